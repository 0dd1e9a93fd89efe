//! Shared fakes for the integration tests.
//!
//! All of them follow tokio's clock, so tests run with
//! `#[tokio::test(start_paused = true)]` and jump through hours of playback
//! instantly.

#![allow(dead_code)]

use async_trait::async_trait;
use pmoprogram::{
    ContractRestrictions, Error, MemoryProgramProvider, PlaybackEvent, PlaybackIntegration,
    PlaybackProperties, PlaybackRate, Program, ProgramConfig, ProgramProvider, Result, Timestamp,
    ValidationOutcome,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

pub const MINUTE: i64 = 60_000;
pub const HALF_HOUR: i64 = 30 * MINUTE;

pub fn program(id: &str, start: Timestamp, end: Timestamp) -> Program {
    Program::new(id, "ch", format!("asset-{id}"), start, end)
}

/// Config with a fixed jitter seed and the default 30 s fuzzy factor
pub fn config() -> ProgramConfig {
    ProgramConfig {
        jitter_seed: Some(42),
        ..ProgramConfig::default()
    }
}

pub fn drain(rx: &mut mpsc::Receiver<PlaybackEvent>) -> Vec<PlaybackEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Ids of the programs announced by `ProgramChanged` (`None` for unknown)
pub fn program_changes(events: &[PlaybackEvent]) -> Vec<Option<String>> {
    events
        .iter()
        .filter_map(|event| match event {
            PlaybackEvent::ProgramChanged(program) => {
                Some(program.as_ref().map(|p| p.program_id.clone()))
            }
            _ => None,
        })
        .collect()
}

/// Advance tokio's paused clock to `millis` after `origin`
pub async fn sleep_until(origin: Instant, millis: i64) {
    tokio::time::sleep_until(origin + std::time::Duration::from_millis(millis as u64)).await;
}

// ============================================================================
// Provider
// ============================================================================

/// In-memory EPG with call counters and switchable transport failures
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    pub epg: MemoryProgramProvider,
    fetch_calls: AtomicUsize,
    next_calls: AtomicUsize,
    previous_calls: AtomicUsize,
    validate_calls: AtomicUsize,
    fail_fetch: AtomicBool,
    fail_next: AtomicBool,
    fail_validation: AtomicBool,
}

impl ScriptedProvider {
    pub fn new(programs: impl IntoIterator<Item = Program>) -> Self {
        Self {
            epg: MemoryProgramProvider::with_programs(programs),
            ..Self::default()
        }
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn next_calls(&self) -> usize {
        self.next_calls.load(Ordering::SeqCst)
    }

    pub fn validate_calls(&self) -> usize {
        self.validate_calls.load(Ordering::SeqCst)
    }

    pub fn fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn fail_next(&self, fail: bool) {
        self.fail_next.store(fail, Ordering::SeqCst);
    }

    pub fn fail_validation(&self, fail: bool) {
        self.fail_validation.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProgramProvider for ScriptedProvider {
    async fn fetch_programs(&self, channel_id: &str, timestamp: Timestamp) -> Result<Vec<Program>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(Error::transport("connection reset"));
        }
        self.epg.fetch_programs(channel_id, timestamp).await
    }

    async fn fetch_next_program(&self, program: &Program) -> Result<Option<Program>> {
        self.next_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.load(Ordering::SeqCst) {
            return Err(Error::transport("connection reset"));
        }
        self.epg.fetch_next_program(program).await
    }

    async fn fetch_previous_program(&self, program: &Program) -> Result<Option<Program>> {
        self.previous_calls.fetch_add(1, Ordering::SeqCst);
        self.epg.fetch_previous_program(program).await
    }

    async fn validate_entitlement(&self, asset_id: &str) -> ValidationOutcome {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_validation.load(Ordering::SeqCst) {
            return ValidationOutcome::ValidationFailed(Error::transport("timeout"));
        }
        self.epg.validate_entitlement(asset_id).await
    }
}

// ============================================================================
// Playback
// ============================================================================

struct Playhead {
    time: Timestamp,
    position: i64,
    anchor: Instant,
    playing: bool,
}

impl Playhead {
    fn elapsed(&self) -> i64 {
        if self.playing {
            self.anchor.elapsed().as_millis() as i64
        } else {
            0
        }
    }
}

/// Player whose playhead advances with tokio's clock while the rate is positive
pub struct SimulatedPlayback {
    playhead: Mutex<Playhead>,
    rate: watch::Sender<PlaybackRate>,
    stops: AtomicUsize,
    seeks: Mutex<Vec<i64>>,
    restarts: Mutex<Vec<PlaybackProperties>>,
}

impl SimulatedPlayback {
    /// Playing from wall-clock `time`, at stream offset `position`
    pub fn new(time: Timestamp, position: i64) -> Self {
        Self {
            playhead: Mutex::new(Playhead {
                time,
                position,
                anchor: Instant::now(),
                playing: true,
            }),
            rate: watch::channel(PlaybackRate::NORMAL).0,
            stops: AtomicUsize::new(0),
            seeks: Mutex::new(Vec::new()),
            restarts: Mutex::new(Vec::new()),
        }
    }

    pub fn set_rate(&self, rate: PlaybackRate) {
        {
            let mut playhead = self.playhead.lock().unwrap();
            let elapsed = playhead.elapsed();
            playhead.time += elapsed;
            playhead.position += elapsed;
            playhead.anchor = Instant::now();
            playhead.playing = rate.is_playing();
        }
        self.rate.send_replace(rate);
    }

    /// Move the playhead to `time` without going through the engine
    pub fn jump_to(&self, time: Timestamp) {
        let mut playhead = self.playhead.lock().unwrap();
        let elapsed = playhead.elapsed();
        playhead.position += elapsed + (time - (playhead.time + elapsed));
        playhead.time = time;
        playhead.anchor = Instant::now();
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn seeks(&self) -> Vec<i64> {
        self.seeks.lock().unwrap().clone()
    }

    pub fn restarts(&self) -> Vec<PlaybackProperties> {
        self.restarts.lock().unwrap().clone()
    }
}

#[async_trait]
impl PlaybackIntegration for SimulatedPlayback {
    fn current_playhead_time(&self) -> Option<Timestamp> {
        let playhead = self.playhead.lock().unwrap();
        Some(playhead.time + playhead.elapsed())
    }

    fn current_playhead_position(&self) -> Option<i64> {
        let playhead = self.playhead.lock().unwrap();
        Some(playhead.position + playhead.elapsed())
    }

    fn is_playing(&self) -> bool {
        self.playhead.lock().unwrap().playing
    }

    fn subscribe_rate(&self) -> watch::Receiver<PlaybackRate> {
        self.rate.subscribe()
    }

    async fn seek_to_position(&self, position: i64) -> Result<()> {
        self.seeks.lock().unwrap().push(position);
        let mut playhead = self.playhead.lock().unwrap();
        let elapsed = playhead.elapsed();
        let current = playhead.position + elapsed;
        playhead.time += elapsed + (position - current);
        playhead.position = position;
        playhead.anchor = Instant::now();
        Ok(())
    }

    async fn seek_to_live(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.set_rate(PlaybackRate::PAUSED);
    }

    async fn restart_playback(&self, properties: PlaybackProperties) -> Result<()> {
        self.restarts.lock().unwrap().push(properties);
        Ok(())
    }
}

// ============================================================================
// Contract restrictions
// ============================================================================

/// Policy that rewrites a given target and refuses another
#[derive(Debug, Default)]
pub struct ScriptedRestrictions {
    pub clamp: Option<(i64, i64)>,
    pub forbidden: Option<i64>,
}

impl ContractRestrictions for ScriptedRestrictions {
    fn can_seek(&self, _from: i64, to: i64) -> bool {
        self.forbidden != Some(to)
    }

    fn will_seek(&self, _from: i64, to: i64) -> i64 {
        match self.clamp {
            Some((requested, allowed)) if requested == to => allowed,
            _ => to,
        }
    }
}
