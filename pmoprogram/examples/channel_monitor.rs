//! Follow an evening of TV on a simulated channel
//!
//! Builds an in-memory EPG (with a hole and a denied program), plays it with
//! a simulated player and prints every event raised by the engine. Tokio's
//! clock is paused, so hours of playback run in a few milliseconds.
//!
//! Usage:
//!   cargo run --example channel_monitor -- [config.yaml]
//!
//! Example:
//!   RUST_LOG=pmoprogram=debug cargo run --example channel_monitor

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use pmoprogram::{
    MemoryProgramProvider, PlaybackEvent, PlaybackIntegration, PlaybackProperties, PlaybackRate,
    Program, ProgramConfig, ProgramSession, SourceCapabilities, SystemClock, Timestamp,
};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

const MINUTE: i64 = 60_000;

/// Player that plays forward from `origin` along tokio's clock
struct SimulatedPlayer {
    origin: Timestamp,
    started: Instant,
    rate: watch::Sender<PlaybackRate>,
}

#[async_trait]
impl PlaybackIntegration for SimulatedPlayer {
    fn current_playhead_time(&self) -> Option<Timestamp> {
        Some(self.origin + self.started.elapsed().as_millis() as i64)
    }

    fn current_playhead_position(&self) -> Option<i64> {
        Some(self.started.elapsed().as_millis() as i64)
    }

    fn is_playing(&self) -> bool {
        self.rate.borrow().is_playing()
    }

    fn subscribe_rate(&self) -> watch::Receiver<PlaybackRate> {
        self.rate.subscribe()
    }

    async fn seek_to_position(&self, position: i64) -> pmoprogram::Result<()> {
        println!("  player: seek to {position} ms");
        Ok(())
    }

    async fn seek_to_live(&self) -> pmoprogram::Result<()> {
        Ok(())
    }

    async fn stop(&self) {
        println!("  player: stopped");
        self.rate.send_replace(PlaybackRate::PAUSED);
    }

    async fn restart_playback(&self, properties: PlaybackProperties) -> pmoprogram::Result<()> {
        println!("  player: restart {:?}", properties.play_from);
        Ok(())
    }
}

fn format_time(timestamp: Timestamp) -> String {
    Utc.timestamp_millis_opt(timestamp)
        .single()
        .map(|dt| dt.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}

#[tokio::main(flavor = "current_thread", start_paused = true)]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let config_path = args.get(1).map(String::as_str).unwrap_or("pmoprogram.yaml");
    let config = ProgramConfig::load_or_default(config_path)?;

    // Align the schedule on the current hour.
    let now = Utc::now().timestamp_millis();
    let hour = now - now % (60 * MINUTE);
    let slot = |id: &str, start: i64, end: i64| {
        Program::new(id, "demo", format!("asset-{id}"), hour + start, hour + end)
    };

    let provider = Arc::new(MemoryProgramProvider::with_programs([
        slot("news", 0, 30 * MINUTE),
        slot("weather", 30 * MINUTE, 35 * MINUTE),
        slot("movie", 35 * MINUTE, 130 * MINUTE),
        // 10 minute hole in the guide
        slot("late-show", 140 * MINUTE, 200 * MINUTE),
        slot("premium-match", 200 * MINUTE, 300 * MINUTE),
    ]));
    provider
        .deny("asset-premium-match", "Subscription required")
        .await;

    let player = Arc::new(SimulatedPlayer {
        origin: hour + 20 * MINUTE,
        started: Instant::now(),
        rate: watch::channel(PlaybackRate::NORMAL).0,
    });

    let (session, mut events) = ProgramSession::new(
        SourceCapabilities::channel("demo"),
        provider,
        player.clone(),
        Arc::new(SystemClock),
        &config,
    );
    println!("Session {} on channel demo", session.id());

    let deadline = tokio::time::sleep(Duration::from_secs(6 * 3600));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                let at = player
                    .current_playhead_time()
                    .map(format_time)
                    .unwrap_or_default();
                match event {
                    PlaybackEvent::ProgramChanged(Some(program)) => println!(
                        "[{at}] now playing {} ({} - {})",
                        program.program_id,
                        format_time(program.start_date),
                        format_time(program.end_date)
                    ),
                    PlaybackEvent::ProgramChanged(None) => println!("[{at}] program unknown"),
                    PlaybackEvent::Warning(warning) => println!("[{at}] warning: {warning}"),
                    PlaybackEvent::NotEntitled { message } => {
                        println!("[{at}] not entitled: {message}");
                        break;
                    }
                }
            }
        }
    }

    session.shutdown().await;
    Ok(())
}
