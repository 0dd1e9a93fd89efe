//! Program tracker: keeps "what is entitled to play" in step with "what is playing".
//!
//! [`ProgramTracker`] is a cheap, cloneable handle. All state lives in a
//! single worker task which serializes commands, timer fires and backend
//! completions, so the active program is only ever mutated in one place.
//!
//! # Validation chain
//!
//! Once a program is known while playing, the worker arms three nested
//! timers, each delay drawn by [`fuzzy_offsets`]:
//!
//! 1. **fetch**: ask the backend for the program following the current one,
//! 2. **program-change**: publish the new (or extended) program,
//! 3. **validate**: re-check the entitlement of the new program, then start
//!    over from step 1.
//!
//! Backend failures are permissive: they raise a [`Warning`] and monitoring
//! continues. Only an explicit `NotEntitled` answer stops the tracker.
//!
//! Backend calls run in spawned tasks; their completions re-enter the worker
//! tagged with the timer generation they were started under and are dropped
//! if that timer was cancelled or replaced meanwhile.

use crate::clock::Clock;
use crate::config::ProgramConfig;
use crate::error::{Error, NavigationDirection, Result};
use crate::events::{EventSink, PlaybackEvent, Warning};
use crate::fuzzy::{fuzzy_offsets, recovery_delay, FuzzyFactor, FuzzyOffsets};
use crate::playback::PlaybackIntegration;
use crate::program::{Continuity, Program, Timestamp};
use crate::provider::{ProgramProvider, ValidationOutcome};
use crate::timers::{TimerKind, TimerSlot};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle of a tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerStatus {
    Idle,
    Monitoring,
    Paused,
    /// The backend denied the current program
    NotEntitled,
    Terminated,
}

/// Consistent view of the tracker state, published after every mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerSnapshot {
    pub status: TrackerStatus,
    pub program: Option<Program>,
    /// Whether `program` passed an entitlement check
    pub validated: bool,
}

impl TrackerSnapshot {
    fn idle() -> Self {
        Self {
            status: TrackerStatus::Idle,
            program: None,
            validated: false,
        }
    }
}

/// Commands sent to the tracker worker.
enum TrackerCommand {
    StartMonitoring {
        reply: oneshot::Sender<Result<Option<Program>>>,
    },
    Pause,
    IsEntitled {
        timestamp: Timestamp,
        reply: oneshot::Sender<Result<Option<Program>>>,
    },
    SetFuzzyFactor(FuzzyFactor),
    Terminate {
        reply: oneshot::Sender<()>,
    },
}

impl fmt::Debug for TrackerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StartMonitoring { .. } => f.write_str("StartMonitoring"),
            Self::Pause => f.write_str("Pause"),
            Self::IsEntitled { timestamp, .. } => write!(f, "IsEntitled({timestamp})"),
            Self::SetFuzzyFactor(factor) => write!(f, "SetFuzzyFactor({})", factor.as_millis()),
            Self::Terminate { .. } => f.write_str("Terminate"),
        }
    }
}

/// Public handle to a channel's program tracker.
#[derive(Clone)]
pub struct ProgramTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    channel_id: String,
    provider: Arc<dyn ProgramProvider>,
    clock: Arc<dyn Clock>,
    events: EventSink,
    commands: mpsc::Sender<TrackerCommand>,
    snapshot: watch::Receiver<TrackerSnapshot>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ProgramTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("ProgramTracker")
            .field("channel_id", &self.inner.channel_id)
            .field("status", &snapshot.status)
            .field("program", &snapshot.program.map(|p| p.program_id))
            .finish()
    }
}

impl ProgramTracker {
    /// Spawn the worker for `channel_id`. The tracker starts `Idle`.
    pub fn spawn(
        channel_id: impl Into<String>,
        provider: Arc<dyn ProgramProvider>,
        playback: Arc<dyn PlaybackIntegration>,
        clock: Arc<dyn Clock>,
        events: EventSink,
        config: &ProgramConfig,
    ) -> Self {
        let channel_id = channel_id.into();
        let (commands, mut rx) = mpsc::channel(config.command_buffer.max(1));
        let (completions, mut completions_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot) = watch::channel(TrackerSnapshot::idle());

        let rng = match config.jitter_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let mut state = TrackerState {
            channel_id: channel_id.clone(),
            provider: Arc::clone(&provider),
            playback,
            events: events.clone(),
            snapshot: snapshot_tx,
            completions,
            rng,
            fuzzy_factor: config.fuzzy_factor,
            status: TrackerStatus::Idle,
            active: None,
            validated: false,
            resolution_op: 0,
            fetch: TimerSlot::new(TimerKind::Fetch),
            change: TimerSlot::new(TimerKind::ProgramChange),
            validate: TimerSlot::new(TimerKind::Validate),
            change_due: None,
            shutdown: false,
        };

        let worker = tokio::spawn(async move {
            info!(channel = %state.channel_id, "Starting program tracker");

            loop {
                tokio::select! {
                    cmd = rx.recv() => match cmd {
                        Some(cmd) => state.handle_command(cmd),
                        None => {
                            debug!(channel = %state.channel_id, "All tracker handles dropped");
                            state.cancel_all();
                            break;
                        }
                    },
                    Some(done) = completions_rx.recv() => state.handle_completion(done),
                    (generation, task) = state.fetch.fired() => state.on_fetch_fired(generation, task),
                    (generation, task) = state.change.fired() => state.on_change_fired(generation, task),
                    (generation, task) = state.validate.fired() => state.on_validate_fired(generation, task),
                }

                if state.shutdown {
                    break;
                }
            }

            info!(channel = %state.channel_id, "Program tracker stopped");
        });

        Self {
            inner: Arc::new(TrackerInner {
                channel_id,
                provider,
                clock,
                events,
                commands,
                snapshot,
                worker: Mutex::new(Some(worker)),
            }),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.inner.channel_id
    }

    /// Resolve the program under the playhead and start the validation chain.
    ///
    /// Permissive: a fetch error or an EPG gap yields `Ok(None)` together with
    /// a warning, and the tracker keeps monitoring.
    pub async fn start_monitoring(&self) -> Result<Option<Program>> {
        self.request(|reply| TrackerCommand::StartMonitoring { reply })
            .await?
    }

    /// Cancel the fetch and program-change timers.
    ///
    /// A pending validate timer keeps running: its result is only applied if
    /// the playhead is still inside the program it validates.
    pub async fn pause(&self) -> Result<()> {
        self.send(TrackerCommand::Pause).await
    }

    /// Check that `timestamp` may be played.
    ///
    /// Returns immediately when the timestamp lies inside the active, already
    /// validated program. Otherwise resolves and validates the program at
    /// `timestamp`. Fails with [`Error::NotEntitled`] when the backend denies it.
    pub async fn is_entitled(&self, timestamp: Timestamp) -> Result<Option<Program>> {
        self.request(|reply| TrackerCommand::IsEntitled { timestamp, reply })
            .await?
    }

    /// Change the jitter window. Cancels every armed timer and restarts the chain.
    pub async fn set_fuzzy_factor(&self, fuzzy_factor: FuzzyFactor) -> Result<()> {
        self.send(TrackerCommand::SetFuzzyFactor(fuzzy_factor)).await
    }

    /// Cancel all timers and stop the worker. Idempotent.
    pub async fn terminate(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if self
            .inner
            .commands
            .send(TrackerCommand::Terminate { reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }

        if let Some(worker) = self.inner.worker.lock().await.take() {
            if let Err(err) = worker.await {
                warn!(channel = %self.inner.channel_id, "Tracker worker join error: {err}");
            }
        }
        Ok(())
    }

    pub fn active_program(&self) -> Option<Program> {
        self.inner.snapshot.borrow().program.clone()
    }

    pub fn status(&self) -> TrackerStatus {
        self.inner.snapshot.borrow().status
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    /// Watch every state transition
    pub fn subscribe(&self) -> watch::Receiver<TrackerSnapshot> {
        self.inner.snapshot.clone()
    }

    /// Program airing at `timestamp`, straight from the backend.
    ///
    /// Does not read or modify the tracker state.
    pub async fn current_program(&self, timestamp: Timestamp) -> Result<Option<Program>> {
        self.inner
            .provider
            .fetch_program_at(&self.inner.channel_id, timestamp)
            .await
    }

    /// Program following `program`. Rejected while the active program is live.
    pub async fn next_program(&self, program: &Program) -> Result<Option<Program>> {
        self.ensure_navigable(program, NavigationDirection::Next)?;
        self.inner.provider.fetch_next_program(program).await
    }

    /// Program preceding `program`. Rejected while the active program is live.
    pub async fn previous_program(&self, program: &Program) -> Result<Option<Program>> {
        self.ensure_navigable(program, NavigationDirection::Previous)?;
        self.inner.provider.fetch_previous_program(program).await
    }

    fn ensure_navigable(&self, program: &Program, direction: NavigationDirection) -> Result<()> {
        let now = self.inner.clock.now_millis();
        let live = self
            .active_program()
            .map(|active| active.is_live(now))
            .unwrap_or(false);
        if !live {
            return Ok(());
        }

        let program_id = program.program_id.clone();
        let warning = match direction {
            NavigationDirection::Next => Warning::NavigateToNextProgramFailed { program_id },
            NavigationDirection::Previous => {
                Warning::NavigateToPreviousProgramFailed { program_id }
            }
        };
        self.inner.events.warn(warning);
        Err(Error::NavigationRejected { direction })
    }

    async fn send(&self, cmd: TrackerCommand) -> Result<()> {
        self.inner
            .commands
            .send(cmd)
            .await
            .map_err(|_| Error::TrackerStopped)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> TrackerCommand,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await.map_err(|_| Error::TrackerStopped)
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Fetch slot payload
enum FetchTask {
    /// Ask for the program following `previous`
    Next {
        previous: Program,
        offsets: FuzzyOffsets,
    },
    /// Re-resolve the program under the playhead after a failure or a gap
    Recover,
}

/// Program-change slot payload
struct ChangeTask {
    previous: Program,
    validate_delay: Duration,
    /// Filled in when the next-program fetch completes
    resolution: Option<NextResolution>,
}

enum NextResolution {
    Continue(Program, Continuity),
    Unknown,
}

struct ValidateTask {
    program: Program,
}

enum Lookup {
    Failed(Error),
    Gap,
    Checked(Program, ValidationOutcome),
}

/// Results of backend calls, fed back into the worker.
enum Completion {
    Started {
        op: u64,
        timestamp: Timestamp,
        result: Result<Option<Program>>,
        reply: oneshot::Sender<Result<Option<Program>>>,
    },
    EntitlementChecked {
        op: u64,
        timestamp: Timestamp,
        lookup: Lookup,
        reply: oneshot::Sender<Result<Option<Program>>>,
    },
    NextFetched {
        fetch_generation: u64,
        change_generation: u64,
        previous: Program,
        result: Result<Option<Program>>,
    },
    Recovered {
        generation: u64,
        timestamp: Timestamp,
        result: Result<Option<Program>>,
    },
    Validated {
        generation: u64,
        program: Program,
        outcome: ValidationOutcome,
    },
}

struct TrackerState {
    channel_id: String,
    provider: Arc<dyn ProgramProvider>,
    playback: Arc<dyn PlaybackIntegration>,
    events: EventSink,
    snapshot: watch::Sender<TrackerSnapshot>,
    completions: mpsc::UnboundedSender<Completion>,
    rng: StdRng,
    fuzzy_factor: FuzzyFactor,
    status: TrackerStatus,
    active: Option<Program>,
    validated: bool,
    /// Bumped by every start/is-entitled request; older completions are stale
    resolution_op: u64,
    fetch: TimerSlot<FetchTask>,
    change: TimerSlot<ChangeTask>,
    validate: TimerSlot<ValidateTask>,
    /// Program-change timer that fired before its fetch completed
    change_due: Option<(u64, ChangeTask)>,
    shutdown: bool,
}

impl TrackerState {
    fn handle_command(&mut self, cmd: TrackerCommand) {
        debug!(channel = %self.channel_id, ?cmd, "Tracker command");

        match cmd {
            TrackerCommand::StartMonitoring { reply } => self.start_monitoring(reply),
            TrackerCommand::Pause => self.pause(),
            TrackerCommand::IsEntitled { timestamp, reply } => self.is_entitled(timestamp, reply),
            TrackerCommand::SetFuzzyFactor(factor) => self.set_fuzzy_factor(factor),
            TrackerCommand::Terminate { reply } => {
                self.cancel_all();
                self.status = TrackerStatus::Terminated;
                self.publish_snapshot();
                self.shutdown = true;
                let _ = reply.send(());
            }
        }
    }

    fn handle_completion(&mut self, done: Completion) {
        match done {
            Completion::Started {
                op,
                timestamp,
                result,
                reply,
            } => self.on_started(op, timestamp, result, reply),
            Completion::EntitlementChecked {
                op,
                timestamp,
                lookup,
                reply,
            } => self.on_entitlement_checked(op, timestamp, lookup, reply),
            Completion::NextFetched {
                fetch_generation,
                change_generation,
                previous,
                result,
            } => self.on_next_fetched(fetch_generation, change_generation, previous, result),
            Completion::Recovered {
                generation,
                timestamp,
                result,
            } => self.on_recovered(generation, timestamp, result),
            Completion::Validated {
                generation,
                program,
                outcome,
            } => self.on_validated(generation, program, outcome),
        }
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    fn start_monitoring(&mut self, reply: oneshot::Sender<Result<Option<Program>>>) {
        if self.status == TrackerStatus::NotEntitled {
            let _ = reply.send(Err(Error::TrackerStopped));
            return;
        }

        // A resumed session must never run two fetch cycles side by side.
        self.cancel_cycle();
        self.status = TrackerStatus::Monitoring;
        self.publish_snapshot();

        let Some(timestamp) = self.playback.current_playhead_time() else {
            self.events.warn(Warning::FetchingCurrentProgramFailed {
                timestamp: 0,
                reason: Error::NoPlayhead.to_string(),
            });
            self.change_program(None, false);
            self.arm_recovery();
            let _ = reply.send(Ok(None));
            return;
        };

        self.resolution_op += 1;
        let op = self.resolution_op;
        let provider = Arc::clone(&self.provider);
        let channel_id = self.channel_id.clone();
        self.spawn_call(async move {
            let result = provider.fetch_program_at(&channel_id, timestamp).await;
            Completion::Started {
                op,
                timestamp,
                result,
                reply,
            }
        });
    }

    fn pause(&mut self) {
        self.cancel_cycle();
        if self.status == TrackerStatus::Monitoring {
            self.status = TrackerStatus::Paused;
            self.publish_snapshot();
            debug!(channel = %self.channel_id, "Monitoring paused");
        }
    }

    fn is_entitled(
        &mut self,
        timestamp: Timestamp,
        reply: oneshot::Sender<Result<Option<Program>>>,
    ) {
        if self.status == TrackerStatus::NotEntitled {
            let _ = reply.send(Err(Error::TrackerStopped));
            return;
        }

        if let Some(active) = self.active.clone() {
            if self.validated && active.contains(timestamp) {
                debug!(channel = %self.channel_id, program = %active, "Entitlement fast path");
                // Once the next program has been requested the chain is
                // already committed to this boundary.
                let changing = self.change.is_armed() || self.change_due.is_some();
                if self.status == TrackerStatus::Monitoring && !changing {
                    self.arm_cycle(timestamp, &active);
                }
                let _ = reply.send(Ok(Some(active)));
                return;
            }
        }

        self.resolution_op += 1;
        let op = self.resolution_op;
        let provider = Arc::clone(&self.provider);
        let channel_id = self.channel_id.clone();
        self.spawn_call(async move {
            let lookup = match provider.fetch_program_at(&channel_id, timestamp).await {
                Err(err) => Lookup::Failed(err),
                Ok(None) => Lookup::Gap,
                Ok(Some(program)) => {
                    let outcome = provider.validate_entitlement(&program.asset_id).await;
                    Lookup::Checked(program, outcome)
                }
            };
            Completion::EntitlementChecked {
                op,
                timestamp,
                lookup,
                reply,
            }
        });
    }

    fn set_fuzzy_factor(&mut self, factor: FuzzyFactor) {
        info!(
            channel = %self.channel_id,
            fuzzy_factor_ms = factor.as_millis(),
            "Fuzzy factor changed, restarting jitter sequence"
        );
        self.fuzzy_factor = factor;
        self.cancel_all();

        if self.status != TrackerStatus::Monitoring {
            return;
        }
        match self.active.clone() {
            Some(active) => {
                let timestamp = self
                    .playback
                    .current_playhead_time()
                    .unwrap_or(active.start_date);
                self.arm_cycle(timestamp, &active);
            }
            None => self.arm_recovery(),
        }
    }

    // ------------------------------------------------------------------------
    // Completions
    // ------------------------------------------------------------------------

    fn on_started(
        &mut self,
        op: u64,
        timestamp: Timestamp,
        result: Result<Option<Program>>,
        reply: oneshot::Sender<Result<Option<Program>>>,
    ) {
        if op != self.resolution_op {
            let _ = reply.send(Err(Error::Superseded));
            return;
        }
        if self.status == TrackerStatus::NotEntitled {
            let _ = reply.send(Err(Error::TrackerStopped));
            return;
        }

        match result {
            Ok(Some(program)) => {
                info!(channel = %self.channel_id, program = %program, "Monitoring program");
                let validated = self.validated && self.active.as_ref() == Some(&program);
                self.change_program(Some(program.clone()), validated);
                if self.status == TrackerStatus::Monitoring {
                    self.arm_cycle(timestamp, &program);
                }
                let _ = reply.send(Ok(Some(program)));
            }
            Ok(None) => {
                self.events.warn(Warning::GapInEpg {
                    channel_id: self.channel_id.clone(),
                    timestamp,
                });
                self.change_program(None, false);
                self.arm_recovery_if_monitoring();
                let _ = reply.send(Ok(None));
            }
            Err(err) => {
                self.events.warn(Warning::FetchingCurrentProgramFailed {
                    timestamp,
                    reason: err.to_string(),
                });
                self.change_program(None, false);
                self.arm_recovery_if_monitoring();
                let _ = reply.send(Ok(None));
            }
        }
    }

    fn on_entitlement_checked(
        &mut self,
        op: u64,
        timestamp: Timestamp,
        lookup: Lookup,
        reply: oneshot::Sender<Result<Option<Program>>>,
    ) {
        if op != self.resolution_op {
            let _ = reply.send(Err(Error::Superseded));
            return;
        }
        if self.status == TrackerStatus::NotEntitled {
            let _ = reply.send(Err(Error::TrackerStopped));
            return;
        }

        match lookup {
            Lookup::Failed(err) => {
                self.events.warn(Warning::FetchingCurrentProgramFailed {
                    timestamp,
                    reason: err.to_string(),
                });
                let _ = reply.send(Ok(None));
            }
            Lookup::Gap => {
                self.events.warn(Warning::GapInEpg {
                    channel_id: self.channel_id.clone(),
                    timestamp,
                });
                let _ = reply.send(Ok(None));
            }
            Lookup::Checked(program, ValidationOutcome::NotEntitled { message }) => {
                self.stop_not_entitled(&program, message.clone());
                let _ = reply.send(Err(Error::NotEntitled(message)));
            }
            Lookup::Checked(program, outcome) => {
                let validated = match outcome {
                    ValidationOutcome::ValidationFailed(err) => {
                        self.events.warn(Warning::EntitlementValidationFailed {
                            program_id: program.program_id.clone(),
                            reason: err.to_string(),
                        });
                        false
                    }
                    _ => true,
                };
                self.change_program(Some(program.clone()), validated);
                if self.status == TrackerStatus::Monitoring {
                    self.arm_cycle(timestamp, &program);
                }
                let _ = reply.send(Ok(Some(program)));
            }
        }
    }

    fn on_next_fetched(
        &mut self,
        fetch_generation: u64,
        change_generation: u64,
        previous: Program,
        result: Result<Option<Program>>,
    ) {
        if !self.fetch.is_current(fetch_generation) {
            debug!(channel = %self.channel_id, "Dropping stale next-program fetch");
            return;
        }

        let resolution = match result {
            Err(err) => {
                self.events.warn(Warning::FetchingCurrentProgramFailed {
                    timestamp: previous.end_date,
                    reason: err.to_string(),
                });
                NextResolution::Unknown
            }
            Ok(None) => {
                self.warn_gap(previous.end_date);
                NextResolution::Unknown
            }
            Ok(Some(next)) => match previous.continuity_to(&next) {
                Continuity::Gap => {
                    self.warn_gap(previous.end_date);
                    NextResolution::Unknown
                }
                continuity => NextResolution::Continue(next, continuity),
            },
        };

        if self.change.is_current(change_generation) {
            if let Some(task) = self.change.payload_mut() {
                task.resolution = Some(resolution);
                return;
            }
            if let Some((generation, mut task)) = self.change_due.take() {
                if generation == change_generation {
                    task.resolution = Some(resolution);
                    self.apply_change(task);
                    return;
                }
            }
        }
        debug!(channel = %self.channel_id, "Program-change timer gone, dropping fetch result");
    }

    fn on_recovered(
        &mut self,
        generation: u64,
        timestamp: Timestamp,
        result: Result<Option<Program>>,
    ) {
        if !self.fetch.is_current(generation) || self.status != TrackerStatus::Monitoring {
            debug!(channel = %self.channel_id, "Dropping stale recovery fetch");
            return;
        }

        match result {
            Ok(Some(program)) => {
                info!(channel = %self.channel_id, program = %program, "Program recovered");
                self.change_program(Some(program.clone()), false);
                let offsets =
                    fuzzy_offsets(timestamp, program.end_date, self.fuzzy_factor, &mut self.rng);
                self.validate
                    .arm(offsets.validate_delay(), ValidateTask { program });
            }
            Ok(None) => {
                self.warn_gap(timestamp);
                self.arm_recovery();
            }
            Err(err) => {
                self.events.warn(Warning::FetchingCurrentProgramFailed {
                    timestamp,
                    reason: err.to_string(),
                });
                self.arm_recovery();
            }
        }
    }

    fn on_validated(&mut self, generation: u64, program: Program, outcome: ValidationOutcome) {
        if !self.validate.is_current(generation) {
            debug!(channel = %self.channel_id, "Dropping stale validation");
            return;
        }
        if self.status == TrackerStatus::NotEntitled {
            return;
        }

        let Some(timestamp) = self
            .playback
            .current_playhead_time()
            .filter(|ts| program.contains(*ts))
        else {
            debug!(
                channel = %self.channel_id,
                program = %program,
                "Playhead left the validated program, ignoring result"
            );
            return;
        };

        match outcome {
            ValidationOutcome::Success => {
                debug!(channel = %self.channel_id, program = %program, "Entitlement confirmed");
                if self.active.as_ref() == Some(&program) {
                    self.validated = true;
                    self.publish_snapshot();
                }
                if self.status == TrackerStatus::Monitoring {
                    self.arm_cycle(timestamp, &program);
                }
            }
            ValidationOutcome::NotEntitled { message } => {
                self.stop_not_entitled(&program, message);
            }
            ValidationOutcome::ValidationFailed(err) => {
                self.events.warn(Warning::EntitlementValidationFailed {
                    program_id: program.program_id.clone(),
                    reason: err.to_string(),
                });
                if self.status == TrackerStatus::Monitoring {
                    self.arm_cycle(timestamp, &program);
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    fn on_fetch_fired(&mut self, generation: u64, task: FetchTask) {
        if self.status != TrackerStatus::Monitoring {
            return;
        }

        match task {
            FetchTask::Next { previous, offsets } => {
                let change_generation = self.change.arm(
                    offsets.change_delay(),
                    ChangeTask {
                        previous: previous.clone(),
                        validate_delay: offsets.validate_delay(),
                        resolution: None,
                    },
                );
                self.change_due = None;

                let provider = Arc::clone(&self.provider);
                self.spawn_call(async move {
                    let result = provider.fetch_next_program(&previous).await;
                    Completion::NextFetched {
                        fetch_generation: generation,
                        change_generation,
                        previous,
                        result,
                    }
                });
            }
            FetchTask::Recover => {
                let Some(timestamp) = self.playback.current_playhead_time() else {
                    self.arm_recovery();
                    return;
                };
                let provider = Arc::clone(&self.provider);
                let channel_id = self.channel_id.clone();
                self.spawn_call(async move {
                    let result = provider.fetch_program_at(&channel_id, timestamp).await;
                    Completion::Recovered {
                        generation,
                        timestamp,
                        result,
                    }
                });
            }
        }
    }

    fn on_change_fired(&mut self, generation: u64, task: ChangeTask) {
        if task.resolution.is_none() {
            debug!(channel = %self.channel_id, "Program change due before fetch completed");
            self.change_due = Some((generation, task));
            return;
        }
        self.apply_change(task);
    }

    fn on_validate_fired(&mut self, generation: u64, task: ValidateTask) {
        let provider = Arc::clone(&self.provider);
        self.spawn_call(async move {
            let outcome = provider.validate_entitlement(&task.program.asset_id).await;
            Completion::Validated {
                generation,
                program: task.program,
                outcome,
            }
        });
    }

    fn apply_change(&mut self, task: ChangeTask) {
        match task.resolution {
            Some(NextResolution::Continue(next, continuity)) => {
                match continuity {
                    Continuity::Extension => info!(
                        channel = %self.channel_id,
                        program = %next,
                        previous_end = task.previous.end_date,
                        "Program extended"
                    ),
                    _ => info!(
                        channel = %self.channel_id,
                        program = %next,
                        previous = %task.previous.program_id,
                        "Program changed"
                    ),
                }
                self.change_program(Some(next.clone()), false);
                self.validate
                    .arm(task.validate_delay, ValidateTask { program: next });
            }
            Some(NextResolution::Unknown) | None => {
                self.change_program(None, false);
                self.arm_recovery_if_monitoring();
            }
        }
    }

    fn arm_cycle(&mut self, timestamp: Timestamp, program: &Program) {
        let offsets = fuzzy_offsets(timestamp, program.end_date, self.fuzzy_factor, &mut self.rng);
        debug!(
            channel = %self.channel_id,
            program = %program.program_id,
            fetch_ms = offsets.fetch,
            change_ms = offsets.change,
            validate_ms = offsets.validate,
            "Arming validation chain"
        );
        self.change.cancel();
        self.change_due = None;
        self.fetch.arm(
            offsets.fetch_delay(),
            FetchTask::Next {
                previous: program.clone(),
                offsets,
            },
        );
    }

    fn arm_recovery(&mut self) {
        self.change.cancel();
        self.change_due = None;
        let delay = recovery_delay(self.fuzzy_factor, &mut self.rng);
        self.fetch.arm(delay, FetchTask::Recover);
    }

    fn arm_recovery_if_monitoring(&mut self) {
        if self.status == TrackerStatus::Monitoring {
            self.arm_recovery();
        }
    }

    /// Cancel fetch and program-change timers, leaving validation alone
    fn cancel_cycle(&mut self) {
        self.fetch.cancel();
        self.change.cancel();
        self.change_due = None;
    }

    fn cancel_all(&mut self) {
        self.cancel_cycle();
        self.validate.cancel();
    }

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    /// Replace the active program and notify listeners.
    ///
    /// Identical programs are not re-announced; a changed end date is.
    fn change_program(&mut self, program: Option<Program>, validated: bool) {
        let changed = self.active != program;
        self.active = program.clone();
        self.validated = validated;
        self.publish_snapshot();
        if changed {
            self.events.publish(PlaybackEvent::ProgramChanged(program));
        }
    }

    fn stop_not_entitled(&mut self, program: &Program, message: String) {
        warn!(
            channel = %self.channel_id,
            program = %program,
            %message,
            "Not entitled to current program"
        );
        self.cancel_all();
        self.status = TrackerStatus::NotEntitled;
        self.validated = false;
        self.publish_snapshot();
        self.events.publish(PlaybackEvent::NotEntitled { message });
    }

    fn warn_gap(&self, timestamp: Timestamp) {
        self.events.warn(Warning::GapInEpg {
            channel_id: self.channel_id.clone(),
            timestamp,
        });
    }

    fn publish_snapshot(&self) {
        self.snapshot.send_replace(TrackerSnapshot {
            status: self.status,
            program: self.active.clone(),
            validated: self.validated,
        });
    }

    fn spawn_call<F>(&self, call: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let done = call.await;
            let _ = completions.send(done);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::playback::{PlaybackProperties, PlaybackRate};
    use crate::provider::MemoryProgramProvider;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::time::{timeout, Instant};

    const MINUTE: i64 = 60_000;

    /// Playhead that follows tokio's (paused) clock from `origin`
    struct VirtualPlayhead {
        origin: Timestamp,
        started: Instant,
        rate: watch::Sender<PlaybackRate>,
    }

    impl VirtualPlayhead {
        fn at(origin: Timestamp) -> Arc<Self> {
            Arc::new(Self {
                origin,
                started: Instant::now(),
                rate: watch::channel(PlaybackRate::NORMAL).0,
            })
        }
    }

    #[async_trait]
    impl PlaybackIntegration for VirtualPlayhead {
        fn current_playhead_time(&self) -> Option<Timestamp> {
            Some(self.origin + self.started.elapsed().as_millis() as i64)
        }

        fn current_playhead_position(&self) -> Option<i64> {
            Some(self.started.elapsed().as_millis() as i64)
        }

        fn is_playing(&self) -> bool {
            true
        }

        fn subscribe_rate(&self) -> watch::Receiver<PlaybackRate> {
            self.rate.subscribe()
        }

        async fn seek_to_position(&self, _position: i64) -> Result<()> {
            Ok(())
        }

        async fn seek_to_live(&self) -> Result<()> {
            Ok(())
        }

        async fn stop(&self) {}

        async fn restart_playback(&self, _properties: PlaybackProperties) -> Result<()> {
            Ok(())
        }
    }

    fn schedule() -> Arc<MemoryProgramProvider> {
        Arc::new(MemoryProgramProvider::with_programs([
            Program::new("p1", "ch", "a1", 0, 10 * MINUTE),
            Program::new("p2", "ch", "a2", 10 * MINUTE, 20 * MINUTE),
        ]))
    }

    fn tracker(
        provider: Arc<MemoryProgramProvider>,
        playhead: Timestamp,
        clock: Arc<ManualClock>,
    ) -> (ProgramTracker, mpsc::Receiver<PlaybackEvent>) {
        let (events, rx) = EventSink::channel(64);
        let config = ProgramConfig {
            jitter_seed: Some(7),
            ..ProgramConfig::default()
        };
        let tracker = ProgramTracker::spawn(
            "ch",
            provider,
            VirtualPlayhead::at(playhead),
            clock,
            events,
            &config,
        );
        (tracker, rx)
    }

    async fn wait_for_program(tracker: &ProgramTracker, program_id: &str) {
        let mut rx = tracker.subscribe();
        timeout(
            Duration::from_secs(3600),
            rx.wait_for(|s| {
                s.program
                    .as_ref()
                    .is_some_and(|p| p.program_id == program_id)
            }),
        )
        .await
        .expect("program never became active")
        .expect("tracker dropped");
    }

    fn drain(rx: &mut mpsc::Receiver<PlaybackEvent>) -> Vec<PlaybackEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_monitoring_resolves_current_program() {
        let (tracker, mut rx) = tracker(schedule(), 5 * MINUTE, Arc::new(ManualClock::new(0)));

        let program = tracker.start_monitoring().await.unwrap().unwrap();
        assert_eq!(program.program_id, "p1");
        assert_eq!(tracker.status(), TrackerStatus::Monitoring);
        assert_eq!(tracker.active_program(), Some(program.clone()));
        assert_eq!(
            drain(&mut rx),
            vec![PlaybackEvent::ProgramChanged(Some(program))]
        );

        tracker.terminate().await.unwrap();
        assert_eq!(tracker.status(), TrackerStatus::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transition_to_next_program() {
        let (tracker, mut rx) = tracker(schedule(), 9 * MINUTE, Arc::new(ManualClock::new(0)));
        tracker.start_monitoring().await.unwrap();

        wait_for_program(&tracker, "p2").await;

        let changes: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                PlaybackEvent::ProgramChanged(p) => p.map(|p| p.program_id),
                _ => None,
            })
            .collect();
        assert_eq!(changes, vec!["p1".to_string(), "p2".to_string()]);
        tracker.terminate().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_next_program_stops_tracker() {
        let provider = schedule();
        provider.deny("a2", "NOT_ENTITLED").await;
        let (tracker, mut rx) = tracker(provider, 9 * MINUTE, Arc::new(ManualClock::new(0)));
        tracker.start_monitoring().await.unwrap();

        let mut snapshots = tracker.subscribe();
        timeout(
            Duration::from_secs(3600),
            snapshots.wait_for(|s| s.status == TrackerStatus::NotEntitled),
        )
        .await
        .unwrap()
        .unwrap();

        let events = drain(&mut rx);
        assert!(events.contains(&PlaybackEvent::NotEntitled {
            message: "NOT_ENTITLED".into()
        }));
        assert!(matches!(
            tracker.start_monitoring().await,
            Err(Error::TrackerStopped)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_cancels_program_change() {
        let (tracker, mut rx) = tracker(schedule(), 9 * MINUTE, Arc::new(ManualClock::new(0)));
        tracker.start_monitoring().await.unwrap();
        drain(&mut rx);

        tracker.pause().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30 * 60)).await;

        assert_eq!(tracker.status(), TrackerStatus::Paused);
        assert_eq!(
            tracker.active_program().map(|p| p.program_id),
            Some("p1".to_string())
        );
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_is_entitled_denied() {
        let provider = schedule();
        provider.deny("a2", "NOT_ENTITLED").await;
        let (tracker, _rx) = tracker(provider, 5 * MINUTE, Arc::new(ManualClock::new(0)));

        let allowed = tracker.is_entitled(5 * MINUTE).await.unwrap();
        assert_eq!(allowed.map(|p| p.program_id), Some("p1".to_string()));
        assert!(tracker.snapshot().validated);

        match tracker.is_entitled(15 * MINUTE).await {
            Err(Error::NotEntitled(message)) => assert_eq!(message, "NOT_ENTITLED"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(tracker.status(), TrackerStatus::NotEntitled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_navigation_rejected_while_live() {
        let clock = Arc::new(ManualClock::new(5 * MINUTE));
        let (tracker, mut rx) = tracker(schedule(), 5 * MINUTE, Arc::clone(&clock));
        let p1 = tracker.start_monitoring().await.unwrap().unwrap();
        drain(&mut rx);

        assert!(matches!(
            tracker.next_program(&p1).await,
            Err(Error::NavigationRejected {
                direction: NavigationDirection::Next
            })
        ));
        assert_eq!(
            drain(&mut rx),
            vec![PlaybackEvent::Warning(Warning::NavigateToNextProgramFailed {
                program_id: "p1".into()
            })]
        );

        assert!(matches!(
            tracker.previous_program(&p1).await,
            Err(Error::NavigationRejected {
                direction: NavigationDirection::Previous
            })
        ));
        assert_eq!(
            drain(&mut rx),
            vec![PlaybackEvent::Warning(Warning::NavigateToPreviousProgramFailed {
                program_id: "p1".into()
            })]
        );

        // Catch-up: the wall clock is well past the active program.
        clock.set(60 * MINUTE);
        let next = tracker.next_program(&p1).await.unwrap().unwrap();
        assert_eq!(next.program_id, "p2");
        assert!(tracker.previous_program(&p1).await.unwrap().is_none());
        tracker.terminate().await.unwrap();
    }
}
