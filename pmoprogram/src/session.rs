//! One playback session: wires the tracker and the seek coordinator to the player.
//!
//! The session looks at the source capabilities once. Program-bounded
//! sources (a channel id is present) get a [`ProgramTracker`] driven by the
//! player's rate changes; other sources only get seek arbitration.
//!
//! Events from the engine are relayed to the receiver returned by
//! [`ProgramSession::new`]. A `NotEntitled` event stops playback before it is
//! relayed.

use crate::clock::Clock;
use crate::config::ProgramConfig;
use crate::events::{EventSink, PlaybackEvent};
use crate::playback::{PlaybackIntegration, PlaybackRate, SourceCapabilities};
use crate::provider::ProgramProvider;
use crate::restrictions::{BasicContractRestrictions, ContractRestrictions};
use crate::seek::SeekCoordinator;
use crate::tracker::ProgramTracker;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct ProgramSession {
    id: Uuid,
    capabilities: SourceCapabilities,
    tracker: Option<ProgramTracker>,
    seek: SeekCoordinator,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProgramSession {
    /// Build a session with restrictions taken from `config`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        capabilities: SourceCapabilities,
        provider: Arc<dyn ProgramProvider>,
        playback: Arc<dyn PlaybackIntegration>,
        clock: Arc<dyn Clock>,
        config: &ProgramConfig,
    ) -> (Self, mpsc::Receiver<PlaybackEvent>) {
        let restrictions = Arc::new(BasicContractRestrictions::from(&config.restrictions));
        Self::with_restrictions(capabilities, provider, playback, restrictions, clock, config)
    }

    pub fn with_restrictions(
        capabilities: SourceCapabilities,
        provider: Arc<dyn ProgramProvider>,
        playback: Arc<dyn PlaybackIntegration>,
        restrictions: Arc<dyn ContractRestrictions>,
        clock: Arc<dyn Clock>,
        config: &ProgramConfig,
    ) -> (Self, mpsc::Receiver<PlaybackEvent>) {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (events, internal_rx) = EventSink::channel(config.event_buffer);
        let (app_tx, app_rx) = mpsc::channel(config.event_buffer.max(1));

        let tracker = capabilities.channel_id.as_ref().map(|channel_id| {
            ProgramTracker::spawn(
                channel_id.clone(),
                provider,
                Arc::clone(&playback),
                clock,
                events.clone(),
                config,
            )
        });

        info!(
            session = %id,
            channel = capabilities.channel_id.as_deref().unwrap_or("-"),
            program_bounded = tracker.is_some(),
            "Starting playback session"
        );

        let mut tasks = vec![tokio::spawn(relay_events(
            id,
            internal_rx,
            app_tx,
            Arc::clone(&playback),
            cancel.clone(),
        ))];
        if let Some(tracker) = &tracker {
            tasks.push(tokio::spawn(drive_rate(
                id,
                playback.subscribe_rate(),
                tracker.clone(),
                cancel.clone(),
            )));
        }

        let seek = SeekCoordinator::new(
            playback,
            restrictions,
            tracker.clone(),
            capabilities.clone(),
            events,
        );

        let session = Self {
            id,
            capabilities,
            tracker,
            seek,
            cancel,
            tasks: Mutex::new(tasks),
        };
        (session, app_rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn capabilities(&self) -> &SourceCapabilities {
        &self.capabilities
    }

    /// Tracker of a program-bounded source
    pub fn tracker(&self) -> Option<&ProgramTracker> {
        self.tracker.as_ref()
    }

    pub fn seek(&self) -> &SeekCoordinator {
        &self.seek
    }

    /// Stop the background tasks and terminate the tracker
    pub async fn shutdown(&self) {
        info!(session = %self.id, "Shutting down playback session");
        self.cancel.cancel();

        if let Some(tracker) = &self.tracker {
            if let Err(err) = tracker.terminate().await {
                debug!(session = %self.id, "Tracker already stopped: {err}");
            }
        }

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                warn!(session = %self.id, "Session task join error: {err}");
            }
        }
    }
}

impl Drop for ProgramSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Relay engine events to the application, stopping playback on denial
async fn relay_events(
    session: Uuid,
    mut rx: mpsc::Receiver<PlaybackEvent>,
    app: mpsc::Sender<PlaybackEvent>,
    playback: Arc<dyn PlaybackIntegration>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        if let PlaybackEvent::NotEntitled { message } = &event {
            warn!(%session, %message, "Stopping playback: not entitled");
            playback.stop().await;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = app.send(event) => if sent.is_err() {
                debug!(%session, "Application event receiver dropped");
            },
        }
    }
    debug!(%session, "Event relay stopped");
}

/// Start monitoring while the player plays, pause it while it does not
async fn drive_rate(
    session: Uuid,
    mut rates: watch::Receiver<PlaybackRate>,
    tracker: ProgramTracker,
    cancel: CancellationToken,
) {
    let mut playing = None;

    loop {
        let rate = *rates.borrow_and_update();
        if playing != Some(rate.is_playing()) {
            playing = Some(rate.is_playing());
            apply_rate(session, &tracker, rate).await;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = rates.changed() => {
                if changed.is_err() {
                    debug!(%session, "Rate notifications closed");
                    break;
                }
            }
        }
    }
}

async fn apply_rate(session: Uuid, tracker: &ProgramTracker, rate: PlaybackRate) {
    if rate.is_playing() {
        match tracker.start_monitoring().await {
            Ok(Some(program)) => {
                debug!(%session, program = %program, rate = rate.0, "Monitoring started")
            }
            Ok(None) => debug!(%session, rate = rate.0, "Monitoring started without program"),
            Err(err) => debug!(%session, "Could not start monitoring: {err}"),
        }
    } else if let Err(err) = tracker.pause().await {
        debug!(%session, "Could not pause monitoring: {err}");
    }
}
