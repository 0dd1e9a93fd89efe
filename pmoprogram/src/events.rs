//! Outward notifications
//!
//! The tracker and the seek coordinator never call back into application
//! code directly. They publish [`PlaybackEvent`]s into an [`EventSink`]; the
//! matching receiver is handed to the caller, who drains it on whatever task
//! owns the player.
//!
//! Publishing never waits: when the receiver falls behind and the channel is
//! full, the event is logged and dropped so the tracker keeps running.

use crate::program::{Program, Timestamp};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Non-fatal conditions reported while playback continues
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Warning {
    #[error("Fetching current program at {timestamp} failed: {reason}")]
    FetchingCurrentProgramFailed { timestamp: Timestamp, reason: String },

    #[error("Gap in EPG at {timestamp} on channel {channel_id}")]
    GapInEpg {
        channel_id: String,
        timestamp: Timestamp,
    },

    #[error("Entitlement validation failed for program {program_id}: {reason}")]
    EntitlementValidationFailed { program_id: String, reason: String },

    #[error("Navigating to next program from {program_id} failed")]
    NavigateToNextProgramFailed { program_id: String },

    #[error("Navigating to previous program from {program_id} failed")]
    NavigateToPreviousProgramFailed { program_id: String },

    #[error("Contract restrictions changed seek target from {requested} to {allowed}")]
    PolicyChangedTargetSeekOffset { requested: i64, allowed: i64 },
}

/// Everything the engine reports to the surrounding player
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// The active program changed, was extended, or became unknown
    ProgramChanged(Option<Program>),
    /// The backend denied the current program: playback must stop
    NotEntitled { message: String },
    Warning(Warning),
}

/// Cloneable publishing end of the event channel.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<PlaybackEvent>,
}

impl EventSink {
    /// Create a sink and the receiver the application drains
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<PlaybackEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn publish(&self, event: PlaybackEvent) {
        if let PlaybackEvent::Warning(warning) = &event {
            warn!("{warning}");
        }
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(?event, "Event channel full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Event receiver dropped, discarding event");
            }
        }
    }

    pub fn warn(&self, warning: Warning) {
        self.publish(PlaybackEvent::Warning(warning));
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
