//! Seek arbitration.
//!
//! Every seek goes through the contract restrictions first, in zero-based
//! position space. Time-based seeks are mapped onto positions using the
//! current (time, position) pair of the playhead as reference frame.
//!
//! On program-bounded sources, a seek landing outside the tracked program
//! does not patch the tracker: the program at the target is resolved, the
//! current session is torn down and playback restarts from that time, since
//! the new program may need a different entitlement grant.

use crate::error::{Error, Result};
use crate::events::{EventSink, Warning};
use crate::playback::{PlaybackIntegration, PlaybackProperties, SourceCapabilities};
use crate::program::Timestamp;
use crate::restrictions::ContractRestrictions;
use crate::tracker::ProgramTracker;
use std::sync::Arc;
use tracing::{debug, info};

/// What a seek request turned into
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeekOutcome {
    /// Seeked inside the current session, to this position
    InPlace(i64),
    /// Playback restarted from this wall-clock time in another program
    Restarted(Timestamp),
}

pub struct SeekCoordinator {
    playback: Arc<dyn PlaybackIntegration>,
    restrictions: Arc<dyn ContractRestrictions>,
    tracker: Option<ProgramTracker>,
    capabilities: SourceCapabilities,
    events: EventSink,
}

impl SeekCoordinator {
    pub fn new(
        playback: Arc<dyn PlaybackIntegration>,
        restrictions: Arc<dyn ContractRestrictions>,
        tracker: Option<ProgramTracker>,
        capabilities: SourceCapabilities,
        events: EventSink,
    ) -> Self {
        Self {
            playback,
            restrictions,
            tracker,
            capabilities,
            events,
        }
    }

    /// Seek to a zero-based offset in milliseconds
    pub async fn seek_to_position(&self, position: i64) -> Result<SeekOutcome> {
        let from = self
            .playback
            .current_playhead_position()
            .ok_or(Error::NoPlayhead)?;
        let allowed = self.arbitrate(from, position)?;

        match (&self.tracker, self.playback.current_playhead_time()) {
            (Some(tracker), Some(now)) => {
                let target = now.saturating_add(allowed.saturating_sub(from));
                self.seek_bounded(tracker, target, allowed).await
            }
            _ => self.seek_in_place(allowed).await,
        }
    }

    /// Seek to a wall-clock unix timestamp in milliseconds
    pub async fn seek_to_time(&self, timestamp: Timestamp) -> Result<SeekOutcome> {
        let from = self
            .playback
            .current_playhead_position()
            .ok_or(Error::NoPlayhead)?;
        let now = self
            .playback
            .current_playhead_time()
            .ok_or(Error::NoPlayhead)?;

        let requested = from.saturating_add(timestamp.saturating_sub(now));
        let allowed = self.arbitrate(from, requested)?;

        match &self.tracker {
            Some(tracker) => {
                let target = timestamp.saturating_add(allowed.saturating_sub(requested));
                self.seek_bounded(tracker, target, allowed).await
            }
            None => self.seek_in_place(allowed).await,
        }
    }

    pub async fn seek_to_live(&self) -> Result<()> {
        if !self.capabilities.supports_go_live {
            return Err(Error::Unsupported(
                "media source does not support going live".into(),
            ));
        }
        info!("Seeking to live edge");
        self.playback.seek_to_live().await
    }

    /// Apply the contract restrictions to a seek from `from` to `to`
    fn arbitrate(&self, from: i64, to: i64) -> Result<i64> {
        if !self.restrictions.can_seek(from, to) {
            return Err(Error::SeekNotAllowed { from, to });
        }

        let allowed = self.restrictions.will_seek(from, to);
        if allowed != to {
            self.events.warn(Warning::PolicyChangedTargetSeekOffset {
                requested: to,
                allowed,
            });
        }
        Ok(allowed)
    }

    async fn seek_bounded(
        &self,
        tracker: &ProgramTracker,
        target: Timestamp,
        position: i64,
    ) -> Result<SeekOutcome> {
        if tracker
            .active_program()
            .is_some_and(|program| program.contains(target))
        {
            return self.seek_in_place(position).await;
        }

        match tracker.current_program(target).await {
            Ok(Some(program)) => {
                info!(
                    channel = %tracker.channel_id(),
                    program = %program,
                    target,
                    "Seek crosses program boundary, restarting playback"
                );
                tracker.terminate().await?;
                self.playback.stop().await;
                self.playback
                    .restart_playback(PlaybackProperties::from_time(target, Some(program)))
                    .await?;
                Ok(SeekOutcome::Restarted(target))
            }
            Ok(None) => {
                self.events.warn(Warning::GapInEpg {
                    channel_id: tracker.channel_id().to_string(),
                    timestamp: target,
                });
                self.seek_in_place(position).await
            }
            Err(err) => {
                self.events.warn(Warning::FetchingCurrentProgramFailed {
                    timestamp: target,
                    reason: err.to_string(),
                });
                self.seek_in_place(position).await
            }
        }
    }

    async fn seek_in_place(&self, position: i64) -> Result<SeekOutcome> {
        debug!(position, "Seeking in current session");
        self.playback.seek_to_position(position).await?;
        Ok(SeekOutcome::InPlace(position))
    }
}
