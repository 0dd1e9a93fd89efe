//! Playback integration boundary
//!
//! The engine never decodes or renders anything. It reads the playhead,
//! follows rate changes and, when a seek crosses a program boundary, asks the
//! integration to tear the session down and start a new one.

use crate::error::Result;
use crate::program::{Program, Timestamp};
use async_trait::async_trait;
use tokio::sync::watch;

/// Playback rate reported by the player (`0.0` means paused)
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlaybackRate(pub f32);

impl PlaybackRate {
    pub const PAUSED: Self = Self(0.0);
    pub const NORMAL: Self = Self(1.0);

    pub fn is_playing(self) -> bool {
        self.0 > 0.0
    }
}

/// Where a (re)started session begins
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PlayFrom {
    #[default]
    DefaultBehaviour,
    /// Wall-clock unix timestamp, in milliseconds
    CustomTime(Timestamp),
}

/// Properties handed to [`PlaybackIntegration::restart_playback`]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlaybackProperties {
    pub play_from: PlayFrom,
    /// Program the new session is expected to start in, when known
    pub program: Option<Program>,
}

impl PlaybackProperties {
    pub fn from_time(timestamp: Timestamp, program: Option<Program>) -> Self {
        Self {
            play_from: PlayFrom::CustomTime(timestamp),
            program,
        }
    }
}

/// What the current media source can do, checked once per session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceCapabilities {
    /// Channel whose EPG bounds this source. `None` disables program tracking.
    pub channel_id: Option<String>,
    /// Whether the source has a live edge to jump to
    pub supports_go_live: bool,
}

impl SourceCapabilities {
    pub fn channel(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: Some(channel_id.into()),
            supports_go_live: true,
        }
    }

    pub fn vod() -> Self {
        Self::default()
    }
}

#[async_trait]
pub trait PlaybackIntegration: Send + Sync {
    /// Wall-clock time of the playhead, when the stream carries one
    fn current_playhead_time(&self) -> Option<Timestamp>;

    /// Zero-based playhead offset in milliseconds
    fn current_playhead_position(&self) -> Option<i64>;

    fn is_playing(&self) -> bool;

    /// Rate change notifications
    fn subscribe_rate(&self) -> watch::Receiver<PlaybackRate>;

    async fn seek_to_position(&self, position: i64) -> Result<()>;

    async fn seek_to_live(&self) -> Result<()>;

    async fn stop(&self);

    /// Start a brand new playback session
    async fn restart_playback(&self, properties: PlaybackProperties) -> Result<()>;
}
