//! Error types for the program continuity engine

/// Result type alias for program tracking operations
pub type Result<T> = std::result::Result<T, Error>;

/// Direction of an EPG navigation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationDirection {
    Next,
    Previous,
}

impl std::fmt::Display for NavigationDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Next => f.write_str("next"),
            Self::Previous => f.write_str("previous"),
        }
    }
}

/// Errors that can occur while tracking programs or arbitrating seeks
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The EPG/entitlement backend could not be reached
    #[error("Transport error: {0}")]
    Transport(String),

    /// The backend explicitly denied the asset
    #[error("Not entitled: {0}")]
    NotEntitled(String),

    /// Next/previous navigation requested while the active program is live
    #[error("Cannot navigate to {direction} program while the current program is live")]
    NavigationRejected { direction: NavigationDirection },

    /// The contract restrictions forbid the requested seek
    #[error("Seek from {from} to {to} is not allowed by contract restrictions")]
    SeekNotAllowed { from: i64, to: i64 },

    /// The media source lacks the requested capability
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// The playback integration reported no playhead
    #[error("No playhead available")]
    NoPlayhead,

    /// The tracker worker has been terminated
    #[error("Program tracker stopped")]
    TrackerStopped,

    /// A newer request replaced this one before it completed
    #[error("Request superseded by a newer one")]
    Superseded,

    /// Fuzzy factor below the allowed minimum
    #[error("Invalid fuzzy factor {0} ms (minimum is 30000 ms)")]
    InvalidFuzzyFactor(i64),

    /// Configuration error (from anyhow)
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),
}

impl Error {
    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Whether the error comes from the backend channel rather than a business decision
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}
