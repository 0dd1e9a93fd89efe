//! # pmoprogram - Program continuity and entitlement validation
//!
//! `pmoprogram` keeps track of which broadcast program matches the playhead of
//! a live, time-shifted or catch-up TV stream, and keeps re-validating that the
//! viewer is entitled to it while spreading backend load over time.
//!
//! ## Features
//!
//! - **Program tracking**: follows program transitions and extensions as the playhead moves
//! - **Load shedding**: backend calls are jittered inside a configurable fuzzy window
//! - **Permissive failures**: network errors and EPG gaps become warnings, not stops
//! - **Seek arbitration**: contract restrictions, then restart when a seek leaves the program
//! - **Async**: one serial tokio worker per channel, no locks around tracking state
//!
//! ## Quick Start
//!
//! ```no_run
//! use pmoprogram::{
//!     MemoryProgramProvider, PlaybackIntegration, ProgramConfig, ProgramSession,
//!     SourceCapabilities, SystemClock,
//! };
//! use std::sync::Arc;
//!
//! # async fn run(player: Arc<dyn PlaybackIntegration>) -> anyhow::Result<()> {
//! let config = ProgramConfig::load_or_default("pmoprogram.yaml")?;
//! let provider = Arc::new(MemoryProgramProvider::new());
//!
//! let (session, mut events) = ProgramSession::new(
//!     SourceCapabilities::channel("france-2"),
//!     provider,
//!     player,
//!     Arc::new(SystemClock),
//!     &config,
//! );
//!
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! session.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`tracker`]: the program tracker worker and its fetch / change / validate timers
//! - [`fuzzy`]: jittered offsets for those timers
//! - [`seek`]: seek arbitration against [`restrictions`]
//! - [`session`]: capability check, rate-change driver, not-entitled enforcement
//! - [`provider`] and [`playback`]: the two collaborator boundaries
//! - [`events`]: everything reported back to the application
//! - [`config`]: YAML configuration with environment overrides

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod fuzzy;
pub mod playback;
pub mod program;
pub mod provider;
pub mod restrictions;
pub mod seek;
pub mod session;
pub mod timers;
pub mod tracker;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ProgramConfig, RestrictionsConfig};
pub use error::{Error, NavigationDirection, Result};
pub use events::{EventSink, PlaybackEvent, Warning};
pub use fuzzy::{fuzzy_offsets, FuzzyFactor, FuzzyOffsets, MIN_FUZZY_FACTOR_MS};
pub use playback::{
    PlayFrom, PlaybackIntegration, PlaybackProperties, PlaybackRate, SourceCapabilities,
};
pub use program::{Continuity, Program, Timestamp};
pub use provider::{MemoryProgramProvider, ProgramProvider, ValidationOutcome};
pub use restrictions::{BasicContractRestrictions, ContractRestrictions};
pub use seek::{SeekCoordinator, SeekOutcome};
pub use session::ProgramSession;
pub use tracker::{ProgramTracker, TrackerSnapshot, TrackerStatus};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
