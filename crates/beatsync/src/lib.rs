//! Real-time beat detection and phase-locked tempo sync.
//!
//! Feed [`AnalysisFrame`]s (or raw onset strengths) into a [`SyncEngine`];
//! read the resulting [`SyncState`] from any thread through a [`SyncHandle`].

pub mod audio;
pub mod beat;
pub mod config;
pub mod error;
pub mod sync;

pub use beat::{AnalysisFrame, BeatCandidate, OnsetFunction, TempoEstimate};
pub use config::{SyncConfig, SyncConfigUpdate};
pub use error::ConfigError;
pub use sync::{BeatEvent, BeatScore, BeatScorer, SyncEngine, SyncHandle, SyncMetrics, SyncState};
