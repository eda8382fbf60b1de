//! Beat events, published sync state and the engine that produces them.

pub mod engine;
pub mod metrics;
pub mod scorer;
pub mod state;

pub use engine::SyncEngine;
pub use metrics::SyncMetrics;
pub use scorer::{BeatScore, BeatScorer, FEATURE_LEN, FeatureVector};
pub use state::{BeatEvent, SyncHandle, SyncState, phase_of};
