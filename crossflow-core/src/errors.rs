//! Error types for the control engine
//!
//! The error surface is deliberately narrow. Per the error-handling design,
//! only two kinds of failure cross a component boundary as an `Err`:
//!
//! - **Fatal startup errors** ([`ConfigError`]): a missing or inconsistent
//!   lane/phase configuration aborts startup; there is no partial service.
//! - **Persistence errors** ([`StoreError`]): failures saving or loading the
//!   Q-table or classifier artifact. Loads fall back to safe defaults (empty
//!   table, rule classifier) and are logged as warnings by the caller; saves
//!   are surfaced so shutdown can report an unflushed model.
//!
//! Everything else (stale readings, missing sensors, malformed features) is
//! substituted with safe defaults inside the component, never raised.

use thiserror::Error;

/// Fatal configuration errors detected at startup
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("intersection '{intersection_id}' has no lanes configured")]
    NoLanes { intersection_id: String },

    #[error("intersection '{intersection_id}' has no phases configured")]
    NoPhases { intersection_id: String },

    #[error("duplicate phase id {phase_id}")]
    DuplicatePhase { phase_id: usize },

    #[error("phase {phase_id}: min_green {min_green_s}s exceeds max_green {max_green_s}s")]
    InvalidPhaseTiming {
        phase_id: usize,
        min_green_s: u32,
        max_green_s: u32,
    },

    #[error("lane '{lane_id}' has an empty angle range")]
    EmptyAngleRange { lane_id: String },
}

/// Errors saving or loading persisted learning state
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("store (de)serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("unsupported artifact version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },
}
