//! Core control engine for Crossflow
//!
//! Fuses asynchronous multi-sensor observations into a consistent per-lane
//! intersection view, classifies the traffic state, and adaptively times
//! signal phases with Q-learning behind a safety-critical state machine.
//!
//! Data flows one way:
//!
//! ```text
//! readings → SensorFusion → TrafficClassifier → control policy → PhaseStateMachine
//! ```
//!
//! Key guarantees:
//! - Snapshots are immutable and replaced whole; readers never see a
//!   half-updated intersection
//! - Classification and control are total operations: bad input degrades to
//!   safe defaults, it does not raise
//! - Clearance intervals (yellow + all-red) are hard-coded into the state
//!   machine and cannot be skipped by any policy, learned or manual
//!
//! ```no_run
//! use crossflow_core::config::IntersectionConfig;
//! use crossflow_core::control::{AdaptivePhaseController, PhaseStateMachine};
//! use crossflow_core::fusion::SensorFusion;
//!
//! let config = IntersectionConfig::four_way("intersection_001");
//! let mut fusion = SensorFusion::new(config.lanes.clone());
//! let mut machine = PhaseStateMachine::new(config.phases.clone(), 0);
//! let controller = AdaptivePhaseController::new(&config);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod classify;
pub mod config;
pub mod control;
pub mod errors;
pub mod fusion;
pub mod reading;
pub mod snapshot;
pub mod status;
pub mod time;

// Public API
pub use classify::{ClassificationResult, Features, TrafficClassifier};
pub use config::IntersectionConfig;
pub use control::{
    Action, ActionOutcome, AdaptivePhaseController, ControlStatus, ControlStrategy,
    PhaseStateMachine,
};
pub use errors::{ConfigError, StoreError};
pub use fusion::SensorFusion;
pub use reading::{SensorKind, SensorPayload, SensorReading};
pub use snapshot::{IntersectionSnapshot, LaneSnapshot, TrafficState};
pub use status::{ControlCommand, StatusRecord};
pub use time::{Clock, Timestamp};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_exists() {
        assert!(!VERSION.is_empty());
    }
}
