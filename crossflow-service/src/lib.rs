//! Intersection controller runtime for Crossflow
//!
//! Wires the core engine to the outside world: one lightweight task per
//! sensor source, a single-consumer fusion actor, a fast monitoring cadence
//! and a slower decision cadence, all per intersection. Multiple
//! intersections run side by side as isolated service instances held in a
//! [`registry::ServiceRegistry`].

#![deny(unsafe_code)]

pub mod registry;
pub mod service;
pub mod source;

pub use registry::ServiceRegistry;
pub use service::{start, ServiceContext, ServiceHandle};
pub use source::{SensorSource, SourceError};
