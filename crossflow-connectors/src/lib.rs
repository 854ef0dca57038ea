//! Message-bus connectors for Crossflow
//!
//! ## Overview
//!
//! The controller treats its transport as an opaque publish/subscribe
//! channel: sensor readings and remote commands arrive on topics, status and
//! alerts leave on topics. This crate provides that channel.
//!
//! MQTT is the deployed protocol. Its pub/sub model maps directly onto the
//! topic layout (`traffic/{intersection_id}/...`), retained messages give
//! late subscribers the last known status, and per-message QoS lets alerts
//! ride at-least-once while high-rate sensor data stays fire-and-forget.
//!
//! ## Design
//!
//! - [`Transport`] is the async seam the service depends on; the MQTT
//!   implementation lives in [`mqtt`], and tests substitute an in-memory
//!   recording transport.
//! - Inbound traffic is decoupled from the broker event loop through a
//!   bounded channel. When the service falls behind, the oldest messages
//!   are dropped and counted; sensor data is superseded every cycle anyway.
//! - Transport failures are transient by definition: they are logged,
//!   counted in [`ConnectionStats`], and the event loop keeps retrying. The
//!   controller runs local-only while the broker is away.

#![deny(unsafe_code)]

pub mod mqtt;
pub mod topics;

pub use mqtt::{MqttConfig, MqttTransport};
pub use topics::TopicSet;

use thiserror::Error;

/// Transport-layer errors; all of them are transient
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("connect timed out after {0} ms")]
    ConnectTimeout(u64),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Connection statistics common to all transports
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    /// Messages published successfully
    pub messages_sent: u64,
    /// Messages that failed to publish
    pub messages_failed: u64,
    /// Payload bytes published
    pub bytes_sent: u64,
    /// Times the event loop re-established the connection
    pub reconnections: u32,
    /// Most recent error, if any
    pub last_error: Option<String>,
}

/// One message received from the bus
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Async publish seam the service depends on
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Publish a payload; errors are transient and safe to drop after logging
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;

    /// Publish with delivery assurance (used for alerts)
    async fn publish_reliable(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    fn stats(&self) -> ConnectionStats;

    /// Cleanly drop the connection; further publishes fail as NotConnected
    async fn disconnect(&self);
}
