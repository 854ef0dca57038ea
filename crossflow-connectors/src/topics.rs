//! Topic layout for one intersection
//!
//! Everything lives under `traffic/{intersection_id}/`:
//!
//! ```text
//! traffic/{id}/sensors/{kind}/data   ← sensor readings (camera|radar|magnetic)
//! traffic/{id}/control/commands      ← manual overrides, remote commands
//! traffic/{id}/config                ← configuration update notifications
//! traffic/{id}/status                → fused state + classification + control
//! traffic/{id}/alerts                → emergencies and override acks
//! ```

use crossflow_core::reading::SensorKind;

/// Topic names for one intersection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSet {
    base: String,
}

impl TopicSet {
    pub fn new(intersection_id: &str) -> Self {
        Self {
            base: format!("traffic/{intersection_id}"),
        }
    }

    pub fn status(&self) -> String {
        format!("{}/status", self.base)
    }

    pub fn alerts(&self) -> String {
        format!("{}/alerts", self.base)
    }

    pub fn commands(&self) -> String {
        format!("{}/control/commands", self.base)
    }

    pub fn config(&self) -> String {
        format!("{}/config", self.base)
    }

    pub fn sensor_data(&self, kind: SensorKind) -> String {
        format!("{}/sensors/{}/data", self.base, kind.name())
    }

    /// Wildcard matching sensor data of every kind
    pub fn sensor_data_filter(&self) -> String {
        format!("{}/sensors/+/data", self.base)
    }

    /// Topics an intersection service subscribes to
    pub fn subscriptions(&self) -> Vec<String> {
        vec![
            self.sensor_data_filter(),
            self.commands(),
            self.config(),
        ]
    }

    /// Extract the sensor kind from a `sensors/{kind}/data` topic
    pub fn sensor_kind_of(&self, topic: &str) -> Option<SensorKind> {
        let rest = topic.strip_prefix(&self.base)?.strip_prefix('/')?;
        let mut parts = rest.split('/');
        if parts.next() != Some("sensors") {
            return None;
        }
        let kind = parts.next()?;
        if parts.next() != Some("data") {
            return None;
        }
        SensorKind::from_name(kind)
    }

    pub fn is_command(&self, topic: &str) -> bool {
        topic == self.commands()
    }

    pub fn is_config(&self, topic: &str) -> bool {
        topic == self.config()
    }
}
