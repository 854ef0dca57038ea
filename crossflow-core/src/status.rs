//! Wire records exchanged over the message bus
//!
//! Everything the service publishes or accepts is defined here so the
//! connectors stay payload-agnostic: they move bytes, these types give the
//! bytes meaning. All records are plain JSON.

use serde::{Deserialize, Serialize};

use crate::classify::ClassificationResult;
use crate::control::{ActionOutcome, ControlStatus};
use crate::snapshot::IntersectionSnapshot;
use crate::time::Timestamp;

/// Status record published on `traffic/{intersection_id}/status` every
/// monitoring cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub intersection_id: String,
    pub timestamp: Timestamp,
    pub fused_data: IntersectionSnapshot,
    pub classification: ClassificationResult,
    pub control_status: ControlStatus,
}

/// Manual override / remote control command received on
/// `traffic/{intersection_id}/control/commands`
///
/// Phase switches are applied through the state machine's request interface
/// and remain subject to its rejections; an override cannot cut a minimum
/// green short.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlCommand {
    SwitchPhase {
        phase: usize,
        /// Requested green hold in seconds; clamped to the phase bounds
        #[serde(default)]
        duration_s: Option<u32>,
    },
    EmergencyStop,
    ClearEmergency,
    NightMode,
    /// Any command type this build does not recognize
    #[serde(other)]
    Unknown,
}

/// Why an alert was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    EmergencyStop,
    ManualOverride,
    NightMode,
}

/// Alert published on `traffic/{intersection_id}/alerts`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub intersection_id: String,
    pub timestamp: Timestamp,
    pub kind: AlertKind,
    /// Outcome of the action that triggered the alert, when there was one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ActionOutcome>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse_from_wire_json() {
        let cmd: ControlCommand =
            serde_json::from_str(r#"{"type": "switch_phase", "phase": 2, "duration_s": 20}"#)
                .unwrap();
        assert_eq!(
            cmd,
            ControlCommand::SwitchPhase {
                phase: 2,
                duration_s: Some(20)
            }
        );

        let cmd: ControlCommand =
            serde_json::from_str(r#"{"type": "emergency_stop"}"#).unwrap();
        assert_eq!(cmd, ControlCommand::EmergencyStop);
    }

    #[test]
    fn unrecognized_command_types_map_to_unknown() {
        let cmd: ControlCommand =
            serde_json::from_str(r#"{"type": "dance_mode"}"#).unwrap();
        assert_eq!(cmd, ControlCommand::Unknown);
    }
}
