//! Control actions and their outcomes
//!
//! The action space is finite and enumerated in a fixed order; the learner's
//! argmax breaks ties by this order, so reordering the enumeration changes
//! behavior. Action ids double as the keys of the persisted Q-table
//! (`extend_5`, `switch_to_2`, ...), which keeps the on-disk format stable
//! and human-readable.

use serde::{Deserialize, Serialize};

use super::phase::SwitchRejection;

/// Green-time adjustments offered to the learner, in seconds
pub const EXTEND_DELTAS: [i32; 5] = [-10, -5, 0, 5, 10];

/// One action the controller can take
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "value")]
pub enum Action {
    /// Adjust the active phase's effective green duration by this many seconds
    Extend(i32),
    /// Begin the clearance sequence toward this phase
    SwitchTo(usize),
    /// Bring the intersection to an all-red hold
    EmergencyStop,
    /// Flashing-yellow night operation
    NightMode,
}

impl Action {
    /// Full action space for an intersection with the given phases,
    /// in the fixed enumeration order used for tie-breaking
    pub fn enumerate(phase_ids: &[usize]) -> Vec<Action> {
        let mut actions = Vec::with_capacity(EXTEND_DELTAS.len() + phase_ids.len() + 2);
        for delta in EXTEND_DELTAS {
            actions.push(Action::Extend(delta));
        }
        for &phase_id in phase_ids {
            actions.push(Action::SwitchTo(phase_id));
        }
        actions.push(Action::EmergencyStop);
        actions.push(Action::NightMode);
        actions
    }

    /// Stable id used as the Q-table key
    pub fn id(&self) -> String {
        match self {
            Action::Extend(delta) => format!("extend_{delta}"),
            Action::SwitchTo(phase) => format!("switch_to_{phase}"),
            Action::EmergencyStop => "emergency_stop".to_string(),
            Action::NightMode => "night_mode".to_string(),
        }
    }

    pub fn is_switch(&self) -> bool {
        matches!(self, Action::SwitchTo(_))
    }
}

/// Why an action left the signal untouched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoChangeReason {
    /// Switch requested to the phase that is already active
    AlreadyInPhase,
    /// Extension requested outside the green interval
    NotInGreen,
    /// Fixed-time control is holding the current phase
    MaintainCurrent,
}

/// Typed result of executing an action; execution is total
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action_type", rename_all = "snake_case")]
pub enum ActionOutcome {
    TimeAdjustment {
        delta_s: i32,
        new_green_s: u32,
        phase: usize,
    },
    PhaseSwitch {
        from: usize,
        to: usize,
    },
    NoChange {
        reason: NoChangeReason,
    },
    /// The state machine refused the switch
    Rejected {
        reason: SwitchRejection,
    },
    Emergency,
    NightMode {
        flash_interval_s: f32,
    },
    /// Command not recognized (reachable only from wire-level commands)
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumeration_order_is_fixed() {
        let actions = Action::enumerate(&[0, 1, 2]);
        assert_eq!(actions[0], Action::Extend(-10));
        assert_eq!(actions[4], Action::Extend(10));
        assert_eq!(actions[5], Action::SwitchTo(0));
        assert_eq!(actions[7], Action::SwitchTo(2));
        assert_eq!(actions[8], Action::EmergencyStop);
        assert_eq!(actions[9], Action::NightMode);
        assert_eq!(actions.len(), 10);
    }

    #[test]
    fn action_ids_are_stable() {
        assert_eq!(Action::Extend(-10).id(), "extend_-10");
        assert_eq!(Action::SwitchTo(3).id(), "switch_to_3");
        assert_eq!(Action::EmergencyStop.id(), "emergency_stop");
        assert_eq!(Action::NightMode.id(), "night_mode");
    }

    #[test]
    fn outcome_serializes_with_action_type_tag() {
        let outcome = ActionOutcome::NoChange {
            reason: NoChangeReason::AlreadyInPhase,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["action_type"], "no_change");
        assert_eq!(json["reason"], "already_in_phase");
    }
}
