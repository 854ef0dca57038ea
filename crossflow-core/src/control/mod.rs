//! Signal control: policies and the phase state machine
//!
//! Control is split into two layers with very different trust levels:
//!
//! - A **policy** ([`ControlStrategy`]) decides *what to ask for*: extend
//!   the green, switch phases, go to emergency hold. The Q-learning policy
//!   in [`qlearn`] is the default; [`FixedTimeController`] cycles phases on
//!   fixed timings, and a learned DQN policy can drop in behind the same
//!   trait.
//! - The **state machine** ([`phase::PhaseStateMachine`]) decides *what
//!   actually happens*. It enforces minimum greens and clearance intervals
//!   no matter what the policy requests.
//!
//! Policies can only submit requests; they cannot manipulate intervals
//! directly.

pub mod action;
pub mod phase;
pub mod qlearn;

pub use action::{Action, ActionOutcome, NoChangeReason};
pub use phase::{PhaseEvent, PhaseRuntime, PhaseStateMachine, SignalInterval, SwitchRejection};
pub use qlearn::{AdaptivePhaseController, CongestionBucket, QTable, StateKey};

use serde::{Deserialize, Serialize};

use crate::errors::StoreError;
use crate::snapshot::IntersectionSnapshot;
use crate::time::{delta_ms, Timestamp};

/// Which policy is driving the intersection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    Adaptive,
    FixedTime,
}

/// Controller status included in every published status record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlStatus {
    pub mode: ControlMode,
    pub current_phase: usize,
    pub phase_name: String,
    pub sub_state: SignalInterval,
    /// Remaining effective green in seconds; 0 during clearance
    pub remaining_time_s: u64,
    /// Current exploration rate; 0 for non-learning policies
    pub epsilon: f64,
    /// Visited states in the Q-table; 0 for non-learning policies
    pub q_table_size: usize,
    pub decisions: u64,
}

/// One decision kept in the bounded controller history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub timestamp: Timestamp,
    pub state: String,
    pub action: String,
    pub outcome: ActionOutcome,
}

/// Contract every control policy implements
///
/// `decide` runs on the decision cadence and may mutate the state machine
/// through its request interface. `settle` runs one reward delay later with
/// the before/after snapshots so learning policies can score the action;
/// non-learning policies ignore it.
pub trait ControlStrategy: Send {
    fn decide(
        &mut self,
        snapshot: &IntersectionSnapshot,
        machine: &mut PhaseStateMachine,
        now: Timestamp,
    ) -> ActionOutcome;

    fn settle(
        &mut self,
        before: &IntersectionSnapshot,
        after: &IntersectionSnapshot,
        machine: &PhaseStateMachine,
        now: Timestamp,
    );

    fn status(&self, machine: &PhaseStateMachine, now: Timestamp) -> ControlStatus;

    /// Persist any learned state; called at shutdown
    fn flush(&mut self) -> Result<(), StoreError>;
}

/// Fixed-time fallback: hold each phase for a configured duration, then
/// cycle to the next
pub struct FixedTimeController {
    /// (phase id, hold seconds) in cycle order
    timings: Vec<(usize, u32)>,
    decisions: u64,
}

impl FixedTimeController {
    pub fn new(timings: Vec<(usize, u32)>) -> Self {
        Self {
            timings,
            decisions: 0,
        }
    }

    /// Hold each configured phase for its minimum green
    pub fn from_config(config: &crate::config::IntersectionConfig) -> Self {
        Self::new(
            config
                .phases
                .iter()
                .map(|p| (p.id, p.min_green_s))
                .collect(),
        )
    }

    fn next_phase_after(&self, phase_id: usize) -> Option<usize> {
        let pos = self.timings.iter().position(|&(id, _)| id == phase_id)?;
        Some(self.timings[(pos + 1) % self.timings.len()].0)
    }
}

impl ControlStrategy for FixedTimeController {
    fn decide(
        &mut self,
        _snapshot: &IntersectionSnapshot,
        machine: &mut PhaseStateMachine,
        now: Timestamp,
    ) -> ActionOutcome {
        self.decisions += 1;

        if machine.interval() != SignalInterval::Green {
            return ActionOutcome::NoChange {
                reason: NoChangeReason::MaintainCurrent,
            };
        }

        let current = machine.current_phase_id();
        let hold_s = self
            .timings
            .iter()
            .find(|&&(id, _)| id == current)
            .map(|&(_, s)| s)
            .unwrap_or(0);
        let elapsed_s = delta_ms(machine.runtime().phase_start_time, now) / 1000;

        if elapsed_s < hold_s as u64 {
            return ActionOutcome::NoChange {
                reason: NoChangeReason::MaintainCurrent,
            };
        }

        match self.next_phase_after(current) {
            Some(next) if next != current => match machine.request_switch(next, now) {
                Ok(_) => ActionOutcome::PhaseSwitch {
                    from: current,
                    to: next,
                },
                Err(reason) => ActionOutcome::Rejected { reason },
            },
            _ => ActionOutcome::NoChange {
                reason: NoChangeReason::MaintainCurrent,
            },
        }
    }

    fn settle(
        &mut self,
        _before: &IntersectionSnapshot,
        _after: &IntersectionSnapshot,
        _machine: &PhaseStateMachine,
        _now: Timestamp,
    ) {
    }

    fn status(&self, machine: &PhaseStateMachine, now: Timestamp) -> ControlStatus {
        ControlStatus {
            mode: ControlMode::FixedTime,
            current_phase: machine.current_phase_id(),
            phase_name: machine.current_phase_name().to_string(),
            sub_state: machine.interval(),
            remaining_time_s: machine.remaining_green_s(now),
            epsilon: 0.0,
            q_table_size: 0,
            decisions: self.decisions,
        }
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}
