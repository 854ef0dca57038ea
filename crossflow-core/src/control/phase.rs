//! Safety-critical phase sequencing
//!
//! ## Overview
//!
//! The state machine owns the signal heads. Whatever the learned policy or a
//! manual override asks for, the only path between two green phases is
//!
//! ```text
//! Green(a) → Yellow(yellow_time) → AllRed(all_red_time) → Green(b)
//! ```
//!
//! The clearance transitions are hard-coded in [`PhaseStateMachine::tick`]
//! and are not parameterized by the requesting action, so skipping Yellow or
//! AllRed is structurally impossible rather than a caught runtime error.
//!
//! ## Timing rules
//!
//! - A green must hold at least `min_green` before any switch is honored;
//!   earlier requests are rejected with [`SwitchRejection::TooEarly`], never
//!   queued.
//! - Yellow lasts exactly `yellow_time` and AllRed exactly `all_red_time`.
//!   Interval boundaries advance by the configured duration, not by the
//!   observation time, so late ticks never stretch a clearance interval.
//! - Extensions adjust only the effective green ceiling, clamped to
//!   `[min_green, max_green]`; they cannot touch clearance intervals.
//! - An emergency stop traverses Yellow and AllRed like any other switch and
//!   then holds AllRed until cleared. There is no instantaneous green→red
//!   flip.

use serde::{Deserialize, Serialize};

use crate::config::PhaseConfig;
use crate::time::{delta_ms, Timestamp, MILLIS_PER_SEC};

/// Signal interval within a phase cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalInterval {
    Green,
    Yellow,
    AllRed,
}

/// Why a switch request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchRejection {
    /// The active green has not yet held `min_green`
    TooEarly,
    /// A clearance sequence is already running
    ClearanceInProgress,
    /// No phase with the requested id is configured
    UnknownPhase,
    /// An emergency hold is active
    EmergencyActive,
}

/// Accepted switch request outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    /// The requested phase is already active; nothing to do
    AlreadyActive,
    /// Clearance toward the requested phase has begun
    Started,
}

/// Transitions produced by advancing the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    EnteredYellow { from: usize },
    EnteredAllRed,
    EnteredGreen { phase: usize },
}

/// Observable runtime state of the machine
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseRuntime {
    pub current_phase: usize,
    pub sub_state: SignalInterval,
    /// When the current green began (the previous one, during clearance)
    pub phase_start_time: Timestamp,
    pub emergency: bool,
}

/// Enforces legal green/yellow/all-red sequencing and timing bounds
pub struct PhaseStateMachine {
    phases: Vec<PhaseConfig>,
    /// Index into `phases` of the active (or, during clearance, outgoing) phase
    current: usize,
    /// Index of the phase the running clearance leads to; `None` during an
    /// emergency hold
    pending: Option<usize>,
    interval: SignalInterval,
    /// Start of the current interval; advanced by exact configured durations
    interval_started: Timestamp,
    /// Start of the current (or outgoing) green
    green_started: Timestamp,
    /// Effective green ceiling for the current green, within
    /// [min_green, max_green]
    effective_green_ms: u64,
    emergency: bool,
}

impl PhaseStateMachine {
    /// Start at the first configured phase, Green, at `now`
    pub fn new(phases: Vec<PhaseConfig>, now: Timestamp) -> Self {
        debug_assert!(!phases.is_empty(), "config validation guarantees phases");
        let effective_green_ms = phases[0].min_green_ms();
        Self {
            phases,
            current: 0,
            pending: None,
            interval: SignalInterval::Green,
            interval_started: now,
            green_started: now,
            effective_green_ms,
            emergency: false,
        }
    }

    pub fn current_phase_id(&self) -> usize {
        self.phases[self.current].id
    }

    pub fn current_phase_name(&self) -> &str {
        &self.phases[self.current].name
    }

    pub fn interval(&self) -> SignalInterval {
        self.interval
    }

    pub fn is_emergency(&self) -> bool {
        self.emergency
    }

    pub fn runtime(&self) -> PhaseRuntime {
        PhaseRuntime {
            current_phase: self.current_phase_id(),
            sub_state: self.interval,
            phase_start_time: self.green_started,
            emergency: self.emergency,
        }
    }

    /// Remaining effective green in whole seconds; 0 outside Green
    pub fn remaining_green_s(&self, now: Timestamp) -> u64 {
        match self.interval {
            SignalInterval::Green => {
                let elapsed = delta_ms(self.interval_started, now);
                self.effective_green_ms.saturating_sub(elapsed) / MILLIS_PER_SEC
            }
            _ => 0,
        }
    }

    /// Request a switch to the phase with the given id
    ///
    /// Deterministic: either the clearance sequence starts now, or the
    /// request is rejected with a reason. Rejected requests are not queued.
    pub fn request_switch(
        &mut self,
        target_id: usize,
        now: Timestamp,
    ) -> Result<SwitchOutcome, SwitchRejection> {
        if self.emergency {
            return Err(SwitchRejection::EmergencyActive);
        }
        let target = self
            .phases
            .iter()
            .position(|p| p.id == target_id)
            .ok_or(SwitchRejection::UnknownPhase)?;

        if self.interval != SignalInterval::Green {
            return Err(SwitchRejection::ClearanceInProgress);
        }
        if target == self.current {
            return Ok(SwitchOutcome::AlreadyActive);
        }

        let elapsed = delta_ms(self.interval_started, now);
        if elapsed < self.phases[self.current].min_green_ms() {
            return Err(SwitchRejection::TooEarly);
        }

        self.begin_clearance(Some(target), now);
        Ok(SwitchOutcome::Started)
    }

    /// Adjust the effective green ceiling by `delta_s` seconds
    ///
    /// Legal only in Green; the result is clamped to the phase's
    /// [min_green, max_green]. Returns the new ceiling in seconds.
    pub fn extend(&mut self, delta_s: i32, _now: Timestamp) -> Option<u32> {
        if self.interval != SignalInterval::Green {
            return None;
        }
        let phase = &self.phases[self.current];
        let proposed =
            self.effective_green_ms as i64 + delta_s as i64 * MILLIS_PER_SEC as i64;
        let clamped = proposed.clamp(phase.min_green_ms() as i64, phase.max_green_ms() as i64);
        self.effective_green_ms = clamped as u64;
        Some((self.effective_green_ms / MILLIS_PER_SEC) as u32)
    }

    /// Begin an emergency all-red hold
    ///
    /// From Green the full clearance sequence runs first; from Yellow or
    /// AllRed the sequence already in flight completes and the machine then
    /// holds AllRed instead of entering a new green.
    pub fn emergency_stop(&mut self, now: Timestamp) {
        if self.emergency {
            return;
        }
        self.emergency = true;
        self.pending = None;
        if self.interval == SignalInterval::Green {
            self.begin_clearance(None, now);
        }
    }

    /// Leave the emergency hold; the current phase's green resumes on the
    /// next tick after any in-flight clearance completes
    pub fn clear_emergency(&mut self, now: Timestamp) {
        if !self.emergency {
            return;
        }
        self.emergency = false;
        if self.interval == SignalInterval::AllRed {
            // Holding all-red: restart the interval so the mandatory
            // all_red_time still elapses before green returns
            self.interval_started = now;
        }
    }

    /// Advance the machine to `now`, returning the transitions that occurred
    ///
    /// Interval boundaries move by exact configured durations, so several
    /// transitions may fire from a single late tick and recorded durations
    /// match configuration regardless of tick cadence.
    pub fn tick(&mut self, now: Timestamp) -> Vec<PhaseEvent> {
        let mut events = Vec::new();
        loop {
            let elapsed = delta_ms(self.interval_started, now);
            match self.interval {
                SignalInterval::Green => {
                    if self.emergency || elapsed < self.effective_green_ms {
                        break;
                    }
                    // Green ceiling reached: roll over to the next phase
                    let rollover_at = self.interval_started + self.effective_green_ms;
                    let next = (self.current + 1) % self.phases.len();
                    self.pending = Some(next);
                    self.interval = SignalInterval::Yellow;
                    self.interval_started = rollover_at;
                    events.push(PhaseEvent::EnteredYellow {
                        from: self.current_phase_id(),
                    });
                }
                SignalInterval::Yellow => {
                    let yellow_ms = self.phases[self.current].yellow_ms();
                    if elapsed < yellow_ms {
                        break;
                    }
                    self.interval = SignalInterval::AllRed;
                    self.interval_started += yellow_ms;
                    events.push(PhaseEvent::EnteredAllRed);
                }
                SignalInterval::AllRed => {
                    let all_red_ms = self.phases[self.current].all_red_ms();
                    if elapsed < all_red_ms {
                        break;
                    }
                    if self.emergency {
                        // Hold all-red until the emergency is cleared
                        break;
                    }
                    let green_at = self.interval_started + all_red_ms;
                    if let Some(target) = self.pending.take() {
                        self.current = target;
                    }
                    self.interval = SignalInterval::Green;
                    self.interval_started = green_at;
                    self.green_started = green_at;
                    self.effective_green_ms = self.phases[self.current].min_green_ms();
                    events.push(PhaseEvent::EnteredGreen {
                        phase: self.current_phase_id(),
                    });
                }
            }
        }
        events
    }

    fn begin_clearance(&mut self, target: Option<usize>, now: Timestamp) {
        self.pending = target;
        self.interval = SignalInterval::Yellow;
        self.interval_started = now;
    }
}
