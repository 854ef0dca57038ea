//! Adaptive phase control via tabular Q-learning
//!
//! ## Overview
//!
//! The controller observes the fused intersection state, discretizes it into
//! a compact state key, and picks the next control action with an ε-greedy
//! policy over a lazily grown Q-table:
//!
//! ```text
//! snapshot ─→ (bucket(N), bucket(S), bucket(E), bucket(W), phase) ─→ ε-greedy
//!                                                                      │
//!        Q[s][a] += α(r + γ·max Q[s'] − Q[s][a])  ←── reward(before, after)
//! ```
//!
//! State keys and action ids are plain strings (`low_medium_high_low_2`,
//! `switch_to_1`), which makes the persisted Q-table a human-readable JSON
//! mapping and keeps test assertions exact.
//!
//! ## Determinism
//!
//! Exploitation breaks ties by the fixed action enumeration order (first
//! declared wins), and the exploration RNG is seedable, so a controller with
//! ε = 0 (or a pinned seed) is fully deterministic under test.
//!
//! ## Persistence
//!
//! The table is flushed every `persist_every` decisions and at shutdown. A
//! missing file at startup means an empty table, not an error; an unreadable
//! file is logged and likewise replaced by an empty table.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::action::{Action, ActionOutcome, NoChangeReason};
use super::phase::PhaseStateMachine;
use super::{ControlMode, ControlStatus, ControlStrategy, DecisionRecord};
use crate::config::{Direction, IntersectionConfig, LearningConfig};
use crate::errors::StoreError;
use crate::snapshot::{IntersectionSnapshot, LaneSnapshot};
use crate::time::Timestamp;

/// Queue length at which a lane counts as fully congested
const LANE_QUEUE_SATURATION: f64 = 15.0;

/// Bounded decision history kept for status reporting
const HISTORY_CAPACITY: usize = 32;

/// Discretized congestion of one approach
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CongestionBucket {
    Low,
    Medium,
    High,
}

impl CongestionBucket {
    pub fn from_level(level: f64) -> Self {
        if level < 0.3 {
            CongestionBucket::Low
        } else if level < 0.7 {
            CongestionBucket::Medium
        } else {
            CongestionBucket::High
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            CongestionBucket::Low => "low",
            CongestionBucket::Medium => "medium",
            CongestionBucket::High => "high",
        }
    }
}

/// Discrete controller state: per-direction congestion plus the active phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateKey {
    pub buckets: [CongestionBucket; 4],
    pub phase: usize,
}

impl StateKey {
    /// Derive the state from a snapshot and the active phase
    ///
    /// Directions with no configured lanes bucket as low.
    pub fn derive(snapshot: &IntersectionSnapshot, phase: usize) -> Self {
        let buckets = Direction::ALL.map(|direction| {
            let levels: Vec<f64> = snapshot
                .lanes_from(direction)
                .map(lane_congestion_estimate)
                .collect();
            if levels.is_empty() {
                CongestionBucket::Low
            } else {
                CongestionBucket::from_level(
                    levels.iter().sum::<f64>() / levels.len() as f64,
                )
            }
        });
        Self { buckets, phase }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}_{}",
            self.buckets[0].name(),
            self.buckets[1].name(),
            self.buckets[2].name(),
            self.buckets[3].name(),
            self.phase
        )
    }
}

/// Continuous congestion estimate for one lane, in [0, 1]
fn lane_congestion_estimate(lane: &LaneSnapshot) -> f64 {
    let queue = (lane.queue_length as f64 / LANE_QUEUE_SATURATION).min(1.0);
    let occupancy = lane.occupancy_rate as f64;
    (0.5 * queue + 0.5 * occupancy).clamp(0.0, 1.0)
}

/// State → action → value mapping, grown lazily
///
/// Reads of unseen entries return 0.0 without inserting, so the serialized
/// table contains exactly the visited (state, action) pairs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QTable {
    entries: HashMap<String, HashMap<String, f64>>,
}

impl QTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn q(&self, state: &str, action: &str) -> f64 {
        self.entries
            .get(state)
            .and_then(|actions| actions.get(action))
            .copied()
            .unwrap_or(0.0)
    }

    /// Highest value over the state's visited actions; 0.0 for unseen states
    pub fn max_q(&self, state: &str) -> f64 {
        self.entries
            .get(state)
            .and_then(|actions| {
                actions
                    .values()
                    .copied()
                    .fold(None, |best: Option<f64>, v| {
                        Some(best.map_or(v, |b| b.max(v)))
                    })
            })
            .unwrap_or(0.0)
    }

    pub fn set(&mut self, state: &str, action: &str, value: f64) {
        self.entries
            .entry(state.to_string())
            .or_default()
            .insert(action.to_string(), value);
    }

    /// Number of visited states
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Load the table, treating a missing file as an empty table and an
    /// unreadable one as an empty table with a warning
    pub fn load_or_empty(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            info!("no Q-table at {}, starting from an empty table", path.display());
            return Self::new();
        }
        match Self::load(path) {
            Ok(table) => {
                info!("loaded Q-table with {} states from {}", table.len(), path.display());
                table
            }
            Err(e) => {
                warn!(
                    "Q-table {} unusable ({e}), starting from an empty table",
                    path.display()
                );
                Self::new()
            }
        }
    }
}

/// Reward for moving the intersection from `before` to `after` via `action`
pub fn reward(
    before: &IntersectionSnapshot,
    after: &IntersectionSnapshot,
    action: &Action,
) -> f64 {
    let mut reward = 10.0 * (before.congestion_level - after.congestion_level);

    if after.average_speed > 40.0 {
        reward += 5.0;
    } else if after.average_speed < 20.0 {
        reward -= 5.0;
    }

    if after.total_vehicles < 10 {
        reward += 2.0;
    } else if after.total_vehicles > 30 {
        reward -= 10.0;
    }

    if action.is_switch() {
        reward -= 2.0;
    }
    if *action == Action::EmergencyStop {
        reward -= 20.0;
    }

    reward
}

struct PendingDecision {
    state_key: String,
    action: Action,
}

/// Q-learning phase controller
pub struct AdaptivePhaseController {
    intersection_id: String,
    learning: LearningConfig,
    actions: Vec<Action>,
    qtable: QTable,
    epsilon: f64,
    decisions: u64,
    store_path: PathBuf,
    rng: StdRng,
    pending: Option<PendingDecision>,
    history: heapless::HistoryBuffer<DecisionRecord, HISTORY_CAPACITY>,
}

impl AdaptivePhaseController {
    pub fn new(config: &IntersectionConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Deterministic exploration for tests
    pub fn with_seed(config: &IntersectionConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &IntersectionConfig, rng: StdRng) -> Self {
        let store_path = config
            .data_dir
            .join(format!("q_table_{}.json", config.intersection_id));
        let phase_ids: Vec<usize> = config.phases.iter().map(|p| p.id).collect();
        Self {
            intersection_id: config.intersection_id.clone(),
            learning: config.learning.clone(),
            actions: Action::enumerate(&phase_ids),
            qtable: QTable::load_or_empty(&store_path),
            epsilon: config.learning.epsilon,
            decisions: 0,
            store_path,
            rng,
            pending: None,
            history: heapless::HistoryBuffer::new(),
        }
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn qtable(&self) -> &QTable {
        &self.qtable
    }

    pub fn decisions(&self) -> u64 {
        self.decisions
    }

    pub fn recent_decisions(&self) -> Vec<DecisionRecord> {
        self.history.oldest_ordered().cloned().collect()
    }

    /// Discard in-flight decision state and restart exploration
    ///
    /// The learned Q-table is kept; only the episode-local state (pending
    /// decision, history, decision count, ε) returns to its initial value.
    pub fn reset(&mut self) {
        self.pending = None;
        self.history = heapless::HistoryBuffer::new();
        self.decisions = 0;
        self.epsilon = self.learning.epsilon;
        info!("{}: controller reset", self.intersection_id);
    }

    /// ε-greedy action selection; exploitation ties break toward the
    /// first-declared action
    pub fn choose_action(&mut self, state: &StateKey) -> Action {
        if self.rng.gen::<f64>() < self.epsilon {
            let idx = self.rng.gen_range(0..self.actions.len());
            return self.actions[idx];
        }

        let key = state.to_string();
        let mut best = self.actions[0];
        let mut best_q = self.qtable.q(&key, &best.id());
        for action in &self.actions[1..] {
            let q = self.qtable.q(&key, &action.id());
            if q > best_q {
                best = *action;
                best_q = q;
            }
        }
        best
    }

    /// Apply an action to the signal; total, every input maps to an outcome
    pub fn execute(
        &mut self,
        action: Action,
        machine: &mut PhaseStateMachine,
        now: Timestamp,
    ) -> ActionOutcome {
        match action {
            Action::Extend(delta_s) => match machine.extend(delta_s, now) {
                Some(new_green_s) => ActionOutcome::TimeAdjustment {
                    delta_s,
                    new_green_s,
                    phase: machine.current_phase_id(),
                },
                None => ActionOutcome::NoChange {
                    reason: NoChangeReason::NotInGreen,
                },
            },
            Action::SwitchTo(target) => {
                let from = machine.current_phase_id();
                if target == from {
                    return ActionOutcome::NoChange {
                        reason: NoChangeReason::AlreadyInPhase,
                    };
                }
                match machine.request_switch(target, now) {
                    Ok(_) => ActionOutcome::PhaseSwitch { from, to: target },
                    Err(reason) => ActionOutcome::Rejected { reason },
                }
            }
            Action::EmergencyStop => {
                machine.emergency_stop(now);
                ActionOutcome::Emergency
            }
            Action::NightMode => ActionOutcome::NightMode { flash_interval_s: 1.0 },
        }
    }

    /// Q-learning update followed by ε decay and periodic persistence
    pub fn update(&mut self, state: &StateKey, action: &Action, reward: f64, next: &StateKey) {
        self.update_by_key(&state.to_string(), &action.id(), reward, &next.to_string());
    }

    fn update_by_key(&mut self, state_key: &str, action_id: &str, reward: f64, next_key: &str) {
        let old_q = self.qtable.q(state_key, action_id);
        let max_next = self.qtable.max_q(next_key);
        let new_q =
            old_q + self.learning.alpha * (reward + self.learning.gamma * max_next - old_q);
        self.qtable.set(state_key, action_id, new_q);

        self.epsilon = (self.epsilon * self.learning.epsilon_decay).max(self.learning.epsilon_min);

        self.decisions += 1;
        if self.learning.persist_every > 0 && self.decisions % self.learning.persist_every == 0 {
            if let Err(e) = self.qtable.save(&self.store_path) {
                warn!(
                    "periodic Q-table persist failed for {}: {e}",
                    self.intersection_id
                );
            }
        }
    }
}

impl ControlStrategy for AdaptivePhaseController {
    fn decide(
        &mut self,
        snapshot: &IntersectionSnapshot,
        machine: &mut PhaseStateMachine,
        now: Timestamp,
    ) -> ActionOutcome {
        let state = StateKey::derive(snapshot, machine.current_phase_id());
        let action = self.choose_action(&state);
        let outcome = self.execute(action, machine, now);
        debug!(
            "{}: state {state} -> {} -> {outcome:?}",
            self.intersection_id,
            action.id()
        );

        self.history.write(DecisionRecord {
            timestamp: now,
            state: state.to_string(),
            action: action.id(),
            outcome,
        });
        self.pending = Some(PendingDecision {
            state_key: state.to_string(),
            action,
        });
        outcome
    }

    fn settle(
        &mut self,
        before: &IntersectionSnapshot,
        after: &IntersectionSnapshot,
        machine: &PhaseStateMachine,
        _now: Timestamp,
    ) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let r = reward(before, after, &pending.action);
        let next = StateKey::derive(after, machine.current_phase_id());
        self.update_by_key(&pending.state_key, &pending.action.id(), r, &next.to_string());
    }

    fn status(&self, machine: &PhaseStateMachine, now: Timestamp) -> ControlStatus {
        ControlStatus {
            mode: ControlMode::Adaptive,
            current_phase: machine.current_phase_id(),
            phase_name: machine.current_phase_name().to_string(),
            sub_state: machine.interval(),
            remaining_time_s: machine.remaining_green_s(now),
            epsilon: self.epsilon,
            q_table_size: self.qtable.len(),
            decisions: self.decisions,
        }
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        self.qtable.save(&self.store_path)
    }
}
