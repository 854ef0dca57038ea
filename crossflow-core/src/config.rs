//! Static intersection configuration
//!
//! Lane geometry, signal phases, and learning parameters are loaded once at
//! startup and immutable afterwards. A missing or inconsistent configuration
//! is the one fatal error class in the system: [`IntersectionConfig::load`]
//! aborts startup rather than running a partially configured intersection.
//!
//! Lane-to-angle mapping is part of the configuration, not a hardcoded
//! four-way table, so the engine generalizes to other intersection shapes.
//! [`IntersectionConfig::four_way`] provides the standard two-lanes-per-
//! approach layout as a default and as the fixture used throughout tests.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::time::MILLIS_PER_SEC;

/// Compass approach of a lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    North,
    South,
    East,
    West,
}

impl Direction {
    /// All directions, in the fixed order used for controller state keys
    pub const ALL: [Direction; 4] = [
        Direction::North,
        Direction::South,
        Direction::East,
        Direction::West,
    ];

    pub const fn name(&self) -> &'static str {
        match self {
            Direction::North => "north",
            Direction::South => "south",
            Direction::East => "east",
            Direction::West => "west",
        }
    }
}

/// Movement a lane serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnType {
    Straight,
    Left,
}

/// Inclusive bearing interval assigning radar targets to a lane, in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AngleRange {
    pub min_deg: f32,
    pub max_deg: f32,
}

impl AngleRange {
    pub const fn new(min_deg: f32, max_deg: f32) -> Self {
        Self { min_deg, max_deg }
    }

    pub fn contains(&self, angle_deg: f32) -> bool {
        angle_deg >= self.min_deg && angle_deg <= self.max_deg
    }

    pub fn is_empty(&self) -> bool {
        self.max_deg < self.min_deg
    }
}

/// One directional traffic channel and the sensors that observe it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneConfig {
    pub lane_id: String,
    pub direction: Direction,
    pub turn: TurnType,
    /// Sensor ids feeding this lane (any kind)
    pub sensor_ids: Vec<String>,
    /// Bearing interval of radar targets belonging to this lane
    pub angle_range: AngleRange,
}

impl LaneConfig {
    pub fn observes(&self, sensor_id: &str) -> bool {
        self.sensor_ids.iter().any(|id| id == sensor_id)
    }
}

/// A named combination of simultaneously-green approaches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub id: usize,
    pub name: String,
    /// Lane ids that run green during this phase
    pub member_lanes: Vec<String>,
    /// Shortest green the phase must hold before any switch is honored
    pub min_green_s: u32,
    /// Longest green the phase may hold, including extensions
    pub max_green_s: u32,
    /// Clearance yellow duration
    pub yellow_s: u32,
    /// Clearance all-red duration
    pub all_red_s: u32,
}

impl PhaseConfig {
    pub fn min_green_ms(&self) -> u64 {
        self.min_green_s as u64 * MILLIS_PER_SEC
    }

    pub fn max_green_ms(&self) -> u64 {
        self.max_green_s as u64 * MILLIS_PER_SEC
    }

    pub fn yellow_ms(&self) -> u64 {
        self.yellow_s as u64 * MILLIS_PER_SEC
    }

    pub fn all_red_ms(&self) -> u64 {
        self.all_red_s as u64 * MILLIS_PER_SEC
    }
}

/// Q-learning hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    /// Learning rate α
    pub alpha: f64,
    /// Discount factor γ
    pub gamma: f64,
    /// Initial exploration rate ε
    pub epsilon: f64,
    /// Floor ε never decays below
    pub epsilon_min: f64,
    /// Multiplicative ε decay applied after every update
    pub epsilon_decay: f64,
    /// Persist the Q-table every this many decisions
    pub persist_every: u64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            alpha: 0.1,
            gamma: 0.9,
            epsilon: 0.1,
            epsilon_min: 0.01,
            epsilon_decay: 0.995,
            persist_every: 100,
        }
    }
}

/// Task cadences for the control loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CadenceConfig {
    /// Monitoring task period (fuse, classify, publish status)
    pub monitor_interval_ms: u64,
    /// Decision task period (choose, execute, learn)
    pub decision_interval_ms: u64,
    /// Delay between executing an action and scoring its reward
    pub reward_delay_ms: u64,
    /// Per-cycle timeout reading a sensor source before "no data" is substituted
    pub source_timeout_ms: u64,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            monitor_interval_ms: 1000,
            decision_interval_ms: 5000,
            reward_delay_ms: 2000,
            source_timeout_ms: 500,
        }
    }
}

/// Complete static configuration of one intersection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntersectionConfig {
    pub intersection_id: String,
    pub lanes: Vec<LaneConfig>,
    pub phases: Vec<PhaseConfig>,
    #[serde(default)]
    pub learning: LearningConfig,
    #[serde(default)]
    pub cadence: CadenceConfig,
    /// Directory holding the per-intersection Q-table and classifier artifacts
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl IntersectionConfig {
    /// Load and validate a configuration file; any failure aborts startup
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lanes.is_empty() {
            return Err(ConfigError::NoLanes {
                intersection_id: self.intersection_id.clone(),
            });
        }
        if self.phases.is_empty() {
            return Err(ConfigError::NoPhases {
                intersection_id: self.intersection_id.clone(),
            });
        }
        for lane in &self.lanes {
            if lane.angle_range.is_empty() {
                return Err(ConfigError::EmptyAngleRange {
                    lane_id: lane.lane_id.clone(),
                });
            }
        }
        for (i, phase) in self.phases.iter().enumerate() {
            if self.phases[..i].iter().any(|p| p.id == phase.id) {
                return Err(ConfigError::DuplicatePhase { phase_id: phase.id });
            }
            if phase.min_green_s > phase.max_green_s {
                return Err(ConfigError::InvalidPhaseTiming {
                    phase_id: phase.id,
                    min_green_s: phase.min_green_s,
                    max_green_s: phase.max_green_s,
                });
            }
        }
        Ok(())
    }

    pub fn lane(&self, lane_id: &str) -> Option<&LaneConfig> {
        self.lanes.iter().find(|l| l.lane_id == lane_id)
    }

    pub fn phase(&self, phase_id: usize) -> Option<&PhaseConfig> {
        self.phases.iter().find(|p| p.id == phase_id)
    }

    /// Standard four-way intersection: straight + left lane per approach,
    /// one camera/radar/magnetic sensor per approach, six phases
    pub fn four_way(intersection_id: impl Into<String>) -> Self {
        let intersection_id = intersection_id.into();

        let approach_angles = [
            (Direction::North, AngleRange::new(-45.0, 45.0)),
            (Direction::South, AngleRange::new(135.0, 225.0)),
            (Direction::East, AngleRange::new(45.0, 135.0)),
            (Direction::West, AngleRange::new(-135.0, -45.0)),
        ];

        let mut lanes = Vec::new();
        for (direction, angle_range) in approach_angles {
            let dir = direction.name();
            let sensor_ids = vec![
                format!("cam_{dir}"),
                format!("radar_{dir}"),
                format!("mag_{dir}"),
            ];
            for turn in [TurnType::Straight, TurnType::Left] {
                let suffix = match turn {
                    TurnType::Straight => "straight",
                    TurnType::Left => "left",
                };
                lanes.push(LaneConfig {
                    lane_id: format!("{dir}_{suffix}"),
                    direction,
                    turn,
                    sensor_ids: sensor_ids.clone(),
                    angle_range,
                });
            }
        }

        let phase = |id: usize, name: &str, member_lanes: &[&str]| PhaseConfig {
            id,
            name: name.to_string(),
            member_lanes: member_lanes.iter().map(|s| s.to_string()).collect(),
            min_green_s: 10,
            max_green_s: 120,
            yellow_s: 3,
            all_red_s: 2,
        };

        let phases = vec![
            phase(0, "North-South", &["north_straight", "south_straight"]),
            phase(1, "East-West", &["east_straight", "west_straight"]),
            phase(2, "North-Left", &["north_left"]),
            phase(3, "East-Left", &["east_left"]),
            phase(4, "South-Left", &["south_left"]),
            phase(5, "West-Left", &["west_left"]),
        ];

        Self {
            intersection_id,
            lanes,
            phases,
            learning: LearningConfig::default(),
            cadence: CadenceConfig::default(),
            data_dir: default_data_dir(),
        }
    }
}
