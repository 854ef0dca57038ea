//! Fused intersection state
//!
//! The fusion engine reduces the raw per-sensor readings to one
//! [`IntersectionSnapshot`]: a per-lane vehicle view plus aggregate traffic
//! metrics. A snapshot is immutable once built; the fusion task publishes a
//! fresh `Arc<IntersectionSnapshot>` each cycle and readers only ever swap
//! whole snapshots, so no reader can observe a half-updated intersection.
//!
//! Fused vehicles are recreated from scratch every cycle. There is no
//! cross-cycle tracking identity: a vehicle id is only unique within the
//! snapshot that contains it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::Direction;
use crate::reading::VehicleClass;
use crate::time::Timestamp;

/// Discrete traffic state, ordered by severity
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TrafficState {
    Free,
    Normal,
    Congested,
    HeavyCongested,
}

impl TrafficState {
    /// All states in severity order
    pub const ALL: [TrafficState; 4] = [
        TrafficState::Free,
        TrafficState::Normal,
        TrafficState::Congested,
        TrafficState::HeavyCongested,
    ];

    pub const fn name(&self) -> &'static str {
        match self {
            TrafficState::Free => "free",
            TrafficState::Normal => "normal",
            TrafficState::Congested => "congested",
            TrafficState::HeavyCongested => "heavy_congested",
        }
    }

    /// Base congestion level of the state
    pub const fn base_congestion_level(&self) -> f64 {
        match self {
            TrafficState::Free => 0.0,
            TrafficState::Normal => 0.2,
            TrafficState::Congested => 0.6,
            TrafficState::HeavyCongested => 1.0,
        }
    }

    /// Classify an intersection-wide vehicle count
    pub fn from_total_vehicles(total: usize) -> Self {
        if total < 5 {
            TrafficState::Free
        } else if total < 15 {
            TrafficState::Normal
        } else if total < 25 {
            TrafficState::Congested
        } else {
            TrafficState::HeavyCongested
        }
    }
}

/// Which sensors contributed to a fused vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provenance {
    #[serde(rename = "camera")]
    Camera,
    #[serde(rename = "radar")]
    Radar,
    #[serde(rename = "camera+radar")]
    CameraRadar,
}

/// One vehicle as seen by the fusion engine this cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedVehicle {
    /// Snapshot-local id; not stable across cycles
    pub id: u32,
    #[serde(default)]
    pub class: Option<VehicleClass>,
    /// Fused speed in km/h
    pub speed: f32,
    /// Camera bounding box when a camera contributed, [x1, y1, x2, y2]
    #[serde(default)]
    pub position: Option<[f32; 4]>,
    /// Detection confidence in [0, 1]
    pub confidence: f32,
    pub provenance: Provenance,
}

/// Per-lane fused view and metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneSnapshot {
    pub lane_id: String,
    pub direction: Direction,
    pub vehicles: Vec<FusedVehicle>,
    /// Always equals `vehicles.len()`
    pub queue_length: usize,
    /// Mean fused speed in km/h, 0 when the lane is empty
    pub average_speed: f32,
    /// Magnetic occupancy in [0, 1], 0 when no magnetic reading exists
    pub occupancy_rate: f32,
    /// Radar target count scaled by the density normalization constant
    pub traffic_density: f32,
}

impl LaneSnapshot {
    /// Lane with no sensor data at all
    pub fn empty(lane_id: impl Into<String>, direction: Direction) -> Self {
        Self {
            lane_id: lane_id.into(),
            direction,
            vehicles: Vec::new(),
            queue_length: 0,
            average_speed: 0.0,
            occupancy_rate: 0.0,
            traffic_density: 0.0,
        }
    }
}

/// Consistent intersection-wide view produced by one fusion cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntersectionSnapshot {
    pub timestamp: Timestamp,
    /// Keyed by lane id; BTreeMap keeps serialization order stable
    pub lanes: BTreeMap<String, LaneSnapshot>,
    pub total_vehicles: usize,
    /// Mean of lane average speeds, counting only lanes with moving traffic
    pub average_speed: f32,
    pub traffic_status: TrafficState,
    /// From the fixed per-state table, in [0, 1]
    pub congestion_level: f64,
}

impl IntersectionSnapshot {
    /// Snapshot with every configured lane zeroed, used before any data arrives
    pub fn empty(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            lanes: BTreeMap::new(),
            total_vehicles: 0,
            average_speed: 0.0,
            traffic_status: TrafficState::Free,
            congestion_level: 0.0,
        }
    }

    /// Lanes approaching from the given direction
    pub fn lanes_from(&self, direction: Direction) -> impl Iterator<Item = &LaneSnapshot> {
        self.lanes.values().filter(move |l| l.direction == direction)
    }
}
