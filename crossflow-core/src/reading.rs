//! Sensor reading types
//!
//! ## Overview
//!
//! Three heterogeneous sensor families observe the intersection:
//!
//! - **Camera**: vision-derived vehicle detections (bounding box, class,
//!   estimated speed, detection confidence)
//! - **Radar**: point targets (distance, radial speed, bearing angle)
//! - **Magnetic**: loop-style occupancy (vehicle present, field strength,
//!   occupancy rate over a trailing window)
//!
//! A [`SensorReading`] is one timestamped sample from one sensor. Readings
//! are not persisted; fusion keeps only the latest reading per
//! (kind, sensor id) pair.
//!
//! ## Wire format
//!
//! Readings arrive over the message bus as JSON with the kind tag alongside
//! the kind-specific measurements:
//!
//! ```json
//! {
//!   "sensor_id": "radar_north",
//!   "timestamp": 1722700000000,
//!   "kind": "radar",
//!   "measurements": { "targets": [{ "distance": 25.3, "speed": 45.2, "angle": -15.3 }] }
//! }
//! ```

use serde::{Deserialize, Serialize};

use crate::time::Timestamp;

/// Sensor family
///
/// Maps to the topic segment in `traffic/{intersection}/sensors/{kind}/data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Camera,
    Radar,
    Magnetic,
}

impl SensorKind {
    /// All kinds, in a fixed order
    pub const ALL: [SensorKind; 3] = [SensorKind::Camera, SensorKind::Radar, SensorKind::Magnetic];

    /// Topic segment / human-readable name
    pub const fn name(&self) -> &'static str {
        match self {
            SensorKind::Camera => "camera",
            SensorKind::Radar => "radar",
            SensorKind::Magnetic => "magnetic",
        }
    }

    /// Parse a topic segment back into a kind
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "camera" => Some(SensorKind::Camera),
            "radar" => Some(SensorKind::Radar),
            "magnetic" => Some(SensorKind::Magnetic),
            _ => None,
        }
    }
}

/// Vehicle class reported by the vision model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleClass {
    Car,
    Truck,
    Bus,
    Motorcycle,
}

/// One camera-detected vehicle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraVehicle {
    /// Detected class, if the model recognized one
    #[serde(default)]
    pub class: Option<VehicleClass>,
    /// Bounding box as [x1, y1, x2, y2] in image coordinates
    pub bbox: [f32; 4],
    /// Detection confidence in [0, 1]
    pub confidence: f32,
    /// Estimated speed in km/h
    #[serde(default)]
    pub speed: f32,
}

/// One radar point target
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RadarTarget {
    /// Range to target in meters
    pub distance: f32,
    /// Radial speed in km/h
    pub speed: f32,
    /// Bearing in degrees, zero straight ahead
    pub angle: f32,
}

/// Magnetic loop occupancy sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MagneticState {
    /// Raw field strength reading
    pub field_strength: f32,
    /// Whether a vehicle is currently over the loop
    pub vehicle_present: bool,
    /// Fraction of the trailing window the loop was occupied, in [0, 1]
    pub occupancy_rate: f32,
}

/// Kind-specific measurements of a reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "measurements", rename_all = "lowercase")]
pub enum SensorPayload {
    Camera { vehicles: Vec<CameraVehicle> },
    Radar { targets: Vec<RadarTarget> },
    Magnetic(MagneticState),
}

impl SensorPayload {
    pub const fn kind(&self) -> SensorKind {
        match self {
            SensorPayload::Camera { .. } => SensorKind::Camera,
            SensorPayload::Radar { .. } => SensorKind::Radar,
            SensorPayload::Magnetic(_) => SensorKind::Magnetic,
        }
    }
}

/// One timestamped sample from one sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub sensor_id: String,
    pub timestamp: Timestamp,
    #[serde(flatten)]
    pub payload: SensorPayload,
}

impl SensorReading {
    pub fn new(sensor_id: impl Into<String>, timestamp: Timestamp, payload: SensorPayload) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            timestamp,
            payload,
        }
    }

    pub fn kind(&self) -> SensorKind {
        self.payload.kind()
    }
}
