//! Sensor sources
//!
//! A [`SensorSource`] is the capability the runtime pulls readings from:
//! one sensor, one kind, periodic samples. Hardware-backed sources live
//! behind the message bus (readings pushed by the actual units are fed into
//! the same fusion channel by the inbound dispatcher); the implementations
//! here simulate a four-way intersection for development and tests.
//!
//! Simulated sources are seeded, so a test can pin the seed and get the
//! same traffic pattern every run.

use async_trait::async_trait;
use heapless::HistoryBuffer;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use crossflow_core::config::{AngleRange, IntersectionConfig};
use crossflow_core::reading::{
    CameraVehicle, MagneticState, RadarTarget, SensorKind, SensorPayload, VehicleClass,
};
use crossflow_core::time::Timestamp;

/// Samples the magnetic occupancy window covers
const OCCUPANCY_WINDOW: usize = 60;

/// Sensor sampling failures; all are transient and substituted with
/// "no data" by the control loop
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("sensor offline")]
    Offline,

    #[error("sensor fault: {0}")]
    Fault(String),
}

/// One periodic reading source
#[async_trait]
pub trait SensorSource: Send {
    fn sensor_id(&self) -> &str;

    fn kind(&self) -> SensorKind;

    /// Preferred sampling period
    fn sample_interval_ms(&self) -> u64;

    /// Produce the next reading's measurements
    async fn sample(&mut self, now: Timestamp) -> Result<SensorPayload, SourceError>;
}

/// Simulated vision sensor: a small queue of detected vehicles whose size
/// drifts by at most one per sample
pub struct SimulatedCamera {
    sensor_id: String,
    rng: StdRng,
    queue: usize,
}

impl SimulatedCamera {
    pub fn new(sensor_id: impl Into<String>, seed: u64) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            rng: StdRng::seed_from_u64(seed),
            queue: 2,
        }
    }
}

#[async_trait]
impl SensorSource for SimulatedCamera {
    fn sensor_id(&self) -> &str {
        &self.sensor_id
    }

    fn kind(&self) -> SensorKind {
        SensorKind::Camera
    }

    fn sample_interval_ms(&self) -> u64 {
        1000
    }

    async fn sample(&mut self, _now: Timestamp) -> Result<SensorPayload, SourceError> {
        // Queue drifts by -1..=1 and stays within a plausible band
        let drift = self.rng.gen_range(-1i32..=1);
        self.queue = (self.queue as i32 + drift).clamp(0, 6) as usize;

        let vehicles = (0..self.queue)
            .map(|i| {
                let class = match self.rng.gen_range(0..10) {
                    0 => VehicleClass::Truck,
                    1 => VehicleClass::Bus,
                    2 => VehicleClass::Motorcycle,
                    _ => VehicleClass::Car,
                };
                let x = 80.0 + 120.0 * i as f32;
                CameraVehicle {
                    class: Some(class),
                    bbox: [x, 180.0, x + 90.0, 260.0],
                    confidence: self.rng.gen_range(0.7..0.98),
                    speed: self.rng.gen_range(20.0..60.0),
                }
            })
            .collect();

        Ok(SensorPayload::Camera { vehicles })
    }
}

/// Simulated radar: point targets distributed over the sensor's bearing range
pub struct SimulatedRadar {
    sensor_id: String,
    angle_range: AngleRange,
    rng: StdRng,
}

impl SimulatedRadar {
    pub fn new(sensor_id: impl Into<String>, angle_range: AngleRange, seed: u64) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            angle_range,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

#[async_trait]
impl SensorSource for SimulatedRadar {
    fn sensor_id(&self) -> &str {
        &self.sensor_id
    }

    fn kind(&self) -> SensorKind {
        SensorKind::Radar
    }

    fn sample_interval_ms(&self) -> u64 {
        500
    }

    async fn sample(&mut self, _now: Timestamp) -> Result<SensorPayload, SourceError> {
        let count = self.rng.gen_range(0..=5);
        let targets = (0..count)
            .map(|_| {
                // Sum of uniforms approximates the bell shape of real speeds
                let speed = (0..3).map(|_| self.rng.gen_range(10.0..30.0)).sum::<f32>() - 20.0;
                RadarTarget {
                    distance: self.rng.gen_range(5.0..100.0),
                    speed: speed.clamp(0.0, 200.0),
                    angle: self
                        .rng
                        .gen_range(self.angle_range.min_deg..=self.angle_range.max_deg),
                }
            })
            .collect();

        Ok(SensorPayload::Radar { targets })
    }
}

/// Simulated magnetic loop with a trailing occupancy window
pub struct SimulatedMagnetic {
    sensor_id: String,
    rng: StdRng,
    baseline: f32,
    history: HistoryBuffer<bool, OCCUPANCY_WINDOW>,
}

impl SimulatedMagnetic {
    pub fn new(sensor_id: impl Into<String>, seed: u64) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            rng: StdRng::seed_from_u64(seed),
            baseline: 1000.0,
            history: HistoryBuffer::new(),
        }
    }
}

#[async_trait]
impl SensorSource for SimulatedMagnetic {
    fn sensor_id(&self) -> &str {
        &self.sensor_id
    }

    fn kind(&self) -> SensorKind {
        SensorKind::Magnetic
    }

    fn sample_interval_ms(&self) -> u64 {
        1000
    }

    async fn sample(&mut self, _now: Timestamp) -> Result<SensorPayload, SourceError> {
        let vehicle_present = self.rng.gen_bool(0.3);
        self.history.write(vehicle_present);

        let field_strength = if vehicle_present {
            self.baseline + self.rng.gen_range(50.0..200.0)
        } else {
            self.baseline + self.rng.gen_range(-10.0..10.0)
        };

        let occupied = self.history.oldest_ordered().filter(|&&p| p).count();
        let occupancy_rate = occupied as f32 / self.history.len().max(1) as f32;

        Ok(SensorPayload::Magnetic(MagneticState {
            field_strength,
            vehicle_present,
            occupancy_rate,
        }))
    }
}

/// Build one simulated source per configured sensor id
///
/// The sensor id prefix picks the kind (`cam_`, `radar_`, `mag_`), matching
/// the naming in [`IntersectionConfig::four_way`]. Radar sources inherit
/// their lane's angle range.
pub fn simulated_sources(config: &IntersectionConfig, seed: u64) -> Vec<Box<dyn SensorSource>> {
    let mut sources: Vec<Box<dyn SensorSource>> = Vec::new();
    let mut seen: Vec<String> = Vec::new();

    for lane in &config.lanes {
        for sensor_id in &lane.sensor_ids {
            if seen.contains(sensor_id) {
                continue;
            }
            seen.push(sensor_id.clone());
            // One distinct stream per sensor
            let sensor_seed = seed.wrapping_add(seen.len() as u64);

            if sensor_id.starts_with("cam") {
                sources.push(Box::new(SimulatedCamera::new(sensor_id, sensor_seed)));
            } else if sensor_id.starts_with("radar") {
                sources.push(Box::new(SimulatedRadar::new(
                    sensor_id,
                    lane.angle_range,
                    sensor_seed,
                )));
            } else if sensor_id.starts_with("mag") {
                sources.push(Box::new(SimulatedMagnetic::new(sensor_id, sensor_seed)));
            } else {
                log::warn!("sensor id '{sensor_id}' has no recognized kind prefix, skipping");
            }
        }
    }

    sources
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn camera_queue_drifts_within_bounds() {
        let mut camera = SimulatedCamera::new("cam_north", 1);
        for _ in 0..50 {
            let SensorPayload::Camera { vehicles } = camera.sample(0).await.unwrap() else {
                panic!("camera produced a non-camera payload");
            };
            assert!(vehicles.len() <= 6);
            for v in &vehicles {
                assert!(v.speed >= 20.0 && v.speed < 60.0);
                assert!(v.confidence >= 0.7 && v.confidence < 0.98);
            }
        }
    }

    #[tokio::test]
    async fn radar_targets_stay_in_bearing_range() {
        let range = AngleRange::new(-45.0, 45.0);
        let mut radar = SimulatedRadar::new("radar_north", range, 2);
        for _ in 0..50 {
            let SensorPayload::Radar { targets } = radar.sample(0).await.unwrap() else {
                panic!("radar produced a non-radar payload");
            };
            for t in &targets {
                assert!(range.contains(t.angle));
                assert!(t.speed >= 0.0);
            }
        }
    }

    #[tokio::test]
    async fn magnetic_occupancy_tracks_history() {
        let mut magnetic = SimulatedMagnetic::new("mag_north", 3);
        let mut last_rate = 0.0;
        for _ in 0..100 {
            let SensorPayload::Magnetic(state) = magnetic.sample(0).await.unwrap() else {
                panic!("magnetic produced a non-magnetic payload");
            };
            assert!((0.0..=1.0).contains(&state.occupancy_rate));
            last_rate = state.occupancy_rate;
        }
        // Presence probability is 0.3; the trailing rate should be near it
        assert!(last_rate > 0.05 && last_rate < 0.7);
    }

    #[test]
    fn four_way_config_yields_twelve_sources() {
        let config = IntersectionConfig::four_way("test");
        let sources = simulated_sources(&config, 42);
        assert_eq!(sources.len(), 12);
        assert_eq!(
            sources.iter().filter(|s| s.kind() == SensorKind::Radar).count(),
            4
        );
    }

    #[test]
    fn seeded_sources_are_reproducible() {
        let mut a = SimulatedCamera::new("cam", 9);
        let mut b = SimulatedCamera::new("cam", 9);
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let pa = rt.block_on(a.sample(0)).unwrap();
        let pb = rt.block_on(b.sample(0)).unwrap();
        assert_eq!(pa, pb);
    }
}
