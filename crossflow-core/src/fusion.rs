//! Multi-sensor fusion
//!
//! ## Overview
//!
//! Camera, radar, and magnetic sensors observe the same lanes asynchronously,
//! at different rates, with different failure modes. This module reconciles
//! them into one consistent [`IntersectionSnapshot`]:
//!
//! ```text
//! camera ──┐
//! radar  ──┼─→ latest-per-sensor cache ─→ per-lane association ─→ snapshot
//! magnetic ┘
//! ```
//!
//! Every [`update`](SensorFusion::update) stores the most recent reading per
//! (kind, sensor id) pair and synchronously recomputes the full snapshot.
//! Cost is bounded by O(lanes × sensors-per-lane × targets), with no
//! allocation proportional to history: only the latest reading per sensor is
//! retained.
//!
//! ## Association
//!
//! Camera detections and radar targets are associated per lane by a greedy
//! nearest-speed match: each camera vehicle claims the unclaimed radar target
//! with the smallest speed difference under a fixed threshold. Claimed
//! targets are tracked with a visited flag rather than removed from the list
//! mid-iteration. Greedy matching is O(n·m) and not a global optimum; for
//! queue estimation at a single intersection the difference is noise.
//!
//! ## Failure behavior
//!
//! Fusion never fails. A lane with no readings fuses to a zeroed
//! [`LaneSnapshot`]; a stale reading (timestamp older than the stored one) is
//! dropped on arrival.

use std::collections::{BTreeMap, HashMap};

use log::debug;

use crate::config::LaneConfig;
use crate::reading::{
    CameraVehicle, MagneticState, RadarTarget, SensorKind, SensorPayload, SensorReading,
};
use crate::snapshot::{
    FusedVehicle, IntersectionSnapshot, LaneSnapshot, Provenance, TrafficState,
};
use crate::time::Timestamp;

/// Camera/radar speeds closer than this (km/h) may associate
const SPEED_MATCH_THRESHOLD_KMH: f32 = 10.0;

/// Speed fusion weights; they sum below 1.0, damping the estimate when
/// both sources contribute
const CAMERA_SPEED_WEIGHT: f32 = 0.4;
const RADAR_SPEED_WEIGHT: f32 = 0.4;

/// Confidence assigned to radar-only detections
const RADAR_ONLY_CONFIDENCE: f32 = 0.8;

/// Radar target count is divided by this to produce `traffic_density`
const DENSITY_NORMALIZATION: f32 = 100.0;

/// Fuses latest sensor readings into intersection snapshots
pub struct SensorFusion {
    lanes: Vec<LaneConfig>,
    /// Most recent reading per (kind, sensor id)
    readings: HashMap<(SensorKind, String), SensorReading>,
}

impl SensorFusion {
    pub fn new(lanes: Vec<LaneConfig>) -> Self {
        Self {
            lanes,
            readings: HashMap::new(),
        }
    }

    /// Store a reading and recompute the snapshot
    ///
    /// The stored reading for a sensor is replaced only if the new one is
    /// not older. Stale arrivals are dropped, and the snapshot is still
    /// recomputed so the caller always gets a current view.
    pub fn update(&mut self, reading: SensorReading) -> IntersectionSnapshot {
        let key = (reading.kind(), reading.sensor_id.clone());
        match self.readings.get(&key) {
            Some(stored) if reading.timestamp < stored.timestamp => {
                debug!(
                    "dropping stale {} reading from {} ({} < {})",
                    reading.kind().name(),
                    reading.sensor_id,
                    reading.timestamp,
                    stored.timestamp
                );
            }
            _ => {
                self.readings.insert(key, reading);
            }
        }
        self.fuse()
    }

    /// Recompute the snapshot from the currently cached readings
    pub fn fuse(&self) -> IntersectionSnapshot {
        let timestamp = self.latest_timestamp();
        let mut next_vehicle_id = 0u32;

        let mut lanes = BTreeMap::new();
        for lane in &self.lanes {
            let snapshot = self.fuse_lane(lane, &mut next_vehicle_id);
            lanes.insert(lane.lane_id.clone(), snapshot);
        }

        let total_vehicles: usize = lanes.values().map(|l| l.queue_length).sum();

        let moving: Vec<f32> = lanes
            .values()
            .map(|l| l.average_speed)
            .filter(|&v| v > 0.0)
            .collect();
        let average_speed = if moving.is_empty() {
            0.0
        } else {
            moving.iter().sum::<f32>() / moving.len() as f32
        };

        let traffic_status = TrafficState::from_total_vehicles(total_vehicles);

        IntersectionSnapshot {
            timestamp,
            lanes,
            total_vehicles,
            average_speed,
            traffic_status,
            congestion_level: traffic_status.base_congestion_level(),
        }
    }

    /// Drop all cached readings
    pub fn reset(&mut self) {
        self.readings.clear();
        debug!("sensor fusion cache cleared");
    }

    fn latest_timestamp(&self) -> Timestamp {
        self.readings
            .values()
            .map(|r| r.timestamp)
            .max()
            .unwrap_or(0)
    }

    fn fuse_lane(&self, lane: &LaneConfig, next_vehicle_id: &mut u32) -> LaneSnapshot {
        let mut camera_vehicles: Vec<CameraVehicle> = Vec::new();
        let mut radar_targets: Vec<RadarTarget> = Vec::new();
        let mut magnetic: Option<&MagneticState> = None;

        // Radar radial speeds are signed by approach direction; lane metrics
        // work in magnitudes so average_speed stays non-negative
        for reading in self.readings.values() {
            if !lane.observes(&reading.sensor_id) {
                continue;
            }
            match &reading.payload {
                SensorPayload::Camera { vehicles } => {
                    camera_vehicles.extend(vehicles.iter().map(|v| CameraVehicle {
                        speed: v.speed.abs(),
                        ..v.clone()
                    }));
                }
                SensorPayload::Radar { targets } => radar_targets.extend(
                    targets
                        .iter()
                        .filter(|t| lane.angle_range.contains(t.angle))
                        .map(|t| RadarTarget {
                            speed: t.speed.abs(),
                            ..*t
                        }),
                ),
                SensorPayload::Magnetic(state) => {
                    if magnetic.is_none() {
                        magnetic = Some(state);
                    }
                }
            }
        }

        let vehicles = associate(&camera_vehicles, &radar_targets, next_vehicle_id);

        let queue_length = vehicles.len();
        let average_speed = if vehicles.is_empty() {
            0.0
        } else {
            vehicles.iter().map(|v| v.speed).sum::<f32>() / vehicles.len() as f32
        };
        let occupancy_rate = magnetic
            .map(|m| m.occupancy_rate.clamp(0.0, 1.0))
            .unwrap_or(0.0);
        let traffic_density = radar_targets.len() as f32 / DENSITY_NORMALIZATION;

        LaneSnapshot {
            lane_id: lane.lane_id.clone(),
            direction: lane.direction,
            vehicles,
            queue_length,
            average_speed,
            occupancy_rate,
            traffic_density,
        }
    }
}

/// Greedy nearest-speed association of camera detections with radar targets
///
/// Claimed radar targets are tracked in a `matched` flag vector; the target
/// list itself is never mutated during iteration. Unclaimed targets become
/// radar-only vehicles.
fn associate(
    camera_vehicles: &[CameraVehicle],
    radar_targets: &[RadarTarget],
    next_vehicle_id: &mut u32,
) -> Vec<FusedVehicle> {
    let mut fused = Vec::with_capacity(camera_vehicles.len() + radar_targets.len());
    let mut matched = vec![false; radar_targets.len()];

    for camera in camera_vehicles {
        let mut best: Option<(usize, f32)> = None;
        for (i, target) in radar_targets.iter().enumerate() {
            if matched[i] {
                continue;
            }
            let diff = (camera.speed - target.speed).abs();
            if diff < SPEED_MATCH_THRESHOLD_KMH
                && best.map_or(true, |(_, best_diff)| diff < best_diff)
            {
                best = Some((i, diff));
            }
        }

        let (speed, provenance) = match best {
            Some((i, _)) => {
                matched[i] = true;
                let fused_speed = CAMERA_SPEED_WEIGHT * camera.speed
                    + RADAR_SPEED_WEIGHT * radar_targets[i].speed;
                (fused_speed, Provenance::CameraRadar)
            }
            // Radar absent: camera carries full weight
            None => (camera.speed, Provenance::Camera),
        };

        fused.push(FusedVehicle {
            id: take_id(next_vehicle_id),
            class: camera.class,
            speed,
            position: Some(camera.bbox),
            confidence: camera.confidence,
            provenance,
        });
    }

    for (i, target) in radar_targets.iter().enumerate() {
        if matched[i] {
            continue;
        }
        fused.push(FusedVehicle {
            id: take_id(next_vehicle_id),
            class: None,
            speed: target.speed,
            position: None,
            confidence: RADAR_ONLY_CONFIDENCE,
            provenance: Provenance::Radar,
        });
    }

    fused
}

fn take_id(next: &mut u32) -> u32 {
    let id = *next;
    *next = next.wrapping_add(1);
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IntersectionConfig;
    use crate::reading::SensorPayload;

    fn fusion() -> SensorFusion {
        SensorFusion::new(IntersectionConfig::four_way("test").lanes)
    }

    fn camera_reading(sensor_id: &str, timestamp: Timestamp, speeds: &[f32]) -> SensorReading {
        SensorReading::new(
            sensor_id,
            timestamp,
            SensorPayload::Camera {
                vehicles: speeds
                    .iter()
                    .map(|&speed| CameraVehicle {
                        class: None,
                        bbox: [0.0, 0.0, 10.0, 10.0],
                        confidence: 0.9,
                        speed,
                    })
                    .collect(),
            },
        )
    }

    fn radar_reading(
        sensor_id: &str,
        timestamp: Timestamp,
        targets: &[(f32, f32)], // (speed, angle)
    ) -> SensorReading {
        SensorReading::new(
            sensor_id,
            timestamp,
            SensorPayload::Radar {
                targets: targets
                    .iter()
                    .map(|&(speed, angle)| RadarTarget {
                        distance: 30.0,
                        speed,
                        angle,
                    })
                    .collect(),
            },
        )
    }

    #[test]
    fn empty_fusion_yields_zeroed_lanes() {
        let snapshot = fusion().fuse();
        assert_eq!(snapshot.total_vehicles, 0);
        assert_eq!(snapshot.traffic_status, TrafficState::Free);
        for lane in snapshot.lanes.values() {
            assert_eq!(lane.queue_length, 0);
            assert_eq!(lane.average_speed, 0.0);
            assert_eq!(lane.occupancy_rate, 0.0);
        }
    }

    #[test]
    fn camera_and_radar_fuse_by_nearest_speed() {
        let mut fusion = fusion();
        fusion.update(camera_reading("cam_north", 1000, &[40.0]));
        let snapshot = fusion.update(radar_reading(
            "radar_north",
            1000,
            &[(60.0, 0.0), (42.0, 5.0)],
        ));

        let lane = &snapshot.lanes["north_straight"];
        let fused: Vec<_> = lane
            .vehicles
            .iter()
            .filter(|v| v.provenance == Provenance::CameraRadar)
            .collect();
        assert_eq!(fused.len(), 1);
        // 0.4 * 40 + 0.4 * 42
        assert!((fused[0].speed - 32.8).abs() < 1e-4);

        // The 60 km/h target is outside the 10 km/h gate and stays radar-only
        let radar_only: Vec<_> = lane
            .vehicles
            .iter()
            .filter(|v| v.provenance == Provenance::Radar)
            .collect();
        assert_eq!(radar_only.len(), 1);
        assert_eq!(radar_only[0].speed, 60.0);
        assert_eq!(radar_only[0].confidence, RADAR_ONLY_CONFIDENCE);
    }

    #[test]
    fn each_radar_target_is_claimed_at_most_once() {
        let cam_a = CameraVehicle {
            class: None,
            bbox: [0.0; 4],
            confidence: 0.9,
            speed: 40.0,
        };
        let cam_b = CameraVehicle {
            speed: 41.0,
            ..cam_a.clone()
        };
        let target = RadarTarget {
            distance: 20.0,
            speed: 40.5,
            angle: 0.0,
        };

        let mut id = 0;
        let fused = associate(&[cam_a, cam_b], &[target], &mut id);

        let paired = fused
            .iter()
            .filter(|v| v.provenance == Provenance::CameraRadar)
            .count();
        assert_eq!(paired, 1);
        // Second camera vehicle keeps its own speed at full weight
        let solo: Vec<_> = fused
            .iter()
            .filter(|v| v.provenance == Provenance::Camera)
            .collect();
        assert_eq!(solo.len(), 1);
        assert_eq!(solo[0].speed, 41.0);
    }

    #[test]
    fn radar_targets_filtered_by_lane_angle_range() {
        let mut fusion = fusion();
        // 90° is due east; must not appear in any north lane
        let snapshot = fusion.update(radar_reading("radar_north", 1000, &[(30.0, 90.0)]));
        assert_eq!(snapshot.lanes["north_straight"].queue_length, 0);
    }

    #[test]
    fn stale_reading_does_not_replace_fresher_one() {
        let mut fusion = fusion();
        fusion.update(camera_reading("cam_north", 2000, &[50.0]));
        let snapshot = fusion.update(camera_reading("cam_north", 1000, &[10.0, 10.0, 10.0]));

        let lane = &snapshot.lanes["north_straight"];
        assert_eq!(lane.queue_length, 1);
        assert_eq!(lane.vehicles[0].speed, 50.0);
    }

    #[test]
    fn equal_timestamp_replaces() {
        let mut fusion = fusion();
        fusion.update(camera_reading("cam_north", 1000, &[50.0]));
        let snapshot = fusion.update(camera_reading("cam_north", 1000, &[20.0, 30.0]));
        assert_eq!(snapshot.lanes["north_straight"].queue_length, 2);
    }

    #[test]
    fn occupancy_comes_from_magnetic_reading() {
        let mut fusion = fusion();
        let snapshot = fusion.update(SensorReading::new(
            "mag_south",
            1000,
            SensorPayload::Magnetic(MagneticState {
                field_strength: 1042.0,
                vehicle_present: true,
                occupancy_rate: 0.35,
            }),
        ));
        assert_eq!(snapshot.lanes["south_straight"].occupancy_rate, 0.35);
        assert_eq!(snapshot.lanes["north_straight"].occupancy_rate, 0.0);
    }

    #[test]
    fn queue_length_always_matches_vehicle_count() {
        let mut fusion = fusion();
        fusion.update(camera_reading("cam_east", 1000, &[20.0, 25.0]));
        let snapshot = fusion.update(radar_reading("radar_east", 1001, &[(55.0, 90.0)]));
        for lane in snapshot.lanes.values() {
            assert_eq!(lane.queue_length, lane.vehicles.len());
        }
    }

    #[test]
    fn aggregate_status_follows_vehicle_thresholds() {
        let mut fusion = fusion();
        // 16 radar-only targets spread across east lanes → congested
        let targets: Vec<(f32, f32)> = (0..16).map(|i| (20.0 + i as f32, 90.0)).collect();
        let snapshot = fusion.update(radar_reading("radar_east", 1000, &targets));

        // east_straight and east_left share sensors and angle range, so both
        // lanes see the same 16 targets
        assert_eq!(snapshot.total_vehicles, 32);
        assert_eq!(snapshot.traffic_status, TrafficState::HeavyCongested);
        assert_eq!(snapshot.congestion_level, 1.0);
        assert!((snapshot.lanes["east_straight"].traffic_density - 0.16).abs() < 1e-6);
    }

    #[test]
    fn reset_clears_cached_readings() {
        let mut fusion = fusion();
        fusion.update(camera_reading("cam_north", 1000, &[40.0]));
        fusion.reset();
        assert_eq!(fusion.fuse().total_vehicles, 0);
    }
}
