//! Integration tests for the fusion → classification path
//!
//! Drives raw sensor readings through fusion and the classifier the same way
//! the monitoring task does, and pins the end-to-end behavior for the light
//! and saturated traffic scenarios.

use proptest::prelude::*;

use crossflow_core::classify::{ClassifiedState, Features, TrafficClassifier};
use crossflow_core::config::{
    AngleRange, Direction, IntersectionConfig, LaneConfig, TurnType,
};
use crossflow_core::fusion::SensorFusion;
use crossflow_core::reading::{
    CameraVehicle, MagneticState, RadarTarget, SensorPayload, SensorReading,
};

/// One straight lane per approach, one camera/radar/magnetic sensor each
fn single_lane_config() -> IntersectionConfig {
    let mut config = IntersectionConfig::four_way("flow_test");
    config.lanes = [
        (Direction::North, AngleRange::new(-45.0, 45.0)),
        (Direction::South, AngleRange::new(135.0, 225.0)),
        (Direction::East, AngleRange::new(45.0, 135.0)),
        (Direction::West, AngleRange::new(-135.0, -45.0)),
    ]
    .into_iter()
    .map(|(direction, angle_range)| {
        let dir = direction.name();
        LaneConfig {
            lane_id: format!("{dir}_straight"),
            direction,
            turn: TurnType::Straight,
            sensor_ids: vec![
                format!("cam_{dir}"),
                format!("radar_{dir}"),
                format!("mag_{dir}"),
            ],
            angle_range,
        }
    })
    .collect();
    config
}

fn camera_reading(sensor_id: &str, timestamp: u64, speeds: &[f32]) -> SensorReading {
    SensorReading::new(
        sensor_id,
        timestamp,
        SensorPayload::Camera {
            vehicles: speeds
                .iter()
                .map(|&speed| CameraVehicle {
                    class: None,
                    bbox: [0.0, 0.0, 50.0, 40.0],
                    confidence: 0.9,
                    speed,
                })
                .collect(),
        },
    )
}

#[test]
fn light_fast_traffic_classifies_free_with_zero_congestion() {
    let config = single_lane_config();
    let mut fusion = SensorFusion::new(config.lanes.clone());

    // Four lanes with 2, 2, 3, 1 vehicles, every speed at or above 35 km/h
    fusion.update(camera_reading("cam_north", 1000, &[38.0, 42.0]));
    fusion.update(camera_reading("cam_south", 1000, &[35.0, 47.0]));
    fusion.update(camera_reading("cam_east", 1000, &[40.0, 36.0, 44.0]));
    let snapshot = fusion.update(camera_reading("cam_west", 1000, &[39.0]));

    assert_eq!(snapshot.total_vehicles, 8);

    let classifier = TrafficClassifier::new();
    let result = classifier.classify(&Features::from_snapshot(&snapshot));

    assert_eq!(result.state, ClassifiedState::Free);
    assert_eq!(result.congestion_level, 0.0);
    let sum: f64 = result.probabilities.values().sum();
    assert!((sum - 1.0).abs() < 1e-6);
}

#[test]
fn saturated_crawl_classifies_heavy_congested() {
    let config = single_lane_config();
    let mut fusion = SensorFusion::new(config.lanes.clone());

    // 40 vehicles crawling at 10 km/h across the four approaches
    let speeds = [10.0f32; 10];
    fusion.update(camera_reading("cam_north", 1000, &speeds));
    fusion.update(camera_reading("cam_south", 1000, &speeds));
    fusion.update(camera_reading("cam_east", 1000, &speeds));
    let snapshot = fusion.update(camera_reading("cam_west", 1000, &speeds));

    assert_eq!(snapshot.total_vehicles, 40);
    assert!((snapshot.average_speed - 10.0).abs() < 1e-4);

    let classifier = TrafficClassifier::new();
    let result = classifier.classify(&Features::from_snapshot(&snapshot));

    assert_eq!(result.state, ClassifiedState::HeavyCongested);
    assert!(result.congestion_level >= 0.9);
}

#[test]
fn mixed_sensor_cycle_produces_consistent_lane_view() {
    let config = single_lane_config();
    let mut fusion = SensorFusion::new(config.lanes.clone());

    fusion.update(camera_reading("cam_north", 1000, &[40.0, 25.0]));
    fusion.update(SensorReading::new(
        "radar_north",
        1001,
        SensorPayload::Radar {
            targets: vec![
                RadarTarget { distance: 22.0, speed: 41.5, angle: -10.0 },
                RadarTarget { distance: 60.0, speed: 55.0, angle: 12.0 },
            ],
        },
    ));
    let snapshot = fusion.update(SensorReading::new(
        "mag_north",
        1002,
        SensorPayload::Magnetic(MagneticState {
            field_strength: 1100.0,
            vehicle_present: true,
            occupancy_rate: 0.2,
        }),
    ));

    let lane = &snapshot.lanes["north_straight"];
    // Two camera vehicles plus one unmatched radar target
    assert_eq!(lane.queue_length, 3);
    assert_eq!(lane.queue_length, lane.vehicles.len());
    assert_eq!(lane.occupancy_rate, 0.2);
    assert!((lane.traffic_density - 0.02).abs() < 1e-6);
    assert_eq!(snapshot.timestamp, 1002);
}

proptest! {
    /// Whatever the sensors report, lane metrics stay inside their contracts
    /// and classification stays total.
    #[test]
    fn lane_invariants_hold_for_arbitrary_readings(
        camera_speeds in prop::collection::vec(-80.0f32..80.0, 0..6),
        radar in prop::collection::vec((-150.0f32..150.0, -180.0f32..225.0), 0..8),
        occupancy in -0.5f32..1.5,
        stamp in 0u64..10_000,
    ) {
        let config = single_lane_config();
        let mut fusion = SensorFusion::new(config.lanes.clone());

        fusion.update(camera_reading("cam_north", stamp, &camera_speeds));
        fusion.update(SensorReading::new(
            "radar_north",
            stamp,
            SensorPayload::Radar {
                targets: radar
                    .iter()
                    .map(|&(speed, angle)| RadarTarget { distance: 30.0, speed, angle })
                    .collect(),
            },
        ));
        let snapshot = fusion.update(SensorReading::new(
            "mag_north",
            stamp,
            SensorPayload::Magnetic(MagneticState {
                field_strength: 1000.0,
                vehicle_present: occupancy > 0.5,
                occupancy_rate: occupancy,
            }),
        ));

        for lane in snapshot.lanes.values() {
            prop_assert_eq!(lane.queue_length, lane.vehicles.len());
            prop_assert!(lane.average_speed >= 0.0);
            prop_assert!((0.0..=1.0).contains(&lane.occupancy_rate));
            prop_assert!(lane.traffic_density >= 0.0);
        }

        let result = TrafficClassifier::new().classify(&Features::from_snapshot(&snapshot));
        prop_assert!((0.0..=1.0).contains(&result.congestion_level));
        let sum: f64 = result.probabilities.values().sum();
        prop_assert!(sum == 0.0 || (sum - 1.0).abs() < 1e-6);
    }
}
