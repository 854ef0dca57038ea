//! End-to-end service tests
//!
//! Runs the full task graph (simulated sources → fusion actor → monitoring
//! and decision tasks) under tokio's paused clock, with a recording
//! transport standing in for the broker. Wall time never passes; the manual
//! controller clock is advanced in lockstep with the virtual timers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crossflow_connectors::{ConnectionStats, InboundMessage, TopicSet, Transport, TransportError};
use crossflow_core::classify::TrafficClassifier;
use crossflow_core::config::IntersectionConfig;
use crossflow_core::control::AdaptivePhaseController;
use crossflow_core::reading::{CameraVehicle, SensorPayload, SensorReading};
use crossflow_core::status::{ControlCommand, StatusRecord};
use crossflow_core::time::ManualClock;
use crossflow_service::source::simulated_sources;
use crossflow_service::{ServiceContext, ServiceHandle};

/// Transport that records every publish in memory
#[derive(Default)]
struct RecordingTransport {
    messages: Mutex<Vec<(String, Vec<u8>)>>,
    disconnected: AtomicBool,
}

impl RecordingTransport {
    fn published(&self, topic: &str) -> Vec<Vec<u8>> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.messages
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    async fn publish_reliable(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.publish(topic, payload).await
    }

    fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst)
    }

    fn stats(&self) -> ConnectionStats {
        ConnectionStats::default()
    }

    async fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }
}

struct Harness {
    handle: ServiceHandle,
    transport: Arc<RecordingTransport>,
    clock: ManualClock,
    topics: TopicSet,
    inbound_tx: Option<tokio::sync::mpsc::Sender<InboundMessage>>,
}

fn start_service(dir: &tempfile::TempDir, with_sources: bool, with_inbound: bool) -> Harness {
    let mut config = IntersectionConfig::four_way("svc_test");
    config.data_dir = dir.path().to_path_buf();

    let clock = ManualClock::new(0);
    let transport = Arc::new(RecordingTransport::default());
    let topics = TopicSet::new(&config.intersection_id);

    let sources = if with_sources {
        simulated_sources(&config, 42)
    } else {
        Vec::new()
    };

    let (inbound_tx, inbound_rx) = if with_inbound {
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };

    let strategy = Box::new(AdaptivePhaseController::with_seed(&config, 7));
    let handle = crossflow_service::start(ServiceContext {
        config,
        sources,
        strategy,
        classifier: TrafficClassifier::new(),
        transport: Some(transport.clone() as Arc<dyn Transport>),
        inbound: inbound_rx,
        clock: Arc::new(clock.clone()),
    });

    Harness {
        handle,
        transport,
        clock,
        topics,
        inbound_tx,
    }
}

/// Advance virtual tokio time and the controller clock together
async fn run_for(harness: &Harness, ms: u64) {
    let step = 50;
    let mut elapsed = 0;
    while elapsed < ms {
        harness.clock.advance(step);
        tokio::time::sleep(Duration::from_millis(step)).await;
        elapsed += step;
    }
}

#[tokio::test(start_paused = true)]
async fn service_publishes_status_and_flushes_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let harness = start_service(&dir, true, false);

    // Two monitoring cycles plus one decision cycle plus the reward delay
    run_for(&harness, 8_000).await;

    let statuses = harness.transport.published(&harness.topics.status());
    assert!(!statuses.is_empty(), "no status records were published");

    let record: StatusRecord = serde_json::from_slice(statuses.last().unwrap()).unwrap();
    assert_eq!(record.intersection_id, "svc_test");
    assert_eq!(record.fused_data.lanes.len(), 8);
    // Simulated sensors have been feeding fusion for seconds by now
    assert!(record.fused_data.timestamp > 0);
    let sum: f64 = record.classification.probabilities.values().sum();
    assert!((sum - 1.0).abs() < 1e-6);

    let latest = harness.handle.latest_status().expect("status watch never set");
    assert_eq!(latest.intersection_id, "svc_test");

    harness.handle.shutdown().await;

    // Shutdown flushed the Q-table for this intersection
    assert!(dir.path().join("q_table_svc_test.json").exists());
}

#[tokio::test(start_paused = true)]
async fn inbound_readings_reach_fusion() {
    let dir = tempfile::tempdir().unwrap();
    let harness = start_service(&dir, false, true);
    let inbound = harness.inbound_tx.clone().unwrap();

    let reading = SensorReading::new(
        "cam_north",
        500,
        SensorPayload::Camera {
            vehicles: vec![CameraVehicle {
                class: None,
                bbox: [0.0, 0.0, 40.0, 30.0],
                confidence: 0.88,
                speed: 33.0,
            }],
        },
    );
    inbound
        .send(InboundMessage {
            topic: harness.topics.sensor_data(reading.kind()),
            payload: serde_json::to_vec(&reading).unwrap(),
        })
        .await
        .unwrap();

    run_for(&harness, 1_500).await;

    let snapshot = harness.handle.latest_snapshot();
    // cam_north feeds both north lanes
    assert_eq!(snapshot.total_vehicles, 2);

    // Garbage on the sensor topic is logged and dropped, not fatal
    inbound
        .send(InboundMessage {
            topic: harness.topics.sensor_data(crossflow_core::reading::SensorKind::Radar),
            payload: b"not json".to_vec(),
        })
        .await
        .unwrap();
    run_for(&harness, 500).await;
    assert_eq!(harness.handle.latest_snapshot().total_vehicles, 2);

    harness.handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn emergency_command_reaches_the_state_machine() {
    let dir = tempfile::tempdir().unwrap();
    let harness = start_service(&dir, false, true);

    harness.handle.send_command(ControlCommand::EmergencyStop).await;
    run_for(&harness, 1_500).await;

    let status = harness.handle.latest_status().expect("no status yet");
    assert_ne!(
        status.control_status.sub_state,
        crossflow_core::control::SignalInterval::Green,
        "emergency must leave green through the clearance sequence"
    );

    // The emergency raised a reliable alert
    let alerts = harness.transport.published(&harness.topics.alerts());
    assert!(!alerts.is_empty());

    harness.handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn premature_manual_switch_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let harness = start_service(&dir, false, true);

    // 1 s into a 10 s min_green
    run_for(&harness, 1_000).await;
    harness
        .handle
        .send_command(ControlCommand::SwitchPhase {
            phase: 2,
            duration_s: None,
        })
        .await;
    run_for(&harness, 1_000).await;

    let status = harness.handle.latest_status().expect("no status yet");
    assert_eq!(status.control_status.current_phase, 0);

    harness.handle.shutdown().await;
}
