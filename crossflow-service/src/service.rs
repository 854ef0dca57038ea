//! Intersection service: task wiring and the two control cadences
//!
//! ## Task layout
//!
//! ```text
//! source tasks (1 per sensor) ──┐
//!                               ├─→ fusion actor ─→ watch<Arc<Snapshot>>
//! inbound dispatcher (bus) ─────┘         │
//!                                          ├─→ monitoring task (1 s): classify, publish status
//!                                          └─→ decision task (5 s): decide → settle → learn
//! ```
//!
//! The fusion actor is the only writer of the snapshot; it publishes each
//! new `Arc<IntersectionSnapshot>` through a watch channel, so the
//! monitoring and decision tasks read a consistent view with a pointer swap
//! and never block each other.
//!
//! The decision task additionally runs a fast tick that advances the phase
//! state machine and drains manual override commands, so clearance
//! transitions land within a tick of their deadline rather than at the
//! decision cadence.
//!
//! ## Shutdown
//!
//! A watch signal asks every task to stop after its current iteration; the
//! decision task then flushes the learned state before exiting. Nothing is
//! aborted mid-write.

use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};

use crossflow_connectors::{InboundMessage, TopicSet, Transport};
use crossflow_core::classify::{Features, TrafficClassifier};
use crossflow_core::config::{CadenceConfig, IntersectionConfig};
use crossflow_core::control::{
    ActionOutcome, ControlStrategy, NoChangeReason, PhaseStateMachine,
};
use crossflow_core::fusion::SensorFusion;
use crossflow_core::reading::SensorReading;
use crossflow_core::snapshot::IntersectionSnapshot;
use crossflow_core::status::{AlertKind, AlertRecord, ControlCommand, StatusRecord};
use crossflow_core::time::{Clock, Timestamp};

use crate::source::SensorSource;

/// Bound of the readings channel between sources and the fusion actor
const FUSION_CHANNEL_CAPACITY: usize = 64;

/// Bound of the manual override command channel
const COMMAND_CHANNEL_CAPACITY: usize = 16;

/// Fast cadence driving state-machine ticks and override handling
const MACHINE_TICK_MS: u64 = 250;

/// Everything needed to start one intersection service
pub struct ServiceContext {
    pub config: IntersectionConfig,
    pub sources: Vec<Box<dyn SensorSource>>,
    pub strategy: Box<dyn ControlStrategy>,
    pub classifier: TrafficClassifier,
    pub transport: Option<Arc<dyn Transport>>,
    pub inbound: Option<mpsc::Receiver<InboundMessage>>,
    pub clock: Arc<dyn Clock>,
}

/// Running intersection service
pub struct ServiceHandle {
    intersection_id: String,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    status_rx: watch::Receiver<Option<StatusRecord>>,
    snapshot_rx: watch::Receiver<Arc<IntersectionSnapshot>>,
    command_tx: mpsc::Sender<ControlCommand>,
}

impl ServiceHandle {
    pub fn intersection_id(&self) -> &str {
        &self.intersection_id
    }

    /// Most recent published status record, if any cycle completed yet
    pub fn latest_status(&self) -> Option<StatusRecord> {
        self.status_rx.borrow().clone()
    }

    pub fn latest_snapshot(&self) -> Arc<IntersectionSnapshot> {
        self.snapshot_rx.borrow().clone()
    }

    /// Inject a manual override, as if it arrived on the command topic
    pub async fn send_command(&self, command: ControlCommand) {
        if self.command_tx.send(command).await.is_err() {
            warn!("{}: command channel closed", self.intersection_id);
        }
    }

    /// Stop all tasks after their current iteration and flush learned state
    pub async fn shutdown(self) {
        info!("{}: shutting down", self.intersection_id);
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!("{}: stopped", self.intersection_id);
    }
}

/// Start the service tasks for one intersection
pub fn start(ctx: ServiceContext) -> ServiceHandle {
    let ServiceContext {
        config,
        sources,
        mut strategy,
        classifier,
        transport,
        inbound,
        clock,
    } = ctx;

    let intersection_id = config.intersection_id.clone();
    let topics = TopicSet::new(&intersection_id);
    let cadence = config.cadence.clone();
    let now = clock.now();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (fusion_tx, fusion_rx) = mpsc::channel::<SensorReading>(FUSION_CHANNEL_CAPACITY);
    let (command_tx, command_rx) = mpsc::channel::<ControlCommand>(COMMAND_CHANNEL_CAPACITY);
    let (snapshot_tx, snapshot_rx) =
        watch::channel(Arc::new(IntersectionSnapshot::empty(now)));
    let (status_tx, status_rx) = watch::channel(None);

    let machine = PhaseStateMachine::new(config.phases.clone(), now);
    let (control_tx, control_rx) = watch::channel(strategy.status(&machine, now));

    let mut tasks = Vec::new();

    for source in sources {
        tasks.push(tokio::spawn(run_source(
            source,
            fusion_tx.clone(),
            Arc::clone(&clock),
            cadence.source_timeout_ms,
            shutdown_rx.clone(),
        )));
    }

    if let Some(inbound_rx) = inbound {
        tasks.push(tokio::spawn(run_inbound(
            inbound_rx,
            topics.clone(),
            fusion_tx.clone(),
            command_tx.clone(),
            shutdown_rx.clone(),
        )));
    }
    drop(fusion_tx);

    tasks.push(tokio::spawn(run_fusion(
        SensorFusion::new(config.lanes.clone()),
        fusion_rx,
        snapshot_tx,
        shutdown_rx.clone(),
    )));

    tasks.push(tokio::spawn(run_monitoring(MonitoringTask {
        intersection_id: intersection_id.clone(),
        classifier,
        snapshot_rx: snapshot_rx.clone(),
        control_rx,
        status_tx,
        transport: transport.clone(),
        topics: topics.clone(),
        clock: Arc::clone(&clock),
        interval_ms: cadence.monitor_interval_ms,
        shutdown: shutdown_rx.clone(),
    })));

    tasks.push(tokio::spawn(run_decision(DecisionTask {
        intersection_id: intersection_id.clone(),
        strategy,
        machine,
        snapshot_rx: snapshot_rx.clone(),
        control_tx,
        command_rx,
        transport,
        topics,
        clock,
        cadence,
        shutdown: shutdown_rx,
    })));

    info!("{intersection_id}: service started ({} tasks)", tasks.len());

    ServiceHandle {
        intersection_id,
        shutdown: shutdown_tx,
        tasks,
        status_rx,
        snapshot_rx,
        command_tx,
    }
}

async fn run_source(
    mut source: Box<dyn SensorSource>,
    tx: mpsc::Sender<SensorReading>,
    clock: Arc<dyn Clock>,
    timeout_ms: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(Duration::from_millis(source.sample_interval_ms().max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let now = clock.now();
                match timeout(Duration::from_millis(timeout_ms), source.sample(now)).await {
                    Ok(Ok(payload)) => {
                        let reading = SensorReading::new(source.sensor_id(), now, payload);
                        if tx.send(reading).await.is_err() {
                            break;
                        }
                    }
                    Ok(Err(e)) => {
                        warn!("{}: sample failed ({e}), substituting no data", source.sensor_id());
                    }
                    Err(_) => {
                        warn!(
                            "{}: sample timed out after {timeout_ms} ms, substituting no data",
                            source.sensor_id()
                        );
                    }
                }
            }
        }
    }
    debug!("{}: source task stopped", source.sensor_id());
}

async fn run_fusion(
    mut fusion: SensorFusion,
    mut readings: mpsc::Receiver<SensorReading>,
    snapshot_tx: watch::Sender<Arc<IntersectionSnapshot>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            reading = readings.recv() => {
                match reading {
                    Some(reading) => {
                        let snapshot = fusion.update(reading);
                        snapshot_tx.send_replace(Arc::new(snapshot));
                    }
                    None => break,
                }
            }
        }
    }
    debug!("fusion task stopped");
}

struct MonitoringTask {
    intersection_id: String,
    classifier: TrafficClassifier,
    snapshot_rx: watch::Receiver<Arc<IntersectionSnapshot>>,
    control_rx: watch::Receiver<crossflow_core::control::ControlStatus>,
    status_tx: watch::Sender<Option<StatusRecord>>,
    transport: Option<Arc<dyn Transport>>,
    topics: TopicSet,
    clock: Arc<dyn Clock>,
    interval_ms: u64,
    shutdown: watch::Receiver<bool>,
}

async fn run_monitoring(mut task: MonitoringTask) {
    let mut ticker = interval(Duration::from_millis(task.interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = task.shutdown.changed() => {
                if changed.is_err() || *task.shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let snapshot = task.snapshot_rx.borrow().clone();
                let features = Features::from_snapshot(&snapshot);
                let classification = task.classifier.classify(&features);

                let record = StatusRecord {
                    intersection_id: task.intersection_id.clone(),
                    timestamp: task.clock.now(),
                    fused_data: (*snapshot).clone(),
                    classification,
                    control_status: task.control_rx.borrow().clone(),
                };

                publish_json(&task.transport, &task.topics.status(), &record).await;
                task.status_tx.send_replace(Some(record));
            }
        }
    }
    debug!("{}: monitoring task stopped", task.intersection_id);
}

struct DecisionTask {
    intersection_id: String,
    strategy: Box<dyn ControlStrategy>,
    machine: PhaseStateMachine,
    snapshot_rx: watch::Receiver<Arc<IntersectionSnapshot>>,
    control_tx: watch::Sender<crossflow_core::control::ControlStatus>,
    command_rx: mpsc::Receiver<ControlCommand>,
    transport: Option<Arc<dyn Transport>>,
    topics: TopicSet,
    clock: Arc<dyn Clock>,
    cadence: CadenceConfig,
    shutdown: watch::Receiver<bool>,
}

struct PendingSettle {
    before: Arc<IntersectionSnapshot>,
    due: Timestamp,
}

async fn run_decision(mut task: DecisionTask) {
    let mut ticker = interval(Duration::from_millis(MACHINE_TICK_MS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut next_decision = task.clock.now() + task.cadence.decision_interval_ms;
    let mut pending: Option<PendingSettle> = None;

    loop {
        tokio::select! {
            changed = task.shutdown.changed() => {
                if changed.is_err() || *task.shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let now = task.clock.now();

                for event in task.machine.tick(now) {
                    info!("{}: {event:?}", task.intersection_id);
                }

                while let Ok(command) = task.command_rx.try_recv() {
                    apply_command(&mut task, command, now).await;
                }

                if pending.as_ref().map_or(false, |s| now >= s.due) {
                    if let Some(settle) = pending.take() {
                        let after = task.snapshot_rx.borrow().clone();
                        task.strategy.settle(&settle.before, &after, &task.machine, now);
                    }
                }

                if now >= next_decision {
                    next_decision = now + task.cadence.decision_interval_ms;
                    let before = task.snapshot_rx.borrow().clone();
                    let outcome = task.strategy.decide(&before, &mut task.machine, now);

                    match outcome {
                        ActionOutcome::Emergency => {
                            alert(&mut task, AlertKind::EmergencyStop, Some(outcome), now).await;
                        }
                        ActionOutcome::NightMode { .. } => {
                            alert(&mut task, AlertKind::NightMode, Some(outcome), now).await;
                        }
                        _ => {}
                    }

                    pending = Some(PendingSettle {
                        before,
                        due: now + task.cadence.reward_delay_ms,
                    });
                }

                let status = task.strategy.status(&task.machine, now);
                task.control_tx.send_replace(status);
            }
        }
    }

    match task.strategy.flush() {
        Ok(()) => info!("{}: learned state flushed", task.intersection_id),
        Err(e) => error!("{}: flushing learned state failed: {e}", task.intersection_id),
    }
    debug!("{}: decision task stopped", task.intersection_id);
}

/// Apply a manual override directly to the state machine
///
/// Overrides bypass the policy but not the safety rules: a switch issued
/// before `min_green` elapses is still rejected. A requested hold duration
/// is honored only when the target phase is already green.
async fn apply_command(task: &mut DecisionTask, command: ControlCommand, now: Timestamp) {
    let outcome = match command {
        ControlCommand::SwitchPhase { phase, duration_s } => {
            let from = task.machine.current_phase_id();
            match task.machine.request_switch(phase, now) {
                Ok(crossflow_core::control::phase::SwitchOutcome::Started) => {
                    ActionOutcome::PhaseSwitch { from, to: phase }
                }
                Ok(crossflow_core::control::phase::SwitchOutcome::AlreadyActive) => {
                    if let Some(duration_s) = duration_s {
                        let delta =
                            duration_s as i64 - task.machine.remaining_green_s(now) as i64;
                        task.machine.extend(delta as i32, now);
                    }
                    ActionOutcome::NoChange {
                        reason: NoChangeReason::AlreadyInPhase,
                    }
                }
                Err(reason) => ActionOutcome::Rejected { reason },
            }
        }
        ControlCommand::EmergencyStop => {
            task.machine.emergency_stop(now);
            ActionOutcome::Emergency
        }
        ControlCommand::ClearEmergency => {
            task.machine.clear_emergency(now);
            ActionOutcome::NoChange {
                reason: NoChangeReason::MaintainCurrent,
            }
        }
        ControlCommand::NightMode => ActionOutcome::NightMode { flash_interval_s: 1.0 },
        ControlCommand::Unknown => ActionOutcome::Unknown,
    };

    info!("{}: manual override {command:?} -> {outcome:?}", task.intersection_id);

    let kind = match command {
        ControlCommand::EmergencyStop => AlertKind::EmergencyStop,
        ControlCommand::NightMode => AlertKind::NightMode,
        _ => AlertKind::ManualOverride,
    };
    alert(task, kind, Some(outcome), now).await;
}

async fn alert(
    task: &mut DecisionTask,
    kind: AlertKind,
    outcome: Option<ActionOutcome>,
    now: Timestamp,
) {
    let record = AlertRecord {
        intersection_id: task.intersection_id.clone(),
        timestamp: now,
        kind,
        outcome,
    };
    let Some(transport) = &task.transport else {
        return;
    };
    if !transport.is_connected() {
        return;
    }
    match serde_json::to_vec(&record) {
        Ok(bytes) => {
            if let Err(e) = transport.publish_reliable(&task.topics.alerts(), &bytes).await {
                warn!("{}: alert publish failed: {e}", task.intersection_id);
            }
        }
        Err(e) => error!("{}: alert serialization failed: {e}", task.intersection_id),
    }
}

async fn publish_json<T: serde::Serialize>(
    transport: &Option<Arc<dyn Transport>>,
    topic: &str,
    value: &T,
) {
    let Some(transport) = transport else {
        return;
    };
    if !transport.is_connected() {
        return;
    }
    match serde_json::to_vec(value) {
        Ok(bytes) => {
            if let Err(e) = transport.publish(topic, &bytes).await {
                warn!("publish to {topic} failed: {e}");
            }
        }
        Err(e) => error!("serialization for {topic} failed: {e}"),
    }
}

async fn run_inbound(
    mut inbound: mpsc::Receiver<InboundMessage>,
    topics: TopicSet,
    fusion_tx: mpsc::Sender<SensorReading>,
    command_tx: mpsc::Sender<ControlCommand>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            message = inbound.recv() => {
                let Some(message) = message else { break };

                if let Some(kind) = topics.sensor_kind_of(&message.topic) {
                    match serde_json::from_slice::<SensorReading>(&message.payload) {
                        Ok(reading) if reading.kind() == kind => {
                            if fusion_tx.send(reading).await.is_err() {
                                break;
                            }
                        }
                        Ok(reading) => warn!(
                            "reading kind {} does not match topic {}, dropping",
                            reading.kind().name(),
                            message.topic
                        ),
                        Err(e) => warn!("malformed reading on {}: {e}", message.topic),
                    }
                } else if topics.is_command(&message.topic) {
                    let command = serde_json::from_slice::<ControlCommand>(&message.payload)
                        .unwrap_or(ControlCommand::Unknown);
                    if command_tx.send(command).await.is_err() {
                        break;
                    }
                } else if topics.is_config(&message.topic) {
                    info!(
                        "config update on {} ({} bytes); restart to apply",
                        message.topic,
                        message.payload.len()
                    );
                } else {
                    debug!("ignoring message on {}", message.topic);
                }
            }
        }
    }
    debug!("inbound dispatcher stopped");
}
