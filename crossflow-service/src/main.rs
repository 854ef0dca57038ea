//! Crossflow intersection controller
//!
//! Usage: `crossflow [config.json]`
//!
//! Without a config file the standard four-way intersection layout runs
//! with simulated sensors. The service attempts to reach the local MQTT
//! broker; if none is available it keeps running local-only and logs a
//! warning, since transport loss is a transient condition.

use std::sync::Arc;

use log::{error, info, warn};

use crossflow_connectors::{MqttConfig, MqttTransport, TopicSet, Transport};
use crossflow_core::classify::TrafficClassifier;
use crossflow_core::config::IntersectionConfig;
use crossflow_core::control::AdaptivePhaseController;
use crossflow_core::time::SystemClock;
use crossflow_service::source::simulated_sources;
use crossflow_service::{ServiceContext, ServiceRegistry};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("startup aborted: {e}");
            std::process::exit(1);
        }
    };
    let intersection_id = config.intersection_id.clone();
    info!(
        "starting intersection '{intersection_id}' ({} lanes, {} phases)",
        config.lanes.len(),
        config.phases.len()
    );

    let topics = TopicSet::new(&intersection_id);
    let (transport, inbound): (Option<Arc<dyn Transport>>, _) =
        match MqttTransport::connect(
            MqttConfig::for_intersection(&intersection_id),
            topics.subscriptions(),
        )
        .await
        {
            Ok((transport, inbound)) => (Some(Arc::new(transport)), Some(inbound)),
            Err(e) => {
                warn!("MQTT unavailable ({e}), running local-only");
                (None, None)
            }
        };

    let classifier = TrafficClassifier::load_or_fallback(
        config
            .data_dir
            .join(format!("classifier_{intersection_id}.json")),
    );
    let strategy = Box::new(AdaptivePhaseController::new(&config));
    let sources = simulated_sources(&config, rand::random());

    let handle = crossflow_service::start(ServiceContext {
        config,
        sources,
        strategy,
        classifier,
        transport: transport.clone(),
        inbound,
        clock: Arc::new(SystemClock),
    });

    let mut registry = ServiceRegistry::new();
    registry.insert(handle);

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("signal handler failed: {e}");
    }
    info!("shutdown signal received");

    registry.shutdown_all().await;
    if let Some(transport) = transport {
        transport.disconnect().await;
    }
    info!("bye");
}

fn load_config() -> Result<IntersectionConfig, crossflow_core::ConfigError> {
    match std::env::args().nth(1) {
        Some(path) => {
            info!("loading configuration from {path}");
            IntersectionConfig::load(path)
        }
        None => {
            info!("no config file given, using the built-in four-way layout");
            Ok(IntersectionConfig::four_way("intersection_001"))
        }
    }
}
