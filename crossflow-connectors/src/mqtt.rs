//! MQTT transport backed by rumqttc
//!
//! One background task drives the broker event loop: it forwards publishes
//! arriving on subscribed topics into a bounded inbound channel, tracks
//! connection state, and lets rumqttc's reconnect logic handle broker
//! outages. Publishing goes through the cloneable async client and never
//! blocks on the event loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::{mpsc, watch};

use crate::{ConnectionStats, InboundMessage, Transport, TransportError};

/// MQTT connection settings
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub keep_alive_s: u64,
    /// Bound of the inbound message channel
    pub inbound_capacity: usize,
    /// How long `connect` waits for the first broker acknowledgment
    pub connect_timeout_ms: u64,
}

impl MqttConfig {
    pub fn for_intersection(intersection_id: &str) -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: format!("crossflow_{intersection_id}"),
            keep_alive_s: 60,
            inbound_capacity: 256,
            connect_timeout_ms: 10_000,
        }
    }
}

/// MQTT-backed [`Transport`]
pub struct MqttTransport {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    stats: Arc<Mutex<ConnectionStats>>,
}

impl MqttTransport {
    /// Connect to the broker, subscribe, and spawn the event-loop task
    ///
    /// Returns the transport plus the channel on which subscribed messages
    /// arrive. Fails only if the broker does not acknowledge within the
    /// configured timeout; after that, outages are handled by reconnection
    /// inside the event-loop task.
    pub async fn connect(
        config: MqttConfig,
        subscriptions: Vec<String>,
    ) -> Result<(Self, mpsc::Receiver<InboundMessage>), TransportError> {
        let mut options = MqttOptions::new(
            config.client_id.as_str(),
            config.broker_host.as_str(),
            config.broker_port,
        );
        options.set_keep_alive(Duration::from_secs(config.keep_alive_s));

        let (client, mut eventloop) = AsyncClient::new(options, config.inbound_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity);
        let (connected_tx, mut connected_rx) = watch::channel(false);

        let connected = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(Mutex::new(ConnectionStats::default()));

        let loop_connected = Arc::clone(&connected);
        let loop_stats = Arc::clone(&stats);
        let loop_client = client.clone();
        let client_id = config.client_id.clone();
        tokio::spawn(async move {
            let mut was_connected = false;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("{client_id}: connected to broker");
                        loop_connected.store(true, Ordering::SeqCst);
                        let _ = connected_tx.send(true);
                        if was_connected {
                            if let Ok(mut s) = loop_stats.lock() {
                                s.reconnections += 1;
                            }
                        }
                        was_connected = true;
                        // (Re)subscribe on every connection
                        for topic in &subscriptions {
                            if let Err(e) =
                                loop_client.subscribe(topic.as_str(), QoS::AtMostOnce).await
                            {
                                warn!("{client_id}: subscribe {topic} failed: {e}");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = InboundMessage {
                            topic: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                        };
                        if inbound_tx.try_send(message).is_err() {
                            debug!(
                                "{client_id}: inbound channel full, dropping message on {}",
                                publish.topic
                            );
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("{client_id}: broker disconnected");
                        loop_connected.store(false, Ordering::SeqCst);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if loop_connected.swap(false, Ordering::SeqCst) {
                            warn!("{client_id}: connection lost: {e}");
                        }
                        if let Ok(mut s) = loop_stats.lock() {
                            s.last_error = Some(e.to_string());
                        }
                        if inbound_tx.is_closed() {
                            // Nobody is listening anymore; stop polling
                            break;
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
            debug!("{client_id}: event loop task finished");
        });

        let wait = tokio::time::timeout(
            Duration::from_millis(config.connect_timeout_ms),
            connected_rx.wait_for(|up| *up),
        )
        .await;
        match wait {
            Ok(Ok(_)) => Ok((
                Self {
                    client,
                    connected,
                    stats,
                },
                inbound_rx,
            )),
            _ => Err(TransportError::ConnectTimeout(config.connect_timeout_ms)),
        }
    }

    async fn publish_qos(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
    ) -> Result<(), TransportError> {
        if !self.is_connected() {
            if let Ok(mut s) = self.stats.lock() {
                s.messages_failed += 1;
            }
            return Err(TransportError::NotConnected);
        }

        match self.client.publish(topic, qos, false, payload.to_vec()).await {
            Ok(()) => {
                if let Ok(mut s) = self.stats.lock() {
                    s.messages_sent += 1;
                    s.bytes_sent += payload.len() as u64;
                }
                Ok(())
            }
            Err(e) => {
                if let Ok(mut s) = self.stats.lock() {
                    s.messages_failed += 1;
                    s.last_error = Some(e.to_string());
                }
                Err(TransportError::Protocol(e.to_string()))
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.publish_qos(topic, payload, QoS::AtMostOnce).await
    }

    async fn publish_reliable(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.publish_qos(topic, payload, QoS::AtLeastOnce).await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn stats(&self) -> ConnectionStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Err(e) = self.client.disconnect().await {
            debug!("disconnect: {e}");
        }
    }
}
