//! Pub/sub bus adapter. Wraps `rumqttc` behind a small capability surface
//! (`publish`/`subscribe`/`unsubscribe`/`is_connected`) so the signalling
//! and engine code never touches `rumqttc` types directly, and so handler
//! dispatch can enforce the "never block the bus dispatcher" rule from the
//! concurrency model: each subscription gets its own bounded channel and a
//! full channel drops the message with a warning rather than blocking the
//! shared poll loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use edgecast_protocol::BusConfig;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One message delivered on a subscribed topic.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

type SubscriptionMap = Arc<Mutex<HashMap<String, mpsc::Sender<BusMessage>>>>;

/// Bounded per-topic handoff channel depth. A bus handler that cannot keep
/// up sees its oldest-pending messages dropped rather than stalling the
/// shared poll loop other topics depend on.
const HANDLER_CHANNEL_DEPTH: usize = 32;

pub struct Bus {
    client: AsyncClient,
    subscriptions: SubscriptionMap,
    connected: Arc<AtomicBool>,
}

impl Bus {
    /// Connect to the configured broker and spawn the background poll loop.
    /// `client_id_suffix` distinguishes multiple connections from the same
    /// process (e.g. one per edge stream).
    pub async fn connect(config: &BusConfig, client_id_suffix: &str) -> anyhow::Result<Self> {
        let client_id = format!(
            "{}-{}-{}",
            config.client_id_prefix,
            client_id_suffix,
            uuid::Uuid::new_v4()
        );
        let (host, port) = parse_broker_address(&config.server)?;
        let mut opts = MqttOptions::new(client_id, host, port);
        opts.set_keep_alive(Duration::from_secs(30));
        opts.set_clean_session(false);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            opts.set_credentials(user, pass);
        }

        let (client, mut event_loop) = AsyncClient::new(opts, 128);
        let subscriptions: SubscriptionMap = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(false));

        let poll_subscriptions = subscriptions.clone();
        let poll_connected = connected.clone();
        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        poll_connected.store(true, Ordering::Relaxed);
                        info!("bus connected");
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let topic = publish.topic.clone();
                        let handler = poll_subscriptions.lock().get(&topic).cloned();
                        if let Some(tx) = handler {
                            let msg = BusMessage {
                                topic: topic.clone(),
                                payload: publish.payload.to_vec(),
                            };
                            if tx.try_send(msg).is_err() {
                                warn!(topic, "bus handler channel full or closed, dropping message");
                            }
                        } else {
                            debug!(topic, "no handler registered for incoming bus message");
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        poll_connected.store(false, Ordering::Relaxed);
                        warn!("bus disconnected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        poll_connected.store(false, Ordering::Relaxed);
                        warn!("bus poll error: {e:#}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(Self {
            client,
            subscriptions,
            connected,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub async fn publish(
        &self,
        topic: &str,
        qos: u8,
        retained: bool,
        payload: Vec<u8>,
    ) -> anyhow::Result<()> {
        self.client
            .publish(topic, qos_from_u8(qos), retained, payload)
            .await?;
        Ok(())
    }

    /// Subscribe to `topic`, returning a receiver fed by the background
    /// poll loop. Re-subscribing to the same topic replaces the previous
    /// receiver's sender, so the old receiver simply stops receiving.
    pub async fn subscribe(&self, topic: &str, qos: u8) -> anyhow::Result<mpsc::Receiver<BusMessage>> {
        let (tx, rx) = mpsc::channel(HANDLER_CHANNEL_DEPTH);
        self.subscriptions.lock().insert(topic.to_string(), tx);
        self.client.subscribe(topic, qos_from_u8(qos)).await?;
        Ok(rx)
    }

    pub async fn unsubscribe(&self, topic: &str) -> anyhow::Result<()> {
        self.subscriptions.lock().remove(topic);
        self.client.unsubscribe(topic).await?;
        Ok(())
    }
}

/// Parse a `mqtt://host:port` (or bare `host:port`) broker address.
fn parse_broker_address(server: &str) -> anyhow::Result<(String, u16)> {
    let stripped = server
        .strip_prefix("mqtt://")
        .or_else(|| server.strip_prefix("tcp://"))
        .unwrap_or(server);
    let (host, port) = stripped
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("bus.server '{server}' is missing a port"))?;
    let port: u16 = port
        .parse()
        .map_err(|_| anyhow::anyhow!("bus.server '{server}' has a non-numeric port"))?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mqtt_scheme() {
        let (host, port) = parse_broker_address("mqtt://broker.local:1883").unwrap();
        assert_eq!(host, "broker.local");
        assert_eq!(port, 1883);
    }

    #[test]
    fn parses_bare_host_port() {
        let (host, port) = parse_broker_address("localhost:1883").unwrap();
        assert_eq!(host, "localhost");
        assert_eq!(port, 1883);
    }

    #[test]
    fn rejects_missing_port() {
        assert!(parse_broker_address("mqtt://broker.local").is_err());
    }

    #[test]
    fn qos_mapping_defaults_to_at_least_once() {
        assert_eq!(qos_from_u8(7), QoS::AtLeastOnce);
        assert_eq!(qos_from_u8(0), QoS::AtMostOnce);
        assert_eq!(qos_from_u8(2), QoS::ExactlyOnce);
    }
}
