// ABOUTME: BusClient implementation for MQTT brokers on top of rumqttc
// ABOUTME: Waits for the CONNACK, then forwards publishes and the disconnect to an event stream

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{BusClient, BusEvent, ConnectOptions, EventStream, InboundMessage, QoS};
use crate::error::TransportError;

/// Requests buffered between the client handle and the event loop.
const REQUEST_CAPACITY: usize = 64;

/// rumqttc rejects keep-alive intervals this short.
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

struct Connection {
    client: AsyncClient,
    pump: JoinHandle<()>,
}

/// MQTT 3.1.1 client. A publish succeeds once rumqttc has accepted the
/// request into its outgoing queue.
pub struct MqttBusClient {
    conn: Mutex<Option<Connection>>,
    connected: Arc<AtomicBool>,
}

impl Default for MqttBusClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MqttBusClient {
    pub fn new() -> Self {
        Self {
            conn: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    fn client(&self) -> Result<AsyncClient, TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.conn
            .lock()
            .as_ref()
            .map(|conn| conn.client.clone())
            .ok_or(TransportError::NotConnected)
    }

    fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(old) = self.conn.lock().take() {
            old.pump.abort();
        }
    }
}

fn mqtt_options(options: &ConnectOptions) -> MqttOptions {
    let mut mqtt = MqttOptions::new(&options.client_id, &options.host, options.port);
    mqtt.set_keep_alive(options.keep_alive.max(MIN_KEEP_ALIVE));
    mqtt.set_clean_session(true);
    mqtt.set_max_packet_size(options.max_packet_size, options.max_packet_size);
    if let Some(username) = &options.username {
        mqtt.set_credentials(username, options.password.as_deref().unwrap_or_default());
    }
    mqtt
}

/// Poll until the broker answers the CONNECT.
async fn await_connack(event_loop: &mut EventLoop) -> Result<(), TransportError> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(TransportError::Rejected(format!("{:?}", code))),
                };
            }
            Ok(_) => continue,
            Err(rumqttc::ConnectionError::ConnectionRefused(code)) => {
                return Err(TransportError::Rejected(format!("{:?}", code)));
            }
            Err(e) => return Err(TransportError::Connect(e.to_string())),
        }
    }
}

/// Forward one event-loop result. `Some(reason)` ends the pump.
fn forward_event(
    polled: Result<Event, rumqttc::ConnectionError>,
    events: &mpsc::UnboundedSender<BusEvent>,
) -> Option<String> {
    match polled {
        Ok(Event::Incoming(Packet::Publish(publish))) => {
            let message = InboundMessage {
                topic: publish.topic,
                payload: publish.payload,
            };
            events
                .send(BusEvent::Message(message))
                .err()
                .map(|_| "event receiver dropped".to_string())
        }
        Ok(Event::Incoming(Packet::Disconnect)) => Some("broker sent DISCONNECT".to_string()),
        Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
            Some("client disconnected".to_string())
        }
        Ok(_) => None,
        Err(e) => Some(e.to_string()),
    }
}

async fn pump(
    mut event_loop: EventLoop,
    events: mpsc::UnboundedSender<BusEvent>,
    connected: Arc<AtomicBool>,
) {
    let reason = loop {
        if let Some(reason) = forward_event(event_loop.poll().await, &events) {
            break reason;
        }
    };
    connected.store(false, Ordering::SeqCst);
    tracing::debug!("MQTT event loop stopped: {}", reason);
    let _ = events.send(BusEvent::Disconnected { reason });
}

#[async_trait]
impl BusClient for MqttBusClient {
    async fn connect(&self, options: &ConnectOptions) -> Result<EventStream, TransportError> {
        self.drop_connection();

        let (client, mut event_loop) = AsyncClient::new(mqtt_options(options), REQUEST_CAPACITY);
        await_connack(&mut event_loop).await?;

        self.connected.store(true, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump(event_loop, tx, Arc::clone(&self.connected)));
        *self.conn.lock() = Some(Connection { client, pump });
        Ok(rx)
    }

    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), TransportError> {
        let client = self.client()?;
        client
            .publish_bytes(topic, qos.into(), false, payload)
            .await
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        let client = self.client()?;
        client
            .subscribe(topic, qos.into())
            .await
            .map_err(|e| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let client = self.client()?;
        client
            .unsubscribe(topic)
            .await
            .map_err(|e| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let client = self.conn.lock().as_ref().map(|conn| conn.client.clone());
        if let Some(client) = client {
            if self.connected.load(Ordering::SeqCst) {
                let _ = client.try_disconnect();
            }
        }
        self.drop_connection();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ConnectOptions {
        ConnectOptions {
            host: "127.0.0.1".into(),
            port: 1,
            client_id: "test-client".into(),
            username: Some("user".into()),
            password: Some("secret".into()),
            keep_alive: Duration::from_secs(1),
            max_packet_size: 4096,
        }
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(rumqttc::QoS::from(QoS::AtMostOnce), rumqttc::QoS::AtMostOnce);
        assert_eq!(rumqttc::QoS::from(QoS::AtLeastOnce), rumqttc::QoS::AtLeastOnce);
        assert_eq!(rumqttc::QoS::from(QoS::ExactlyOnce), rumqttc::QoS::ExactlyOnce);
    }

    #[test]
    fn test_keep_alive_has_a_floor() {
        let mqtt = mqtt_options(&options());
        assert_eq!(mqtt.keep_alive(), MIN_KEEP_ALIVE);
        assert_eq!(mqtt.client_id(), "test-client");
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let client = MqttBusClient::new();
        assert!(!client.is_connected());
        assert_eq!(
            client
                .publish("db/sync", Bytes::from_static(b"x"), QoS::AtLeastOnce)
                .await,
            Err(TransportError::NotConnected)
        );
        assert_eq!(
            client.subscribe("db/sync", QoS::AtLeastOnce).await,
            Err(TransportError::NotConnected)
        );
        assert!(client.disconnect().await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let client = MqttBusClient::new();
        let result = client.connect(&options()).await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
        assert!(!client.is_connected());
    }

    #[test]
    fn test_forward_event_stops_when_receiver_is_gone() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let publish = || {
            Ok(Event::Incoming(Packet::Publish(rumqttc::Publish::new(
                "db/sync",
                rumqttc::QoS::AtLeastOnce,
                "payload",
            ))))
        };

        assert_eq!(forward_event(publish(), &tx), None);
        assert!(matches!(rx.try_recv(), Ok(BusEvent::Message(m)) if m.topic == "db/sync"));
        assert_eq!(forward_event(Ok(Event::Outgoing(rumqttc::Outgoing::PingReq)), &tx), None);

        drop(rx);
        assert_eq!(
            forward_event(publish(), &tx),
            Some("event receiver dropped".to_string())
        );
        assert_eq!(
            forward_event(Ok(Event::Incoming(Packet::Disconnect)), &tx),
            Some("broker sent DISCONNECT".to_string())
        );
    }
}
