// ABOUTME: Message-bus abstraction and the resilient publish/subscribe session
// ABOUTME: BusClient trait, inbound events, and MQTT topic filter matching

pub mod memory;
pub mod mqtt;
pub mod session;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::TransportError;

pub use memory::{MemoryBroker, MemoryBusClient};
pub use mqtt::MqttBusClient;
pub use session::{
    PublishOutcome, ReconnectPolicy, SessionConfig, SessionState, TransportSession,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QoS {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

/// Parameters of one connection attempt.
#[derive(Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    /// Fresh for every attempt.
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub max_packet_size: usize,
}

impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("keep_alive", &self.keep_alive)
            .field("max_packet_size", &self.max_packet_size)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Message(InboundMessage),
    /// The connection is gone; no further events follow on this stream.
    Disconnected { reason: String },
}

/// Events of one established connection.
pub type EventStream = mpsc::UnboundedReceiver<BusEvent>;

/// A message-bus client. One connection at a time.
#[async_trait]
pub trait BusClient: Send + Sync + 'static {
    /// Connect, replacing any previous connection. Inbound messages and the
    /// eventual disconnect arrive on the returned stream.
    async fn connect(&self, options: &ConnectOptions) -> Result<EventStream, TransportError>;

    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;
}

/// Receives messages for a subscribed topic filter.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: InboundMessage) -> anyhow::Result<()>;
}

/// Whether `topic` matches the MQTT topic `filter` (`+` one level, `#` the rest).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Whether a topic contains wildcard characters and so cannot be published to.
pub fn has_wildcards(topic: &str) -> bool {
    topic.contains('+') || topic.contains('#')
}
