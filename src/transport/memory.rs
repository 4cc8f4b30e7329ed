// ABOUTME: In-process message broker implementing BusClient for tests and local wiring
// ABOUTME: Can simulate outages, dropped connections and slow connects, and counts calls

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    topic_matches, BusClient, BusEvent, ConnectOptions, EventStream, InboundMessage, QoS,
};
use crate::error::TransportError;

struct Session {
    client_id: String,
    subscriptions: Vec<String>,
    events: mpsc::UnboundedSender<BusEvent>,
}

struct BrokerState {
    available: bool,
    connect_delay: Duration,
    next_session: u64,
    sessions: HashMap<u64, Session>,
    published: Vec<(String, Bytes)>,
}

#[derive(Default)]
struct Counters {
    publish_calls: AtomicUsize,
    connect_calls: AtomicUsize,
    connects_in_flight: AtomicUsize,
    max_connects_in_flight: AtomicUsize,
}

/// A broker living in process memory.
///
/// Clones share the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    counters: Arc<Counters>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                available: true,
                connect_delay: Duration::ZERO,
                next_session: 0,
                sessions: HashMap::new(),
                published: Vec::new(),
            })),
            counters: Arc::new(Counters::default()),
        }
    }

    /// A new client of this broker, initially disconnected.
    pub fn client(&self) -> MemoryBusClient {
        MemoryBusClient {
            broker: self.clone(),
            session: Mutex::new(None),
        }
    }

    /// While unavailable, connect attempts fail.
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = delay;
    }

    /// Drop every live connection, notifying each client.
    pub fn drop_connections(&self, reason: &str) {
        let sessions: Vec<Session> = self.state.lock().sessions.drain().map(|(_, s)| s).collect();
        for session in sessions {
            let _ = session.events.send(BusEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
    }

    /// Deliver a message as if another client had published it.
    pub fn inject(&self, topic: &str, payload: impl Into<Bytes>) {
        self.route(topic, payload.into());
    }

    /// Every payload accepted by `publish`, in order.
    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.state.lock().published.clone()
    }

    pub fn publish_count(&self) -> usize {
        self.counters.publish_calls.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.counters.connect_calls.load(Ordering::SeqCst)
    }

    /// Highest number of connect calls that were ever running at once.
    pub fn max_concurrent_connects(&self) -> usize {
        self.counters.max_connects_in_flight.load(Ordering::SeqCst)
    }

    /// Client ids of the live connections.
    pub fn client_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .sessions
            .values()
            .map(|s| s.client_id.clone())
            .collect()
    }

    fn route(&self, topic: &str, payload: Bytes) {
        let state = self.state.lock();
        for session in state.sessions.values() {
            if session.subscriptions.iter().any(|f| topic_matches(f, topic)) {
                let _ = session.events.send(BusEvent::Message(InboundMessage {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                }));
            }
        }
    }
}

/// Decrements the in-flight connect counter when the attempt ends or is cancelled.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MemoryBusClient {
    broker: MemoryBroker,
    session: Mutex<Option<u64>>,
}

impl MemoryBusClient {
    fn session_id(&self) -> Result<u64, TransportError> {
        let id = (*self.session.lock()).ok_or(TransportError::NotConnected)?;
        if self.broker.state.lock().sessions.contains_key(&id) {
            Ok(id)
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

#[async_trait]
impl BusClient for MemoryBusClient {
    async fn connect(&self, options: &ConnectOptions) -> Result<EventStream, TransportError> {
        let counters = &self.broker.counters;
        counters.connect_calls.fetch_add(1, Ordering::SeqCst);
        let now = counters.connects_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_connects_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&counters.connects_in_flight);

        let delay = self.broker.state.lock().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.broker.state.lock();
        if !state.available {
            return Err(TransportError::Connect("broker unavailable".to_string()));
        }
        if let Some(old) = self.session.lock().take() {
            state.sessions.remove(&old);
        }
        state.next_session += 1;
        let id = state.next_session;
        state.sessions.insert(
            id,
            Session {
                client_id: options.client_id.clone(),
                subscriptions: Vec::new(),
                events: tx,
            },
        );
        *self.session.lock() = Some(id);
        Ok(rx)
    }

    async fn publish(&self, topic: &str, payload: Bytes, _qos: QoS) -> Result<(), TransportError> {
        self.session_id()?;
        self.broker
            .counters
            .publish_calls
            .fetch_add(1, Ordering::SeqCst);
        self.broker
            .state
            .lock()
            .published
            .push((topic.to_string(), payload.clone()));
        self.broker.route(topic, payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), TransportError> {
        let id = self.session_id()?;
        let mut state = self.broker.state.lock();
        if let Some(session) = state.sessions.get_mut(&id) {
            if !session.subscriptions.iter().any(|f| f == topic) {
                session.subscriptions.push(topic.to_string());
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let id = self.session_id()?;
        let mut state = self.broker.state.lock();
        if let Some(session) = state.sessions.get_mut(&id) {
            session.subscriptions.retain(|f| f != topic);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let session = self.session.lock().take();
        if let Some(id) = session {
            self.broker.state.lock().sessions.remove(&id);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session_id().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(id: &str) -> ConnectOptions {
        ConnectOptions {
            host: "memory".into(),
            port: 0,
            client_id: id.into(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
            max_packet_size: 1024,
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_subscribers() {
        let broker = MemoryBroker::new();
        let publisher = broker.client();
        let subscriber = broker.client();
        publisher.connect(&options("pub")).await.unwrap();
        let mut events = subscriber.connect(&options("sub")).await.unwrap();
        subscriber.subscribe("db/#", QoS::AtLeastOnce).await.unwrap();

        publisher
            .publish("db/sync", Bytes::from_static(b"hello"), QoS::AtLeastOnce)
            .await
            .unwrap();
        publisher
            .publish("other", Bytes::from_static(b"skip"), QoS::AtLeastOnce)
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            BusEvent::Message(InboundMessage {
                topic: "db/sync".into(),
                payload: Bytes::from_static(b"hello"),
            })
        );
        assert!(events.try_recv().is_err());
        assert_eq!(broker.publish_count(), 2);
    }

    #[tokio::test]
    async fn test_unavailable_broker_refuses_connects() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let client = broker.client();
        assert!(matches!(
            client.connect(&options("c")).await,
            Err(TransportError::Connect(_))
        ));
        assert!(!client.is_connected());
        assert_eq!(broker.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_drop_connections_notifies_clients() {
        let broker = MemoryBroker::new();
        let client = broker.client();
        let mut events = client.connect(&options("c")).await.unwrap();
        assert!(client.is_connected());
        assert_eq!(broker.client_ids(), vec!["c".to_string()]);

        broker.drop_connections("network down");
        assert_eq!(
            events.recv().await,
            Some(BusEvent::Disconnected {
                reason: "network down".into()
            })
        );
        assert!(!client.is_connected());
        assert!(matches!(
            client
                .publish("t", Bytes::from_static(b"x"), QoS::AtLeastOnce)
                .await,
            Err(TransportError::NotConnected)
        ));
    }
}
