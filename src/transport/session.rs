// ABOUTME: Long-lived bus session with single-flight reconnection and publish dedup
// ABOUTME: Tracks connection state on a watch channel and re-subscribes after reconnects

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{
    BusClient, BusEvent, ConnectOptions, EventStream, InboundMessage, MessageHandler, QoS,
    topic_matches,
};
use crate::delta::MessageKind;
use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl SessionState {
    pub fn is_connected(self) -> bool {
        self == SessionState::Connected
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Constant wait before each reconnect attempt.
    pub backoff: Duration,
    /// Give up after this many failed attempts; `None` retries forever.
    pub max_attempts: Option<u32>,
    pub connect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(3),
            max_attempts: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Client ids are `<prefix>-<uuid>`, new for every attempt.
    pub client_id_prefix: String,
    pub keep_alive: Duration,
    pub max_packet_size: usize,
    pub qos: QoS,
    pub reconnect: ReconnectPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id_prefix: "mqtt-replicator".to_string(),
            keep_alive: Duration::from_secs(30),
            max_packet_size: 16 * 1024 * 1024,
            qos: QoS::AtLeastOnce,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    /// Same payload as the last one published to the topic.
    Duplicate,
    Empty,
}

#[derive(Default)]
struct Tasks {
    reconnect: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
}

struct Inner<B> {
    client: B,
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    closed: AtomicBool,
    /// One permit; held by the running reconnect task.
    reconnect_guard: Arc<Semaphore>,
    /// Last published digest per topic and payload kind. Held across the
    /// publish call, which also keeps publishes in call order.
    last_published: tokio::sync::Mutex<HashMap<(String, MessageKind), [u8; 32]>>,
    handlers: Mutex<Vec<(String, Arc<dyn MessageHandler>)>>,
    /// Bumped per established connection so stale event pumps stay quiet.
    generation: AtomicU64,
    /// Set when the live link drops while a reconnect holds the guard.
    relink: AtomicBool,
    tasks: Mutex<Tasks>,
}

/// A single logical publish/subscribe session over a [`BusClient`].
///
/// Cheap to clone; clones share the session.
pub struct TransportSession<B: BusClient> {
    inner: Arc<Inner<B>>,
}

impl<B: BusClient> Clone for TransportSession<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: BusClient> TransportSession<B> {
    pub fn new(client: B, config: SessionConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                client,
                config,
                state,
                closed: AtomicBool::new(false),
                reconnect_guard: Arc::new(Semaphore::new(1)),
                last_published: tokio::sync::Mutex::new(HashMap::new()),
                handlers: Mutex::new(Vec::new()),
                generation: AtomicU64::new(0),
                relink: AtomicBool::new(false),
                tasks: Mutex::new(Tasks::default()),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Observe state transitions.
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// True while a reconnect task holds the single-flight guard.
    pub fn is_reconnecting(&self) -> bool {
        self.inner.reconnect_guard.available_permits() == 0
    }

    /// Connect once, bounded by the connect timeout.
    ///
    /// On success every registered subscription is re-issued. On failure
    /// the state returns to `Disconnected`; no automatic retry is started.
    pub async fn connect(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.inner.connect_once(SessionState::Disconnected).await
    }

    /// Report a lost connection and start reconnecting.
    ///
    /// Returns `false` when a reconnect is already running or the session is
    /// closed; the notification is then ignored.
    pub fn notify_disconnected(&self, reason: &str) -> bool {
        self.inner.notify_disconnected(reason, false)
    }

    /// Publish `payload` unless it is empty or identical to the last payload
    /// of the same kind successfully published to `topic`.
    pub async fn publish_with_dedup(
        &self,
        topic: &str,
        kind: MessageKind,
        payload: Bytes,
    ) -> Result<PublishOutcome, TransportError> {
        if payload.is_empty() {
            tracing::debug!("Skipping empty payload for {}", topic);
            return Ok(PublishOutcome::Empty);
        }
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let digest: [u8; 32] = Sha256::digest(&payload).into();
        let key = (topic.to_string(), kind);
        let mut last_published = self.inner.last_published.lock().await;
        if last_published.get(&key) == Some(&digest) {
            tracing::debug!("Skipping duplicate payload for {}", topic);
            return Ok(PublishOutcome::Duplicate);
        }
        if !self.state().is_connected() {
            return Err(TransportError::NotConnected);
        }

        let size = payload.len();
        self.inner
            .client
            .publish(topic, payload, self.inner.config.qos)
            .await?;
        last_published.insert(key, digest);
        tracing::info!("Published {} bytes to {}", size, topic);
        Ok(PublishOutcome::Published)
    }

    /// Route messages matching `topic` (a filter, wildcards allowed) to `handler`.
    ///
    /// Registering the same filter again replaces its handler. The
    /// subscription is issued now if connected and again after every
    /// reconnect.
    pub async fn subscribe_with_dispatch(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        {
            let mut handlers = self.inner.handlers.lock();
            match handlers.iter_mut().find(|(filter, _)| filter == topic) {
                Some(entry) => entry.1 = handler,
                None => handlers.push((topic.to_string(), handler)),
            }
        }
        if self.state().is_connected() {
            self.inner
                .client
                .subscribe(topic, self.inner.config.qos)
                .await?;
            tracing::info!("Subscribed to {}", topic);
        }
        Ok(())
    }

    /// Close the session: stop reconnecting, unsubscribe and disconnect.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let (reconnect, pump) = {
            let mut tasks = self.inner.tasks.lock();
            (tasks.reconnect.take(), tasks.pump.take())
        };
        if let Some(task) = reconnect {
            task.abort();
            let _ = task.await;
        }
        if let Some(task) = pump {
            task.abort();
        }

        if self.inner.client.is_connected() {
            let topics: Vec<String> = self
                .inner
                .handlers
                .lock()
                .iter()
                .map(|(topic, _)| topic.clone())
                .collect();
            for topic in topics {
                if let Err(e) = self.inner.client.unsubscribe(&topic).await {
                    tracing::debug!("Unsubscribe from {} failed during close: {}", topic, e);
                }
            }
        }
        if let Err(e) = self.inner.client.disconnect().await {
            tracing::debug!("Disconnect failed during close: {}", e);
        }
        self.inner.set_state(SessionState::Disconnected);
        tracing::info!("Session closed");
    }
}

impl<B: BusClient> Inner<B> {
    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            host: self.config.host.clone(),
            port: self.config.port,
            client_id: format!("{}-{}", self.config.client_id_prefix, Uuid::new_v4()),
            username: self.config.username.clone(),
            password: self.config.password.clone(),
            keep_alive: self.config.keep_alive,
            max_packet_size: self.config.max_packet_size,
        }
    }

    /// One connect attempt; `failure_state` is entered if it does not succeed.
    async fn connect_once(
        self: &Arc<Self>,
        failure_state: SessionState,
    ) -> Result<(), TransportError> {
        self.set_state(SessionState::Connecting);
        // The previous connection's pump becomes stale before it can observe
        // its stream closing.
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let options = self.connect_options();
        let timeout = self.config.reconnect.connect_timeout;
        tracing::debug!(
            "Connecting to {}:{} as {}",
            options.host,
            options.port,
            options.client_id
        );

        let events = match tokio::time::timeout(timeout, self.client.connect(&options)).await {
            Ok(Ok(events)) => events,
            Ok(Err(e)) => {
                self.set_state(failure_state);
                return Err(e);
            }
            Err(_) => {
                self.set_state(failure_state);
                return Err(TransportError::ConnectTimeout(timeout));
            }
        };

        if self.is_closed() {
            let _ = self.client.disconnect().await;
            self.set_state(SessionState::Disconnected);
            return Err(TransportError::Closed);
        }

        let pump = tokio::spawn(pump_events(Arc::downgrade(self), events, generation));
        if let Some(old) = self.tasks.lock().pump.replace(pump) {
            old.abort();
        }
        self.set_state(SessionState::Connected);
        tracing::info!(
            "Connected to broker {}:{} as {}",
            options.host,
            options.port,
            options.client_id
        );

        let topics: Vec<String> = self
            .handlers
            .lock()
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect();
        for topic in topics {
            match self.client.subscribe(&topic, self.config.qos).await {
                Ok(()) => tracing::info!("Subscribed to {}", topic),
                Err(e) => tracing::warn!("Failed to subscribe to {}: {}", topic, e),
            }
        }
        Ok(())
    }

    /// `from_link` marks a drop reported by the live connection's event pump.
    fn notify_disconnected(self: &Arc<Self>, reason: &str, from_link: bool) -> bool {
        if self.is_closed() {
            return false;
        }
        let permit = match Arc::clone(&self.reconnect_guard).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                if from_link {
                    self.relink.store(true, Ordering::SeqCst);
                }
                tracing::info!(
                    "Reconnection already in progress; ignoring disconnect ({})",
                    reason
                );
                return false;
            }
        };

        tracing::warn!(
            "Connection lost: {}. Reconnecting every {:?}",
            reason,
            self.config.reconnect.backoff
        );
        self.set_state(SessionState::Reconnecting);

        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            inner.reconnect_loop().await;
            drop(permit);
            if inner.relink.swap(false, Ordering::SeqCst) {
                inner.notify_disconnected("link dropped while the reconnect was finishing", true);
            }
        });
        self.tasks.lock().reconnect = Some(task);
        true
    }

    async fn reconnect_loop(self: &Arc<Self>) {
        let policy = &self.config.reconnect;
        let mut attempts: u32 = 0;
        loop {
            tokio::time::sleep(policy.backoff).await;
            if self.is_closed() {
                return;
            }
            if self.state.borrow().is_connected() && self.client.is_connected() {
                tracing::debug!("Link restored before reconnect attempt {}", attempts + 1);
                return;
            }

            attempts += 1;
            tracing::info!("Reconnect attempt {}", attempts);
            self.relink.store(false, Ordering::SeqCst);
            match self.connect_once(SessionState::Reconnecting).await {
                Ok(()) => {
                    // The new link may already be gone; its pump could not
                    // start another reconnect while this one held the guard.
                    if !self.relink.swap(false, Ordering::SeqCst) && self.client.is_connected() {
                        tracing::info!("Reconnected after {} attempt(s)", attempts);
                        return;
                    }
                    if self.is_closed() {
                        return;
                    }
                    tracing::warn!("Connection dropped again right after reconnect attempt {}", attempts);
                    self.set_state(SessionState::Reconnecting);
                }
                Err(TransportError::Closed) => return,
                Err(e) => tracing::warn!("Reconnect attempt {} failed: {}", attempts, e),
            }

            if policy.max_attempts.is_some_and(|max| attempts >= max) {
                tracing::error!(
                    "Abandoning reconnection to {}:{} after {} attempts",
                    self.config.host,
                    self.config.port,
                    attempts
                );
                self.set_state(SessionState::Disconnected);
                return;
            }
        }
    }

    async fn dispatch(&self, message: InboundMessage) {
        let handlers: Vec<Arc<dyn MessageHandler>> = self
            .handlers
            .lock()
            .iter()
            .filter(|(filter, _)| topic_matches(filter, &message.topic))
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        if handlers.is_empty() {
            tracing::debug!("No handler for message on {}", message.topic);
            return;
        }
        for handler in handlers {
            if let Err(e) = handler.handle(message.clone()).await {
                tracing::error!("Handler for {} failed: {:#}", message.topic, e);
            }
        }
    }
}

/// Forward one connection's events until it ends.
async fn pump_events<B: BusClient>(inner: Weak<Inner<B>>, mut events: EventStream, generation: u64) {
    let reason = loop {
        let Some(event) = events.recv().await else {
            break "event stream ended".to_string();
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match event {
            BusEvent::Message(message) => inner.dispatch(message).await,
            BusEvent::Disconnected { reason } => break reason,
        }
    };

    if let Some(inner) = inner.upgrade() {
        if inner.generation.load(Ordering::SeqCst) == generation {
            inner.notify_disconnected(&reason, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryBroker, MemoryBusClient};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    fn config() -> SessionConfig {
        SessionConfig {
            client_id_prefix: "test".into(),
            reconnect: ReconnectPolicy {
                backoff: Duration::from_millis(20),
                max_attempts: None,
                connect_timeout: Duration::from_millis(500),
            },
            ..SessionConfig::default()
        }
    }

    async fn wait_for_state(session: &TransportSession<impl BusClient>, state: SessionState) {
        let mut changes = session.state_changes();
        tokio::time::timeout(Duration::from_secs(5), changes.wait_for(|s| *s == state))
            .await
            .expect("timed out waiting for state")
            .unwrap();
    }

    struct Collect(mpsc::UnboundedSender<InboundMessage>);

    #[async_trait]
    impl MessageHandler for Collect {
        async fn handle(&self, message: InboundMessage) -> anyhow::Result<()> {
            self.0.send(message)?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_connect_uses_fresh_client_ids() {
        let broker = MemoryBroker::new();
        let session = TransportSession::new(broker.client(), config());
        assert_eq!(session.state(), SessionState::Disconnected);

        session.connect().await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        let first = broker.client_ids();
        assert!(first[0].starts_with("test-"));

        session.connect().await.unwrap();
        let second = broker.client_ids();
        assert_eq!(second.len(), 1);
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_connect_failure_returns_to_disconnected() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let session = TransportSession::new(broker.client(), config());

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.is_reconnecting());
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let broker = MemoryBroker::new();
        broker.set_connect_delay(Duration::from_secs(2));
        let mut cfg = config();
        cfg.reconnect.connect_timeout = Duration::from_millis(50);
        let session = TransportSession::new(broker.client(), cfg);

        let err = session.connect().await.unwrap_err();
        assert_eq!(err, TransportError::ConnectTimeout(Duration::from_millis(50)));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_dedup_publishes_identical_payload_once() {
        let broker = MemoryBroker::new();
        let session = TransportSession::new(broker.client(), config());
        session.connect().await.unwrap();

        let payload = Bytes::from_static(b"{\"Inserts\":[]}");
        assert_eq!(
            session.publish_with_dedup("db/sync", MessageKind::Delta, payload.clone()).await,
            Ok(PublishOutcome::Published)
        );
        assert_eq!(
            session.publish_with_dedup("db/sync", MessageKind::Delta, payload.clone()).await,
            Ok(PublishOutcome::Duplicate)
        );
        assert_eq!(
            session.publish_with_dedup("db/other", MessageKind::Delta, payload).await,
            Ok(PublishOutcome::Published)
        );
        assert_eq!(
            session.publish_with_dedup("db/sync", MessageKind::Delta, Bytes::new()).await,
            Ok(PublishOutcome::Empty)
        );
        assert_eq!(broker.publish_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_publish_is_not_recorded() {
        let broker = MemoryBroker::new();
        let session = TransportSession::new(broker.client(), config());
        let payload = Bytes::from_static(b"data");

        assert_eq!(
            session.publish_with_dedup("db/sync", MessageKind::Delta, payload.clone()).await,
            Err(TransportError::NotConnected)
        );
        session.connect().await.unwrap();
        assert_eq!(
            session.publish_with_dedup("db/sync", MessageKind::Delta, payload).await,
            Ok(PublishOutcome::Published)
        );
        assert_eq!(broker.publish_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_disconnects_start_one_reconnect() {
        let broker = MemoryBroker::new();
        broker.set_connect_delay(Duration::from_millis(50));
        let session = TransportSession::new(broker.client(), config());
        session.connect().await.unwrap();
        let connects_before = broker.connect_count();

        let started: Vec<bool> = (0..10)
            .map(|i| session.notify_disconnected(&format!("drop {}", i)))
            .collect();
        assert_eq!(started.iter().filter(|s| **s).count(), 1);
        assert!(session.is_reconnecting());

        wait_for_state(&session, SessionState::Connected).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(broker.connect_count(), connects_before + 1);
        assert_eq!(broker.max_concurrent_connects(), 1);
        assert!(!session.is_reconnecting());
    }

    #[tokio::test]
    async fn test_reconnects_and_resubscribes_after_drop() {
        let broker = MemoryBroker::new();
        let session = TransportSession::new(broker.client(), config());
        let (tx, mut rx) = mpsc::unbounded_channel();
        session
            .subscribe_with_dispatch("db/#", Arc::new(Collect(tx)))
            .await
            .unwrap();
        session.connect().await.unwrap();

        broker.set_available(false);
        broker.drop_connections("link down");
        wait_for_state(&session, SessionState::Reconnecting).await;

        // Fails while the broker is away, then recovers.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(session.state(), SessionState::Reconnecting);
        broker.set_available(true);
        wait_for_state(&session, SessionState::Connected).await;

        broker.inject("db/sync", Bytes::from_static(b"after"));
        let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.payload, Bytes::from_static(b"after"));
    }

    #[tokio::test]
    async fn test_reconnect_gives_up_after_max_attempts() {
        let broker = MemoryBroker::new();
        let mut cfg = config();
        cfg.reconnect.max_attempts = Some(2);
        let session = TransportSession::new(broker.client(), cfg);
        session.connect().await.unwrap();

        broker.set_available(false);
        broker.drop_connections("gone");
        wait_for_state(&session, SessionState::Reconnecting).await;
        wait_for_state(&session, SessionState::Disconnected).await;

        // The guard is released once the task ends.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!session.is_reconnecting());
        assert_eq!(broker.connect_count(), 3);
    }

    #[tokio::test]
    async fn test_close_cancels_reconnect() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let session = TransportSession::new(broker.client(), config());
        assert!(session.notify_disconnected("initial"));
        assert!(session.is_reconnecting());

        tokio::time::timeout(Duration::from_secs(1), session.close())
            .await
            .expect("close must not hang");
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.is_reconnecting());
        assert!(!session.notify_disconnected("after close"));
        assert_eq!(
            session.publish_with_dedup("db/sync", MessageKind::Delta, Bytes::from_static(b"x")).await,
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn test_dedup_is_tracked_per_payload_kind() {
        let broker = MemoryBroker::new();
        let session = TransportSession::new(broker.client(), config());
        session.connect().await.unwrap();

        let payload = Bytes::from_static(b"same bytes");
        assert_eq!(
            session.publish_with_dedup("db/sync", MessageKind::Delta, payload.clone()).await,
            Ok(PublishOutcome::Published)
        );
        assert_eq!(
            session.publish_with_dedup("db/sync", MessageKind::File, payload.clone()).await,
            Ok(PublishOutcome::Published)
        );
        assert_eq!(
            session.publish_with_dedup("db/sync", MessageKind::Delta, payload).await,
            Ok(PublishOutcome::Duplicate)
        );
        assert_eq!(broker.publish_count(), 2);
    }

    /// Loses its link while re-subscribing after the `drop_on`-th connect.
    struct DropsWhileSubscribing {
        inner: MemoryBusClient,
        broker: MemoryBroker,
        connects: AtomicUsize,
        drop_on: usize,
    }

    #[async_trait]
    impl BusClient for DropsWhileSubscribing {
        async fn connect(&self, options: &ConnectOptions) -> Result<EventStream, TransportError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.inner.connect(options).await
        }

        async fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), TransportError> {
            self.inner.publish(topic, payload, qos).await
        }

        async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
            if self.connects.load(Ordering::SeqCst) == self.drop_on {
                self.broker.drop_connections("dropped while subscribing");
                return Err(TransportError::NotConnected);
            }
            self.inner.subscribe(topic, qos).await
        }

        async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
            self.inner.unsubscribe(topic).await
        }

        async fn disconnect(&self) -> Result<(), TransportError> {
            self.inner.disconnect().await
        }

        fn is_connected(&self) -> bool {
            self.inner.is_connected()
        }
    }

    #[tokio::test]
    async fn test_drop_during_reconnect_starts_another_attempt() {
        let broker = MemoryBroker::new();
        let client = DropsWhileSubscribing {
            inner: broker.client(),
            broker: broker.clone(),
            connects: AtomicUsize::new(0),
            drop_on: 2,
        };
        let session = TransportSession::new(client, config());
        let (tx, _rx) = mpsc::unbounded_channel();
        session
            .subscribe_with_dispatch("db/#", Arc::new(Collect(tx)))
            .await
            .unwrap();
        session.connect().await.unwrap();

        assert!(session.notify_disconnected("first drop"));
        tokio::time::timeout(Duration::from_secs(5), async {
            while !(broker.connect_count() >= 3
                && session.state() == SessionState::Connected
                && !session.is_reconnecting())
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session never recovered");

        assert_eq!(broker.connect_count(), 3);
        assert_eq!(
            session
                .publish_with_dedup("db/sync", MessageKind::Delta, Bytes::from_static(b"after"))
                .await,
            Ok(PublishOutcome::Published)
        );
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_filter_and_survives_handler_errors() {
        struct Failing;

        #[async_trait]
        impl MessageHandler for Failing {
            async fn handle(&self, _message: InboundMessage) -> anyhow::Result<()> {
                anyhow::bail!("boom")
            }
        }

        let broker = MemoryBroker::new();
        let session = TransportSession::new(broker.client(), config());
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.connect().await.unwrap();
        session
            .subscribe_with_dispatch("rooms/+", Arc::new(Failing))
            .await
            .unwrap();
        session
            .subscribe_with_dispatch("db/sync", Arc::new(Collect(tx)))
            .await
            .unwrap();

        broker.inject("rooms/kitchen", Bytes::from_static(b"ignored"));
        broker.inject("db/sync", Bytes::from_static(b"one"));
        broker.inject("db/sync", Bytes::from_static(b"two"));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.payload, Bytes::from_static(b"one"));
        assert_eq!(second.payload, Bytes::from_static(b"two"));
        assert_eq!(session.state(), SessionState::Connected);
    }
}
