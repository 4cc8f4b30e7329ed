// ABOUTME: Publisher and subscriber loops that tie the tracker, applier and session together
// ABOUTME: Publisher polls on a fixed interval; subscriber dispatches until shutdown

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};

use super::file_source::WatchedFile;
use crate::delta::{Delta, Framing, MessageKind};
use crate::store::StoreReader;
use crate::tracker::ChangeTracker;
use crate::error::TransportError;
use crate::transport::{BusClient, MessageHandler, PublishOutcome, TransportSession};

/// Configuration for the publisher loop.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub topic: String,
    /// Interval between sync cycles
    pub poll_interval: Duration,
    pub framing: Framing,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            topic: "db/sync".to_string(),
            poll_interval: Duration::from_secs(12),
            framing: Framing::Envelope,
        }
    }
}

/// Statistics from one publisher cycle.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub inserts: usize,
    pub updates: usize,
    pub delta: Option<PublishOutcome>,
    pub file: Option<PublishOutcome>,
    /// A delta that could not be published and is carried into the next cycle.
    pub pending: bool,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl SyncStats {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Connect, or start the reconnect loop if the broker is not reachable yet.
pub async fn start_session<B: BusClient>(session: &TransportSession<B>) {
    if let Err(e) = session.connect().await {
        tracing::warn!("Initial connection failed: {}", e);
        session.notify_disconnected(&e.to_string());
    }
}

/// Periodically turns tracked changes into published deltas.
pub struct PublisherLoop<R, B: BusClient> {
    tracker: ChangeTracker<R>,
    session: TransportSession<B>,
    config: PublisherConfig,
    watched: Option<WatchedFile>,
    /// Changes already past the watermark that have not reached the bus.
    pending: Option<Delta>,
}

impl<R: StoreReader, B: BusClient> PublisherLoop<R, B> {
    pub fn new(tracker: ChangeTracker<R>, session: TransportSession<B>, config: PublisherConfig) -> Self {
        Self {
            tracker,
            session,
            config,
            watched: None,
            pending: None,
        }
    }

    /// Also publish `file` whenever its modification time changes.
    pub fn with_watched_file(mut self, file: WatchedFile) -> Self {
        self.watched = Some(file);
        self
    }

    pub fn tracker(&self) -> &ChangeTracker<R> {
        &self.tracker
    }

    pub fn pending(&self) -> Option<&Delta> {
        self.pending.as_ref()
    }

    /// Run one cycle: capture changes, publish them, then check the watched file.
    ///
    /// Fails only when the change query fails; publish failures are recorded
    /// in the stats and the delta is retried next cycle.
    pub async fn run_cycle(&mut self) -> Result<SyncStats> {
        let start = Instant::now();
        let mut stats = SyncStats::default();

        let fresh = self.tracker.generate_delta().await?;
        let delta = match self.pending.take() {
            Some(pending) => pending.merge(fresh, &self.tracker.table().id_column),
            None => fresh,
        };
        stats.inserts = delta.inserts.len();
        stats.updates = delta.updates.len();

        if delta.is_empty() {
            tracing::debug!("No changes in {}", self.tracker.table().display_name());
        } else {
            match self.publish_delta(&delta).await {
                Ok(outcome) => stats.delta = Some(outcome),
                Err(e) => {
                    tracing::warn!(
                        "Failed to publish delta ({} rows), keeping it for the next cycle: {:#}",
                        delta.len(),
                        e
                    );
                    if let Some(transport) = e.downcast_ref::<TransportError>() {
                        Self::notify_link_failure(&self.session, transport);
                    }
                    stats.errors.push(format!("delta: {:#}", e));
                    stats.pending = true;
                    self.pending = Some(delta);
                }
            }
        }

        if let Some(watched) = self.watched.as_mut() {
            match watched.poll_changed().await {
                Ok(Some(contents)) => {
                    let payload = self.config.framing.wrap(MessageKind::File, &contents);
                    match self
                        .session
                        .publish_with_dedup(&self.config.topic, MessageKind::File, payload)
                        .await
                    {
                        Ok(outcome) => stats.file = Some(outcome),
                        Err(e) => {
                            tracing::warn!(
                                "Failed to publish {}: {}",
                                watched.path().display(),
                                e
                            );
                            watched.reset();
                            Self::notify_link_failure(&self.session, &e);
                            stats.errors.push(format!("file: {}", e));
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("{:#}", e);
                    stats.errors.push(format!("file: {:#}", e));
                }
            }
        }

        stats.duration_ms = start.elapsed().as_millis() as u64;
        Ok(stats)
    }

    /// Hand a failed publish to the reconnect loop; a state that claims a
    /// link the client no longer has is only healed this way.
    fn notify_link_failure(session: &TransportSession<B>, error: &TransportError) {
        if matches!(error, TransportError::Closed) {
            return;
        }
        session.notify_disconnected(&format!("publish failed: {}", error));
    }

    async fn publish_delta(&self, delta: &Delta) -> Result<PublishOutcome> {
        let body = delta.encode().context("Failed to encode delta")?;
        let payload = self.config.framing.wrap(MessageKind::Delta, &body);
        let outcome = self
            .session
            .publish_with_dedup(&self.config.topic, MessageKind::Delta, payload)
            .await?;
        if outcome == PublishOutcome::Published {
            tracing::info!(
                "Published delta with {} inserts and {} updates to {}",
                delta.inserts.len(),
                delta.updates.len(),
                self.config.topic
            );
        }
        Ok(outcome)
    }

    /// Connect and run cycles until a shutdown signal arrives, then close the session.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        tracing::info!(
            "Starting publisher on {} with poll_interval={:?}",
            self.config.topic,
            self.config.poll_interval
        );
        start_session(&self.session).await;

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycles = 0u64;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping publisher");
                    break;
                }
                _ = ticker.tick() => {
                    cycles += 1;
                    match self.run_cycle().await {
                        Ok(stats) => {
                            if stats.inserts + stats.updates > 0 || !stats.is_success() {
                                tracing::info!(
                                    "Sync cycle {} completed: {} inserts, {} updates in {}ms",
                                    cycles,
                                    stats.inserts,
                                    stats.updates,
                                    stats.duration_ms
                                );
                            }
                            if !stats.errors.is_empty() {
                                tracing::warn!("Sync cycle had {} errors", stats.errors.len());
                            }
                        }
                        Err(e) => {
                            tracing::error!("Sync cycle {} failed: {:#}", cycles, e);
                        }
                    }
                }
            }
        }

        self.session.close().await;
        Ok(())
    }
}

/// Subscribe `handler` to `topic` and keep the session alive until shutdown.
pub async fn run_subscriber<B: BusClient>(
    session: TransportSession<B>,
    topic: &str,
    handler: Arc<dyn MessageHandler>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    tracing::info!("Starting subscriber on {}", topic);
    session
        .subscribe_with_dispatch(topic, handler)
        .await
        .with_context(|| format!("Failed to register handler for {}", topic))?;
    start_session(&session).await;

    // A closed channel also means shutdown.
    let _ = shutdown.recv().await;
    tracing::info!("Shutdown signal received, stopping subscriber");
    session.close().await;
    Ok(())
}
