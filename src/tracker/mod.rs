// ABOUTME: Watermark-based change tracker that turns changed rows into deltas
// ABOUTME: Owns the watermark and advances it only after a successful read

pub mod state;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::delta::{Delta, RowSnapshot};
use crate::store::{StoreReader, TableSpec};
pub use state::WatermarkState;

/// How the watermark moves after a successful read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatermarkStrategy {
    /// The instant the change query was started. Rows committed while the
    /// query ran are picked up by the next cycle.
    #[default]
    QueryStart,
    /// The largest created/updated timestamp seen in the result.
    MaxObserved,
    /// The wall clock after the read completed.
    WallClock,
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub table: TableSpec,
    /// Initial watermark is "now minus this".
    pub startup_skew: Duration,
    pub strategy: WatermarkStrategy,
    /// Subtracted from every new watermark to tolerate clock skew between
    /// the host and the database. Rows in the overlap are re-sent; applying
    /// them again is harmless.
    pub lookback: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            table: TableSpec::default(),
            startup_skew: Duration::from_secs(60),
            strategy: WatermarkStrategy::default(),
            lookback: Duration::ZERO,
        }
    }
}

struct StateFile {
    path: PathBuf,
    state: WatermarkState,
}

/// Captures row-level inserts and updates since the watermark.
///
/// `generate_delta` takes `&mut self`, so at most one read per tracker is in
/// flight.
pub struct ChangeTracker<R> {
    reader: R,
    config: TrackerConfig,
    watermark: DateTime<Utc>,
    state_file: Option<StateFile>,
}

/// A delta together with the watermark that applies once it is accepted.
struct Capture {
    delta: Delta,
    next_watermark: DateTime<Utc>,
}

/// `ts - duration`, saturating at the earliest representable instant.
fn saturating_sub(ts: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| ts.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl<R: StoreReader> ChangeTracker<R> {
    pub fn new(reader: R, config: TrackerConfig) -> Self {
        let watermark = saturating_sub(Utc::now(), config.startup_skew);
        Self::with_watermark(reader, config, watermark)
    }

    /// Start from an explicit watermark instead of "now minus skew".
    pub fn with_watermark(reader: R, config: TrackerConfig, watermark: DateTime<Utc>) -> Self {
        tracing::info!(
            "Tracking changes to {} since {}",
            config.table.display_name(),
            watermark
        );
        Self {
            reader,
            config,
            watermark,
            state_file: None,
        }
    }

    /// Persist the watermark to `path` after every advance.
    ///
    /// If the file already holds a watermark for this table it replaces the
    /// startup watermark.
    pub async fn with_state_file(mut self, path: impl Into<PathBuf>, store_url: &str) -> Result<Self> {
        let path = path.into();
        let table = self.config.table.display_name();
        let state = match WatermarkState::load_if_exists(&path).await? {
            Some(saved) if saved.table == table => {
                tracing::info!(
                    "Resuming {} from saved watermark {} ({:?})",
                    table,
                    saved.watermark,
                    path
                );
                self.watermark = saved.watermark;
                saved
            }
            Some(saved) => {
                tracing::warn!(
                    "Ignoring watermark state for {} in {:?}; now tracking {}",
                    saved.table,
                    path,
                    table
                );
                WatermarkState::new(store_url, &table, self.watermark)
            }
            None => WatermarkState::new(store_url, &table, self.watermark),
        };
        self.state_file = Some(StateFile { path, state });
        Ok(self)
    }

    pub fn watermark(&self) -> DateTime<Utc> {
        self.watermark
    }

    pub fn table(&self) -> &TableSpec {
        &self.config.table
    }

    /// Read rows changed since the watermark and advance it.
    ///
    /// On a read failure the watermark stays where it was.
    pub async fn generate_delta(&mut self) -> Result<Delta> {
        let capture = self.capture().await?;
        self.advance(capture.next_watermark, capture.delta.len() as u64)
            .await;
        Ok(capture.delta)
    }

    /// Generate a delta and write it to `path` in the interchange format.
    ///
    /// The watermark only advances once the file is written.
    pub async fn save_delta_to_file(&mut self, path: &Path) -> Result<Delta> {
        let capture = self.capture().await?;
        capture.delta.write_to_file(path).await?;
        self.advance(capture.next_watermark, capture.delta.len() as u64)
            .await;
        tracing::info!(
            "Wrote {} inserts and {} updates to {}",
            capture.delta.inserts.len(),
            capture.delta.updates.len(),
            path.display()
        );
        Ok(capture.delta)
    }

    async fn capture(&self) -> Result<Capture> {
        let table = &self.config.table;
        let query_start = Utc::now();
        let changed = self
            .reader
            .query_changed_since(table, self.watermark)
            .await
            .with_context(|| format!("Failed to query changes in {}", table.display_name()))?;

        let mut seen: HashSet<i64> = HashSet::new();
        let mut max_observed: Option<DateTime<Utc>> = None;
        let mut delta = Delta::default();

        for (rows, is_insert) in [(changed.inserted, true), (changed.updated, false)] {
            for row in rows {
                let Some(id) = row.id(&table.id_column) else {
                    tracing::warn!(
                        "Skipping changed row in {} without an integer {}",
                        table.display_name(),
                        table.id_column
                    );
                    continue;
                };
                if !seen.insert(id) {
                    continue;
                }
                if let Some(ts) = self.latest_change(&row) {
                    max_observed = Some(max_observed.map_or(ts, |m| m.max(ts)));
                }
                if is_insert {
                    delta.inserts.push(row);
                } else {
                    delta.updates.push(row);
                }
            }
        }

        Ok(Capture {
            next_watermark: self.next_watermark(query_start, max_observed),
            delta,
        })
    }

    fn latest_change(&self, row: &RowSnapshot) -> Option<DateTime<Utc>> {
        let table = &self.config.table;
        let created = row
            .get(&table.created_at_column)
            .and_then(|v| v.as_timestamp());
        let updated = row
            .get(&table.updated_at_column)
            .and_then(|v| v.as_timestamp());
        created.max(updated)
    }

    fn next_watermark(
        &self,
        query_start: DateTime<Utc>,
        max_observed: Option<DateTime<Utc>>,
    ) -> DateTime<Utc> {
        let candidate = match self.config.strategy {
            WatermarkStrategy::QueryStart => query_start,
            WatermarkStrategy::MaxObserved => max_observed.unwrap_or(self.watermark),
            WatermarkStrategy::WallClock => Utc::now(),
        };
        let candidate = saturating_sub(candidate, self.config.lookback);
        candidate.max(self.watermark)
    }

    async fn advance(&mut self, next: DateTime<Utc>, row_count: u64) {
        self.watermark = self.watermark.max(next);
        if let Some(file) = self.state_file.as_mut() {
            file.state.update(self.watermark, row_count);
            if let Err(e) = file.state.save(&file.path).await {
                tracing::warn!("Failed to persist watermark: {:#}", e);
            }
        }
    }
}
