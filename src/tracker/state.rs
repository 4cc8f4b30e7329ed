// ABOUTME: Persisted change-tracker watermark for restarts
// ABOUTME: Stored as a small JSON document next to the process

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

use crate::utils::sanitize_url;

/// Watermark of one tracked table, as saved between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatermarkState {
    /// Store URL with the password masked, for operator orientation only
    pub store_url: String,
    /// Qualified table name ("schema.table")
    pub table: String,
    /// Rows changed strictly after this instant are still to be published
    pub watermark: DateTime<Utc>,
    /// Rows captured by the cycle that produced this watermark
    pub last_row_count: u64,
    /// Version of the state format
    pub version: u32,
    pub updated_at: DateTime<Utc>,
}

impl WatermarkState {
    pub fn new(store_url: &str, table: &str, watermark: DateTime<Utc>) -> Self {
        Self {
            store_url: sanitize_url(store_url),
            table: table.to_string(),
            watermark,
            last_row_count: 0,
            version: 1,
            updated_at: Utc::now(),
        }
    }

    pub fn update(&mut self, watermark: DateTime<Utc>, row_count: u64) {
        self.watermark = watermark;
        self.last_row_count = row_count;
        self.updated_at = Utc::now();
    }

    /// Load state from a JSON file, or `None` if the file does not exist yet.
    pub async fn load_if_exists(path: &Path) -> Result<Option<Self>> {
        let contents = match fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read watermark state from {:?}", path))
            }
        };
        let state: WatermarkState = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse watermark state from {:?}", path))?;
        Ok(Some(state))
    }

    /// Save state to a JSON file, creating the parent directory.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }

        let contents =
            serde_json::to_string_pretty(self).context("Failed to serialize watermark state")?;
        fs::write(path, contents)
            .await
            .with_context(|| format!("Failed to write watermark state to {:?}", path))?;
        Ok(())
    }
}
