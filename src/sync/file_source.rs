// ABOUTME: Watches a single file's modification time for the publisher's file path
// ABOUTME: Re-reads the file on change, retrying while it is transiently unreadable

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use bytes::Bytes;

use crate::utils::retry_with_delay;

const READ_RETRIES: u32 = 4;
const READ_RETRY_DELAY: Duration = Duration::from_millis(200);

pub struct WatchedFile {
    path: PathBuf,
    last_modified: Option<SystemTime>,
}

impl WatchedFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_modified: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Forget the last seen modification time so the next poll reports the file.
    pub fn reset(&mut self) {
        self.last_modified = None;
    }

    /// The file's contents if it changed since the last successful poll.
    ///
    /// A missing file is not an error; it is reported once it appears.
    pub async fn poll_changed(&mut self) -> Result<Option<Bytes>> {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("Watched file {} does not exist yet", self.path.display());
                return Ok(None);
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to stat {}", self.path.display()));
            }
        };
        let modified = metadata
            .modified()
            .with_context(|| format!("No modification time for {}", self.path.display()))?;
        if self.last_modified == Some(modified) {
            return Ok(None);
        }

        let path = &self.path;
        let contents = retry_with_delay(
            move || async move {
                tokio::fs::read(path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))
            },
            READ_RETRIES,
            READ_RETRY_DELAY,
        )
        .await?;

        self.last_modified = Some(modified);
        tracing::debug!(
            "Watched file {} changed ({} bytes)",
            self.path.display(),
            contents.len()
        );
        Ok(Some(Bytes::from(contents)))
    }
}
