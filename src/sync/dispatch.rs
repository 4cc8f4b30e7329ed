// ABOUTME: Classifies inbound bus payloads and routes deltas to the applier, files to a sink
// ABOUTME: Uses the envelope kind tag, falling back to a JSON-shape heuristic for raw peers

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;

use crate::applier::{ApplyReport, DeltaApplier};
use crate::delta::{unframe, Delta, MessageKind, DELTA_KEYS};
use crate::error::DispatchError;
use crate::store::StoreWriter;
use crate::transport::{InboundMessage, MessageHandler};

/// Where an inbound payload should go.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Delta(Delta),
    File(Bytes),
    /// A JSON object that does not decode as a delta.
    Ambiguous(Bytes),
}

/// Classify a payload, enveloped or not.
pub fn classify(payload: &Bytes) -> Result<Classification, DispatchError> {
    match unframe(payload) {
        Some((MessageKind::Delta, body)) => Ok(Classification::Delta(Delta::decode(body)?)),
        Some((MessageKind::File, body)) => Ok(Classification::File(payload.slice_ref(body))),
        None => Ok(classify_unframed(payload)),
    }
}

fn classify_unframed(payload: &Bytes) -> Classification {
    let Ok(serde_json::Value::Object(object)) = serde_json::from_slice::<serde_json::Value>(payload)
    else {
        return Classification::File(payload.clone());
    };

    let looks_like_delta =
        !object.is_empty() && object.keys().all(|key| DELTA_KEYS.contains(&key.as_str()));
    if !looks_like_delta {
        return Classification::Ambiguous(payload.clone());
    }
    match Delta::decode(payload) {
        Ok(delta) => Classification::Delta(delta),
        Err(_) => Classification::Ambiguous(payload.clone()),
    }
}

/// Pick a file extension from the payload's leading bytes.
pub fn infer_extension(data: &[u8]) -> &'static str {
    if data.len() < 4 {
        return ".bin";
    }
    if data.starts_with(&[0xFF, 0xD8]) {
        return ".jpg";
    }
    if data.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
        return ".png";
    }
    if data.starts_with(b"GIF") {
        return ".gif";
    }

    let printable = data
        .iter()
        .all(|b| (32..=126).contains(b) || matches!(b, b'\t' | b'\r' | b'\n'));
    if !printable {
        return ".bin";
    }
    // Printable ASCII is valid UTF-8.
    let text = String::from_utf8_lossy(data);
    let trimmed = text.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        ".json"
    } else {
        ".txt"
    }
}

/// Destination for payloads that are not deltas.
#[async_trait]
pub trait FileSink: Send + Sync {
    async fn save(&self, data: &[u8], extension: &str) -> Result<PathBuf>;
}

/// Writes each received file to `<dir>/received_file<ext>`, replacing the
/// previous one with the same extension.
pub struct DirectoryFileSink {
    dir: PathBuf,
}

impl DirectoryFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl FileSink for DirectoryFileSink {
    async fn save(&self, data: &[u8], extension: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create directory {}", self.dir.display()))?;
        let path = self.dir.join(format!("received_file{}", extension));
        tokio::fs::write(&path, data)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Applied(ApplyReport),
    Saved(PathBuf),
    /// A file payload arrived but no sink is configured.
    Dropped,
}

/// Subscriber-side message handler.
pub struct Dispatcher<W> {
    applier: DeltaApplier<W>,
    sink: Option<Arc<dyn FileSink>>,
}

impl<W: StoreWriter> Dispatcher<W> {
    pub fn new(applier: DeltaApplier<W>, sink: Option<Arc<dyn FileSink>>) -> Self {
        Self { applier, sink }
    }

    pub async fn dispatch(&self, payload: &Bytes) -> Result<DispatchOutcome, DispatchError> {
        match classify(payload)? {
            Classification::Delta(delta) => self.apply(&delta).await,
            Classification::File(data) => self.save(&data).await,
            Classification::Ambiguous(data) => {
                tracing::warn!(
                    "ClassificationAmbiguous: {}-byte JSON payload is not a valid delta, treating it as a file",
                    data.len()
                );
                self.save(&data).await
            }
        }
    }

    async fn apply(&self, delta: &Delta) -> Result<DispatchOutcome, DispatchError> {
        let report = self.applier.apply(delta).await.map_err(DispatchError::Apply)?;
        Ok(DispatchOutcome::Applied(report))
    }

    async fn save(&self, data: &[u8]) -> Result<DispatchOutcome, DispatchError> {
        let Some(sink) = &self.sink else {
            tracing::warn!(
                "Dropping {}-byte file payload: no save directory configured",
                data.len()
            );
            return Ok(DispatchOutcome::Dropped);
        };
        let path = sink
            .save(data, infer_extension(data))
            .await
            .map_err(DispatchError::Sink)?;
        tracing::info!("Saved {} bytes to {}", data.len(), path.display());
        Ok(DispatchOutcome::Saved(path))
    }
}

#[async_trait]
impl<W: StoreWriter> MessageHandler for Dispatcher<W> {
    async fn handle(&self, message: InboundMessage) -> anyhow::Result<()> {
        self.dispatch(&message.payload)
            .await
            .with_context(|| format!("Failed to handle message on {}", message.topic))?;
        Ok(())
    }
}
