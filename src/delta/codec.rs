// ABOUTME: Delta value (inserts, updates, deletes) and its JSON interchange encoding
// ABOUTME: Also merges deltas that could not be published into the next cycle

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::row::RowSnapshot;

/// A batch of row-level changes for one table.
///
/// Any list may be omitted on input; output always carries all three.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Delta {
    #[serde(rename = "Inserts", default)]
    pub inserts: Vec<RowSnapshot>,
    #[serde(rename = "Updates", default)]
    pub updates: Vec<RowSnapshot>,
    #[serde(rename = "Deletes", default)]
    pub deletes: Vec<i64>,
}

/// Top-level keys of the interchange format.
pub const DELTA_KEYS: [&str; 3] = ["Inserts", "Updates", "Deletes"];

impl Delta {
    /// True for the canonical "no change" value, which is never published.
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletes.len()
    }

    /// Encode as compact JSON.
    ///
    /// The format carries no type tags, so two values do not survive a round
    /// trip unchanged: text spelled exactly like a canonical timestamp decodes
    /// as [`ColumnValue::Timestamp`](super::ColumnValue::Timestamp), and
    /// non-finite floats are written as `null`. Target columns coerce a
    /// timestamp back to the same text, so only the NaN/infinity case loses data.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Encode as indented JSON, used for delta files.
    pub fn encode_pretty(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Read a delta file written by [`Delta::write_to_file`].
    pub async fn read_from_file(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read delta file {}", path.display()))?;
        Self::decode(&bytes)
            .with_context(|| format!("Failed to parse delta file {}", path.display()))
    }

    /// Write the delta in the interchange format, replacing any existing file.
    pub async fn write_to_file(&self, path: &Path) -> Result<()> {
        let bytes = self.encode_pretty().context("Failed to serialize delta")?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.with_context(|| {
                    format!("Failed to create directory {}", parent.display())
                })?;
            }
        }
        tokio::fs::write(path, bytes)
            .await
            .with_context(|| format!("Failed to write delta file {}", path.display()))
    }

    /// Fold a newer delta into this one.
    ///
    /// The newer snapshot of a row replaces the older one. A row that was an
    /// insert stays an insert. Deletes and upserts of the same id cancel in
    /// favour of whichever came later. Rows without a usable id are carried
    /// through unchanged so the applier can report them.
    pub fn merge(self, newer: Delta, id_column: &str) -> Delta {
        #[derive(Clone, Copy, PartialEq)]
        enum Kind {
            Insert,
            Update,
        }

        let newer_deletes: Vec<i64> = newer.deletes.clone();

        let mut order: Vec<i64> = Vec::new();
        let mut latest: HashMap<i64, (Kind, RowSnapshot)> = HashMap::new();
        let mut keyless: Vec<(Kind, RowSnapshot)> = Vec::new();
        let mut deletes: Vec<i64> = Vec::new();

        let mut fold = |kind: Kind, row: RowSnapshot, deletes: &mut Vec<i64>| match row.id(id_column)
        {
            Some(id) => {
                deletes.retain(|d| *d != id);
                match latest.get_mut(&id) {
                    Some(entry) => {
                        let kind = if entry.0 == Kind::Insert { Kind::Insert } else { kind };
                        *entry = (kind, row);
                    }
                    None => {
                        order.push(id);
                        latest.insert(id, (kind, row));
                    }
                }
            }
            None => keyless.push((kind, row)),
        };

        for id in self.deletes {
            if !deletes.contains(&id) {
                deletes.push(id);
            }
        }
        for row in self.inserts {
            fold(Kind::Insert, row, &mut deletes);
        }
        for row in self.updates {
            fold(Kind::Update, row, &mut deletes);
        }
        for row in newer.inserts {
            fold(Kind::Insert, row, &mut deletes);
        }
        for row in newer.updates {
            fold(Kind::Update, row, &mut deletes);
        }
        for id in newer_deletes {
            if !deletes.contains(&id) {
                deletes.push(id);
            }
        }

        let mut merged = Delta {
            deletes,
            ..Delta::default()
        };
        for id in order {
            if merged.deletes.contains(&id) {
                continue;
            }
            if let Some((kind, row)) = latest.remove(&id) {
                match kind {
                    Kind::Insert => merged.inserts.push(row),
                    Kind::Update => merged.updates.push(row),
                }
            }
        }
        for (kind, row) in keyless {
            match kind {
                Kind::Insert => merged.inserts.push(row),
                Kind::Update => merged.updates.push(row),
            }
        }
        merged
    }
}
