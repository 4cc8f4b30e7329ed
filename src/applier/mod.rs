// ABOUTME: Replays a delta against the target table with upsert semantics
// ABOUTME: Coerces values to column types and collects per-row rejections

use std::collections::{HashMap, HashSet};

use anyhow::{bail, Context, Result};

use crate::delta::{format_timestamp, parse_timestamp, ColumnValue, Delta, RowSnapshot};
use crate::error::{ChangeKind, RowError};
use crate::store::{ColumnKind, PreparedRow, StoreWriter, TableSpec, WriteBatch};

/// Outcome of applying one delta.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    /// Rows inserted or updated.
    pub upserted: u64,
    /// Rows removed; ids that were already absent are not counted.
    pub deleted: u64,
    pub rejected: Vec<RowError>,
    /// Incoming columns the target table does not have.
    pub ignored_columns: Vec<String>,
}

impl ApplyReport {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Applies deltas to one table through a [`StoreWriter`].
///
/// Every mutation of one `apply` call is committed in a single transaction.
pub struct DeltaApplier<W> {
    writer: W,
    table: TableSpec,
}

impl<W: StoreWriter> DeltaApplier<W> {
    pub fn new(writer: W, table: TableSpec) -> Self {
        Self { writer, table }
    }

    pub fn table(&self) -> &TableSpec {
        &self.table
    }

    pub async fn apply(&self, delta: &Delta) -> Result<ApplyReport> {
        let mut report = ApplyReport::default();
        if delta.is_empty() {
            tracing::debug!("Empty delta, nothing to apply");
            return Ok(report);
        }

        let columns: HashMap<String, ColumnKind> = self
            .writer
            .columns(&self.table)
            .await
            .with_context(|| format!("Failed to inspect {}", self.table.display_name()))?
            .into_iter()
            .map(|c| (c.name, c.kind))
            .collect();
        if !columns.contains_key(&self.table.id_column) {
            bail!(
                "Table {} has no {} column",
                self.table.display_name(),
                self.table.id_column
            );
        }

        let (winners, deletes) = self.resolve(delta, &mut report.rejected);

        let mut ignored: HashSet<String> = HashSet::new();
        let mut batch = WriteBatch {
            upserts: Vec::with_capacity(winners.len()),
            deletes,
        };
        for (kind, id, row) in winners {
            match self.prepare(id, row, &columns, &mut ignored) {
                Ok(prepared) => batch.upserts.push(prepared),
                Err(reason) => report
                    .rejected
                    .push(RowError::malformed(kind, Some(id), reason)),
            }
        }

        if !ignored.is_empty() {
            let mut names: Vec<String> = ignored.into_iter().collect();
            names.sort();
            tracing::warn!(
                "Ignoring columns not present in {}: {}",
                self.table.display_name(),
                names.join(", ")
            );
            report.ignored_columns = names;
        }

        for rejected in &report.rejected {
            tracing::warn!("Rejected row: {}", rejected);
        }

        let upserts = batch.upserts.len() as u64;
        let summary = self
            .writer
            .write_batch(&self.table, batch)
            .await
            .with_context(|| format!("Failed to apply delta to {}", self.table.display_name()))?;

        report.upserted = upserts;
        report.deleted = summary.deleted;

        tracing::info!(
            "Applied delta to {}: {} upserted, {} deleted, {} rejected",
            self.table.display_name(),
            report.upserted,
            report.deleted,
            report.rejected.len()
        );
        Ok(report)
    }

    /// Pick the winning entry per id with precedence delete > update > insert.
    ///
    /// Returns the rows to upsert, in delta order, and the ids to delete.
    /// Repeats inside a single list keep the last occurrence.
    fn resolve<'a>(
        &self,
        delta: &'a Delta,
        rejected: &mut Vec<RowError>,
    ) -> (Vec<(ChangeKind, i64, &'a RowSnapshot)>, Vec<i64>) {
        let id_column = &self.table.id_column;

        let mut deletes: Vec<i64> = Vec::with_capacity(delta.deletes.len());
        let mut delete_set: HashSet<i64> = HashSet::new();
        for id in &delta.deletes {
            if delete_set.insert(*id) {
                deletes.push(*id);
            }
        }

        let mut keyed = |kind: ChangeKind, rows: &'a [RowSnapshot]| -> Vec<(i64, &'a RowSnapshot)> {
            let mut latest: HashMap<i64, usize> = HashMap::new();
            let mut out: Vec<(i64, &'a RowSnapshot)> = Vec::new();
            for row in rows {
                match row.id(id_column) {
                    Some(id) => match latest.get(&id) {
                        Some(&idx) => out[idx] = (id, row),
                        None => {
                            latest.insert(id, out.len());
                            out.push((id, row));
                        }
                    },
                    None => rejected.push(RowError::malformed(
                        kind,
                        None,
                        format!("missing or non-integer {}", id_column),
                    )),
                }
            }
            out
        };

        let updates = keyed(ChangeKind::Update, &delta.updates);
        let inserts = keyed(ChangeKind::Insert, &delta.inserts);
        let update_ids: HashSet<i64> = updates.iter().map(|(id, _)| *id).collect();

        let mut winners = Vec::with_capacity(inserts.len() + updates.len());
        for (id, row) in inserts {
            if delete_set.contains(&id) {
                rejected.push(RowError::AmbiguousDelta {
                    id,
                    applied: ChangeKind::Delete,
                    rejected: ChangeKind::Insert,
                });
            } else if update_ids.contains(&id) {
                rejected.push(RowError::AmbiguousDelta {
                    id,
                    applied: ChangeKind::Update,
                    rejected: ChangeKind::Insert,
                });
            } else {
                winners.push((ChangeKind::Insert, id, row));
            }
        }
        for (id, row) in updates {
            if delete_set.contains(&id) {
                rejected.push(RowError::AmbiguousDelta {
                    id,
                    applied: ChangeKind::Delete,
                    rejected: ChangeKind::Update,
                });
            } else {
                winners.push((ChangeKind::Update, id, row));
            }
        }

        (winners, deletes)
    }

    /// Keep known columns and coerce each value to its column kind.
    fn prepare(
        &self,
        id: i64,
        row: &RowSnapshot,
        columns: &HashMap<String, ColumnKind>,
        ignored: &mut HashSet<String>,
    ) -> std::result::Result<PreparedRow, String> {
        let mut values = Vec::with_capacity(row.len());
        for (name, value) in row.iter() {
            let Some(kind) = columns.get(name) else {
                ignored.insert(name.to_string());
                continue;
            };
            let coerced = coerce(value, kind).map_err(|e| format!("column {}: {}", name, e))?;
            values.push((name.to_string(), coerced));
        }
        Ok(PreparedRow { id, values })
    }
}

/// Convert a wire value into the representation a column of `kind` stores.
pub fn coerce(value: &ColumnValue, kind: &ColumnKind) -> std::result::Result<ColumnValue, String> {
    if value.is_null() {
        return Ok(ColumnValue::Null);
    }

    let mismatch = || format!("cannot store {} value in a {:?} column", value.type_name(), kind);

    match kind {
        ColumnKind::SmallInt | ColumnKind::Integer | ColumnKind::BigInt => {
            let v = match value {
                ColumnValue::Timestamp(_) => return Err(mismatch()),
                other => other.as_i64().ok_or_else(mismatch)?,
            };
            let (min, max) = match kind {
                ColumnKind::SmallInt => (i64::from(i16::MIN), i64::from(i16::MAX)),
                ColumnKind::Integer => (i64::from(i32::MIN), i64::from(i32::MAX)),
                _ => (i64::MIN, i64::MAX),
            };
            if v < min || v > max {
                return Err(format!("value {} out of range for a {:?} column", v, kind));
            }
            Ok(ColumnValue::Int(v))
        }
        ColumnKind::Real | ColumnKind::Double | ColumnKind::Numeric => match value {
            ColumnValue::Int(v) => Ok(ColumnValue::Float(*v as f64)),
            ColumnValue::Float(v) => Ok(ColumnValue::Float(*v)),
            ColumnValue::Text(s) => s
                .trim()
                .parse::<f64>()
                .map(ColumnValue::Float)
                .map_err(|_| format!("'{}' is not a number", s)),
            _ => Err(mismatch()),
        },
        ColumnKind::Boolean => match value {
            ColumnValue::Int(v) => Ok(ColumnValue::Int(i64::from(*v != 0))),
            ColumnValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "1" => Ok(ColumnValue::Int(1)),
                "false" | "f" | "0" => Ok(ColumnValue::Int(0)),
                _ => Err(format!("'{}' is not a boolean", s)),
            },
            _ => Err(mismatch()),
        },
        ColumnKind::Text | ColumnKind::Other(_) => match value {
            ColumnValue::Text(s) => Ok(ColumnValue::Text(s.clone())),
            ColumnValue::Int(v) => Ok(ColumnValue::Text(v.to_string())),
            ColumnValue::Float(v) => Ok(ColumnValue::Text(v.to_string())),
            ColumnValue::Timestamp(ts) => Ok(ColumnValue::Text(format_timestamp(ts))),
            ColumnValue::Null => Ok(ColumnValue::Null),
        },
        ColumnKind::Timestamp | ColumnKind::TimestampTz => match value {
            ColumnValue::Timestamp(ts) => Ok(ColumnValue::Timestamp(*ts)),
            ColumnValue::Text(s) => parse_timestamp(s)
                .map(ColumnValue::Timestamp)
                .ok_or_else(|| format!("malformed timestamp '{}'", s)),
            _ => Err(mismatch()),
        },
    }
}
