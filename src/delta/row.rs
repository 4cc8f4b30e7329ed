// ABOUTME: Ordered column-name to value mapping for a single table row
// ABOUTME: Serializes as a JSON object preserving the source column order

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::value::ColumnValue;

/// Default name of the reconciliation key column.
pub const DEFAULT_ID_COLUMN: &str = "Id";

/// A row projected into column order, as read from the source table.
///
/// Lookups are linear; rows are narrow and order preservation matters
/// more than lookup speed here.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSnapshot {
    columns: Vec<(String, ColumnValue)>,
}

impl RowSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            columns: Vec::with_capacity(capacity),
        }
    }

    /// Set a column value. An existing column keeps its position.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ColumnValue>) {
        let name = name.into();
        let value = value.into();
        match self.columns.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.columns.push((name, value)),
        }
    }

    /// Builder form of [`RowSnapshot::insert`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ColumnValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ColumnValue> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ColumnValue)> {
        self.columns.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }

    /// The row's integer key, if the id column is present and integral.
    pub fn id(&self, id_column: &str) -> Option<i64> {
        self.get(id_column).and_then(ColumnValue::as_i64)
    }
}

impl FromIterator<(String, ColumnValue)> for RowSnapshot {
    fn from_iter<I: IntoIterator<Item = (String, ColumnValue)>>(iter: I) -> Self {
        let mut row = RowSnapshot::new();
        for (name, value) in iter {
            row.insert(name, value);
        }
        row
    }
}

impl Serialize for RowSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (name, value) in &self.columns {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

struct RowSnapshotVisitor;

impl<'de> Visitor<'de> for RowSnapshotVisitor {
    type Value = RowSnapshot;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a row object mapping column names to scalar values")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<RowSnapshot, A::Error> {
        let mut row = RowSnapshot::with_capacity(access.size_hint().unwrap_or(8));
        while let Some((name, value)) = access.next_entry::<String, ColumnValue>()? {
            row.insert(name, value);
        }
        Ok(row)
    }
}

impl<'de> Deserialize<'de> for RowSnapshot {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(RowSnapshotVisitor)
    }
}
