// ABOUTME: SQLite store - change queries and transactional upserts via rusqlite
// ABOUTME: Timestamps are kept as fixed-width ISO-8601 text so text order is time order

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params_from_iter, Connection, OpenFlags};

use super::sql::{build_delete_query, build_update_query, build_upsert_query, INSERTED_FLAG};
use super::{
    ChangedRows, ColumnInfo, ColumnKind, StoreReader, StoreWriter, TableSpec, WriteBatch,
    WriteSummary,
};
use crate::delta::{format_timestamp, parse_timestamp, ColumnValue, RowSnapshot};
use crate::utils::quote_ident;

const DELETE_CHUNK: usize = 500;

/// SQLite-backed store.
///
/// rusqlite is synchronous, so every call runs on the blocking pool with
/// the connection behind a mutex.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (creating if needed) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Failed to open SQLite database {}", path.display()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        tracing::info!("Opened SQLite database {}", path.display());
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run raw SQL, typically schema setup.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn
            .lock()
            .execute_batch(sql)
            .context("Failed to execute SQL batch")
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .context("SQLite worker task failed")?
    }
}

fn fetch_columns(conn: &Connection, table: &TableSpec) -> Result<Vec<ColumnInfo>> {
    let query = format!("PRAGMA table_info({})", quote_ident(&table.name));
    let mut stmt = conn
        .prepare(&query)
        .with_context(|| format!("Failed to inspect table {}", table.name))?;
    let columns = stmt
        .query_map([], |row| {
            let name: String = row.get(1)?;
            let declared: String = row.get::<_, Option<String>>(2)?.unwrap_or_default();
            Ok(ColumnInfo::new(name, ColumnKind::from_sqlite(&declared)))
        })
        .with_context(|| format!("Failed to query columns of {}", table.name))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to collect columns of {}", table.name))?;

    if columns.is_empty() {
        bail!("Table {} does not exist", table.name);
    }
    Ok(columns)
}

fn read_value(value: ValueRef<'_>, column: &ColumnInfo) -> ColumnValue {
    match value {
        ValueRef::Null => ColumnValue::Null,
        ValueRef::Integer(v) => ColumnValue::Int(v),
        ValueRef::Real(v) => ColumnValue::Float(v),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes).into_owned();
            if column.kind.is_timestamp() {
                if let Some(ts) = parse_timestamp(&text) {
                    return ColumnValue::Timestamp(ts);
                }
            }
            ColumnValue::Text(text)
        }
        ValueRef::Blob(_) => {
            tracing::warn!("Skipping BLOB value in column {}", column.name);
            ColumnValue::Null
        }
    }
}

fn to_sql_value(value: &ColumnValue) -> Value {
    match value {
        ColumnValue::Null => Value::Null,
        ColumnValue::Int(v) => Value::Integer(*v),
        ColumnValue::Float(v) => Value::Real(*v),
        ColumnValue::Text(v) => Value::Text(v.clone()),
        ColumnValue::Timestamp(ts) => Value::Text(format_timestamp(ts)),
    }
}

/// `column > ?1` as instants rather than text.
///
/// `julianday` accepts both the canonical `T...Z` form and SQLite's own
/// `YYYY-MM-DD HH:MM:SS`, but only resolves milliseconds; ties fall back to
/// text order, which is exact for canonical values.
fn newer_than(column: &str) -> String {
    format!(
        "(julianday({c}) > julianday(?1) OR (julianday({c}) = julianday(?1) AND {c} > ?1))",
        c = column
    )
}

fn query_changed(conn: &Connection, table: &TableSpec, since: &str) -> Result<ChangedRows> {
    let columns = fetch_columns(conn, table)?;
    let created = newer_than(&quote_ident(&table.created_at_column));
    let updated = newer_than(&quote_ident(&table.updated_at_column));
    let select_list = columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");

    let query = format!(
        "SELECT {}, COALESCE({}, 0) AS {} FROM {} WHERE {} OR {} ORDER BY {}",
        select_list,
        created,
        quote_ident(INSERTED_FLAG),
        quote_ident(&table.name),
        created,
        updated,
        quote_ident(&table.id_column)
    );

    let mut stmt = conn
        .prepare(&query)
        .with_context(|| format!("Failed to prepare change query for {}", table.name))?;
    let mut rows = stmt
        .query([since])
        .with_context(|| format!("Failed to read changes from {}", table.name))?;

    let mut changed = ChangedRows::default();
    while let Some(row) = rows.next().context("Failed to fetch changed row")? {
        let mut snapshot = RowSnapshot::with_capacity(columns.len());
        for (idx, column) in columns.iter().enumerate() {
            let value = row
                .get_ref(idx)
                .with_context(|| format!("Failed to read column {}", column.name))?;
            snapshot.insert(column.name.clone(), read_value(value, column));
        }
        let inserted: i64 = row.get(columns.len()).context("Failed to read insert flag")?;
        if inserted != 0 {
            changed.inserted.push(snapshot);
        } else {
            changed.updated.push(snapshot);
        }
    }
    Ok(changed)
}

fn write(conn: &mut Connection, table: &TableSpec, batch: &WriteBatch) -> Result<WriteSummary> {
    let known: HashMap<String, ColumnKind> = fetch_columns(conn, table)?
        .into_iter()
        .map(|c| (c.name, c.kind))
        .collect();
    let target = quote_ident(&table.name);
    let mut summary = WriteSummary::default();

    let tx = conn.transaction().context("Failed to begin transaction")?;

    for row in &batch.upserts {
        let names: Vec<&str> = row.values.iter().map(|(n, _)| n.as_str()).collect();
        if let Some(missing) = names.iter().find(|n| !known.contains_key(**n)) {
            bail!("Column {} does not exist in {}", missing, table.name);
        }
        let values: Vec<Value> = row.values.iter().map(|(_, v)| to_sql_value(v)).collect();
        let bind = |n: usize, _: usize| format!("?{}", n);

        if let Some(update) = build_update_query(&target, &table.id_column, &names, bind) {
            let updated = tx
                .execute(&update, params_from_iter(values.iter()))
                .with_context(|| format!("Failed to update row {} in {}", row.id, table.name))?;
            if updated > 0 {
                summary.upserted += updated as u64;
                continue;
            }
        }

        let upsert = build_upsert_query(&target, &table.id_column, &names, bind);
        let affected = tx
            .execute(&upsert, params_from_iter(values.iter()))
            .with_context(|| format!("Failed to upsert row {} into {}", row.id, table.name))?;
        summary.upserted += affected as u64;
    }

    for chunk in batch.deletes.chunks(DELETE_CHUNK) {
        let query = build_delete_query(&target, &table.id_column, chunk.len(), |n| format!("?{}", n));
        let affected = tx
            .execute(&query, params_from_iter(chunk.iter()))
            .with_context(|| format!("Failed to delete rows from {}", table.name))?;
        summary.deleted += affected as u64;
    }

    tx.commit()
        .with_context(|| format!("Failed to commit changes to {}", table.name))?;
    Ok(summary)
}

#[async_trait]
impl StoreReader for SqliteStore {
    async fn query_changed_since(
        &self,
        table: &TableSpec,
        since: DateTime<Utc>,
    ) -> Result<ChangedRows> {
        let table = table.clone();
        let since_text = format_timestamp(&since);
        let changed = self
            .with_conn(move |conn| query_changed(conn, &table, &since_text))
            .await?;
        tracing::debug!(
            "Read {} inserted and {} updated rows since {}",
            changed.inserted.len(),
            changed.updated.len(),
            since
        );
        Ok(changed)
    }
}

#[async_trait]
impl StoreWriter for SqliteStore {
    async fn columns(&self, table: &TableSpec) -> Result<Vec<ColumnInfo>> {
        let table = table.clone();
        self.with_conn(move |conn| fetch_columns(conn, &table)).await
    }

    async fn write_batch(&self, table: &TableSpec, batch: WriteBatch) -> Result<WriteSummary> {
        if batch.is_empty() {
            return Ok(WriteSummary::default());
        }
        let table = table.clone();
        self.with_conn(move |conn| write(conn, &table, &batch)).await
    }
}
