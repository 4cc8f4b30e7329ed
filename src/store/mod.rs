// ABOUTME: Relational store abstraction used by the change tracker and the applier
// ABOUTME: Table description, column typing, and the reader/writer traits

pub mod postgres;
pub mod sql;
pub mod sqlite;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::delta::{ColumnValue, RowSnapshot, DEFAULT_ID_COLUMN};
use crate::utils::validate_identifier;

pub use self::postgres::PgStore;
pub use self::sqlite::SqliteStore;

/// The replicated table and the names of its bookkeeping columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableSpec {
    /// Ignored by SQLite.
    pub schema: String,
    pub name: String,
    pub id_column: String,
    pub created_at_column: String,
    pub updated_at_column: String,
}

impl Default for TableSpec {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            name: "RoomTemperatures".to_string(),
            id_column: DEFAULT_ID_COLUMN.to_string(),
            created_at_column: "CreatedAt".to_string(),
            updated_at_column: "UpdatedAt".to_string(),
        }
    }
}

impl TableSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// All names are spliced into SQL, so every one must be a plain identifier.
    pub fn validate(&self) -> Result<()> {
        for (what, value) in [
            ("schema", &self.schema),
            ("table", &self.name),
            ("id column", &self.id_column),
            ("created-at column", &self.created_at_column),
            ("updated-at column", &self.updated_at_column),
        ] {
            validate_identifier(value).with_context(|| format!("Invalid {} name", what))?;
        }
        Ok(())
    }

    pub fn display_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// Storage type of a target column, as far as value coercion cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnKind {
    SmallInt,
    Integer,
    BigInt,
    Real,
    Double,
    Numeric,
    Boolean,
    Text,
    Timestamp,
    TimestampTz,
    /// Any other type, carried as text and cast by the database.
    Other(String),
}

impl ColumnKind {
    /// Map an `information_schema.columns` type to a kind.
    pub fn from_postgres(data_type: &str, udt_name: &str) -> Self {
        match data_type {
            "smallint" => ColumnKind::SmallInt,
            "integer" => ColumnKind::Integer,
            "bigint" => ColumnKind::BigInt,
            "real" => ColumnKind::Real,
            "double precision" => ColumnKind::Double,
            "numeric" => ColumnKind::Numeric,
            "boolean" => ColumnKind::Boolean,
            "text" | "character varying" | "character" | "name" => ColumnKind::Text,
            "timestamp without time zone" => ColumnKind::Timestamp,
            "timestamp with time zone" => ColumnKind::TimestampTz,
            _ => ColumnKind::Other(udt_name.to_string()),
        }
    }

    /// Map a SQLite declared type to a kind using its affinity rules,
    /// with date/time names recognised before text.
    pub fn from_sqlite(declared: &str) -> Self {
        let decl = declared.to_ascii_uppercase();
        if decl.contains("INT") {
            ColumnKind::BigInt
        } else if decl.contains("DATE") || decl.contains("TIME") {
            ColumnKind::Timestamp
        } else if decl.contains("CHAR") || decl.contains("CLOB") || decl.contains("TEXT") {
            ColumnKind::Text
        } else if decl.contains("REAL") || decl.contains("FLOA") || decl.contains("DOUB") {
            ColumnKind::Double
        } else if decl.contains("BOOL") {
            ColumnKind::Boolean
        } else if decl.contains("NUMERIC") || decl.contains("DECIMAL") {
            ColumnKind::Numeric
        } else {
            ColumnKind::Other(declared.to_string())
        }
    }

    pub fn is_timestamp(&self) -> bool {
        matches!(self, ColumnKind::Timestamp | ColumnKind::TimestampTz)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub kind: ColumnKind,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Rows changed since a watermark, split by which predicate they matched.
///
/// A row matching both the created and the updated predicate is only in
/// `inserted`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangedRows {
    pub inserted: Vec<RowSnapshot>,
    pub updated: Vec<RowSnapshot>,
}

/// A row ready to be written: values already coerced to the column kinds.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRow {
    pub id: i64,
    pub values: Vec<(String, ColumnValue)>,
}

/// Mutations applied together in one store transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    pub upserts: Vec<PreparedRow>,
    pub deletes: Vec<i64>,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub upserted: u64,
    pub deleted: u64,
}

#[async_trait]
pub trait StoreReader: Send + Sync {
    /// Rows whose created or updated timestamp is strictly after `since`,
    /// evaluated in a single query, ordered by id.
    async fn query_changed_since(
        &self,
        table: &TableSpec,
        since: DateTime<Utc>,
    ) -> Result<ChangedRows>;
}

#[async_trait]
pub trait StoreWriter: Send + Sync {
    /// Columns of the table in ordinal order.
    async fn columns(&self, table: &TableSpec) -> Result<Vec<ColumnInfo>>;

    /// Apply all upserts and deletes in one transaction.
    async fn write_batch(&self, table: &TableSpec, batch: WriteBatch) -> Result<WriteSummary>;
}

#[async_trait]
impl<T: StoreReader + ?Sized> StoreReader for Arc<T> {
    async fn query_changed_since(
        &self,
        table: &TableSpec,
        since: DateTime<Utc>,
    ) -> Result<ChangedRows> {
        (**self).query_changed_since(table, since).await
    }
}

#[async_trait]
impl<T: StoreWriter + ?Sized> StoreWriter for Arc<T> {
    async fn columns(&self, table: &TableSpec) -> Result<Vec<ColumnInfo>> {
        (**self).columns(table).await
    }

    async fn write_batch(&self, table: &TableSpec, batch: WriteBatch) -> Result<WriteSummary> {
        (**self).write_batch(table, batch).await
    }
}

/// A store opened from a connection URL.
pub enum AnyStore {
    Postgres(PgStore),
    Sqlite(SqliteStore),
}

impl AnyStore {
    /// Open the store named by `url`.
    ///
    /// `postgres://` and `postgresql://` URLs select PostgreSQL; `sqlite://`
    /// URLs, `.db`/`.sqlite`/`.sqlite3` paths and `:memory:` select SQLite.
    pub async fn open(url: &str, allow_self_signed_certs: bool) -> Result<Self> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            return Ok(AnyStore::Postgres(
                PgStore::connect(url, allow_self_signed_certs).await?,
            ));
        }
        if url == ":memory:" || url == "sqlite::memory:" {
            return Ok(AnyStore::Sqlite(SqliteStore::open_in_memory()?));
        }
        if let Some(path) = url.strip_prefix("sqlite://") {
            return Ok(AnyStore::Sqlite(SqliteStore::open(path)?));
        }
        let lower = url.to_ascii_lowercase();
        if lower.ends_with(".db") || lower.ends_with(".sqlite") || lower.ends_with(".sqlite3") {
            return Ok(AnyStore::Sqlite(SqliteStore::open(url)?));
        }
        bail!(
            "Unsupported store URL '{}': expected postgres://, postgresql://, sqlite:// or a .db/.sqlite path",
            crate::utils::sanitize_url(url)
        )
    }
}

#[async_trait]
impl StoreReader for AnyStore {
    async fn query_changed_since(
        &self,
        table: &TableSpec,
        since: DateTime<Utc>,
    ) -> Result<ChangedRows> {
        match self {
            AnyStore::Postgres(store) => store.query_changed_since(table, since).await,
            AnyStore::Sqlite(store) => store.query_changed_since(table, since).await,
        }
    }
}

#[async_trait]
impl StoreWriter for AnyStore {
    async fn columns(&self, table: &TableSpec) -> Result<Vec<ColumnInfo>> {
        match self {
            AnyStore::Postgres(store) => store.columns(table).await,
            AnyStore::Sqlite(store) => store.columns(table).await,
        }
    }

    async fn write_batch(&self, table: &TableSpec, batch: WriteBatch) -> Result<WriteSummary> {
        match self {
            AnyStore::Postgres(store) => store.write_batch(table, batch).await,
            AnyStore::Sqlite(store) => store.write_batch(table, batch).await,
        }
    }
}
