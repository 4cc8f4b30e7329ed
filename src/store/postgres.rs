// ABOUTME: PostgreSQL store - reads changed rows and applies upsert batches
// ABOUTME: Uses tokio-postgres over native TLS with the session pinned to UTC

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::sync::Mutex;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Row};

use super::sql::{build_delete_query, build_update_query, build_upsert_query, INSERTED_FLAG};
use super::{
    ChangedRows, ColumnInfo, ColumnKind, StoreReader, StoreWriter, TableSpec, WriteBatch,
    WriteSummary,
};
use crate::delta::{ColumnValue, RowSnapshot};
use crate::utils::{quote_ident, sanitize_url};

/// Deletes are sent in chunks to stay well inside the parameter limit.
const DELETE_CHUNK: usize = 1000;

type BoxedParam = Box<dyn ToSql + Sync + Send>;

/// PostgreSQL-backed store.
///
/// The client sits behind an async mutex because transactions need
/// exclusive access to it.
pub struct PgStore {
    client: Mutex<Client>,
}

impl PgStore {
    /// Connect to `url`, optionally accepting self-signed certificates.
    pub async fn connect(url: &str, allow_self_signed_certs: bool) -> Result<Self> {
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(allow_self_signed_certs)
            .build()
            .context("Failed to build TLS connector")?;
        let tls = postgres_native_tls::MakeTlsConnector::new(connector);

        let (client, connection) = tokio_postgres::connect(url, tls)
            .await
            .with_context(|| format!("Failed to connect to {}", sanitize_url(url)))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("PostgreSQL connection error: {}", e);
            }
        });

        client
            .batch_execute("SET TIME ZONE 'UTC'")
            .await
            .context("Failed to set session time zone")?;

        tracing::info!("Connected to PostgreSQL at {}", sanitize_url(url));
        Ok(Self::from_client(client))
    }

    pub fn from_client(client: Client) -> Self {
        Self {
            client: Mutex::new(client),
        }
    }
}

fn table_sql(table: &TableSpec) -> String {
    format!("{}.{}", quote_ident(&table.schema), quote_ident(&table.name))
}

async fn fetch_columns(client: &Client, table: &TableSpec) -> Result<Vec<ColumnInfo>> {
    let rows = client
        .query(
            "SELECT column_name::text, data_type::text, udt_name::text
             FROM information_schema.columns
             WHERE table_schema = $1 AND table_name = $2
             ORDER BY ordinal_position",
            &[&table.schema, &table.name],
        )
        .await
        .with_context(|| format!("Failed to get columns for {}", table.display_name()))?;

    if rows.is_empty() {
        bail!("Table {} does not exist", table.display_name());
    }

    Ok(rows
        .iter()
        .map(|row| {
            let name: String = row.get(0);
            let data_type: String = row.get(1);
            let udt_name: String = row.get(2);
            ColumnInfo::new(name, ColumnKind::from_postgres(&data_type, &udt_name))
        })
        .collect())
}

/// Select expression for a column; types without a native mapping are read as text.
fn projection(column: &ColumnInfo) -> String {
    let name = quote_ident(&column.name);
    match column.kind {
        ColumnKind::Numeric => format!("{}::float8 AS {}", name, name),
        ColumnKind::Other(_) => format!("{}::text AS {}", name, name),
        _ => name,
    }
}

/// Bind marker for a column; numeric and unmapped types are cast on the way in.
fn placeholder(n: usize, kind: &ColumnKind) -> String {
    match kind {
        ColumnKind::Numeric => format!("${}::float8", n),
        ColumnKind::Other(udt) => format!("${}::text::{}", n, quote_ident(udt)),
        _ => format!("${}", n),
    }
}

fn read_value(row: &Row, idx: usize, kind: &ColumnKind) -> Result<ColumnValue> {
    let value = match kind {
        ColumnKind::SmallInt => row
            .try_get::<_, Option<i16>>(idx)?
            .map(|v| ColumnValue::Int(v.into()))
            .unwrap_or(ColumnValue::Null),
        ColumnKind::Integer => row.try_get::<_, Option<i32>>(idx)?.into(),
        ColumnKind::BigInt => row.try_get::<_, Option<i64>>(idx)?.into(),
        ColumnKind::Real => row
            .try_get::<_, Option<f32>>(idx)?
            .map(|v| ColumnValue::Float(v.into()))
            .unwrap_or(ColumnValue::Null),
        ColumnKind::Double | ColumnKind::Numeric => row.try_get::<_, Option<f64>>(idx)?.into(),
        ColumnKind::Boolean => row
            .try_get::<_, Option<bool>>(idx)?
            .map(|v| ColumnValue::Int(i64::from(v)))
            .unwrap_or(ColumnValue::Null),
        ColumnKind::Text | ColumnKind::Other(_) => row.try_get::<_, Option<String>>(idx)?.into(),
        ColumnKind::Timestamp => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(|v| ColumnValue::Timestamp(v.and_utc()))
            .unwrap_or(ColumnValue::Null),
        ColumnKind::TimestampTz => row.try_get::<_, Option<DateTime<Utc>>>(idx)?.into(),
    };
    Ok(value)
}

/// Convert an already coerced value into a parameter of the column's type.
fn to_param(value: &ColumnValue, kind: &ColumnKind) -> Result<BoxedParam> {
    let mismatch = || {
        anyhow::anyhow!(
            "cannot bind {} value to a {:?} column",
            value.type_name(),
            kind
        )
    };

    let param: BoxedParam = match kind {
        ColumnKind::SmallInt => match value {
            ColumnValue::Null => Box::new(None::<i16>),
            ColumnValue::Int(v) => Box::new(i16::try_from(*v).context("value out of range")?),
            _ => return Err(mismatch()),
        },
        ColumnKind::Integer => match value {
            ColumnValue::Null => Box::new(None::<i32>),
            ColumnValue::Int(v) => Box::new(i32::try_from(*v).context("value out of range")?),
            _ => return Err(mismatch()),
        },
        ColumnKind::BigInt => match value {
            ColumnValue::Null => Box::new(None::<i64>),
            ColumnValue::Int(v) => Box::new(*v),
            _ => return Err(mismatch()),
        },
        ColumnKind::Real => match value {
            ColumnValue::Null => Box::new(None::<f32>),
            ColumnValue::Float(v) => Box::new(*v as f32),
            _ => return Err(mismatch()),
        },
        ColumnKind::Double | ColumnKind::Numeric => match value {
            ColumnValue::Null => Box::new(None::<f64>),
            ColumnValue::Float(v) => Box::new(*v),
            _ => return Err(mismatch()),
        },
        ColumnKind::Boolean => match value {
            ColumnValue::Null => Box::new(None::<bool>),
            ColumnValue::Int(v) => Box::new(*v != 0),
            _ => return Err(mismatch()),
        },
        ColumnKind::Text | ColumnKind::Other(_) => match value {
            ColumnValue::Null => Box::new(None::<String>),
            ColumnValue::Text(v) => Box::new(v.clone()),
            _ => return Err(mismatch()),
        },
        ColumnKind::Timestamp => match value {
            ColumnValue::Null => Box::new(None::<NaiveDateTime>),
            ColumnValue::Timestamp(v) => Box::new(v.naive_utc()),
            _ => return Err(mismatch()),
        },
        ColumnKind::TimestampTz => match value {
            ColumnValue::Null => Box::new(None::<DateTime<Utc>>),
            ColumnValue::Timestamp(v) => Box::new(*v),
            _ => return Err(mismatch()),
        },
    };
    Ok(param)
}

#[async_trait]
impl StoreReader for PgStore {
    async fn query_changed_since(
        &self,
        table: &TableSpec,
        since: DateTime<Utc>,
    ) -> Result<ChangedRows> {
        let client = self.client.lock().await;
        let columns = fetch_columns(&client, table).await?;

        let created = quote_ident(&table.created_at_column);
        let updated = quote_ident(&table.updated_at_column);
        let select_list = columns
            .iter()
            .map(projection)
            .collect::<Vec<_>>()
            .join(", ");

        let query = format!(
            "SELECT {}, COALESCE({} > $1::timestamptz, false) AS {} \
             FROM {} \
             WHERE {} > $1::timestamptz OR {} > $1::timestamptz \
             ORDER BY {}",
            select_list,
            created,
            quote_ident(INSERTED_FLAG),
            table_sql(table),
            created,
            updated,
            quote_ident(&table.id_column)
        );

        let rows = client
            .query(&query, &[&since])
            .await
            .with_context(|| format!("Failed to read changes from {}", table.display_name()))?;

        let mut changed = ChangedRows::default();
        for row in &rows {
            let mut snapshot = RowSnapshot::with_capacity(columns.len());
            for (idx, column) in columns.iter().enumerate() {
                let value = read_value(row, idx, &column.kind).with_context(|| {
                    format!("Failed to read column {} of {}", column.name, table.display_name())
                })?;
                snapshot.insert(column.name.clone(), value);
            }
            let inserted: bool = row
                .try_get(columns.len())
                .context("Failed to read insert flag")?;
            if inserted {
                changed.inserted.push(snapshot);
            } else {
                changed.updated.push(snapshot);
            }
        }

        tracing::debug!(
            "Read {} inserted and {} updated rows from {} since {}",
            changed.inserted.len(),
            changed.updated.len(),
            table.display_name(),
            since
        );
        Ok(changed)
    }
}

#[async_trait]
impl StoreWriter for PgStore {
    async fn columns(&self, table: &TableSpec) -> Result<Vec<ColumnInfo>> {
        let client = self.client.lock().await;
        fetch_columns(&client, table).await
    }

    async fn write_batch(&self, table: &TableSpec, batch: WriteBatch) -> Result<WriteSummary> {
        let mut summary = WriteSummary::default();
        if batch.is_empty() {
            return Ok(summary);
        }

        let mut client = self.client.lock().await;
        let columns = fetch_columns(&client, table).await?;
        let kinds: HashMap<&str, &ColumnKind> = columns
            .iter()
            .map(|c| (c.name.as_str(), &c.kind))
            .collect();
        let target = table_sql(table);

        let tx = client
            .transaction()
            .await
            .context("Failed to begin transaction")?;

        for row in &batch.upserts {
            let names: Vec<&str> = row.values.iter().map(|(n, _)| n.as_str()).collect();
            let row_kinds = names
                .iter()
                .map(|n| {
                    kinds.get(n).copied().with_context(|| {
                        format!("Column {} does not exist in {}", n, table.display_name())
                    })
                })
                .collect::<Result<Vec<&ColumnKind>>>()?;

            let bind = |n: usize, col: usize| placeholder(n, row_kinds[col]);
            let update = build_update_query(&target, &table.id_column, &names, bind);
            let upsert = build_upsert_query(&target, &table.id_column, &names, bind);

            let params = row
                .values
                .iter()
                .zip(&row_kinds)
                .map(|((name, value), kind)| {
                    to_param(value, kind)
                        .with_context(|| format!("Invalid value for column {}", name))
                })
                .collect::<Result<Vec<BoxedParam>>>()?;
            let refs: Vec<&(dyn ToSql + Sync)> = params
                .iter()
                .map(|p| p.as_ref() as &(dyn ToSql + Sync))
                .collect();

            if let Some(update) = update {
                let updated = tx.execute(&update, &refs).await.with_context(|| {
                    format!("Failed to update row {} in {}", row.id, table.display_name())
                })?;
                if updated > 0 {
                    summary.upserted += updated;
                    continue;
                }
            }

            summary.upserted += tx.execute(&upsert, &refs).await.with_context(|| {
                format!("Failed to upsert row {} into {}", row.id, table.display_name())
            })?;
        }

        for chunk in batch.deletes.chunks(DELETE_CHUNK) {
            let query = build_delete_query(&target, &table.id_column, chunk.len(), |n| {
                format!("${}", n)
            });
            let refs: Vec<&(dyn ToSql + Sync)> =
                chunk.iter().map(|id| id as &(dyn ToSql + Sync)).collect();
            summary.deleted += tx.execute(&query, &refs).await.with_context(|| {
                format!("Failed to delete rows from {}", table.display_name())
            })?;
        }

        tx.commit()
            .await
            .with_context(|| format!("Failed to commit changes to {}", table.display_name()))?;

        Ok(summary)
    }
}
