// ABOUTME: SQL text builders shared by the PostgreSQL and SQLite stores
// ABOUTME: Upsert on the id column and delete-by-id statements

use crate::utils::quote_ident;

/// Build a single-row upsert keyed on `id_column`.
///
/// `placeholder(param_number, column_index)` renders the bind marker for a
/// column, so each dialect can choose `$n`, `?n` or add a cast.
///
/// Generates a query like:
/// ```sql
/// INSERT INTO "public"."rooms" ("Id", "RoomName")
/// VALUES ($1, $2)
/// ON CONFLICT ("Id") DO UPDATE SET "RoomName" = EXCLUDED."RoomName"
/// ```
pub fn build_upsert_query<F>(
    table_sql: &str,
    id_column: &str,
    columns: &[&str],
    placeholder: F,
) -> String
where
    F: Fn(usize, usize) -> String,
{
    let quoted_columns: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();

    let placeholders: Vec<String> = (0..columns.len())
        .map(|idx| placeholder(idx + 1, idx))
        .collect();

    let update_columns: Vec<String> = columns
        .iter()
        .filter(|c| **c != id_column)
        .map(|c| format!("{} = EXCLUDED.{}", quote_ident(c), quote_ident(c)))
        .collect();

    let update_clause = if update_columns.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", update_columns.join(", "))
    };

    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
        table_sql,
        quoted_columns.join(", "),
        placeholders.join(", "),
        quote_ident(id_column),
        update_clause
    )
}

/// Build an update of the non-id columns of one row.
///
/// Bind numbers follow the position of each column in `columns`, so the same
/// parameter list serves both this query and [`build_upsert_query`]. Partial
/// rows go through here first because NOT NULL checks run before an
/// `ON CONFLICT` clause is considered. Returns `None` when there is nothing
/// to update or the id column is absent.
///
/// ```sql
/// UPDATE "public"."rooms" SET "RoomName" = $2 WHERE "Id" = $1
/// ```
pub fn build_update_query<F>(
    table_sql: &str,
    id_column: &str,
    columns: &[&str],
    placeholder: F,
) -> Option<String>
where
    F: Fn(usize, usize) -> String,
{
    let id_idx = columns.iter().position(|c| *c == id_column)?;
    let assignments: Vec<String> = columns
        .iter()
        .enumerate()
        .filter(|(_, c)| **c != id_column)
        .map(|(idx, c)| format!("{} = {}", quote_ident(c), placeholder(idx + 1, idx)))
        .collect();

    if assignments.is_empty() {
        return None;
    }

    Some(format!(
        "UPDATE {} SET {} WHERE {} = {}",
        table_sql,
        assignments.join(", "),
        quote_ident(id_column),
        placeholder(id_idx + 1, id_idx)
    ))
}

/// Build a delete for `num_ids` id values.
///
/// ```sql
/// DELETE FROM "public"."rooms" WHERE "Id" IN ($1, $2, $3)
/// ```
pub fn build_delete_query<F>(table_sql: &str, id_column: &str, num_ids: usize, placeholder: F) -> String
where
    F: Fn(usize) -> String,
{
    let placeholders: Vec<String> = (1..=num_ids).map(placeholder).collect();
    format!(
        "DELETE FROM {} WHERE {} IN ({})",
        table_sql,
        quote_ident(id_column),
        placeholders.join(", ")
    )
}

/// Alias of the computed column that tells inserts from updates.
pub const INSERTED_FLAG: &str = "__mr_inserted";
