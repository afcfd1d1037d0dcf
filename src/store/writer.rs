//! Idempotent batched upserts into fact tables.
//!
//! One page is one transaction; inside it, rows are written in statements of
//! at most `UPSERT_BATCH_SIZE` each. Replaying the same page leaves the
//! table unchanged apart from `updated_at`, which the schema maintains on
//! genuine row changes only.

use sqlx::{MySql, Transaction};

use crate::error::{EtlError, Result};
use crate::vendor::{DataPage, Value};

/// Rows per INSERT statement. MySQL handles multi-row VALUES well up to a
/// few thousand; beyond that the packet size becomes the limit.
pub const UPSERT_BATCH_SIZE: usize = 2000;

/// `INSERT ... ON DUPLICATE KEY UPDATE` text for `rows` rows of `columns`.
/// Identifiers come from the static catalog, never from user input.
pub fn upsert_sql(table: &str, columns: &[&str], rows: usize) -> String {
    let cols = columns
        .iter()
        .map(|c| format!("`{c}`"))
        .collect::<Vec<_>>()
        .join(",");
    let one_row = format!(
        "({})",
        std::iter::repeat("?")
            .take(columns.len())
            .collect::<Vec<_>>()
            .join(",")
    );
    let values = std::iter::repeat(one_row.as_str())
        .take(rows)
        .collect::<Vec<_>>()
        .join(",");
    let updates = columns
        .iter()
        .map(|c| format!("`{c}`=VALUES(`{c}`)"))
        .collect::<Vec<_>>()
        .join(",");
    format!("INSERT INTO `{table}` ({cols}) VALUES {values} ON DUPLICATE KEY UPDATE {updates}")
}

/// Write one batch of page rows `[from, to)` inside the open transaction.
pub async fn write_batch(
    tx: &mut Transaction<'_, MySql>,
    table: &str,
    page: &DataPage,
    from: usize,
    to: usize,
) -> Result<()> {
    let columns: Vec<&str> = page.column_names().collect();
    let sql = upsert_sql(table, &columns, to - from);
    let mut query = sqlx::query(&sql);
    for row_idx in from..to {
        for cell in page.row(row_idx) {
            query = match cell {
                Value::Int(i) => query.bind(*i),
                Value::Float(f) => query.bind(*f),
                Value::Text(s) => query.bind(s.clone()),
                Value::Null => query.bind(Option::<String>::None),
            };
        }
    }
    query.execute(&mut **tx).await.map_err(map_write_err)?;
    Ok(())
}

/// Constraint violations other than the expected PK conflict surface as
/// store-write failures; the PK conflict itself is the upsert mechanism and
/// never reaches us as an error.
fn map_write_err(err: sqlx::Error) -> EtlError {
    match &err {
        sqlx::Error::Database(db) => EtlError::StoreWrite(db.message().to_string()),
        _ => EtlError::Database(err),
    }
}
