//! PostgreSQL source reader.
//!
//! Rows are read with keyset pagination on the surrogate key. Every foreign
//! key is LEFT JOINed to the referenced table on its surrogate key so the
//! referenced row's identity comes back with the row, along with a flag
//! telling a dangling key apart from a legacy row without an identity.

use async_trait::async_trait;
use deadpool_postgres::Pool;
use tokio::sync::mpsc;
use tokio_postgres::Row;
use tracing::debug;
use uuid::Uuid;

use crate::core::identifier::{qualify_pg, quote_pg};
use crate::core::schema::{ColumnType, TableDescriptor};
use crate::core::traits::{SourceBatch, SourceReader, SourceReference, SourceRow};
use crate::core::value::SqlValue;
use crate::error::{MigrateError, Result};

/// Batches buffered between the reader task and the serializer.
const CHANNEL_CAPACITY: usize = 4;

/// PostgreSQL implementation of [`SourceReader`].
pub struct PostgresReader {
    pool: Pool,
    schema: String,
}

impl PostgresReader {
    pub fn new(pool: Pool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }
}

#[async_trait]
impl SourceReader for PostgresReader {
    fn read_table(
        &self,
        table: &TableDescriptor,
        batch_size: usize,
    ) -> mpsc::Receiver<Result<SourceBatch>> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let pool = self.pool.clone();
        let schema = self.schema.clone();
        let table = table.clone();

        tokio::spawn(async move {
            if let Err(e) = read_table_internal(pool, &schema, &table, batch_size, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
        });

        rx
    }

    async fn row_count(&self, table: &TableDescriptor) -> Result<i64> {
        let client = self.pool.get().await?;
        let query = format!(
            "SELECT COUNT(*)::int8 FROM {}",
            qualify_pg(&self.schema, &table.name)?
        );
        let row = client.query_one(&query, &[]).await?;
        Ok(row.try_get::<_, i64>(0)?)
    }

    fn db_type(&self) -> &str {
        "postgres"
    }

    async fn close(&self) {
        self.pool.close();
    }
}

async fn read_table_internal(
    pool: Pool,
    schema: &str,
    table: &TableDescriptor,
    batch_size: usize,
    tx: &mpsc::Sender<Result<SourceBatch>>,
) -> Result<()> {
    let client = pool.get().await?;
    let query = build_select_query(schema, table)?;
    let statement = client.prepare(&query).await?;
    let limit = batch_size.max(1) as i64;
    let mut last_key = i64::MIN;

    loop {
        let rows = client.query(&statement, &[&last_key, &limit]).await?;
        let fetched = rows.len();

        let mut batch = Vec::with_capacity(fetched);
        for row in &rows {
            batch.push(decode_row(row, table)?);
        }

        if let Some(last) = batch.last() {
            last_key = last.key;
        }
        debug!("{}: read {} rows (last key {})", table.name, fetched, last_key);

        if fetched > 0 && tx.send(Ok(batch)).await.is_err() {
            // Consumer went away.
            return Ok(());
        }
        if (fetched as i64) < limit {
            return Ok(());
        }
    }
}

/// `SELECT` for one page of `table`, parameterized by the last key seen and
/// the page size.
///
/// Result layout: key, identity, data columns, then per foreign key the raw
/// key, the referenced identity and whether a referenced row was found.
fn build_select_query(schema: &str, table: &TableDescriptor) -> Result<String> {
    let key = quote_pg(&table.key_column)?;
    let mut select = vec![
        format!("t.{}::int8", key),
        format!("t.{}", quote_pg(&table.identity_column)?),
    ];
    for column in &table.columns {
        select.push(format!(
            "t.{}::{}",
            quote_pg(&column.name)?,
            column.column_type.pg_type()
        ));
    }

    let mut joins = Vec::with_capacity(table.foreign_keys.len());
    for (i, fk) in table.foreign_keys.iter().enumerate() {
        let alias = format!("r{}", i);
        select.push(format!("t.{}::int8", quote_pg(&fk.column)?));
        // Referenced tables use the same identity column name.
        select.push(format!("{}.{}", alias, quote_pg(&table.identity_column)?));
        select.push(format!("({}.{} IS NOT NULL)", alias, key));
        joins.push(format!(
            "LEFT JOIN {} {} ON {}.{} = t.{}",
            qualify_pg(schema, &fk.references)?,
            alias,
            alias,
            key,
            quote_pg(&fk.column)?
        ));
    }

    let mut sql = format!(
        "SELECT {} FROM {} t",
        select.join(", "),
        qualify_pg(schema, &table.name)?
    );
    for join in joins {
        sql.push(' ');
        sql.push_str(&join);
    }
    sql.push_str(&format!(
        " WHERE t.{key} > $1::int8 ORDER BY t.{key} LIMIT $2::int8",
        key = key
    ));
    Ok(sql)
}

fn decode_row(row: &Row, table: &TableDescriptor) -> Result<SourceRow> {
    let key: i64 = row.try_get(0)?;
    let identity: Option<Uuid> = row.try_get(1)?;

    let mut idx = 2;
    let mut values = Vec::with_capacity(table.columns.len());
    for column in &table.columns {
        values.push(decode_value(row, idx, column.column_type)?);
        idx += 1;
    }

    let mut references = Vec::with_capacity(table.foreign_keys.len());
    for fk in &table.foreign_keys {
        let raw: Option<i64> = row.try_get(idx)?;
        let referenced: Option<Uuid> = row.try_get(idx + 1)?;
        let found: bool = row.try_get(idx + 2)?;
        idx += 3;

        if raw.is_none() && !fk.nullable {
            return Err(MigrateError::Export {
                table: table.name.clone(),
                message: format!("row {} has NULL in required column {}", key, fk.column),
            });
        }
        references.push(SourceReference {
            key: raw,
            identity: referenced,
            found,
        });
    }

    Ok(SourceRow {
        key,
        identity,
        values,
        references,
    })
}

/// Decode one column. The query casts every column to its declared type.
fn decode_value(row: &Row, idx: usize, column_type: ColumnType) -> Result<SqlValue> {
    let value = match column_type {
        ColumnType::Bool => row.try_get::<_, Option<bool>>(idx)?.map(SqlValue::Bool),
        ColumnType::Int => row.try_get::<_, Option<i32>>(idx)?.map(SqlValue::I32),
        ColumnType::BigInt => row.try_get::<_, Option<i64>>(idx)?.map(SqlValue::I64),
        ColumnType::Float => row.try_get::<_, Option<f64>>(idx)?.map(SqlValue::F64),
        ColumnType::Text => row.try_get::<_, Option<String>>(idx)?.map(SqlValue::Text),
        ColumnType::Uuid => row.try_get::<_, Option<Uuid>>(idx)?.map(SqlValue::Uuid),
        ColumnType::Timestamp => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)?
            .map(SqlValue::DateTime),
        ColumnType::Date => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)?
            .map(SqlValue::Date),
    };
    Ok(value.unwrap_or(SqlValue::Null(column_type)))
}
