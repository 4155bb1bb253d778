//! PostgreSQL import target.
//!
//! One pooled connection holds the import transaction for the whole
//! session. Records are loaded with text `COPY` into a `TEMP` staging table
//! per destination table, then applied with set-based statements:
//!
//! ```text
//! UPDATE t SET ... FROM stage s WHERE t.guid = s.guid RETURNING guid, id
//! INSERT INTO t (...) SELECT ... FROM stage s WHERE NOT EXISTS (...) RETURNING guid, id
//! ```

use async_trait::async_trait;
use deadpool_postgres::{Object, Pool};
use futures::SinkExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::identifier::{column_list, qualify_pg, quote_pg, staging_table_name};
use crate::core::schema::TableDescriptor;
use crate::core::traits::{IdentityKey, ImportTarget, SelfReferenceUpdate, StagedRow};
use crate::error::{MigrateError, Result};

/// PostgreSQL implementation of [`ImportTarget`].
///
/// Dropping a target that was neither committed nor rolled back detaches its
/// connection from the pool and closes it, which makes the server abort the
/// transaction.
pub struct PostgresTarget {
    client: Option<Object>,
    schema: String,
}

impl PostgresTarget {
    /// Take a connection from `pool` and open the import transaction.
    pub async fn begin(pool: &Pool, schema: impl Into<String>) -> Result<Self> {
        let client = pool.get().await?;
        client.batch_execute("BEGIN").await?;
        debug!("Import transaction opened");
        Ok(Self {
            client: Some(client),
            schema: schema.into(),
        })
    }

    fn client(&self) -> Result<&Object> {
        self.client
            .as_ref()
            .ok_or(MigrateError::SessionClosed("connection released"))
    }

    fn qualified(&self, table: &TableDescriptor) -> Result<String> {
        qualify_pg(&self.schema, &table.name)
    }

    /// `CREATE TEMP TABLE` for the staged columns of `table`.
    fn staging_ddl(table: &TableDescriptor) -> Result<String> {
        let mut columns = vec![format!("{} uuid NOT NULL", quote_pg(&table.identity_column)?)];
        for column in &table.columns {
            columns.push(format!(
                "{} {}",
                quote_pg(&column.name)?,
                column.column_type.pg_type()
            ));
        }
        for fk in table.external_references() {
            columns.push(format!("{} bigint", quote_pg(&fk.column)?));
        }
        Ok(format!(
            "CREATE TEMP TABLE {} ({}) ON COMMIT DROP",
            quote_pg(&staging_table_name(&table.name))?,
            columns.join(", ")
        ))
    }

    /// Close the connection instead of returning it to the pool.
    fn discard(&mut self) {
        if let Some(client) = self.client.take() {
            drop(Object::take(client));
        }
    }
}

/// Staged identities with no destination row (anti-join on the identity).
fn unmatched_sql(table: &TableDescriptor, schema: &str) -> Result<String> {
    Ok(format!(
        "SELECT s.{guid} FROM {staging} s \
         WHERE NOT EXISTS (SELECT 1 FROM {table} t WHERE t.{guid} = s.{guid}) \
         ORDER BY s.{guid}",
        guid = quote_pg(&table.identity_column)?,
        staging = quote_pg(&staging_table_name(&table.name))?,
        table = qualify_pg(schema, &table.name)?
    ))
}

/// Overwrite every staged column except the identity of matched rows.
///
/// A table whose only staged column is the identity has nothing to set, so
/// the matched pairs are just selected.
fn update_sql(table: &TableDescriptor, schema: &str) -> Result<String> {
    let guid = quote_pg(&table.identity_column)?;
    let id = quote_pg(&table.key_column)?;
    let staging = quote_pg(&staging_table_name(&table.name))?;
    let target = qualify_pg(schema, &table.name)?;

    let assignments = table
        .staged_columns()
        .into_iter()
        .skip(1)
        .map(|c| quote_pg(c).map(|q| format!("{q} = s.{q}")))
        .collect::<Result<Vec<_>>>()?;

    if assignments.is_empty() {
        return Ok(format!(
            "SELECT t.{guid}, t.{id}::int8 FROM {target} t JOIN {staging} s ON t.{guid} = s.{guid}"
        ));
    }
    Ok(format!(
        "UPDATE {target} AS t SET {} FROM {staging} s WHERE t.{guid} = s.{guid} \
         RETURNING t.{guid}, t.{id}::int8",
        assignments.join(", ")
    ))
}

/// Insert staged rows whose identity is not in the destination yet.
fn insert_sql(table: &TableDescriptor, schema: &str) -> Result<String> {
    let guid = quote_pg(&table.identity_column)?;
    let id = quote_pg(&table.key_column)?;
    let staging = quote_pg(&staging_table_name(&table.name))?;
    let target = qualify_pg(schema, &table.name)?;
    let columns = table.staged_columns();
    let insert_list = column_list(&columns)?;
    let select_list = columns
        .iter()
        .map(|c| quote_pg(c).map(|q| format!("s.{q}")))
        .collect::<Result<Vec<_>>>()?
        .join(", ");

    Ok(format!(
        "INSERT INTO {target} ({insert_list}) SELECT {select_list} FROM {staging} s \
         WHERE NOT EXISTS (SELECT 1 FROM {target} t WHERE t.{guid} = s.{guid}) \
         RETURNING {guid}, {id}::int8"
    ))
}

/// Set one self-referencing column from parallel key/reference arrays.
fn self_reference_sql(table: &TableDescriptor, schema: &str, column: &str) -> Result<String> {
    Ok(format!(
        "UPDATE {target} AS t SET {column} = u.reference \
         FROM unnest($1::int8[], $2::int8[]) AS u(key, reference) \
         WHERE t.{id} = u.key",
        target = qualify_pg(schema, &table.name)?,
        column = quote_pg(column)?,
        id = quote_pg(&table.key_column)?
    ))
}

/// Read `(identity, key)` pairs from `RETURNING guid, id` style rows.
fn identity_keys(rows: &[tokio_postgres::Row]) -> Result<Vec<IdentityKey>> {
    rows.iter()
        .map(|row| -> Result<IdentityKey> {
            Ok((row.try_get::<_, Uuid>(0)?, row.try_get::<_, i64>(1)?))
        })
        .collect()
}

#[async_trait]
impl ImportTarget for PostgresTarget {
    async fn existing_identities(&mut self, table: &TableDescriptor) -> Result<Vec<IdentityKey>> {
        let sql = format!(
            "SELECT {guid}, {id}::int8 FROM {table} WHERE {guid} IS NOT NULL",
            guid = quote_pg(&table.identity_column)?,
            id = quote_pg(&table.key_column)?,
            table = self.qualified(table)?
        );
        let rows = self.client()?.query(&sql, &[]).await?;
        identity_keys(&rows)
    }

    async fn create_staging(&mut self, table: &TableDescriptor) -> Result<()> {
        let staging = quote_pg(&staging_table_name(&table.name))?;
        let client = self.client()?;
        client
            .batch_execute(&format!("DROP TABLE IF EXISTS {}", staging))
            .await?;
        client.batch_execute(&Self::staging_ddl(table)?).await?;
        debug!("{}: staging table created", table.name);
        Ok(())
    }

    async fn stage_rows(&mut self, table: &TableDescriptor, rows: &[StagedRow]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let copy_sql = format!(
            "COPY {} ({}) FROM STDIN WITH (FORMAT TEXT)",
            quote_pg(&staging_table_name(&table.name))?,
            column_list(&table.staged_columns())?
        );

        let mut text_buf = String::with_capacity(rows.len() * 256);
        for row in rows {
            text_buf.push_str(&row.identity.to_string());
            for value in &row.values {
                text_buf.push('\t');
                text_buf.push_str(&value.to_copy_text());
            }
            text_buf.push('\n');
        }

        let sink = self.client()?.copy_in(&copy_sql).await?;
        tokio::pin!(sink);
        sink.send(bytes::Bytes::from(text_buf)).await?;
        let copied = sink.finish().await?;
        Ok(copied)
    }

    async fn unmatched_identities(&mut self, table: &TableDescriptor) -> Result<Vec<Uuid>> {
        let sql = unmatched_sql(table, &self.schema)?;
        let rows = self.client()?.query(&sql, &[]).await?;
        rows.iter()
            .map(|row| row.try_get::<_, Uuid>(0).map_err(MigrateError::from))
            .collect()
    }

    async fn apply_updates(&mut self, table: &TableDescriptor) -> Result<Vec<IdentityKey>> {
        let sql = update_sql(table, &self.schema)?;
        let rows = self.client()?.query(&sql, &[]).await?;
        debug!("{}: {} rows updated", table.name, rows.len());
        identity_keys(&rows)
    }

    async fn apply_inserts(&mut self, table: &TableDescriptor) -> Result<Vec<IdentityKey>> {
        let sql = insert_sql(table, &self.schema)?;
        let rows = self.client()?.query(&sql, &[]).await?;
        debug!("{}: {} rows inserted", table.name, rows.len());
        identity_keys(&rows)
    }

    async fn update_self_reference(
        &mut self,
        table: &TableDescriptor,
        column: &str,
        updates: &[SelfReferenceUpdate],
    ) -> Result<u64> {
        if updates.is_empty() {
            return Ok(0);
        }

        let keys: Vec<i64> = updates.iter().map(|u| u.key).collect();
        let references: Vec<Option<i64>> = updates.iter().map(|u| u.reference).collect();
        let sql = self_reference_sql(table, &self.schema, column)?;

        let updated = self.client()?.execute(&sql, &[&keys, &references]).await?;
        Ok(updated)
    }

    async fn drop_staging(&mut self, table: &TableDescriptor) -> Result<()> {
        let sql = format!(
            "DROP TABLE IF EXISTS {}",
            quote_pg(&staging_table_name(&table.name))?
        );
        self.client()?.batch_execute(&sql).await?;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        let result = self.client()?.batch_execute("COMMIT").await;
        match result {
            Ok(()) => {
                // Healthy connection goes back to the pool.
                self.client = None;
                Ok(())
            }
            Err(e) => {
                self.discard();
                Err(e.into())
            }
        }
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        let result = self.client()?.batch_execute("ROLLBACK").await;
        match result {
            Ok(()) => {
                self.client = None;
                Ok(())
            }
            Err(e) => {
                self.discard();
                Err(e.into())
            }
        }
    }

    fn db_type(&self) -> &str {
        "postgres"
    }
}

impl Drop for PostgresTarget {
    fn drop(&mut self) {
        if self.client.is_some() {
            warn!("Import transaction abandoned; closing its connection");
            self.discard();
        }
    }
}
