//! Source rows to portable records.

use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::schema::TableDescriptor;
use crate::core::traits::{SourceBatch, SourceReader, SourceRow};
use crate::core::value::SqlValue;
use crate::error::{MigrateError, Result};
use crate::portable::PortableRecord;

/// Identity for a row that has none in the source.
///
/// Derived from the export's namespace, the table and the surrogate key, so
/// every reference to the same legacy row within one export agrees. A new
/// export uses a new namespace and therefore new identities.
pub fn legacy_identity(namespace: &Uuid, table: &str, key: i64) -> Uuid {
    Uuid::new_v5(namespace, format!("{}:{}", table, key).as_bytes())
}

/// Lazily converts one table's rows into portable records.
///
/// Single pass, forward only: batches are pulled from the source reader's
/// channel as the caller asks for them.
pub struct RecordSerializer<'a> {
    table: &'a TableDescriptor,
    namespace: Uuid,
    rows: mpsc::Receiver<Result<SourceBatch>>,
    legacy_rows: u64,
}

impl<'a> RecordSerializer<'a> {
    pub fn new(
        table: &'a TableDescriptor,
        source: &dyn SourceReader,
        namespace: Uuid,
        batch_size: usize,
    ) -> Self {
        Self {
            table,
            namespace,
            rows: source.read_table(table, batch_size),
            legacy_rows: 0,
        }
    }

    /// Next batch of records, or `None` when the table is exhausted.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<PortableRecord>>> {
        match self.rows.recv().await {
            Some(batch) => {
                let batch = batch?;
                let records = batch
                    .into_iter()
                    .map(|row| self.to_record(row))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Some(records))
            }
            None => Ok(None),
        }
    }

    /// Rows that were given a derived identity so far.
    pub fn legacy_rows(&self) -> u64 {
        self.legacy_rows
    }

    fn to_record(&mut self, row: SourceRow) -> Result<PortableRecord> {
        let table = self.table;
        if row.values.len() != table.columns.len()
            || row.references.len() != table.foreign_keys.len()
        {
            return Err(MigrateError::Export {
                table: table.name.clone(),
                message: format!(
                    "source row {} has {} values and {} references, expected {} and {}",
                    row.key,
                    row.values.len(),
                    row.references.len(),
                    table.columns.len(),
                    table.foreign_keys.len()
                ),
            });
        }

        let mut record = PortableRecord::new();

        let identity = match row.identity {
            Some(identity) => identity,
            None => {
                self.legacy_rows += 1;
                legacy_identity(&self.namespace, &table.name, row.key)
            }
        };
        record.set(&table.identity_column, JsonValue::String(identity.to_string()));

        for (column, value) in table.columns.iter().zip(&row.values) {
            // JSON has no NaN or infinity; writing null would change the value.
            if let SqlValue::F64(v) = value {
                if !v.is_finite() {
                    return Err(MigrateError::Export {
                        table: table.name.clone(),
                        message: format!(
                            "row {} column {} holds {}, which the portable format cannot carry",
                            row.key, column.name, v
                        ),
                    });
                }
            }
            record.set(&column.name, value.to_portable());
        }

        for (fk, reference) in table.foreign_keys.iter().zip(&row.references) {
            let value = match reference.key {
                None => JsonValue::Null,
                Some(key) if !reference.found => {
                    return Err(MigrateError::Export {
                        table: table.name.clone(),
                        message: format!(
                            "row {} column {} references missing {} row {}",
                            row.key, fk.column, fk.references, key
                        ),
                    });
                }
                Some(key) => {
                    let identity = reference
                        .identity
                        .unwrap_or_else(|| legacy_identity(&self.namespace, &fk.references, key));
                    JsonValue::String(identity.to_string())
                }
            };
            record.set(&fk.column, value);
        }

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::ColumnType;
    use crate::core::traits::SourceReference;
    use async_trait::async_trait;

    struct FixedSource(Vec<SourceRow>);

    #[async_trait]
    impl SourceReader for FixedSource {
        fn read_table(&self, _table: &TableDescriptor, batch_size: usize) -> mpsc::Receiver<Result<SourceBatch>> {
            let (tx, rx) = mpsc::channel(16);
            for chunk in self.0.chunks(batch_size) {
                tx.try_send(Ok(chunk.to_vec())).unwrap();
            }
            rx
        }

        async fn row_count(&self, _table: &TableDescriptor) -> Result<i64> {
            Ok(self.0.len() as i64)
        }

        fn db_type(&self) -> &str {
            "fixed"
        }

        async fn close(&self) {}
    }

    fn action() -> TableDescriptor {
        TableDescriptor::new("action")
            .column("name", ColumnType::Text)
            .optionally_references("workflow_id", "workflow")
    }

    fn row(key: i64, identity: Option<Uuid>, reference: SourceReference) -> SourceRow {
        SourceRow {
            key,
            identity,
            values: vec![SqlValue::Text(format!("a{}", key))],
            references: vec![reference],
        }
    }

    #[tokio::test]
    async fn test_references_become_identities() {
        let table = action();
        let wf = Uuid::new_v4();
        let id = Uuid::new_v4();
        let source = FixedSource(vec![
            row(1, Some(id), SourceReference { key: Some(7), identity: Some(wf), found: true }),
            row(2, Some(Uuid::new_v4()), SourceReference::null()),
        ]);

        let mut serializer = RecordSerializer::new(&table, &source, Uuid::new_v4(), 10);
        let batch = serializer.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].get("guid").unwrap(), &JsonValue::String(id.to_string()));
        assert_eq!(batch[0].get("workflow_id").unwrap(), &JsonValue::String(wf.to_string()));
        assert_eq!(batch[1].get("workflow_id").unwrap(), &JsonValue::Null);
        assert!(serializer.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_legacy_rows_get_consistent_identities() {
        let table = action();
        let namespace = Uuid::new_v4();
        let source = FixedSource(vec![row(
            5,
            None,
            SourceReference { key: Some(3), identity: None, found: true },
        )]);

        let mut serializer = RecordSerializer::new(&table, &source, namespace, 10);
        let batch = serializer.next_batch().await.unwrap().unwrap();
        assert_eq!(serializer.legacy_rows(), 1);
        assert_eq!(
            batch[0].get("guid").unwrap(),
            &JsonValue::String(legacy_identity(&namespace, "action", 5).to_string())
        );
        assert_eq!(
            batch[0].get("workflow_id").unwrap(),
            &JsonValue::String(legacy_identity(&namespace, "workflow", 3).to_string())
        );
        assert_ne!(
            legacy_identity(&namespace, "action", 5),
            legacy_identity(&Uuid::new_v4(), "action", 5)
        );
    }

    #[tokio::test]
    async fn test_dangling_reference_fails_export() {
        let table = action();
        let source = FixedSource(vec![row(
            1,
            Some(Uuid::new_v4()),
            SourceReference { key: Some(99), identity: None, found: false },
        )]);

        let mut serializer = RecordSerializer::new(&table, &source, Uuid::new_v4(), 10);
        let err = serializer.next_batch().await.unwrap_err();
        assert!(matches!(err, MigrateError::Export { .. }));
    }

    #[tokio::test]
    async fn test_non_finite_float_fails_export() {
        let table = TableDescriptor::new("measurement").nullable_column("reading", ColumnType::Float);
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let source = FixedSource(vec![SourceRow {
                key: 1,
                identity: Some(Uuid::new_v4()),
                values: vec![SqlValue::F64(bad)],
                references: vec![],
            }]);
            let mut serializer = RecordSerializer::new(&table, &source, Uuid::new_v4(), 10);
            let err = serializer.next_batch().await.unwrap_err();
            assert!(matches!(err, MigrateError::Export { .. }), "{} accepted", bad);
        }

        let source = FixedSource(vec![SourceRow {
            key: 2,
            identity: Some(Uuid::new_v4()),
            values: vec![SqlValue::F64(2.5)],
            references: vec![],
        }]);
        let mut serializer = RecordSerializer::new(&table, &source, Uuid::new_v4(), 10);
        let batch = serializer.next_batch().await.unwrap().unwrap();
        assert_eq!(batch[0].get("reading").unwrap(), &serde_json::json!(2.5));
    }
}
