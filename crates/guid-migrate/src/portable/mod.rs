//! Portable, identity-keyed representation of table rows.
//!
//! Each table is written to its own JSON Lines file (`<table>.jsonl`), one
//! flat object per row. Foreign keys hold the durable identity of the
//! referenced row instead of a surrogate key, so the files can be imported
//! into any database sharing the logical schema. A [`Manifest`] written at
//! the end of an export lists every file with its record count and SHA-256.

mod file;
mod manifest;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use crate::core::schema::{Column, ForeignKey, TableDescriptor};
use crate::core::value::SqlValue;
use crate::error::{MigrateError, Result};

pub use file::{verify_checksum, FileSummary, PortableReader, PortableWriter};
pub use manifest::{Manifest, ManifestEntry, FORMAT_VERSION, MANIFEST_FILE};

/// One exported row: column name to JSON scalar or null.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortableRecord {
    fields: Map<String, JsonValue>,
}

impl PortableRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: JsonValue) {
        self.fields.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        self.fields.get(name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The row's durable identity. Always required.
    pub fn identity(&self, table: &TableDescriptor) -> Result<Uuid> {
        match self.get(&table.identity_column) {
            Some(JsonValue::String(s)) => Uuid::parse_str(s).map_err(|e| {
                MigrateError::invalid_record(&table.name, format!("bad identity {:?}: {}", s, e))
            }),
            Some(other) => Err(MigrateError::invalid_record(
                &table.name,
                format!("identity must be a UUID string, found {}", other),
            )),
            None => Err(MigrateError::invalid_record(
                &table.name,
                format!("record has no '{}' field", table.identity_column),
            )),
        }
    }

    /// Typed value of a data column. A missing field reads as NULL.
    pub fn value(&self, table: &TableDescriptor, column: &Column) -> Result<SqlValue> {
        let value = match self.get(&column.name) {
            Some(v) => SqlValue::from_portable(v, column.column_type)
                .map_err(|e| MigrateError::invalid_record(&table.name, format!("{}: {}", column.name, e)))?,
            None => SqlValue::Null(column.column_type),
        };

        if value.is_null() && !column.nullable {
            return Err(MigrateError::invalid_record(
                &table.name,
                format!("column '{}' is NOT NULL but has no value", column.name),
            ));
        }
        Ok(value)
    }

    /// Identity of the row referenced by a foreign key, if any.
    pub fn reference(&self, table: &TableDescriptor, fk: &ForeignKey) -> Result<Option<Uuid>> {
        let reference = match self.get(&fk.column) {
            None | Some(JsonValue::Null) => None,
            Some(JsonValue::String(s)) => Some(Uuid::parse_str(s).map_err(|e| {
                MigrateError::invalid_record(
                    &table.name,
                    format!("{}: bad reference {:?}: {}", fk.column, s, e),
                )
            })?),
            Some(other) => {
                return Err(MigrateError::invalid_record(
                    &table.name,
                    format!("{}: reference must be a UUID string, found {}", fk.column, other),
                ))
            }
        };

        if reference.is_none() && !fk.nullable {
            return Err(MigrateError::invalid_record(
                &table.name,
                format!("foreign key '{}' is NOT NULL but has no value", fk.column),
            ));
        }
        Ok(reference)
    }

    /// Reject fields the table does not declare.
    pub fn check_fields(&self, table: &TableDescriptor) -> Result<()> {
        let unknown = self.field_names().find(|name| {
            *name != table.identity_column
                && table.find_column(name).is_none()
                && !table.foreign_keys.iter().any(|fk| fk.column == *name)
        });

        match unknown {
            Some(name) => Err(MigrateError::invalid_record(
                &table.name,
                format!("unknown field '{}'", name),
            )),
            None => Ok(()),
        }
    }
}
