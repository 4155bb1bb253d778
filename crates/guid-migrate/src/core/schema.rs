//! Table descriptor types.
//!
//! A [`TableDescriptor`] is the static description of one migratable table:
//! its columns, the column holding the durable identity (a GUID), the
//! database-local surrogate key, and the foreign keys into other tables.

use serde::{Deserialize, Serialize};

/// Default name of the durable identity column.
pub const DEFAULT_IDENTITY_COLUMN: &str = "guid";

/// Default name of the surrogate key column.
pub const DEFAULT_KEY_COLUMN: &str = "id";

/// Column types understood by the portable format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Bool,
    /// 32-bit integer.
    Int,
    /// 64-bit integer.
    BigInt,
    /// Double precision float.
    Float,
    Text,
    Uuid,
    /// Timestamp without time zone.
    Timestamp,
    Date,
}

impl ColumnType {
    /// PostgreSQL type name used for staging tables.
    pub fn pg_type(&self) -> &'static str {
        match self {
            ColumnType::Bool => "boolean",
            ColumnType::Int => "integer",
            ColumnType::BigInt => "bigint",
            ColumnType::Float => "double precision",
            ColumnType::Text => "text",
            ColumnType::Uuid => "uuid",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Date => "date",
        }
    }
}

/// A plain data column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// A foreign key column holding the surrogate key of a row in `references`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Column in the referencing table.
    pub column: String,
    /// Name of the referenced table.
    pub references: String,
    pub nullable: bool,
}

/// Which part of the catalogue a table belongs to.
///
/// The LabDE tables are an optional subset that callers can opt out of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableDomain {
    Core,
    LabDE,
}

/// Static description of one migratable table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    /// Surrogate key column (database-assigned, BIGINT-compatible).
    pub key_column: String,
    /// Durable identity column (UUID).
    pub identity_column: String,
    /// Data columns, in declaration order. Excludes key, identity and FK columns.
    pub columns: Vec<Column>,
    pub foreign_keys: Vec<ForeignKey>,
    /// False for fixed-vocabulary tables: import may update but never add rows.
    pub insertable: bool,
    pub domain: TableDomain,
}

impl TableDescriptor {
    /// Start a Core-domain table with the default `id` / `guid` columns.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_column: DEFAULT_KEY_COLUMN.to_string(),
            identity_column: DEFAULT_IDENTITY_COLUMN.to_string(),
            columns: Vec::new(),
            foreign_keys: Vec::new(),
            insertable: true,
            domain: TableDomain::Core,
        }
    }

    pub fn column(mut self, name: &str, column_type: ColumnType) -> Self {
        self.columns.push(Column::new(name, column_type));
        self
    }

    pub fn nullable_column(mut self, name: &str, column_type: ColumnType) -> Self {
        self.columns.push(Column::new(name, column_type).nullable());
        self
    }

    /// Add a NOT NULL foreign key.
    pub fn references(mut self, column: &str, table: &str) -> Self {
        self.foreign_keys.push(ForeignKey {
            column: column.to_string(),
            references: table.to_string(),
            nullable: false,
        });
        self
    }

    /// Add a nullable foreign key.
    pub fn optionally_references(mut self, column: &str, table: &str) -> Self {
        self.foreign_keys.push(ForeignKey {
            column: column.to_string(),
            references: table.to_string(),
            nullable: true,
        });
        self
    }

    /// Mark as a fixed-vocabulary table.
    pub fn fixed_vocabulary(mut self) -> Self {
        self.insertable = false;
        self
    }

    pub fn labde(mut self) -> Self {
        self.domain = TableDomain::LabDE;
        self
    }

    pub fn is_labde(&self) -> bool {
        self.domain == TableDomain::LabDE
    }

    /// Foreign keys pointing at another table.
    pub fn external_references(&self) -> impl Iterator<Item = &ForeignKey> {
        self.foreign_keys.iter().filter(move |fk| fk.references != self.name)
    }

    /// Foreign keys pointing back into this table (resolved in a second pass).
    pub fn self_references(&self) -> impl Iterator<Item = &ForeignKey> {
        self.foreign_keys.iter().filter(move |fk| fk.references == self.name)
    }

    pub fn has_self_references(&self) -> bool {
        self.self_references().next().is_some()
    }

    /// Columns written during staging and apply, in order: identity, data
    /// columns, then external foreign keys (as resolved surrogate keys).
    /// Self-references are excluded and written by the second pass.
    pub fn staged_columns(&self) -> Vec<&str> {
        std::iter::once(self.identity_column.as_str())
            .chain(self.columns.iter().map(|c| c.name.as_str()))
            .chain(self.external_references().map(|fk| fk.column.as_str()))
            .collect()
    }

    /// Name of the portable file for this table.
    pub fn file_name(&self) -> String {
        format!("{}.jsonl", self.name)
    }

    pub fn find_column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patient() -> TableDescriptor {
        TableDescriptor::new("labde_patient")
            .column("mrn", ColumnType::Text)
            .nullable_column("last_name", ColumnType::Text)
            .optionally_references("merged_into", "labde_patient")
            .labde()
    }

    #[test]
    fn test_self_references_are_split_out() {
        let table = patient();
        assert!(table.has_self_references());
        assert_eq!(table.external_references().count(), 0);
        assert_eq!(table.staged_columns(), vec!["guid", "mrn", "last_name"]);
    }

    #[test]
    fn test_staged_columns_order() {
        let table = TableDescriptor::new("action")
            .column("name", ColumnType::Text)
            .optionally_references("workflow_id", "workflow");
        assert_eq!(table.staged_columns(), vec!["guid", "name", "workflow_id"]);
        assert_eq!(table.file_name(), "action.jsonl");
        assert!(table.insertable);
        assert_eq!(table.domain, TableDomain::Core);
    }
}
