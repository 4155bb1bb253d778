//! Table descriptor registry.
//!
//! The registry owns every migratable [`TableDescriptor`] and hands them out
//! in dependency order: a referenced table always comes before the tables
//! that reference it, so the importer has the referenced identity map ready
//! when it reaches a referencing table.
//!
//! All structural problems (unknown references, cycles, required
//! self-references, Core tables depending on the optional LabDE subset) are
//! detected when the registry is built, never in the middle of an import.

mod catalog;

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::core::identifier::validate_identifier;
use crate::core::schema::{TableDescriptor, TableDomain};
use crate::error::{MigrateError, Result};

pub use catalog::standard_tables;

/// Validated, dependency-ordered catalogue of migratable tables.
#[derive(Debug, Clone)]
pub struct Registry {
    /// Core tables in dependency order, followed by LabDE tables in dependency order.
    tables: Vec<TableDescriptor>,
    index: HashMap<String, usize>,
    core_len: usize,
}

impl Registry {
    /// Validate `descriptors` and order them.
    pub fn new(descriptors: Vec<TableDescriptor>) -> Result<Self> {
        validate(&descriptors)?;

        let (core, labde): (Vec<_>, Vec<_>) = descriptors
            .into_iter()
            .partition(|t| t.domain == TableDomain::Core);

        let core = dependency_order(core)?;
        let labde = dependency_order(labde)?;
        let core_len = core.len();

        let tables: Vec<TableDescriptor> = core.into_iter().chain(labde).collect();
        let index = tables
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), i))
            .collect();

        debug!(
            "Table registry: {} core tables, {} LabDE tables",
            core_len,
            tables.len() - core_len
        );

        Ok(Self {
            tables,
            index,
            core_len,
        })
    }

    /// The built-in catalogue.
    pub fn standard() -> Result<Self> {
        Self::new(standard_tables())
    }

    /// Look up a descriptor by table name.
    pub fn get(&self, name: &str) -> Option<&TableDescriptor> {
        self.index.get(name).map(|&i| &self.tables[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Non-LabDE tables in dependency order.
    pub fn core_tables(&self) -> &[TableDescriptor] {
        &self.tables[..self.core_len]
    }

    /// LabDE tables in dependency order.
    pub fn labde_tables(&self) -> &[TableDescriptor] {
        &self.tables[self.core_len..]
    }

    /// Tables in import order, optionally including the LabDE subset.
    pub fn ordered(&self, include_labde: bool) -> &[TableDescriptor] {
        if include_labde {
            &self.tables
        } else {
            self.core_tables()
        }
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

fn validate(descriptors: &[TableDescriptor]) -> Result<()> {
    let mut domains: HashMap<&str, TableDomain> = HashMap::new();
    for table in descriptors {
        validate_identifier(&table.name)?;
        if domains.insert(table.name.as_str(), table.domain).is_some() {
            return Err(MigrateError::Config(format!(
                "Table '{}' is registered twice",
                table.name
            )));
        }
    }

    for table in descriptors {
        let mut seen = HashSet::new();
        let names = [table.key_column.as_str(), table.identity_column.as_str()]
            .into_iter()
            .chain(table.columns.iter().map(|c| c.name.as_str()))
            .chain(table.foreign_keys.iter().map(|fk| fk.column.as_str()));
        for name in names {
            validate_identifier(name)?;
            if !seen.insert(name) {
                return Err(MigrateError::Config(format!(
                    "Column '{}' is declared more than once in table '{}'",
                    name, table.name
                )));
            }
        }

        for fk in &table.foreign_keys {
            let Some(&referenced_domain) = domains.get(fk.references.as_str()) else {
                return Err(MigrateError::Config(format!(
                    "{}.{} references unknown table '{}'",
                    table.name, fk.column, fk.references
                )));
            };

            if fk.references == table.name && !fk.nullable {
                return Err(MigrateError::Config(format!(
                    "Self-reference {}.{} must be nullable",
                    table.name, fk.column
                )));
            }

            if table.domain == TableDomain::Core && referenced_domain == TableDomain::LabDE {
                return Err(MigrateError::Config(format!(
                    "Core table '{}' cannot reference LabDE table '{}'",
                    table.name, fk.references
                )));
            }
        }
    }

    Ok(())
}

/// Stable topological sort: keeps declaration order wherever dependencies allow.
///
/// References to tables outside `tables` (Core tables referenced from LabDE)
/// are already satisfied.
fn dependency_order(tables: Vec<TableDescriptor>) -> Result<Vec<TableDescriptor>> {
    let members: HashSet<String> = tables.iter().map(|t| t.name.clone()).collect();
    let mut placed: HashSet<String> = HashSet::new();
    let mut pending = tables;
    let mut ordered = Vec::with_capacity(pending.len());

    while !pending.is_empty() {
        let ready = pending.iter().position(|t| {
            t.external_references()
                .all(|fk| !members.contains(&fk.references) || placed.contains(&fk.references))
        });

        match ready {
            Some(i) => {
                let table = pending.remove(i);
                placed.insert(table.name.clone());
                ordered.push(table);
            }
            None => {
                let names: Vec<&str> = pending.iter().map(|t| t.name.as_str()).collect();
                return Err(MigrateError::Config(format!(
                    "Foreign key cycle between tables: {}",
                    names.join(", ")
                )));
            }
        }
    }

    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::ColumnType;

    fn position(registry: &Registry, name: &str) -> usize {
        registry
            .ordered(true)
            .iter()
            .position(|t| t.name == name)
            .unwrap()
    }

    #[test]
    fn test_standard_registry_is_valid() {
        let registry = Registry::standard().unwrap();
        assert!(!registry.is_empty());
        assert!(registry.get("db_info").is_some());
        assert!(!registry.get("db_info").unwrap().insertable);
        assert!(registry.labde_tables().iter().all(|t| t.domain == TableDomain::LabDE));
        assert!(registry.core_tables().iter().all(|t| t.domain == TableDomain::Core));
    }

    #[test]
    fn test_standard_registry_dependency_order() {
        let registry = Registry::standard().unwrap();
        for (i, table) in registry.ordered(true).iter().enumerate() {
            for fk in table.external_references() {
                assert!(
                    position(&registry, &fk.references) < i,
                    "{} must come after {}",
                    table.name,
                    fk.references
                );
            }
        }
    }

    #[test]
    fn test_ordered_excludes_labde() {
        let registry = Registry::standard().unwrap();
        let core = registry.ordered(false);
        assert_eq!(core.len(), registry.core_tables().len());
        assert!(core.iter().all(|t| !t.name.starts_with("labde_")));
    }

    #[test]
    fn test_declaration_order_kept_when_possible() {
        let registry = Registry::new(vec![
            TableDescriptor::new("child").references("parent_id", "parent"),
            TableDescriptor::new("zebra"),
            TableDescriptor::new("parent"),
        ])
        .unwrap();
        let names: Vec<&str> = registry.ordered(true).iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["zebra", "parent", "child"]);
    }

    #[test]
    fn test_unknown_reference_is_config_error() {
        let err = Registry::new(vec![
            TableDescriptor::new("action").references("workflow_id", "workflow")
        ])
        .unwrap_err();
        assert!(matches!(err, MigrateError::Config(msg) if msg.contains("unknown table")));
    }

    #[test]
    fn test_cycle_is_config_error() {
        let err = Registry::new(vec![
            TableDescriptor::new("a").references("b_id", "b"),
            TableDescriptor::new("b").optionally_references("a_id", "a"),
        ])
        .unwrap_err();
        assert!(matches!(err, MigrateError::Config(msg) if msg.contains("cycle")));
    }

    #[test]
    fn test_required_self_reference_rejected() {
        let err = Registry::new(vec![TableDescriptor::new("node").references("parent_id", "node")])
            .unwrap_err();
        assert!(matches!(err, MigrateError::Config(msg) if msg.contains("nullable")));
    }

    #[test]
    fn test_core_cannot_depend_on_labde() {
        let err = Registry::new(vec![
            TableDescriptor::new("labde_patient").labde(),
            TableDescriptor::new("dashboard").references("patient_id", "labde_patient"),
        ])
        .unwrap_err();
        assert!(matches!(err, MigrateError::Config(_)));
    }

    #[test]
    fn test_duplicate_column_rejected() {
        let err = Registry::new(vec![TableDescriptor::new("tag")
            .column("name", ColumnType::Text)
            .column("name", ColumnType::Text)])
        .unwrap_err();
        assert!(matches!(err, MigrateError::Config(_)));
    }

    #[test]
    fn test_duplicate_table_rejected() {
        let err = Registry::new(vec![TableDescriptor::new("tag"), TableDescriptor::new("tag")])
            .unwrap_err();
        assert!(matches!(err, MigrateError::Config(msg) if msg.contains("twice")));
    }
}
