//! Session-scoped identity maps.
//!
//! For every table reconciled in an import session, an [`IdentityMap`]
//! records which destination surrogate key each durable identity ended up
//! with. Tables later in dependency order resolve their foreign keys
//! through these maps. Maps live only as long as the session.

use std::collections::HashMap;

use uuid::Uuid;

use crate::core::schema::{ForeignKey, TableDescriptor};
use crate::core::traits::IdentityKey;
use crate::error::{MigrateError, Result};

/// Durable identity to destination surrogate key, for one table.
#[derive(Debug, Clone, Default)]
pub struct IdentityMap {
    entries: HashMap<Uuid, i64>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, identity: Uuid, key: i64) -> Option<i64> {
        self.entries.insert(identity, key)
    }

    pub fn get(&self, identity: &Uuid) -> Option<i64> {
        self.entries.get(identity).copied()
    }

    pub fn contains(&self, identity: &Uuid) -> bool {
        self.entries.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Extend<IdentityKey> for IdentityMap {
    fn extend<I: IntoIterator<Item = IdentityKey>>(&mut self, iter: I) {
        self.entries.extend(iter);
    }
}

impl FromIterator<IdentityKey> for IdentityMap {
    fn from_iter<I: IntoIterator<Item = IdentityKey>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// All identity maps of one import session, by table name.
#[derive(Debug, Default)]
pub struct IdentityMaps {
    maps: HashMap<String, IdentityMap>,
}

impl IdentityMaps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, table: &str) -> Option<&IdentityMap> {
        self.maps.get(table)
    }

    pub fn contains_table(&self, table: &str) -> bool {
        self.maps.contains_key(table)
    }

    /// The map for `table`, created empty on first use.
    pub fn table_mut(&mut self, table: &str) -> &mut IdentityMap {
        self.maps.entry(table.to_string()).or_default()
    }

    pub fn insert_table(&mut self, table: &str, map: IdentityMap) {
        self.maps.insert(table.to_string(), map);
    }

    /// Destination key for a foreign key value of a record in `table`.
    ///
    /// `record` is the identity of the referencing record, used for the
    /// error message only.
    pub fn resolve(
        &self,
        table: &TableDescriptor,
        fk: &ForeignKey,
        record: Uuid,
        reference: Uuid,
    ) -> Result<i64> {
        self.maps
            .get(&fk.references)
            .and_then(|m| m.get(&reference))
            .ok_or_else(|| MigrateError::UnresolvedReference {
                table: table.name.clone(),
                column: fk.column.clone(),
                identity: record,
                referenced_table: fk.references.clone(),
                reference,
            })
    }

    pub fn tables(&self) -> impl Iterator<Item = (&str, &IdentityMap)> {
        self.maps.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_through_referenced_map() {
        let action = TableDescriptor::new("action").references("workflow_id", "workflow");
        let fk = &action.foreign_keys[0];
        let wf = Uuid::new_v4();
        let record = Uuid::new_v4();

        let mut maps = IdentityMaps::new();
        maps.table_mut("workflow").insert(wf, 42);

        assert_eq!(maps.resolve(&action, fk, record, wf).unwrap(), 42);

        let missing = Uuid::new_v4();
        match maps.resolve(&action, fk, record, missing).unwrap_err() {
            MigrateError::UnresolvedReference { table, column, identity, reference, .. } => {
                assert_eq!(table, "action");
                assert_eq!(column, "workflow_id");
                assert_eq!(identity, record);
                assert_eq!(reference, missing);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_missing_map_is_unresolved() {
        let action = TableDescriptor::new("action").references("workflow_id", "workflow");
        let maps = IdentityMaps::new();
        assert!(maps
            .resolve(&action, &action.foreign_keys[0], Uuid::new_v4(), Uuid::new_v4())
            .is_err());
    }

    #[test]
    fn test_extend_and_collect() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut map: IdentityMap = vec![(a, 1)].into_iter().collect();
        map.extend(vec![(b, 2), (a, 3)]);
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&a), Some(3));
        assert!(map.contains(&b));
    }
}
