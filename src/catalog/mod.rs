//! Catalog: the persisted and in-memory directory of tables, indexes and
//! sequences.
//!
//! Every catalog object is stored as one rmp-encoded entry in the
//! `__chai_catalog` namespace and mirrored into an in-memory [`Catalog`]
//! built on persistent maps. Each transaction works against its own catalog
//! snapshot; DDL goes through [`CatalogWriter`], which updates the persisted
//! entry and the snapshot together under the transaction's batch, so a
//! rollback discards both.

pub mod schema;

use crate::encoding::prefix_successor;
use crate::error::{CatalogKind, Error, Result};
use crate::kv::{IterOptions, Session};
use parking_lot::Mutex;
use self::schema::{IndexInfo, SequenceInfo, TableInfo};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

pub const CATALOG_NAMESPACE: &str = "__chai_catalog";

// ---------------------------------------------------------------------------
// Key namespaces. Every object kind gets its own prefix with an explicit
// delimiter, so no two kinds can collide.

pub fn table_prefix(table: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(table.len() + 7);
    key.extend_from_slice(b"table:");
    key.extend_from_slice(table.as_bytes());
    key.push(b'/');
    key
}

pub fn row_key(table: &str, pk: &[u8]) -> Vec<u8> {
    let mut key = table_prefix(table);
    key.extend_from_slice(pk);
    key
}

pub fn index_prefix(index: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(index.len() + 7);
    key.extend_from_slice(b"index:");
    key.extend_from_slice(index.as_bytes());
    key.push(b'/');
    key
}

pub fn sequence_value_key(sequence: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(sequence.len() + 9);
    key.extend_from_slice(b"sequence:");
    key.extend_from_slice(sequence.as_bytes());
    key
}

fn catalog_entry_key(kind: CatalogKind, name: &str) -> Vec<u8> {
    let tag = match kind {
        CatalogKind::Table => "table",
        CatalogKind::Index => "index",
        CatalogKind::Sequence => "sequence",
    };
    format!("{CATALOG_NAMESPACE}/{tag}:{name}").into_bytes()
}

fn catalog_namespace_bounds() -> (Vec<u8>, Vec<u8>) {
    let lower = format!("{CATALOG_NAMESPACE}/").into_bytes();
    let upper = prefix_successor(&lower).expect("catalog prefix has a successor");
    (lower, upper)
}

/// One persisted catalog row. The external parser owns SQL text, so replay
/// stores the structured info rather than source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CatalogEntry {
    Table(TableInfo),
    Index(IndexInfo),
    Sequence(SequenceInfo),
}

impl CatalogEntry {
    pub fn kind(&self) -> CatalogKind {
        match self {
            CatalogEntry::Table(_) => CatalogKind::Table,
            CatalogEntry::Index(_) => CatalogKind::Index,
            CatalogEntry::Sequence(_) => CatalogKind::Sequence,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            CatalogEntry::Table(info) => &info.name,
            CatalogEntry::Index(info) => &info.name,
            CatalogEntry::Sequence(info) => &info.name,
        }
    }

    pub fn owner_table(&self) -> Option<&str> {
        match self {
            CatalogEntry::Table(_) => None,
            CatalogEntry::Index(info) => Some(&info.table),
            CatalogEntry::Sequence(info) => info.owner_table.as_deref(),
        }
    }

    fn encode(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|e| Error::Encode(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| Error::Decode(e.to_string()))
    }
}

/// In-memory catalog snapshot. Cloning is cheap (persistent maps), which is
/// what makes per-transaction copy-on-write snapshots viable.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    tables: im::HashMap<String, Arc<TableInfo>>,
    indexes: im::HashMap<String, Arc<IndexInfo>>,
    sequences: im::HashMap<String, Arc<SequenceInfo>>,
}

impl Catalog {
    /// Loads the catalog namespace from the given session.
    pub fn load(session: &dyn Session) -> Result<Self> {
        let (lower, upper) = catalog_namespace_bounds();
        let mut cursor = session.cursor(IterOptions {
            lower: Some(lower),
            upper: Some(upper),
        })?;
        let mut catalog = Catalog::default();
        cursor.seek_first();
        while cursor.valid() {
            let bytes = cursor.value().expect("valid cursor has a value");
            match CatalogEntry::decode(bytes)? {
                CatalogEntry::Table(info) => {
                    catalog.tables.insert(info.name.clone(), Arc::new(info));
                }
                CatalogEntry::Index(info) => {
                    catalog.indexes.insert(info.name.clone(), Arc::new(info));
                }
                CatalogEntry::Sequence(info) => {
                    catalog.sequences.insert(info.name.clone(), Arc::new(info));
                }
            }
            cursor.next();
        }
        Ok(catalog)
    }

    pub fn get_table(&self, name: &str) -> Result<Arc<TableInfo>> {
        self.tables
            .get(name)
            .cloned()
            .ok_or_else(|| Error::CatalogNotFound {
                kind: CatalogKind::Table,
                name: name.to_string(),
            })
    }

    pub fn get_index(&self, name: &str) -> Result<Arc<IndexInfo>> {
        self.indexes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::CatalogNotFound {
                kind: CatalogKind::Index,
                name: name.to_string(),
            })
    }

    pub fn get_sequence(&self, name: &str) -> Result<Arc<SequenceInfo>> {
        self.sequences
            .get(name)
            .cloned()
            .ok_or_else(|| Error::CatalogNotFound {
                kind: CatalogKind::Sequence,
                name: name.to_string(),
            })
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn index_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.indexes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Indexes declared on `table`, in name order (deterministic for the
    /// planner and for index maintenance pipelines).
    pub fn table_indexes(&self, table: &str) -> Vec<Arc<IndexInfo>> {
        let mut found: Vec<Arc<IndexInfo>> = self
            .indexes
            .values()
            .filter(|idx| idx.table == table)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        found
    }

    /// Schema-dump companion entries for one table: its indexes, plus
    /// sequences that have no owner.
    pub fn schema_entries(&self, table: &str) -> Vec<CatalogEntry> {
        let mut entries: Vec<CatalogEntry> = self
            .table_indexes(table)
            .into_iter()
            .map(|idx| CatalogEntry::Index((*idx).clone()))
            .collect();
        let mut loose: Vec<Arc<SequenceInfo>> = self
            .sequences
            .values()
            .filter(|seq| seq.owner_table.is_none())
            .cloned()
            .collect();
        loose.sort_by(|a, b| a.name.cmp(&b.name));
        entries.extend(loose.into_iter().map(|seq| CatalogEntry::Sequence((*seq).clone())));
        entries
    }
}

/// DDL writer: mutates the persisted catalog namespace and the transaction's
/// in-memory snapshot together, under the transaction's batch session.
pub struct CatalogWriter<'a> {
    session: &'a dyn Session,
    catalog: &'a Mutex<Catalog>,
}

impl<'a> CatalogWriter<'a> {
    pub fn new(session: &'a dyn Session, catalog: &'a Mutex<Catalog>) -> Self {
        Self { session, catalog }
    }

    fn persist(&self, entry: &CatalogEntry) -> Result<()> {
        let key = catalog_entry_key(entry.kind(), entry.name());
        self.session.put(&key, &entry.encode()?)
    }

    fn unpersist(&self, kind: CatalogKind, name: &str) -> Result<()> {
        self.session.delete(&catalog_entry_key(kind, name))
    }

    /// Returns false when `if_not_exists` suppressed an existing object.
    pub fn create_table(&self, info: TableInfo, if_not_exists: bool) -> Result<bool> {
        let mut catalog = self.catalog.lock();
        if catalog.tables.contains_key(&info.name) {
            if if_not_exists {
                return Ok(false);
            }
            return Err(Error::CatalogAlreadyExists {
                kind: CatalogKind::Table,
                name: info.name,
            });
        }
        debug!(table = %info.name, "create table");
        self.persist(&CatalogEntry::Table(info.clone()))?;
        catalog.tables.insert(info.name.clone(), Arc::new(info));
        Ok(true)
    }

    pub fn create_index(&self, info: IndexInfo, if_not_exists: bool) -> Result<bool> {
        let mut catalog = self.catalog.lock();
        catalog.get_table(&info.table)?;
        if catalog.indexes.contains_key(&info.name) {
            if if_not_exists {
                return Ok(false);
            }
            return Err(Error::CatalogAlreadyExists {
                kind: CatalogKind::Index,
                name: info.name,
            });
        }
        debug!(index = %info.name, table = %info.table, "create index");
        self.persist(&CatalogEntry::Index(info.clone()))?;
        catalog.indexes.insert(info.name.clone(), Arc::new(info));
        Ok(true)
    }

    pub fn create_sequence(&self, info: SequenceInfo, if_not_exists: bool) -> Result<bool> {
        let mut catalog = self.catalog.lock();
        if catalog.sequences.contains_key(&info.name) {
            if if_not_exists {
                return Ok(false);
            }
            return Err(Error::CatalogAlreadyExists {
                kind: CatalogKind::Sequence,
                name: info.name,
            });
        }
        debug!(sequence = %info.name, "create sequence");
        self.persist(&CatalogEntry::Sequence(info.clone()))?;
        catalog.sequences.insert(info.name.clone(), Arc::new(info));
        Ok(true)
    }

    pub fn drop_table(&self, name: &str, if_exists: bool) -> Result<bool> {
        let info = {
            let catalog = self.catalog.lock();
            match catalog.get_table(name) {
                Ok(info) => info,
                Err(_) if if_exists => return Ok(false),
                Err(err) => return Err(err),
            }
        };
        debug!(table = %name, "drop table");
        // Owned indexes go first, then the rows, then the rowid sequence.
        let owned: Vec<String> = {
            let catalog = self.catalog.lock();
            catalog
                .table_indexes(name)
                .into_iter()
                .map(|idx| idx.name.clone())
                .collect()
        };
        for index in owned {
            self.drop_index(&index, false)?;
        }
        let prefix = table_prefix(name);
        if let Some(upper) = prefix_successor(&prefix) {
            self.session.delete_range(&prefix, &upper)?;
        }
        if let Some(sequence) = &info.rowid_sequence {
            self.drop_sequence(sequence, true)?;
        }
        self.unpersist(CatalogKind::Table, name)?;
        self.catalog.lock().tables.remove(name);
        Ok(true)
    }

    pub fn drop_index(&self, name: &str, if_exists: bool) -> Result<bool> {
        {
            let catalog = self.catalog.lock();
            if let Err(err) = catalog.get_index(name) {
                if if_exists {
                    return Ok(false);
                }
                return Err(err);
            }
        }
        debug!(index = %name, "drop index");
        let prefix = index_prefix(name);
        if let Some(upper) = prefix_successor(&prefix) {
            self.session.delete_range(&prefix, &upper)?;
        }
        self.unpersist(CatalogKind::Index, name)?;
        self.catalog.lock().indexes.remove(name);
        Ok(true)
    }

    pub fn drop_sequence(&self, name: &str, if_exists: bool) -> Result<bool> {
        {
            let catalog = self.catalog.lock();
            if let Err(err) = catalog.get_sequence(name) {
                if if_exists {
                    return Ok(false);
                }
                return Err(err);
            }
        }
        debug!(sequence = %name, "drop sequence");
        // The current-value key only exists once the sequence was bumped.
        match self.session.delete(&sequence_value_key(name)) {
            Ok(()) | Err(Error::KeyNotFound) => {}
            Err(err) => return Err(err),
        }
        self.unpersist(CatalogKind::Sequence, name)?;
        self.catalog.lock().sequences.remove(name);
        Ok(true)
    }

    /// Renames a table, moving its rows to the new key namespace and
    /// repointing owned indexes and sequences.
    pub fn rename_table(&self, old: &str, new: &str) -> Result<()> {
        let info = self.catalog.lock().get_table(old)?;
        if self.catalog.lock().tables.contains_key(new) {
            return Err(Error::CatalogAlreadyExists {
                kind: CatalogKind::Table,
                name: new.to_string(),
            });
        }
        debug!(from = %old, to = %new, "rename table");

        let old_prefix = table_prefix(old);
        let upper = prefix_successor(&old_prefix)
            .ok_or_else(|| Error::Encode("table prefix has no successor".into()))?;
        let mut moved: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        let mut cursor = self.session.cursor(IterOptions {
            lower: Some(old_prefix.clone()),
            upper: Some(upper.clone()),
        })?;
        cursor.seek_first();
        while cursor.valid() {
            let key = cursor.key().expect("valid cursor has a key");
            let pk = key[old_prefix.len()..].to_vec();
            moved.push((pk, cursor.value().expect("valid cursor has a value").to_vec()));
            cursor.next();
        }
        self.session.delete_range(&old_prefix, &upper)?;
        for (pk, value) in moved {
            self.session.put(&row_key(new, &pk), &value)?;
        }

        let mut renamed = (*info).clone();
        renamed.name = new.to_string();
        self.unpersist(CatalogKind::Table, old)?;
        self.persist(&CatalogEntry::Table(renamed.clone()))?;

        let mut catalog = self.catalog.lock();
        catalog.tables.remove(old);
        catalog.tables.insert(new.to_string(), Arc::new(renamed));

        let repointed: Vec<Arc<IndexInfo>> = catalog.table_indexes(old);
        for index in repointed {
            let mut updated = (*index).clone();
            updated.table = new.to_string();
            self.persist(&CatalogEntry::Index(updated.clone()))?;
            catalog.indexes.insert(updated.name.clone(), Arc::new(updated));
        }
        let owned_sequences: Vec<Arc<SequenceInfo>> = catalog
            .sequences
            .values()
            .filter(|seq| seq.owner_table.as_deref() == Some(old))
            .cloned()
            .collect();
        for sequence in owned_sequences {
            let mut updated = (*sequence).clone();
            updated.owner_table = Some(new.to_string());
            self.persist(&CatalogEntry::Sequence(updated.clone()))?;
            catalog
                .sequences
                .insert(updated.name.clone(), Arc::new(updated));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Catalog, CatalogWriter, schema::TableInfo};
    use crate::error::Error;
    use crate::kv::{Engine, MemoryEngine};
    use parking_lot::Mutex;

    #[test]
    fn create_table_round_trips_through_the_store() {
        let engine = MemoryEngine::new();
        let batch = engine.batch_session();
        let catalog = Mutex::new(Catalog::default());
        let writer = CatalogWriter::new(batch.as_ref(), &catalog);
        assert!(writer.create_table(TableInfo::new("users"), false).unwrap());
        batch.commit().unwrap();

        let snapshot = engine.snapshot_session();
        let reloaded = Catalog::load(snapshot.as_ref()).unwrap();
        assert!(reloaded.get_table("users").is_ok());
        assert_eq!(reloaded.table_names(), vec!["users"]);
    }

    #[test]
    fn create_twice_fails_unless_if_not_exists() {
        let engine = MemoryEngine::new();
        let batch = engine.batch_session();
        let catalog = Mutex::new(Catalog::default());
        let writer = CatalogWriter::new(batch.as_ref(), &catalog);
        writer.create_table(TableInfo::new("t"), false).unwrap();
        assert!(matches!(
            writer.create_table(TableInfo::new("t"), false),
            Err(Error::CatalogAlreadyExists { .. })
        ));
        assert!(!writer.create_table(TableInfo::new("t"), true).unwrap());
        batch.rollback().unwrap();
    }

    #[test]
    fn rolled_back_ddl_is_invisible() {
        let engine = MemoryEngine::new();
        {
            let batch = engine.batch_session();
            let catalog = Mutex::new(Catalog::default());
            let writer = CatalogWriter::new(batch.as_ref(), &catalog);
            writer.create_table(TableInfo::new("ghost"), false).unwrap();
            batch.rollback().unwrap();
        }
        let snapshot = engine.snapshot_session();
        let reloaded = Catalog::load(snapshot.as_ref()).unwrap();
        assert!(reloaded.get_table("ghost").is_err());
    }
}
