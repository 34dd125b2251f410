//! Embedded redb-backed store: one file, two tables (`servers`, `leases`),
//! id -> JSON. Generic get/put/delete/for_each primitives plus raw
//! view/update access for repositories that need multi-key transactions
//! (e.g. allocator's "find a free IP and claim it" check-then-write).
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};

use crate::error::{IgniteError, Result};

pub(crate) const SERVERS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("servers");
pub(crate) const LEASES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("leases");

/// Thin, cloneable handle to the on-disk database.
#[derive(Clone)]
pub struct Db {
    inner: Arc<Database>,
}

impl Db {
    /// Opens (creating if absent) the database at `path` and ensures both
    /// buckets exist.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| IgniteError::Io {
                    op: format!("create_dir_all({})", parent.display()),
                    source: e,
                })?;
            }
        }
        let db = Database::create(path).map_err(|e| IgniteError::store("open database", e))?;

        let write_txn = db
            .begin_write()
            .map_err(|e| IgniteError::store("init tables", e))?;
        {
            let _ = write_txn
                .open_table(SERVERS_TABLE)
                .map_err(|e| IgniteError::store("init servers table", e))?;
            let _ = write_txn
                .open_table(LEASES_TABLE)
                .map_err(|e| IgniteError::store("init leases table", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| IgniteError::store("init tables", e))?;

        Ok(Self {
            inner: Arc::new(db),
        })
    }

    /// Opens an in-memory-backed database file in a temp dir; used by tests
    /// that want the real redb code path without touching a fixed path.
    #[cfg(test)]
    pub fn open_temp() -> (Self, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Self::open(&dir.path().join("ignite.redb")).expect("open temp db");
        (db, dir)
    }

    pub fn get(&self, table: TableDefinition<&str, &str>, key: &str) -> Result<Option<String>> {
        let read_txn = self
            .inner
            .begin_read()
            .map_err(|e| IgniteError::store("begin_read", e))?;
        let t = read_txn
            .open_table(table)
            .map_err(|e| IgniteError::store("open_table", e))?;
        match t.get(key).map_err(|e| IgniteError::store("get", e))? {
            Some(v) => Ok(Some(v.value().to_string())),
            None => Ok(None),
        }
    }

    pub fn put(&self, table: TableDefinition<&str, &str>, key: &str, value: &str) -> Result<()> {
        let write_txn = self
            .inner
            .begin_write()
            .map_err(|e| IgniteError::store("begin_write", e))?;
        {
            let mut t = write_txn
                .open_table(table)
                .map_err(|e| IgniteError::store("open_table", e))?;
            t.insert(key, value)
                .map_err(|e| IgniteError::store("insert", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| IgniteError::store("commit", e))?;
        Ok(())
    }

    pub fn delete(&self, table: TableDefinition<&str, &str>, key: &str) -> Result<()> {
        let write_txn = self
            .inner
            .begin_write()
            .map_err(|e| IgniteError::store("begin_write", e))?;
        {
            let mut t = write_txn
                .open_table(table)
                .map_err(|e| IgniteError::store("open_table", e))?;
            t.remove(key).map_err(|e| IgniteError::store("remove", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| IgniteError::store("commit", e))?;
        Ok(())
    }

    /// Snapshot of every `(key, value)` pair in `table` at a single point
    /// in time. Used by repositories for the linear-scan secondary lookups.
    pub fn for_each(&self, table: TableDefinition<&str, &str>) -> Result<Vec<(String, String)>> {
        let read_txn = self
            .inner
            .begin_read()
            .map_err(|e| IgniteError::store("begin_read", e))?;
        let t = read_txn
            .open_table(table)
            .map_err(|e| IgniteError::store("open_table", e))?;
        let mut out = Vec::new();
        for entry in t.iter().map_err(|e| IgniteError::store("iter", e))? {
            let (k, v) = entry.map_err(|e| IgniteError::store("iter entry", e))?;
            out.push((k.value().to_string(), v.value().to_string()));
        }
        Ok(out)
    }

    /// Runs `f` inside a single write transaction covering both tables,
    /// committing iff `f` returns `Ok`. Used by the allocator so the
    /// "scan for a free IP" and "insert the claimed lease" steps are
    /// atomic with respect to other writers.
    pub fn update<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&redb::WriteTransaction) -> Result<T>,
    {
        let write_txn = self
            .inner
            .begin_write()
            .map_err(|e| IgniteError::store("begin_write", e))?;
        let result = f(&write_txn)?;
        write_txn
            .commit()
            .map_err(|e| IgniteError::store("commit", e))?;
        Ok(result)
    }

    /// Runs `f` inside a single read transaction covering both tables, for
    /// callers that need a consistent snapshot across more than one table.
    pub fn view<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&redb::ReadTransaction) -> Result<T>,
    {
        let read_txn = self
            .inner
            .begin_read()
            .map_err(|e| IgniteError::store("begin_read", e))?;
        f(&read_txn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete_round_trip() {
        let (db, _dir) = Db::open_temp();
        db.put(SERVERS_TABLE, "a", "{}").unwrap();
        assert_eq!(db.get(SERVERS_TABLE, "a").unwrap().as_deref(), Some("{}"));
        db.delete(SERVERS_TABLE, "a").unwrap();
        assert_eq!(db.get(SERVERS_TABLE, "a").unwrap(), None);
    }

    #[test]
    fn for_each_returns_all_entries() {
        let (db, _dir) = Db::open_temp();
        db.put(LEASES_TABLE, "one", "1").unwrap();
        db.put(LEASES_TABLE, "two", "2").unwrap();
        let mut all = db.for_each(LEASES_TABLE).unwrap();
        all.sort();
        assert_eq!(
            all,
            vec![("one".to_string(), "1".to_string()), ("two".to_string(), "2".to_string())]
        );
    }

    #[test]
    fn reopen_preserves_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ignite.redb");
        {
            let db = Db::open(&path).unwrap();
            db.put(SERVERS_TABLE, "a", "{}").unwrap();
        }
        let db = Db::open(&path).unwrap();
        assert_eq!(db.get(SERVERS_TABLE, "a").unwrap().as_deref(), Some("{}"));
    }
}
