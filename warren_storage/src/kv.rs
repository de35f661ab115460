use std::{
    collections::{BTreeMap, HashMap},
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use parking_lot::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage encoding failure: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// The storage engine surface: named tables of ordered string keys.
///
/// `put` must only return once the write is committed; `delete` is
/// idempotent. Iteration yields keys in ascending order.
pub trait KvStore: Send + Sync + 'static {
    fn get(&self, table: &str, key: &str) -> crate::Result<Option<Vec<u8>>>;
    fn put(&self, table: &str, key: &str, value: &[u8]) -> crate::Result<()>;
    fn delete(&self, table: &str, key: &str) -> crate::Result<()>;
    /// All entries of `table` whose key starts with `prefix`, ascending.
    fn iter_prefix(&self, table: &str, prefix: &str) -> crate::Result<Vec<(String, Vec<u8>)>>;
}

type Tables = HashMap<String, BTreeMap<String, Vec<u8>>>;

fn prefix_entries(tables: &Tables, table: &str, prefix: &str) -> Vec<(String, Vec<u8>)> {
    match tables.get(table) {
        Some(entries) => entries
            .range(prefix.to_owned()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
        None => Vec::new(),
    }
}

/// Process-local engine. State dies with the process; useful for tests and
/// for running without a persistent engine configured.
#[derive(Debug, Default)]
pub struct MemoryKv {
    tables: RwLock<Tables>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, table: &str, key: &str) -> crate::Result<Option<Vec<u8>>> {
        Ok(self
            .tables
            .read()
            .get(table)
            .and_then(|entries| entries.get(key).cloned()))
    }

    fn put(&self, table: &str, key: &str, value: &[u8]) -> crate::Result<()> {
        self.tables
            .write()
            .entry(table.to_owned())
            .or_default()
            .insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    fn delete(&self, table: &str, key: &str) -> crate::Result<()> {
        if let Some(entries) = self.tables.write().get_mut(table) {
            entries.remove(key);
        }
        Ok(())
    }

    fn iter_prefix(&self, table: &str, prefix: &str) -> crate::Result<Vec<(String, Vec<u8>)>> {
        Ok(prefix_entries(&self.tables.read(), table, prefix))
    }
}

/// Engine persisting the table map as one JSON document, committed through
/// a temp-file rename on every mutation. Slow but crash-safe; good enough
/// for a single node without an external engine.
#[derive(Debug)]
pub struct FileKv {
    path: PathBuf,
    tables: RwLock<Tables>,
}

impl FileKv {
    pub fn open(path: impl Into<PathBuf>) -> crate::Result<Self> {
        let path = path.into();
        let tables = match fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Tables::default(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            tables: RwLock::new(tables),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn commit(&self, tables: &Tables) -> crate::Result<()> {
        let raw = serde_json::to_vec(tables)?;
        let tmp = self.path.with_extension("tmp");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&raw)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KvStore for FileKv {
    fn get(&self, table: &str, key: &str) -> crate::Result<Option<Vec<u8>>> {
        Ok(self
            .tables
            .read()
            .get(table)
            .and_then(|entries| entries.get(key).cloned()))
    }

    fn put(&self, table: &str, key: &str, value: &[u8]) -> crate::Result<()> {
        let mut tables = self.tables.write();
        tables
            .entry(table.to_owned())
            .or_default()
            .insert(key.to_owned(), value.to_vec());
        self.commit(&tables)
    }

    fn delete(&self, table: &str, key: &str) -> crate::Result<()> {
        let mut tables = self.tables.write();
        let removed = match tables.get_mut(table) {
            Some(entries) => entries.remove(key).is_some(),
            None => false,
        };
        if removed {
            self.commit(&tables)?;
        }
        Ok(())
    }

    fn iter_prefix(&self, table: &str, prefix: &str) -> crate::Result<Vec<(String, Vec<u8>)>> {
        Ok(prefix_entries(&self.tables.read(), table, prefix))
    }
}
