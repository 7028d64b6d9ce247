use std::collections::{BTreeMap, HashMap};

use super::{Store, StoreError, StoredValue};

type Namespace = BTreeMap<String, StoredValue>;

/// Volatile store. Staged writes and committed state are kept apart so a
/// failed commit is observable the same way as with a durable store.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    committed: HashMap<String, Namespace>,
    staged: HashMap<String, Namespace>,
    read_only: bool,
    failing_commits: usize,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    /// While set, every `set`, `erase_namespace` and `commit` fails.
    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    /// The next `count` commits fail with [`StoreError::ReadOnly`] while
    /// staging keeps working.
    pub fn fail_commits(&mut self, count: usize) {
        self.failing_commits = count;
    }

    pub fn remove(&mut self, namespace: &str, key: &str) {
        for map in [&mut self.committed, &mut self.staged] {
            if let Some(ns) = map.get_mut(namespace) {
                ns.remove(key);
            }
        }
    }

    fn writable(&self) -> Result<(), StoreError> {
        match self.read_only {
            true => Err(StoreError::ReadOnly),
            false => Ok(()),
        }
    }
}

impl Store for MemoryStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<StoredValue>, StoreError> {
        Ok(self
            .staged
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .cloned())
    }

    fn set(&mut self, namespace: &str, key: &str, value: StoredValue) -> Result<(), StoreError> {
        self.writable()?;
        self.staged
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    fn erase_namespace(&mut self, namespace: &str) -> Result<(), StoreError> {
        self.writable()?;
        self.staged.remove(namespace);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.writable()?;

        if self.failing_commits > 0 {
            self.failing_commits -= 1;
            return Err(StoreError::ReadOnly);
        }

        self.committed = self.staged.clone();
        Ok(())
    }

    fn discard(&mut self) {
        self.staged = self.committed.clone();
    }
}
