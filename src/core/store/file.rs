use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde_json::Value as Json;

use super::{Store, StoreError, StoredValue};

/// Entries stay raw JSON until read so one bad value only costs its own key.
type Contents = HashMap<String, BTreeMap<String, Json>>;

/// JSON document on disk holding every namespace. Commits replace the file
/// through a sibling temporary so a crash never leaves it half written.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    contents: Contents,
    committed: Contents,
}

impl FileStore {
    /// Opens `path`, starting empty when the file does not exist yet. A file
    /// that is not a JSON document of namespaces is renamed to `*.corrupt`
    /// and the store starts empty.
    pub fn open(path: impl AsRef<Path>) -> Result<FileStore, StoreError> {
        let path = path.as_ref().to_path_buf();

        let contents = match fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => Contents::new(),
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(contents) => contents,
                Err(err) => {
                    set_aside(&path, &err);
                    Contents::new()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!("No store at {}, starting empty", path.display());
                Contents::new()
            }
            Err(err) => return Err(err.into()),
        };

        Ok(FileStore {
            path,
            committed: contents.clone(),
            contents,
        })
    }
}

fn set_aside(path: &Path, err: &serde_json::Error) {
    let corrupt = path.with_extension("corrupt");
    warn!(
        "Store at {} is unreadable ({err}), moving it to {} and starting empty",
        path.display(),
        corrupt.display()
    );

    if let Err(err) = fs::rename(path, &corrupt) {
        warn!("Failed to move {}: {err}", path.display());
    }
}

impl Store for FileStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<StoredValue>, StoreError> {
        let Some(raw) = self.contents.get(namespace).and_then(|ns| ns.get(key)) else {
            return Ok(None);
        };

        serde_json::from_value(raw.clone())
            .map(Some)
            .map_err(|err| StoreError::Corrupt {
                namespace: namespace.to_string(),
                key: key.to_string(),
                reason: err.to_string(),
            })
    }

    fn set(&mut self, namespace: &str, key: &str, value: StoredValue) -> Result<(), StoreError> {
        let raw = serde_json::to_value(value)?;
        self.contents
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), raw);
        Ok(())
    }

    fn erase_namespace(&mut self, namespace: &str) -> Result<(), StoreError> {
        self.contents.remove(namespace);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(&self.contents)?;
        let staging = self.path.with_extension("tmp");

        fs::write(&staging, json)?;
        fs::rename(&staging, &self.path)?;

        self.committed = self.contents.clone();
        debug!("Committed store to {}", self.path.display());
        Ok(())
    }

    fn discard(&mut self) {
        self.contents = self.committed.clone();
    }
}
