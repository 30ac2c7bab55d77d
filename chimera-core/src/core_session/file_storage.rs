//! Credential storage backed by a JSON file
//!
//! Lets separate processes act as tabs of one origin. Every read goes to
//! disk, so writes from other processes become visible to the recheck path.
//! There are no change notifications.

use super::storage::{CredentialStorage, StorageResult};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

pub struct FileStorage {
    path: PathBuf,
    // Serializes read-modify-write within this process
    write_lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every key currently stored
    pub fn entries(&self) -> StorageResult<BTreeMap<String, String>> {
        self.load()
    }

    fn load(&self) -> StorageResult<BTreeMap<String, String>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        if contents.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&contents)?)
    }

    fn store(&self, values: &BTreeMap<String, String>) -> StorageResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        // Write then rename so readers never see a half-written file
        let tmp = self.tmp_path();
        fs::write(&tmp, serde_json::to_vec_pretty(values)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "storage".to_string());
        self.path
            .with_file_name(format!(".{name}.{}.tmp", std::process::id()))
    }

    fn update(&self, f: impl FnOnce(&mut BTreeMap<String, String>) -> bool) -> StorageResult<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut values = self.load()?;
        if f(&mut values) {
            self.store(&values)?;
        }
        Ok(())
    }
}

impl CredentialStorage for FileStorage {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.update(|values| {
            let changed = values.get(key).map(String::as_str) != Some(value);
            values.insert(key.to_string(), value.to_string());
            changed
        })?;
        debug!(path = %self.path.display(), %key, "Stored value");
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        self.update(|values| values.remove(key).is_some())
    }
}
