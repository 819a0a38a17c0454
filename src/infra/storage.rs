//! Usage: Key/value persistence backends for session tokens (in-memory + JSON file).

use crate::shared::error::AppResult;
use crate::shared::mutex_ext::MutexExt;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// A string key/value store, the shape of browser `sessionStorage`.
///
/// Implementations may be shared with other processes (file-backed stores),
/// so values written here can be observed, or changed, from outside.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> AppResult<Option<String>>;

    fn set(&self, key: &str, value: &str) -> AppResult<()>;

    /// Removing a missing key is not an error.
    fn remove(&self, key: &str) -> AppResult<()>;

    /// Apply several writes (`None` removes). File-backed stores override this
    /// to persist the batch in one write.
    fn write_batch(&self, entries: &[(&str, Option<&str>)]) -> AppResult<()> {
        for (key, value) in entries {
            match value {
                Some(value) => self.set(key, value)?,
                None => self.remove(key)?,
            }
        }
        Ok(())
    }
}

/// Process-scoped store; contents disappear with the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock_or_recover().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> AppResult<Option<String>> {
        Ok(self.entries.lock_or_recover().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> AppResult<()> {
        self.entries
            .lock_or_recover()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> AppResult<()> {
        self.entries.lock_or_recover().remove(key);
        Ok(())
    }

    fn write_batch(&self, entries: &[(&str, Option<&str>)]) -> AppResult<()> {
        let mut guard = self.entries.lock_or_recover();
        for (key, value) in entries {
            match value {
                Some(value) => {
                    guard.insert(key.to_string(), value.to_string());
                }
                None => {
                    guard.remove(*key);
                }
            }
        }
        Ok(())
    }
}

/// JSON object on disk (`{"key": "value", ...}`), rewritten atomically.
///
/// The file is re-read on every call, so writes from other processes sharing
/// the path are visible on the next read.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> AppResult<BTreeMap<String, String>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(format!(
                    "STORAGE_ERROR: failed to read {}: {e}",
                    self.path.display()
                )
                .into())
            }
        };
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&content).map_err(|e| {
            format!(
                "STORAGE_ERROR: failed to parse {}: {e}",
                self.path.display()
            )
            .into()
        })
    }

    fn store(&self, entries: &BTreeMap<String, String>) -> AppResult<()> {
        let content = serde_json::to_vec_pretty(entries)
            .map_err(|e| format!("STORAGE_ERROR: failed to serialize store: {e}"))?;
        write_file_atomic(&self.path, &content)
    }

    fn modify(&self, apply: impl FnOnce(&mut BTreeMap<String, String>) -> bool) -> AppResult<()> {
        let _guard = self.write_lock.lock_or_recover();
        let mut entries = self.load()?;
        if !apply(&mut entries) {
            return Ok(());
        }
        if entries.is_empty() {
            return match std::fs::remove_file(&self.path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(format!(
                    "STORAGE_ERROR: failed to remove {}: {e}",
                    self.path.display()
                )
                .into()),
            };
        }
        self.store(&entries)
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> AppResult<Option<String>> {
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> AppResult<()> {
        self.modify(|entries| {
            entries.insert(key.to_string(), value.to_string()).as_deref() != Some(value)
        })
    }

    fn remove(&self, key: &str) -> AppResult<()> {
        self.modify(|entries| entries.remove(key).is_some())
    }

    fn write_batch(&self, batch: &[(&str, Option<&str>)]) -> AppResult<()> {
        self.modify(|entries| {
            let mut changed = false;
            for (key, value) in batch {
                changed |= match value {
                    Some(value) => {
                        entries.insert(key.to_string(), value.to_string()).as_deref()
                            != Some(*value)
                    }
                    None => entries.remove(*key).is_some(),
                };
            }
            changed
        })
    }
}

/// Write `content` to `path` via a temp file and rename, keeping the previous
/// file as a backup until the rename succeeds.
pub(crate) fn write_file_atomic(path: &Path, content: &[u8]) -> AppResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            format!(
                "STORAGE_ERROR: failed to create {}: {e}",
                parent.display()
            )
        })?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| format!("STORAGE_ERROR: invalid file path {}", path.display()))?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));
    let backup_path = path.with_file_name(format!("{file_name}.bak"));

    std::fs::write(&tmp_path, content)
        .map_err(|e| format!("STORAGE_ERROR: failed to write temp file: {e}"))?;

    if backup_path.exists() {
        let _ = std::fs::remove_file(&backup_path);
    }

    if path.exists() {
        std::fs::rename(path, &backup_path)
            .map_err(|e| format!("STORAGE_ERROR: failed to create backup: {e}"))?;
    }

    if let Err(e) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::rename(&backup_path, path);
        return Err(format!("STORAGE_ERROR: failed to finalize {}: {e}", path.display()).into());
    }

    if backup_path.exists() {
        let _ = std::fs::remove_file(&backup_path);
    }
    Ok(())
}
