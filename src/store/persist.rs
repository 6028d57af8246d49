//! Persistence backends.
//!
//! The store treats persistence as an opaque collaborator: anything that can
//! durably save and load a dataset together with its commit log, keyed by
//! dataset name. The default backend writes one JSON document per dataset
//! with a temp-file-and-rename protocol so a crashed write never leaves a
//! truncated document behind.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;

use crate::error::{StoreError, StoreResult};
use crate::history::Commit;
use crate::model::Dataset;

/// The unit of persistence: the live dataset plus its full commit history.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DatasetDocument {
    pub dataset: Dataset,
    pub commits: Vec<Commit>,
}

/// Trait for persistence backends.
///
/// Implementations must be safe to call from multiple threads; the store
/// serializes writes per dataset, so per-name operations never race.
pub trait PersistBackend: Send + Sync {
    /// Durably store a dataset document under its name.
    fn save(&self, name: &str, doc: &DatasetDocument) -> StoreResult<()>;

    /// Load a dataset document, or `None` if the name has never been saved.
    fn load(&self, name: &str) -> StoreResult<Option<DatasetDocument>>;

    /// Remove a dataset document. Removing an absent name is not an error.
    fn delete(&self, name: &str) -> StoreResult<()>;

    /// Names of all stored datasets.
    fn list(&self) -> StoreResult<Vec<String>>;
}

/// JSON-file persistence: one `<name>.json` document per dataset under a
/// base directory.
pub struct JsonFilePersist {
    dir: PathBuf,
}

impl JsonFilePersist {
    /// Create a backend rooted at `dir`, creating the directory if absent.
    pub fn new(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(JsonFilePersist { dir })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }
}

impl PersistBackend for JsonFilePersist {
    fn save(&self, name: &str, doc: &DatasetDocument) -> StoreResult<()> {
        let path = self.path_for(name);
        let tmp = self.dir.join(format!(".{name}.json.tmp"));
        let json = serde_json::to_vec_pretty(doc)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn load(&self, name: &str) -> StoreResult<Option<DatasetDocument>> {
        let path = self.path_for(name);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let doc = serde_json::from_slice(&bytes)?;
        Ok(Some(doc))
    }

    fn delete(&self, name: &str) -> StoreResult<()> {
        let path = self.path_for(name);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn list(&self) -> StoreResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if let Some(stem) = file_name.strip_suffix(".json") {
                if !stem.starts_with('.') {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort_unstable();
        Ok(names)
    }
}

/// In-memory persistence, for tests and ephemeral deployments.
///
/// Supports failure injection: `fail_next_saves(n)` makes the next `n` save
/// calls return `Unavailable`, exercising the store's bounded-retry and
/// memory-rollback path.
#[derive(Default)]
pub struct MemoryPersist {
    docs: RwLock<HashMap<String, DatasetDocument>>,
    failing_saves: AtomicU32,
}

impl MemoryPersist {
    pub fn new() -> Self {
        MemoryPersist::default()
    }

    /// Make the next `n` save calls fail with `Unavailable`.
    pub fn fail_next_saves(&self, n: u32) {
        self.failing_saves.store(n, Ordering::SeqCst);
    }
}

impl PersistBackend for MemoryPersist {
    fn save(&self, name: &str, doc: &DatasetDocument) -> StoreResult<()> {
        let remaining = self.failing_saves.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_saves.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable(format!(
                "injected save failure for '{name}'"
            )));
        }
        self.docs.write().insert(name.to_string(), doc.clone());
        Ok(())
    }

    fn load(&self, name: &str) -> StoreResult<Option<DatasetDocument>> {
        Ok(self.docs.read().get(name).cloned())
    }

    fn delete(&self, name: &str) -> StoreResult<()> {
        self.docs.write().remove(name);
        Ok(())
    }

    fn list(&self) -> StoreResult<Vec<String>> {
        let mut names: Vec<String> = self.docs.read().keys().cloned().collect();
        names.sort_unstable();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Category;
    use tempfile::TempDir;

    fn doc(name: &str) -> DatasetDocument {
        let mut dataset = Dataset::new(name);
        dataset.categories.push(Category::new("Mobs"));
        DatasetDocument {
            dataset,
            commits: Vec::new(),
        }
    }

    #[test]
    fn test_file_round_trip() {
        let tmp = TempDir::new().unwrap();
        let persist = JsonFilePersist::new(tmp.path()).unwrap();

        persist.save("wiki", &doc("wiki")).unwrap();
        let loaded = persist.load("wiki").unwrap().unwrap();
        assert_eq!(loaded.dataset.name, "wiki");
        assert_eq!(loaded.dataset.categories[0].name, "Mobs");
    }

    #[test]
    fn test_file_load_missing_is_none() {
        let tmp = TempDir::new().unwrap();
        let persist = JsonFilePersist::new(tmp.path()).unwrap();
        assert!(persist.load("absent").unwrap().is_none());
    }

    #[test]
    fn test_file_delete_and_list() {
        let tmp = TempDir::new().unwrap();
        let persist = JsonFilePersist::new(tmp.path()).unwrap();

        persist.save("b", &doc("b")).unwrap();
        persist.save("a", &doc("a")).unwrap();
        assert_eq!(persist.list().unwrap(), vec!["a", "b"]);

        persist.delete("a").unwrap();
        assert_eq!(persist.list().unwrap(), vec!["b"]);
        // Deleting twice is fine
        persist.delete("a").unwrap();
    }

    #[test]
    fn test_memory_failure_injection() {
        let persist = MemoryPersist::new();
        persist.fail_next_saves(2);

        assert!(persist.save("x", &doc("x")).unwrap_err().is_unavailable());
        assert!(persist.save("x", &doc("x")).unwrap_err().is_unavailable());
        persist.save("x", &doc("x")).unwrap();
        assert!(persist.load("x").unwrap().is_some());
    }
}
