//! Versioned Store
//!
//! Orchestrates every mutation against a dataset as one externally-atomic
//! step: validate preconditions, apply the change to the live dataset, deep
//! clone the result, append a commit, and save through the persistence
//! backend. A typed error at any point leaves observable state unchanged.
//!
//! ## Concurrency
//!
//! Each dataset has its own lock (`DashMap<name, Arc<Mutex<DatasetEntry>>>`).
//! Mutations on the same dataset serialize their validate/apply/commit steps;
//! datasets are independent of each other. Reads take the same per-dataset
//! lock and return clones, so a reader sees either the pre- or post-mutation
//! state, never a partial one.
//!
//! ## Persistence
//!
//! `Unavailable` from the backend is the only error class retried. If the
//! bounded retries exhaust, the in-memory dataset and commit log are unwound
//! to their pre-mutation values so memory and disk never diverge.

pub mod persist;

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::history::{CommitDetail, CommitLog, CommitMeta, CommitSource, ROLLBACK_ACTION};
use crate::model::{
    Category, Chunk, ChunkMetadata, CustomField, Dataset, DatasetStats, new_stable_id,
    MAX_CHUNK_TEXT_CHARS,
};
use persist::{DatasetDocument, PersistBackend};

/// Reserved metadata keys mapped to fixed fields on import/export.
const RESERVED_KEYS: [&str; 3] = ["page_title", "source", "license"];

/// Store tuning knobs. History capacity is fixed per store, not per dataset.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Commits retained per dataset (FIFO eviction beyond this).
    pub history_capacity: usize,
    /// Maximum chunk text length in characters.
    pub max_chunk_text: usize,
    /// Additional save attempts after the first `Unavailable` failure.
    pub save_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            history_capacity: crate::history::DEFAULT_HISTORY_CAPACITY,
            max_chunk_text: MAX_CHUNK_TEXT_CHARS,
            save_retries: 2,
        }
    }
}

/// Name plus aggregate stats, for dataset listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub name: String,
    pub stats: DatasetStats,
}

/// Input for creating a chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub metadata: ChunkMetadata,
}

/// Partial update of a chunk; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkUpdate {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub metadata: Option<ChunkMetadata>,
}

/// Metadata patch applied across many chunks at once. Reserved fields
/// overwrite when `Some`; custom entries are upserted by key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataPatch {
    #[serde(default)]
    pub page_title: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub custom: Vec<CustomField>,
}

/// Flat record shape used by import and export:
/// `{ id, text, metadata: { page_title, source, license, ...customKeys } }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Live dataset plus its commit log; guarded by one mutex per dataset.
struct DatasetEntry {
    dataset: Dataset,
    log: CommitLog,
}

/// The versioned store: all live datasets, their histories, and the
/// persistence backend behind them.
pub struct VersionedStore {
    entries: DashMap<String, Arc<Mutex<DatasetEntry>>>,
    persist: Arc<dyn PersistBackend>,
    config: StoreConfig,
}

impl VersionedStore {
    /// Open a store, loading every dataset the backend knows about.
    pub fn open(config: StoreConfig, persist: Arc<dyn PersistBackend>) -> StoreResult<Self> {
        let store = VersionedStore {
            entries: DashMap::new(),
            persist,
            config,
        };
        for name in store.persist.list()? {
            if let Some(doc) = store.persist.load(&name)? {
                let entry = DatasetEntry {
                    dataset: doc.dataset,
                    log: CommitLog::from_commits(store.config.history_capacity, doc.commits),
                };
                store.entries.insert(name.clone(), Arc::new(Mutex::new(entry)));
                debug!(dataset = %name, "dataset_loaded");
            }
        }
        info!(datasets = store.entries.len(), "store_opened");
        Ok(store)
    }

    /// Store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // === Dataset lifecycle ===

    /// Create an empty dataset. Does not append a commit; history starts with
    /// the first mutation inside the dataset.
    pub fn create_dataset(&self, name: &str) -> StoreResult<()> {
        validate_name(name)?;
        let entry = Arc::new(Mutex::new(DatasetEntry {
            dataset: Dataset::new(name),
            log: CommitLog::new(self.config.history_capacity),
        }));
        // Vacant-entry insert keeps create atomic against concurrent creates.
        match self.entries.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(StoreError::DatasetExists(name.to_string()));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry.clone());
            }
        }
        let guard = entry.lock();
        if let Err(e) = self.save_with_retry(name, &guard) {
            drop(guard);
            self.entries.remove(name);
            return Err(e);
        }
        info!(dataset = %name, "dataset_created");
        Ok(())
    }

    /// Delete a dataset and its entire commit history.
    ///
    /// Takes the dataset's lock, so deletion serializes with mutations on the
    /// same dataset: an in-flight mutation finishes (and persists) first, and
    /// any mutation that arrives later fails with `DatasetNotFound` instead
    /// of resurrecting the document.
    pub fn delete_dataset(&self, name: &str) -> StoreResult<()> {
        let entry = self.entry(name)?;
        let _guard = entry.lock();
        self.verify_live(name, &entry)?;
        self.delete_with_retry(name)?;
        self.entries.remove(name);
        info!(dataset = %name, "dataset_deleted");
        Ok(())
    }

    /// Names and aggregate stats of all datasets, sorted by name.
    pub fn list_datasets(&self) -> Vec<DatasetSummary> {
        // Collect the handles first; entry locks are never acquired while a
        // map shard is held (deletion locks in the opposite order).
        let handles: Vec<Arc<Mutex<DatasetEntry>>> =
            self.entries.iter().map(|item| item.value().clone()).collect();
        let mut out: Vec<DatasetSummary> = handles
            .iter()
            .map(|entry| {
                let guard = entry.lock();
                DatasetSummary {
                    name: guard.dataset.name.clone(),
                    stats: guard.dataset.stats(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Cloned snapshot of a dataset's current state.
    pub fn get_dataset(&self, name: &str) -> StoreResult<Dataset> {
        self.with_entry(name, |entry| Ok(entry.dataset.snapshot()))
    }

    // === Category operations ===

    pub fn add_category(
        &self,
        dataset: &str,
        name: &str,
        source: CommitSource,
    ) -> StoreResult<CommitMeta> {
        let name = name.trim().to_string();
        self.mutate(dataset, source, "add_category", |ds| {
            if name.is_empty() {
                return Err(StoreError::InvalidInput(
                    "category name cannot be empty".to_string(),
                ));
            }
            ds.categories.push(Category::new(&name));
            Ok(format!("Added category \"{name}\""))
        })
    }

    pub fn rename_category(
        &self,
        dataset: &str,
        category_uid: &str,
        new_name: &str,
        source: CommitSource,
    ) -> StoreResult<CommitMeta> {
        let dataset_name = dataset.to_string();
        let new_name = new_name.trim().to_string();
        self.mutate(dataset, source, "rename_category", move |ds| {
            if new_name.is_empty() {
                return Err(StoreError::InvalidInput(
                    "category name cannot be empty".to_string(),
                ));
            }
            let cat = ds.category_mut(category_uid).ok_or_else(|| {
                StoreError::CategoryNotFound {
                    dataset: dataset_name.clone(),
                    category: category_uid.to_string(),
                }
            })?;
            let old = std::mem::replace(&mut cat.name, new_name.clone());
            Ok(format!("Renamed category \"{old}\" to \"{new_name}\""))
        })
    }

    /// Delete a category together with all of its chunks.
    pub fn delete_category(
        &self,
        dataset: &str,
        category_uid: &str,
        source: CommitSource,
    ) -> StoreResult<CommitMeta> {
        let dataset_name = dataset.to_string();
        self.mutate(dataset, source, "delete_category", move |ds| {
            let idx = ds
                .categories
                .iter()
                .position(|c| c.uid == category_uid)
                .ok_or_else(|| StoreError::CategoryNotFound {
                    dataset: dataset_name.clone(),
                    category: category_uid.to_string(),
                })?;
            let removed = ds.categories.remove(idx);
            Ok(format!(
                "Deleted category \"{}\" ({} chunks)",
                removed.name,
                removed.chunks.len()
            ))
        })
    }

    /// Flip a category's UI expansion flag.
    pub fn toggle_category(
        &self,
        dataset: &str,
        category_uid: &str,
        source: CommitSource,
    ) -> StoreResult<CommitMeta> {
        let dataset_name = dataset.to_string();
        self.mutate(dataset, source, "toggle_category", move |ds| {
            let cat = ds.category_mut(category_uid).ok_or_else(|| {
                StoreError::CategoryNotFound {
                    dataset: dataset_name.clone(),
                    category: category_uid.to_string(),
                }
            })?;
            cat.expanded = !cat.expanded;
            Ok(format!(
                "{} category \"{}\"",
                if cat.expanded { "Expanded" } else { "Collapsed" },
                cat.name
            ))
        })
    }

    // === Chunk operations ===

    pub fn add_chunk(
        &self,
        dataset: &str,
        category_uid: &str,
        chunk: NewChunk,
        source: CommitSource,
    ) -> StoreResult<CommitMeta> {
        let dataset_name = dataset.to_string();
        let max_text = self.config.max_chunk_text;
        self.mutate(dataset, source, "add_chunk", move |ds| {
            validate_text(&chunk.text, max_text)?;
            if ds.chunk_id_in_use(&chunk.id, None) {
                return Err(StoreError::DuplicateChunkId {
                    dataset: dataset_name.clone(),
                    id: chunk.id.clone(),
                });
            }
            let cat = ds.category_mut(category_uid).ok_or_else(|| {
                StoreError::CategoryNotFound {
                    dataset: dataset_name.clone(),
                    category: category_uid.to_string(),
                }
            })?;
            let cat_name = cat.name.clone();
            let label = chunk.id.clone();
            cat.chunks
                .push(Chunk::new(chunk.id, chunk.text, chunk.metadata));
            Ok(format!("Added chunk \"{label}\" to \"{cat_name}\""))
        })
    }

    /// Add several chunks to one category as a single commit. The whole batch
    /// is validated before anything is applied.
    pub fn add_chunks(
        &self,
        dataset: &str,
        category_uid: &str,
        chunks: Vec<NewChunk>,
        source: CommitSource,
    ) -> StoreResult<CommitMeta> {
        let dataset_name = dataset.to_string();
        let max_text = self.config.max_chunk_text;
        self.mutate(dataset, source, "add_chunks", move |ds| {
            let mut seen: Vec<&str> = Vec::new();
            for chunk in &chunks {
                validate_text(&chunk.text, max_text)?;
                let id = chunk.id.as_str();
                if !id.is_empty() && (ds.chunk_id_in_use(id, None) || seen.contains(&id)) {
                    return Err(StoreError::DuplicateChunkId {
                        dataset: dataset_name.clone(),
                        id: id.to_string(),
                    });
                }
                seen.push(id);
            }
            let cat = ds.category_mut(category_uid).ok_or_else(|| {
                StoreError::CategoryNotFound {
                    dataset: dataset_name.clone(),
                    category: category_uid.to_string(),
                }
            })?;
            let cat_name = cat.name.clone();
            let count = chunks.len();
            for chunk in chunks {
                cat.chunks
                    .push(Chunk::new(chunk.id, chunk.text, chunk.metadata));
            }
            Ok(format!("Added {count} chunks to \"{cat_name}\""))
        })
    }

    pub fn update_chunk(
        &self,
        dataset: &str,
        chunk_uid: &str,
        update: ChunkUpdate,
        source: CommitSource,
    ) -> StoreResult<CommitMeta> {
        let dataset_name = dataset.to_string();
        let max_text = self.config.max_chunk_text;
        self.mutate(dataset, source, "update_chunk", move |ds| {
            if let Some(text) = &update.text {
                validate_text(text, max_text)?;
            }
            if let Some(new_id) = &update.id {
                if ds.chunk_id_in_use(new_id, Some(chunk_uid)) {
                    return Err(StoreError::DuplicateChunkId {
                        dataset: dataset_name.clone(),
                        id: new_id.clone(),
                    });
                }
            }
            let chunk = ds.chunk_mut(chunk_uid).ok_or_else(|| {
                StoreError::ChunkNotFound {
                    dataset: dataset_name.clone(),
                    chunk: chunk_uid.to_string(),
                }
            })?;
            if let Some(id) = update.id {
                chunk.id = id;
            }
            if let Some(text) = update.text {
                chunk.text = text;
            }
            if let Some(metadata) = update.metadata {
                chunk.metadata = metadata;
            }
            Ok(format!("Updated chunk \"{}\"", chunk.id))
        })
    }

    pub fn delete_chunk(
        &self,
        dataset: &str,
        chunk_uid: &str,
        source: CommitSource,
    ) -> StoreResult<CommitMeta> {
        let dataset_name = dataset.to_string();
        self.mutate(dataset, source, "delete_chunk", move |ds| {
            for cat in &mut ds.categories {
                if let Some(idx) = cat.chunks.iter().position(|c| c.uid == chunk_uid) {
                    let removed = cat.chunks.remove(idx);
                    return Ok(format!(
                        "Deleted chunk \"{}\" from \"{}\"",
                        removed.id, cat.name
                    ));
                }
            }
            Err(StoreError::ChunkNotFound {
                dataset: dataset_name.clone(),
                chunk: chunk_uid.to_string(),
            })
        })
    }

    /// Duplicate a chunk in place. The copy gets a fresh stable identifier
    /// and, when the original's user-facing id is non-empty, a derived id
    /// (`<id>-copy`, `<id>-copy2`, …) that satisfies the uniqueness
    /// invariant.
    pub fn duplicate_chunk(
        &self,
        dataset: &str,
        chunk_uid: &str,
        source: CommitSource,
    ) -> StoreResult<CommitMeta> {
        let dataset_name = dataset.to_string();
        self.mutate(dataset, source, "duplicate_chunk", move |ds| {
            let (_, original) = ds.chunk(chunk_uid).ok_or_else(|| {
                StoreError::ChunkNotFound {
                    dataset: dataset_name.clone(),
                    chunk: chunk_uid.to_string(),
                }
            })?;
            let mut copy = original.clone();
            copy.uid = new_stable_id();
            copy.id = derive_copy_id(ds, &copy.id);
            let label = copy.id.clone();
            let cat = ds
                .categories
                .iter_mut()
                .find(|c| c.chunks.iter().any(|ch| ch.uid == chunk_uid))
                .expect("owning category exists for found chunk");
            let idx = cat
                .chunks
                .iter()
                .position(|c| c.uid == chunk_uid)
                .expect("chunk position exists");
            cat.chunks.insert(idx + 1, copy);
            Ok(format!("Duplicated chunk as \"{label}\""))
        })
    }

    /// Move a chunk to another category, optionally at a specific position
    /// (defaults to the end).
    pub fn move_chunk(
        &self,
        dataset: &str,
        chunk_uid: &str,
        target_category_uid: &str,
        position: Option<usize>,
        source: CommitSource,
    ) -> StoreResult<CommitMeta> {
        let dataset_name = dataset.to_string();
        self.mutate(dataset, source, "move_chunk", move |ds| {
            if ds.category(target_category_uid).is_none() {
                return Err(StoreError::CategoryNotFound {
                    dataset: dataset_name.clone(),
                    category: target_category_uid.to_string(),
                });
            }
            let mut moved = None;
            let mut from_name = String::new();
            for cat in &mut ds.categories {
                if let Some(idx) = cat.chunks.iter().position(|c| c.uid == chunk_uid) {
                    from_name = cat.name.clone();
                    moved = Some(cat.chunks.remove(idx));
                    break;
                }
            }
            let chunk = moved.ok_or_else(|| StoreError::ChunkNotFound {
                dataset: dataset_name.clone(),
                chunk: chunk_uid.to_string(),
            })?;
            let label = chunk.id.clone();
            let target = ds
                .category_mut(target_category_uid)
                .expect("target category checked above");
            let to_name = target.name.clone();
            let idx = position.unwrap_or(target.chunks.len()).min(target.chunks.len());
            target.chunks.insert(idx, chunk);
            Ok(format!(
                "Moved chunk \"{label}\" from \"{from_name}\" to \"{to_name}\""
            ))
        })
    }

    /// Apply one metadata patch to several chunks as a single commit.
    pub fn update_metadata_bulk(
        &self,
        dataset: &str,
        chunk_uids: &[String],
        patch: MetadataPatch,
        source: CommitSource,
    ) -> StoreResult<CommitMeta> {
        let dataset_name = dataset.to_string();
        let uids: Vec<String> = chunk_uids.to_vec();
        self.mutate(dataset, source, "update_metadata", move |ds| {
            for uid in &uids {
                if ds.chunk(uid).is_none() {
                    return Err(StoreError::ChunkNotFound {
                        dataset: dataset_name.clone(),
                        chunk: uid.clone(),
                    });
                }
            }
            for uid in &uids {
                let chunk = ds.chunk_mut(uid).expect("validated above");
                let meta = &mut chunk.metadata;
                if let Some(v) = &patch.page_title {
                    meta.page_title = v.clone();
                }
                if let Some(v) = &patch.source {
                    meta.source = v.clone();
                }
                if let Some(v) = &patch.license {
                    meta.license = v.clone();
                }
                for field in &patch.custom {
                    meta.set_custom(&field.key, &field.value);
                }
            }
            Ok(format!("Updated metadata on {} chunks", uids.len()))
        })
    }

    // === Import / export / merge ===

    /// Import a flat array of records into one category (created if absent).
    /// Reserved metadata keys become the fixed fields; everything else
    /// becomes custom fields. Every created chunk gets a fresh stable
    /// identifier. User-facing id uniqueness is not enforced here; imported
    /// data may transiently violate it.
    pub fn import(
        &self,
        dataset: &str,
        category_name: &str,
        records: Vec<FlatRecord>,
        source: CommitSource,
    ) -> StoreResult<CommitMeta> {
        let category_name = category_name.trim().to_string();
        let max_text = self.config.max_chunk_text;
        self.mutate(dataset, source, "import", move |ds| {
            if category_name.is_empty() {
                return Err(StoreError::InvalidInput(
                    "import category name cannot be empty".to_string(),
                ));
            }
            for record in &records {
                validate_text(&record.text, max_text)?;
            }
            let count = records.len();
            let chunks: Vec<Chunk> = records.into_iter().map(flat_to_chunk).collect();
            match ds
                .categories
                .iter_mut()
                .find(|c| c.name == category_name)
            {
                Some(cat) => cat.chunks.extend(chunks),
                None => {
                    let mut cat = Category::new(&category_name);
                    cat.chunks = chunks;
                    ds.categories.push(cat);
                }
            }
            Ok(format!("Imported {count} chunks into \"{category_name}\""))
        })
    }

    /// Flatten all chunks into export records. Read-only; no commit.
    pub fn export(&self, dataset: &str) -> StoreResult<Vec<FlatRecord>> {
        self.with_entry(dataset, |entry| {
            Ok(entry
                .dataset
                .categories
                .iter()
                .flat_map(|cat| cat.chunks.iter().map(chunk_to_flat))
                .collect())
        })
    }

    /// Fold all categories and chunks of `source_name` into `target`.
    /// Categories are matched by name (created in the target when absent);
    /// every copied chunk gets a fresh stable identifier. The source dataset
    /// is left untouched.
    pub fn merge(
        &self,
        target: &str,
        source_name: &str,
        source: CommitSource,
    ) -> StoreResult<CommitMeta> {
        // Snapshot the source outside the target's critical section; cross-
        // dataset transactions are out of scope.
        let source_ds = self.get_dataset(source_name)?;
        self.mutate(target, source, "merge", move |ds| {
            let mut moved = 0usize;
            for src_cat in &source_ds.categories {
                let chunks: Vec<Chunk> = src_cat
                    .chunks
                    .iter()
                    .map(|c| {
                        let mut copy = c.clone();
                        copy.uid = new_stable_id();
                        copy
                    })
                    .collect();
                moved += chunks.len();
                match ds.categories.iter_mut().find(|c| c.name == src_cat.name) {
                    Some(cat) => cat.chunks.extend(chunks),
                    None => {
                        let mut cat = Category::new(&src_cat.name);
                        cat.expanded = src_cat.expanded;
                        cat.chunks = chunks;
                        ds.categories.push(cat);
                    }
                }
            }
            Ok(format!(
                "Merged dataset \"{}\" ({moved} chunks)",
                source_ds.name
            ))
        })
    }

    // === History ===

    /// Commit metadata for a dataset, chronological ascending, snapshots
    /// excluded.
    pub fn history(&self, dataset: &str) -> StoreResult<Vec<CommitMeta>> {
        self.with_entry(dataset, |entry| Ok(entry.log.list()))
    }

    /// One commit with its snapshot and the preceding commit's snapshot.
    pub fn commit_detail(&self, dataset: &str, commit_id: &str) -> StoreResult<CommitDetail> {
        self.with_entry(dataset, |entry| {
            entry
                .log
                .get(commit_id)
                .ok_or_else(|| StoreError::CommitNotFound {
                    dataset: dataset.to_string(),
                    commit: commit_id.to_string(),
                })
        })
    }

    /// Restore the dataset to a commit's snapshot.
    ///
    /// The rollback itself is recorded as a new commit (action `"rollback"`)
    /// whose snapshot captures the state the rollback departed from; prior
    /// history is never mutated or removed, so a rollback can be undone by
    /// rolling back to the commit it created.
    pub fn rollback(
        &self,
        dataset: &str,
        commit_id: &str,
        source: CommitSource,
    ) -> StoreResult<CommitMeta> {
        let entry = self.entry(dataset)?;
        let mut guard = entry.lock();
        self.verify_live(dataset, &entry)?;
        let target = guard
            .log
            .snapshot_of(commit_id)
            .ok_or_else(|| StoreError::CommitNotFound {
                dataset: dataset.to_string(),
                commit: commit_id.to_string(),
            })?
            .clone();
        let before = guard.dataset.snapshot();
        let meta = guard.log.append(
            source,
            ROLLBACK_ACTION,
            format!("Rolled back to commit {commit_id}"),
            before.snapshot(),
        );
        guard.dataset = target;
        if let Err(e) = self.save_with_retry(dataset, &guard) {
            guard.log.pop_newest();
            guard.dataset = before;
            return Err(e);
        }
        info!(dataset = %dataset, commit = %commit_id, "rollback_applied");
        Ok(meta)
    }

    // === Internals ===

    fn entry(&self, name: &str) -> StoreResult<Arc<Mutex<DatasetEntry>>> {
        self.entries
            .get(name)
            .map(|r| r.value().clone())
            .ok_or_else(|| StoreError::DatasetNotFound(name.to_string()))
    }

    /// Confirm a locked entry is still the one registered under `name`. A
    /// handle obtained before a concurrent delete (or delete + re-create)
    /// fails here instead of operating on a detached dataset.
    fn verify_live(&self, name: &str, entry: &Arc<Mutex<DatasetEntry>>) -> StoreResult<()> {
        let live = self
            .entries
            .get(name)
            .map(|r| Arc::ptr_eq(r.value(), entry))
            .unwrap_or(false);
        if live {
            Ok(())
        } else {
            Err(StoreError::DatasetNotFound(name.to_string()))
        }
    }

    fn with_entry<R>(
        &self,
        name: &str,
        f: impl FnOnce(&DatasetEntry) -> StoreResult<R>,
    ) -> StoreResult<R> {
        let entry = self.entry(name)?;
        let guard = entry.lock();
        self.verify_live(name, &entry)?;
        f(&guard)
    }

    /// The mutation protocol: under the dataset's lock, run the closure
    /// (validate + apply, returning the commit summary), snapshot, append a
    /// commit, and persist. Any failure unwinds to the pre-mutation state.
    fn mutate(
        &self,
        name: &str,
        source: CommitSource,
        action: &str,
        f: impl FnOnce(&mut Dataset) -> StoreResult<String>,
    ) -> StoreResult<CommitMeta> {
        let entry = self.entry(name)?;
        let mut guard = entry.lock();
        self.verify_live(name, &entry)?;
        let before = guard.dataset.snapshot();
        let summary = match f(&mut guard.dataset) {
            Ok(summary) => summary,
            Err(e) => {
                guard.dataset = before;
                return Err(e);
            }
        };
        let after = guard.dataset.snapshot();
        let meta = guard.log.append(source, action, summary, after);
        if let Err(e) = self.save_with_retry(name, &guard) {
            guard.log.pop_newest();
            guard.dataset = before;
            return Err(e);
        }
        debug!(dataset = %name, action = %action, commit = %meta.id, "mutation_committed");
        Ok(meta)
    }

    fn save_with_retry(&self, name: &str, entry: &DatasetEntry) -> StoreResult<()> {
        let doc = DatasetDocument {
            dataset: entry.dataset.clone(),
            commits: entry.log.commits().cloned().collect(),
        };
        let mut attempt = 0u32;
        loop {
            match self.persist.save(name, &doc) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_unavailable() && attempt < self.config.save_retries => {
                    attempt += 1;
                    warn!(dataset = %name, attempt, error = %e, "save_retry");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn delete_with_retry(&self, name: &str) -> StoreResult<()> {
        let mut attempt = 0u32;
        loop {
            match self.persist.delete(name) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_unavailable() && attempt < self.config.save_retries => {
                    attempt += 1;
                    warn!(dataset = %name, attempt, error = %e, "delete_retry");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn validate_name(name: &str) -> StoreResult<()> {
    if name.trim().is_empty() {
        return Err(StoreError::InvalidInput(
            "dataset name cannot be empty".to_string(),
        ));
    }
    if name.len() > 128 {
        return Err(StoreError::InvalidInput(
            "dataset name exceeds 128 characters".to_string(),
        ));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(StoreError::InvalidInput(format!(
            "dataset name contains invalid characters: {name}"
        )));
    }
    Ok(())
}

fn validate_text(text: &str, max_chars: usize) -> StoreResult<()> {
    let len = text.chars().count();
    if len > max_chars {
        return Err(StoreError::InvalidInput(format!(
            "chunk text exceeds {max_chars} characters (got {len})"
        )));
    }
    Ok(())
}

fn derive_copy_id(ds: &Dataset, base: &str) -> String {
    if base.is_empty() {
        return String::new();
    }
    let mut candidate = format!("{base}-copy");
    let mut n = 2;
    while ds.chunk_id_in_use(&candidate, None) {
        candidate = format!("{base}-copy{n}");
        n += 1;
    }
    candidate
}

fn flat_to_chunk(record: FlatRecord) -> Chunk {
    let mut metadata = ChunkMetadata::default();
    for (key, value) in record.metadata {
        let value = json_value_to_string(&value);
        match key.as_str() {
            "page_title" => metadata.page_title = value,
            "source" => metadata.source = value,
            "license" => metadata.license = value,
            _ => metadata.custom.push(CustomField { key, value }),
        }
    }
    Chunk::new(record.id, record.text, metadata)
}

fn chunk_to_flat(chunk: &Chunk) -> FlatRecord {
    let mut metadata = serde_json::Map::new();
    let m = &chunk.metadata;
    for (key, value) in RESERVED_KEYS.iter().zip([&m.page_title, &m.source, &m.license]) {
        metadata.insert(key.to_string(), serde_json::Value::String(value.clone()));
    }
    for field in &m.custom {
        // Blank custom keys are dropped on export.
        if !field.key.trim().is_empty() {
            metadata.insert(
                field.key.clone(),
                serde_json::Value::String(field.value.clone()),
            );
        }
    }
    FlatRecord {
        id: chunk.id.clone(),
        text: chunk.text.clone(),
        metadata,
    }
}

fn json_value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
