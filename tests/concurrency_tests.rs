//! Concurrency integration tests: per-dataset serialization and
//! cross-dataset independence under parallel mutation.

use std::sync::{Arc, Barrier, Mutex};

use chunkvault::store::persist::DatasetDocument;
use chunkvault::{
    CommitSource, MemoryPersist, NewChunk, PersistBackend, StoreConfig, StoreResult,
    VersionedStore,
};

fn open_shared() -> Arc<VersionedStore> {
    Arc::new(
        VersionedStore::open(StoreConfig::default(), Arc::new(MemoryPersist::new())).unwrap(),
    )
}

#[test]
fn test_parallel_writers_one_commit_each() {
    let store = open_shared();
    store.create_dataset("d").unwrap();
    store
        .add_category("d", "Cat", CommitSource::Primary)
        .unwrap();
    let cat = store.get_dataset("d").unwrap().categories[0].uid.clone();

    let mut handles = vec![];
    for i in 0..16 {
        let store = Arc::clone(&store);
        let cat = cat.clone();
        handles.push(std::thread::spawn(move || {
            store
                .add_chunk(
                    "d",
                    &cat,
                    NewChunk {
                        id: format!("w{i}"),
                        ..Default::default()
                    },
                    CommitSource::Secondary,
                )
                .unwrap()
        }));
    }
    let metas: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    // Every writer observed a distinct, monotonically growing chunk count
    let mut counts: Vec<usize> = metas.iter().map(|m| m.stats.chunks).collect();
    counts.sort_unstable();
    assert_eq!(counts, (1..=16).collect::<Vec<_>>());

    assert_eq!(store.get_dataset("d").unwrap().stats().chunks, 16);
    assert_eq!(store.history("d").unwrap().len(), 17);
}

#[test]
fn test_independent_datasets_mutate_concurrently() {
    let store = open_shared();
    for name in ["a", "b", "c", "e"] {
        store.create_dataset(name).unwrap();
    }

    let mut handles = vec![];
    for name in ["a", "b", "c", "e"] {
        let store = Arc::clone(&store);
        handles.push(std::thread::spawn(move || {
            for i in 0..10 {
                store
                    .add_category(name, &format!("cat-{i}"), CommitSource::Primary)
                    .unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    for name in ["a", "b", "c", "e"] {
        assert_eq!(store.get_dataset(name).unwrap().categories.len(), 10);
        assert_eq!(store.history(name).unwrap().len(), 10);
    }
}

#[test]
fn test_concurrent_duplicate_ids_admit_exactly_one() {
    let store = open_shared();
    store.create_dataset("d").unwrap();
    store
        .add_category("d", "Cat", CommitSource::Primary)
        .unwrap();
    let cat = store.get_dataset("d").unwrap().categories[0].uid.clone();

    let mut handles = vec![];
    for _ in 0..8 {
        let store = Arc::clone(&store);
        let cat = cat.clone();
        handles.push(std::thread::spawn(move || {
            store.add_chunk(
                "d",
                &cat,
                NewChunk {
                    id: "contested".to_string(),
                    ..Default::default()
                },
                CommitSource::Secondary,
            )
        }));
    }
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let won = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(won, 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| e.is_conflict()));
    assert_eq!(store.get_dataset("d").unwrap().stats().chunks, 1);
}

#[test]
fn test_readers_never_observe_partial_mutations() {
    let store = open_shared();
    store.create_dataset("d").unwrap();
    store
        .add_category("d", "Cat", CommitSource::Primary)
        .unwrap();
    let cat = store.get_dataset("d").unwrap().categories[0].uid.clone();

    let writer = {
        let store = Arc::clone(&store);
        std::thread::spawn(move || {
            for i in 0..20 {
                // Batch of 5 per commit; readers must see multiples of 5
                let batch: Vec<NewChunk> = (0..5)
                    .map(|j| NewChunk {
                        id: format!("b{i}-{j}"),
                        ..Default::default()
                    })
                    .collect();
                store
                    .add_chunks("d", &cat, batch, CommitSource::Primary)
                    .unwrap();
            }
        })
    };

    let reader = {
        let store = Arc::clone(&store);
        std::thread::spawn(move || {
            for _ in 0..200 {
                let chunks = store.get_dataset("d").unwrap().stats().chunks;
                assert_eq!(chunks % 5, 0, "observed mid-batch state: {chunks}");
            }
        })
    };

    writer.join().unwrap();
    reader.join().unwrap();
    assert_eq!(store.get_dataset("d").unwrap().stats().chunks, 100);
}

/// Backend whose next save rendezvouses with the test before completing,
/// pinning a mutation inside its persistence step.
#[derive(Default)]
struct GatedPersist {
    inner: MemoryPersist,
    gate: Mutex<Option<(Arc<Barrier>, Arc<Barrier>)>>,
}

impl GatedPersist {
    fn arm(&self, reached: Arc<Barrier>, release: Arc<Barrier>) {
        *self.gate.lock().unwrap() = Some((reached, release));
    }
}

impl PersistBackend for GatedPersist {
    fn save(&self, name: &str, doc: &DatasetDocument) -> StoreResult<()> {
        let armed = self.gate.lock().unwrap().take();
        if let Some((reached, release)) = armed {
            reached.wait();
            release.wait();
        }
        self.inner.save(name, doc)
    }

    fn load(&self, name: &str) -> StoreResult<Option<DatasetDocument>> {
        self.inner.load(name)
    }

    fn delete(&self, name: &str) -> StoreResult<()> {
        self.inner.delete(name)
    }

    fn list(&self) -> StoreResult<Vec<String>> {
        self.inner.list()
    }
}

#[test]
fn test_delete_serializes_with_inflight_mutation() {
    let persist = Arc::new(GatedPersist::default());
    let store = Arc::new(
        VersionedStore::open(
            StoreConfig::default(),
            persist.clone() as Arc<dyn PersistBackend>,
        )
        .unwrap(),
    );
    store.create_dataset("d").unwrap();

    let reached = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));
    persist.arm(Arc::clone(&reached), Arc::clone(&release));

    let writer = {
        let store = Arc::clone(&store);
        std::thread::spawn(move || store.add_category("d", "Mobs", CommitSource::Primary))
    };
    // Writer is now inside its save, holding the dataset's lock
    reached.wait();

    let deleter = {
        let store = Arc::clone(&store);
        std::thread::spawn(move || store.delete_dataset("d"))
    };
    // Give the delete time to queue on the dataset's lock, then let the
    // writer's save finish
    std::thread::sleep(std::time::Duration::from_millis(100));
    release.wait();

    // The mutation committed before the delete was admitted
    writer.join().unwrap().unwrap();
    deleter.join().unwrap().unwrap();

    // Memory and disk agree: the dataset is gone from both
    assert!(store.get_dataset("d").unwrap_err().is_not_found());
    assert!(persist.list().unwrap().is_empty());

    // Later mutations see a missing dataset, never a resurrected one
    assert!(store
        .add_category("d", "Late", CommitSource::Primary)
        .unwrap_err()
        .is_not_found());
}
