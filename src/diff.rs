//! Snapshot Differ
//!
//! Pure comparison of two dataset snapshots producing an ordered list of
//! typed change records. No randomness and no wall-clock dependence: the same
//! pair of snapshots always yields the same output.
//!
//! Output ordering is fixed: category deletions, category additions, category
//! renames, then chunk-level changes grouped per category in encounter order.
//!
//! Cross-category moves are detected in a dedicated join pass after all
//! added/deleted/modified sets are built: a chunk whose stable identifier
//! exists in both snapshots under different owning categories has its
//! add/delete pair replaced by a single `moved` record. The join key is the
//! stable identifier, never the mutable user-facing id.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::model::{Category, Chunk, Dataset};

/// Kind of change a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Deleted,
    Modified,
}

/// Structured identity of the changed entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "lowercase")]
pub enum ChangeTarget {
    Category {
        uid: String,
        name: String,
    },
    Chunk {
        uid: String,
        id: String,
        /// Owning category name (destination side for moves).
        category: String,
    },
}

/// One typed change between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub kind: ChangeKind,
    pub description: String,
    pub target: ChangeTarget,
}

impl ChangeRecord {
    fn category(kind: ChangeKind, description: String, cat: &Category) -> Self {
        ChangeRecord {
            kind,
            description,
            target: ChangeTarget::Category {
                uid: cat.uid.clone(),
                name: cat.name.clone(),
            },
        }
    }

    fn chunk(kind: ChangeKind, description: String, chunk: &Chunk, category: &str) -> Self {
        ChangeRecord {
            kind,
            description,
            target: ChangeTarget::Chunk {
                uid: chunk.uid.clone(),
                id: chunk.id.clone(),
                category: category.to_string(),
            },
        }
    }
}

/// Compare two snapshots. `previous == None` (e.g. diffing against an import
/// point) reports every category and chunk of `current` as added.
pub fn diff(previous: Option<&Dataset>, current: &Dataset) -> Vec<ChangeRecord> {
    let Some(prev) = previous else {
        let mut out = Vec::new();
        for cat in &current.categories {
            out.push(ChangeRecord::category(
                ChangeKind::Added,
                format!("Category added: \"{}\"", cat.name),
                cat,
            ));
        }
        for cat in &current.categories {
            for chunk in &cat.chunks {
                out.push(chunk_added(chunk, &cat.name));
            }
        }
        return out;
    };

    let prev_cats: HashMap<&str, &Category> =
        prev.categories.iter().map(|c| (c.uid.as_str(), c)).collect();
    let cur_cats: HashMap<&str, &Category> = current
        .categories
        .iter()
        .map(|c| (c.uid.as_str(), c))
        .collect();

    let mut out = Vec::new();

    // Phase 1: category-level changes.
    for cat in &prev.categories {
        if !cur_cats.contains_key(cat.uid.as_str()) {
            out.push(ChangeRecord::category(
                ChangeKind::Deleted,
                format!("Category deleted: \"{}\"", cat.name),
                cat,
            ));
        }
    }
    for cat in &current.categories {
        if !prev_cats.contains_key(cat.uid.as_str()) {
            out.push(ChangeRecord::category(
                ChangeKind::Added,
                format!("Category added: \"{}\"", cat.name),
                cat,
            ));
        }
    }
    for cat in &current.categories {
        if let Some(old) = prev_cats.get(cat.uid.as_str()) {
            if old.name != cat.name {
                out.push(ChangeRecord::category(
                    ChangeKind::Modified,
                    format!("Category renamed: \"{}\" → \"{}\"", old.name, cat.name),
                    cat,
                ));
            }
        }
    }

    // Phase 2: chunk-level added/deleted/modified sets, grouped per category.
    // Deleted categories first (their chunks leave the dataset unless moved),
    // then current categories in encounter order.
    let mut pending = Vec::new();
    for cat in &prev.categories {
        if !cur_cats.contains_key(cat.uid.as_str()) {
            for chunk in &cat.chunks {
                pending.push(chunk_deleted(chunk, &cat.name));
            }
        }
    }
    for cat in &current.categories {
        match prev_cats.get(cat.uid.as_str()) {
            None => {
                for chunk in &cat.chunks {
                    pending.push(chunk_added(chunk, &cat.name));
                }
            }
            Some(old) => {
                let old_chunks: HashMap<&str, &Chunk> =
                    old.chunks.iter().map(|c| (c.uid.as_str(), c)).collect();
                let new_chunks: HashMap<&str, &Chunk> =
                    cat.chunks.iter().map(|c| (c.uid.as_str(), c)).collect();

                for chunk in &old.chunks {
                    if !new_chunks.contains_key(chunk.uid.as_str()) {
                        pending.push(chunk_deleted(chunk, &old.name));
                    }
                }
                for chunk in &cat.chunks {
                    if !old_chunks.contains_key(chunk.uid.as_str()) {
                        pending.push(chunk_added(chunk, &cat.name));
                    }
                }
                for chunk in &cat.chunks {
                    if let Some(old_chunk) = old_chunks.get(chunk.uid.as_str()) {
                        let changes = field_changes(old_chunk, chunk);
                        if !changes.is_empty() {
                            pending.push(ChangeRecord::chunk(
                                ChangeKind::Modified,
                                format!("Chunk \"{}\" modified: {}", chunk.id, changes.join(", ")),
                                chunk,
                                &cat.name,
                            ));
                        }
                    }
                }
            }
        }
    }

    // Phase 3: move promotion. Join over stable identifiers across the full
    // snapshots; a matching add+delete pair becomes one `moved` record in the
    // position of the add.
    let prev_owner = owner_map(prev);
    let cur_owner = owner_map(current);
    let mut promoted: HashSet<String> = HashSet::new();

    for record in pending {
        let ChangeTarget::Chunk { uid, id, category } = &record.target else {
            unreachable!("pending records are chunk-level");
        };
        match record.kind {
            ChangeKind::Added => {
                if let (Some((from_uid, from_name)), Some((to_uid, _))) = (
                    prev_owner.get(uid.as_str()),
                    cur_owner.get(uid.as_str()),
                ) {
                    if from_uid != to_uid {
                        promoted.insert(uid.clone());
                        let description =
                            format!("Chunk \"{id}\" moved: {from_name} → {category}");
                        out.push(ChangeRecord {
                            kind: ChangeKind::Modified,
                            description,
                            target: record.target.clone(),
                        });
                        continue;
                    }
                }
                out.push(record);
            }
            ChangeKind::Deleted => {
                // The add side of a move owns the promoted record.
                if !cur_owner.contains_key(uid.as_str()) && !promoted.contains(uid.as_str()) {
                    out.push(record);
                }
            }
            ChangeKind::Modified => out.push(record),
        }
    }

    out
}

fn chunk_added(chunk: &Chunk, category: &str) -> ChangeRecord {
    ChangeRecord::chunk(
        ChangeKind::Added,
        format!("Chunk added: \"{}\"", chunk.id),
        chunk,
        category,
    )
}

fn chunk_deleted(chunk: &Chunk, category: &str) -> ChangeRecord {
    ChangeRecord::chunk(
        ChangeKind::Deleted,
        format!("Chunk deleted: \"{}\"", chunk.id),
        chunk,
        category,
    )
}

/// Map every chunk's stable identifier to its owning category's identifier
/// and display name. Ownership is compared by identifier; the name is only
/// for rendering descriptions (display names need not be unique).
fn owner_map(ds: &Dataset) -> HashMap<&str, (&str, &str)> {
    let mut map = HashMap::new();
    for cat in &ds.categories {
        for chunk in &cat.chunks {
            map.insert(chunk.uid.as_str(), (cat.uid.as_str(), cat.name.as_str()));
        }
    }
    map
}

/// Enumerate changed fields between two revisions of the same chunk as
/// `field: "old" → "new"` fragments. Text changes report character counts,
/// not content.
fn field_changes(old: &Chunk, new: &Chunk) -> Vec<String> {
    let mut changes = Vec::new();

    if old.id != new.id {
        changes.push(format!("id: \"{}\" → \"{}\"", old.id, new.id));
    }
    if old.text != new.text {
        changes.push(format!(
            "text: {} → {} chars",
            old.text.chars().count(),
            new.text.chars().count()
        ));
    }
    for (name, o, n) in [
        ("page_title", &old.metadata.page_title, &new.metadata.page_title),
        ("source", &old.metadata.source, &new.metadata.source),
        ("license", &old.metadata.license, &new.metadata.license),
    ] {
        if o != n {
            changes.push(format!("{name}: \"{o}\" → \"{n}\""));
        }
    }

    // Custom keys: current order first, then keys only present before.
    for field in &new.metadata.custom {
        let before = old.metadata.custom_value(&field.key).unwrap_or("");
        if before != field.value {
            changes.push(format!("{}: \"{}\" → \"{}\"", field.key, before, field.value));
        }
    }
    for field in &old.metadata.custom {
        if new.metadata.custom_value(&field.key).is_none() && !field.value.is_empty() {
            changes.push(format!("{}: \"{}\" → \"\"", field.key, field.value));
        }
    }

    changes
}
