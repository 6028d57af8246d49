//! Dataset Model
//!
//! In-memory representation of a versioned dataset: an ordered list of
//! categories, each holding an ordered list of chunks. Every category and
//! chunk carries a stable identifier assigned at creation, immutable for its
//! lifetime, and distinct from any user-editable field. Snapshots taken for
//! the commit log are structural deep copies (`Dataset::snapshot`) so that
//! history never aliases live mutable state.
//!
//! ```text
//! Dataset "wiki"
//! ├── Category "Mobs" (uid a1…, expanded)
//! │   ├── Chunk id="creeper" (uid f3…)
//! │   └── Chunk id="zombie"  (uid 9c…)
//! └── Category "Items" (uid 07…)
//!     └── Chunk id="sword"   (uid 5e…)
//! ```

use serde::{Deserialize, Serialize};

/// Maximum length of a chunk's text body, in characters.
pub const MAX_CHUNK_TEXT_CHARS: usize = 2000;

/// Stable identifier: an opaque token assigned at creation, immutable for
/// the entity's lifetime. Distinct from user-facing ids.
pub type StableId = String;

/// Generate a fresh stable identifier.
pub fn new_stable_id() -> StableId {
    uuid::Uuid::new_v4().to_string()
}

/// A custom metadata key/value pair. Order is preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomField {
    pub key: String,
    pub value: String,
}

/// Chunk metadata: three reserved fields plus an open-ended ordered list of
/// custom key/value pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    #[serde(default)]
    pub page_title: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub license: String,
    #[serde(default)]
    pub custom: Vec<CustomField>,
}

impl ChunkMetadata {
    /// Look up a custom field value by key.
    pub fn custom_value(&self, key: &str) -> Option<&str> {
        self.custom
            .iter()
            .find(|f| f.key == key)
            .map(|f| f.value.as_str())
    }

    /// Insert or replace a custom field, preserving insertion order for new keys.
    pub fn set_custom(&mut self, key: &str, value: &str) {
        if let Some(field) = self.custom.iter_mut().find(|f| f.key == key) {
            field.value = value.to_string();
        } else {
            self.custom.push(CustomField {
                key: key.to_string(),
                value: value.to_string(),
            });
        }
    }
}

/// The atomic unit of content: a text body plus metadata.
///
/// `uid` is the stable identifier; `id` is the user-facing id, mutable and
/// subject to a dataset-wide uniqueness constraint when non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub uid: StableId,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub metadata: ChunkMetadata,
}

impl Chunk {
    /// Create a chunk with a fresh stable identifier.
    pub fn new(id: impl Into<String>, text: impl Into<String>, metadata: ChunkMetadata) -> Self {
        Chunk {
            uid: new_stable_id(),
            id: id.into(),
            text: text.into(),
            metadata,
        }
    }
}

/// An ordered group of chunks with a mutable display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub uid: StableId,
    pub name: String,
    /// UI-only expansion flag; versioned like any other field.
    #[serde(default = "default_expanded")]
    pub expanded: bool,
    #[serde(default)]
    pub chunks: Vec<Chunk>,
}

fn default_expanded() -> bool {
    true
}

impl Category {
    /// Create an empty, expanded category with a fresh stable identifier.
    pub fn new(name: impl Into<String>) -> Self {
        Category {
            uid: new_stable_id(),
            name: name.into(),
            expanded: true,
            chunks: Vec::new(),
        }
    }
}

/// Aggregate counts for a dataset, recomputed from a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetStats {
    pub categories: usize,
    pub chunks: usize,
}

/// The top-level named collection of categories under version control.
///
/// The live `Dataset` is owned exclusively by the versioned store; historical
/// snapshots are deep copies and never share structure with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    #[serde(default)]
    pub categories: Vec<Category>,
}

impl Dataset {
    /// Create an empty dataset.
    pub fn new(name: impl Into<String>) -> Self {
        Dataset {
            name: name.into(),
            categories: Vec::new(),
        }
    }

    /// Deep copy of the full dataset state. All fields are owned values, so
    /// a structural clone shares nothing with the live dataset.
    pub fn snapshot(&self) -> Dataset {
        self.clone()
    }

    /// Category and chunk counts.
    pub fn stats(&self) -> DatasetStats {
        DatasetStats {
            categories: self.categories.len(),
            chunks: self.categories.iter().map(|c| c.chunks.len()).sum(),
        }
    }

    /// Find a category by stable identifier.
    pub fn category(&self, uid: &str) -> Option<&Category> {
        self.categories.iter().find(|c| c.uid == uid)
    }

    /// Find a category by stable identifier, mutably.
    pub fn category_mut(&mut self, uid: &str) -> Option<&mut Category> {
        self.categories.iter_mut().find(|c| c.uid == uid)
    }

    /// Find a category by display name (first match in display order).
    pub fn category_by_name(&self, name: &str) -> Option<&Category> {
        self.categories.iter().find(|c| c.name == name)
    }

    /// Find a chunk by stable identifier, with its owning category's uid.
    pub fn chunk(&self, uid: &str) -> Option<(&Category, &Chunk)> {
        self.categories.iter().find_map(|cat| {
            cat.chunks
                .iter()
                .find(|ch| ch.uid == uid)
                .map(|ch| (cat, ch))
        })
    }

    /// Find a chunk by stable identifier, mutably.
    pub fn chunk_mut(&mut self, uid: &str) -> Option<&mut Chunk> {
        self.categories
            .iter_mut()
            .find_map(|cat| cat.chunks.iter_mut().find(|ch| ch.uid == uid))
    }

    /// Whether a non-empty user-facing chunk id is already in use, optionally
    /// excluding one chunk (by stable identifier) from the check.
    ///
    /// Enforced at mutation time only; imported or rolled-back data may
    /// transiently violate uniqueness.
    pub fn chunk_id_in_use(&self, id: &str, exclude_uid: Option<&str>) -> bool {
        if id.is_empty() {
            return false;
        }
        self.categories.iter().any(|cat| {
            cat.chunks
                .iter()
                .any(|ch| ch.id == id && Some(ch.uid.as_str()) != exclude_uid)
        })
    }
}
