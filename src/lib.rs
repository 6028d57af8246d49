//! # ChunkVault
//!
//! Versioned store for chunked text datasets with a bounded commit history,
//! snapshot diffing, rollback, and live multi-client change broadcast.
//!
//! ## Architecture
//!
//! ```text
//! MutationRequest
//!     ↓
//! [MutationGateway]      → one funnel for every state change
//!     ↓
//! [VersionedStore]       → validate → apply → snapshot → commit
//!     ├── CommitLog      → capacity-bounded FIFO history per dataset
//!     └── PersistBackend → JSON document per dataset (temp + rename)
//!     ↓ on success
//! [BroadcastRouter]      → {event, data} envelopes to session members
//!     └── SessionRegistry → join codes, roles, idle sweeping
//! ```
//!
//! The snapshot differ (`diff`) turns any two commit snapshots into an
//! ordered list of human-readable change records, joining chunks on their
//! stable identifiers so renames and moves are reported as such rather than
//! as delete/add pairs.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use chunkvault::{Config, VersionedStore, JsonFilePersist, CommitSource, NewChunk};
//!
//! let config = Config::load()?;
//! let persist = Arc::new(JsonFilePersist::new(&config.storage.data_dir)?);
//! let store = VersionedStore::open(config.store_config(), persist)?;
//!
//! store.create_dataset("wiki")?;
//! let commit = store.add_category("wiki", "Mobs", CommitSource::Primary)?;
//!
//! // Every mutation is a commit; any commit can be restored
//! let history = store.history("wiki")?;
//! store.rollback("wiki", &history[0].id, CommitSource::Primary)?;
//! ```

pub mod broadcast;
pub mod config;
pub mod diff;
pub mod error;
pub mod gateway;
pub mod history;
pub mod model;
pub mod session;
pub mod store;

pub use crate::broadcast::BroadcastRouter;
pub use crate::config::Config;
pub use crate::diff::{diff, ChangeKind, ChangeRecord, ChangeTarget};
pub use crate::error::{StoreError, StoreResult};
pub use crate::gateway::{Mutation, MutationGateway, MutationOutcome, MutationRequest};
pub use crate::history::{Commit, CommitDetail, CommitLog, CommitMeta, CommitSource};
pub use crate::model::{Category, Chunk, ChunkMetadata, CustomField, Dataset, DatasetStats};
pub use crate::session::{ClientHandle, Role, SessionRegistry, SweeperHandle};
pub use crate::store::persist::{JsonFilePersist, MemoryPersist, PersistBackend};
pub use crate::store::{
    ChunkUpdate, DatasetSummary, FlatRecord, MetadataPatch, NewChunk, StoreConfig, VersionedStore,
};
