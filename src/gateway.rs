//! Mutation Gateway
//!
//! The single funnel every state change goes through: one typed `Mutation`
//! per store operation, applied to the versioned store and, on success,
//! announced to the originating client's session as a `data-changed` event.
//! The originator is excluded from the broadcast; it already holds the
//! post-mutation state. Errors from the store propagate unchanged and
//! nothing is broadcast for a failed mutation.
//!
//! ```text
//! MutationRequest ──▶ MutationGateway ──▶ VersionedStore (commit + persist)
//!                          │ on success
//!                          └─▶ BroadcastRouter.send(code, "data-changed", …)
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::broadcast::BroadcastRouter;
use crate::error::StoreResult;
use crate::history::{CommitMeta, CommitSource};
use crate::session::ClientId;
use crate::store::{ChunkUpdate, FlatRecord, MetadataPatch, NewChunk, VersionedStore};

/// Event name announced to session members after a successful mutation.
pub const EVENT_DATA_CHANGED: &str = "data-changed";

/// Every state-changing operation the gateway accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    CreateDataset { dataset: String },
    DeleteDataset { dataset: String },
    AddCategory { dataset: String, name: String },
    RenameCategory { dataset: String, category: String, name: String },
    DeleteCategory { dataset: String, category: String },
    ToggleCategory { dataset: String, category: String },
    AddChunk { dataset: String, category: String, chunk: NewChunk },
    AddChunks { dataset: String, category: String, chunks: Vec<NewChunk> },
    UpdateChunk { dataset: String, chunk: String, update: ChunkUpdate },
    DeleteChunk { dataset: String, chunk: String },
    DuplicateChunk { dataset: String, chunk: String },
    MoveChunk {
        dataset: String,
        chunk: String,
        category: String,
        #[serde(default)]
        position: Option<usize>,
    },
    UpdateMetadata { dataset: String, chunks: Vec<String>, patch: MetadataPatch },
    Import { dataset: String, category: String, records: Vec<FlatRecord> },
    Merge { dataset: String, from: String },
    Rollback { dataset: String, commit: String },
}

impl Mutation {
    /// Name of the dataset this mutation targets.
    pub fn dataset(&self) -> &str {
        match self {
            Mutation::CreateDataset { dataset }
            | Mutation::DeleteDataset { dataset }
            | Mutation::AddCategory { dataset, .. }
            | Mutation::RenameCategory { dataset, .. }
            | Mutation::DeleteCategory { dataset, .. }
            | Mutation::ToggleCategory { dataset, .. }
            | Mutation::AddChunk { dataset, .. }
            | Mutation::AddChunks { dataset, .. }
            | Mutation::UpdateChunk { dataset, .. }
            | Mutation::DeleteChunk { dataset, .. }
            | Mutation::DuplicateChunk { dataset, .. }
            | Mutation::MoveChunk { dataset, .. }
            | Mutation::UpdateMetadata { dataset, .. }
            | Mutation::Import { dataset, .. }
            | Mutation::Merge { dataset, .. }
            | Mutation::Rollback { dataset, .. } => dataset,
        }
    }
}

/// A mutation plus its provenance: who made it and from which session.
#[derive(Debug, Clone, Deserialize)]
pub struct MutationRequest {
    #[serde(flatten)]
    pub mutation: Mutation,
    /// Join code of the originating session, when the client is in one.
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default = "default_source")]
    pub source: CommitSource,
    /// Originating client, excluded from the change broadcast.
    #[serde(default)]
    pub origin: Option<ClientId>,
}

fn default_source() -> CommitSource {
    CommitSource::Primary
}

/// Result of a successful mutation. Dataset lifecycle operations produce no
/// commit; everything else carries the commit's metadata.
#[derive(Debug, Clone, Serialize)]
pub struct MutationOutcome {
    pub dataset: String,
    pub commit: Option<CommitMeta>,
}

/// Funnels all mutations through the store and fans out change events.
pub struct MutationGateway {
    store: Arc<VersionedStore>,
    router: Arc<BroadcastRouter>,
}

impl MutationGateway {
    pub fn new(store: Arc<VersionedStore>, router: Arc<BroadcastRouter>) -> Self {
        MutationGateway { store, router }
    }

    pub fn store(&self) -> &Arc<VersionedStore> {
        &self.store
    }

    pub fn router(&self) -> &Arc<BroadcastRouter> {
        &self.router
    }

    /// Apply one mutation. On success, members of the request's session
    /// (except the originator) are notified; notification is best effort and
    /// never fails the mutation.
    pub fn apply(&self, request: MutationRequest) -> StoreResult<MutationOutcome> {
        let dataset = request.mutation.dataset().to_string();
        let source = request.source.clone();
        let commit = self.dispatch(request.mutation, source)?;
        if let Some(code) = &request.session {
            self.announce(code, &dataset, request.origin.as_deref());
        }
        Ok(MutationOutcome { dataset, commit })
    }

    fn dispatch(&self, mutation: Mutation, source: CommitSource) -> StoreResult<Option<CommitMeta>> {
        let store = &self.store;
        match mutation {
            Mutation::CreateDataset { dataset } => {
                store.create_dataset(&dataset)?;
                Ok(None)
            }
            Mutation::DeleteDataset { dataset } => {
                store.delete_dataset(&dataset)?;
                Ok(None)
            }
            Mutation::AddCategory { dataset, name } => {
                store.add_category(&dataset, &name, source).map(Some)
            }
            Mutation::RenameCategory { dataset, category, name } => store
                .rename_category(&dataset, &category, &name, source)
                .map(Some),
            Mutation::DeleteCategory { dataset, category } => {
                store.delete_category(&dataset, &category, source).map(Some)
            }
            Mutation::ToggleCategory { dataset, category } => {
                store.toggle_category(&dataset, &category, source).map(Some)
            }
            Mutation::AddChunk { dataset, category, chunk } => {
                store.add_chunk(&dataset, &category, chunk, source).map(Some)
            }
            Mutation::AddChunks { dataset, category, chunks } => {
                store.add_chunks(&dataset, &category, chunks, source).map(Some)
            }
            Mutation::UpdateChunk { dataset, chunk, update } => {
                store.update_chunk(&dataset, &chunk, update, source).map(Some)
            }
            Mutation::DeleteChunk { dataset, chunk } => {
                store.delete_chunk(&dataset, &chunk, source).map(Some)
            }
            Mutation::DuplicateChunk { dataset, chunk } => {
                store.duplicate_chunk(&dataset, &chunk, source).map(Some)
            }
            Mutation::MoveChunk { dataset, chunk, category, position } => store
                .move_chunk(&dataset, &chunk, &category, position, source)
                .map(Some),
            Mutation::UpdateMetadata { dataset, chunks, patch } => store
                .update_metadata_bulk(&dataset, &chunks, patch, source)
                .map(Some),
            Mutation::Import { dataset, category, records } => {
                store.import(&dataset, &category, records, source).map(Some)
            }
            Mutation::Merge { dataset, from } => {
                store.merge(&dataset, &from, source).map(Some)
            }
            Mutation::Rollback { dataset, commit } => {
                store.rollback(&dataset, &commit, source).map(Some)
            }
        }
    }

    fn announce(&self, code: &str, dataset: &str, origin: Option<&str>) {
        let result = self.router.send(
            code,
            EVENT_DATA_CHANGED,
            json!({ "dataset": dataset }),
            origin,
        );
        if let Err(e) = result {
            // The mutation already committed; a vanished session only costs
            // the notification.
            warn!(code = %code, dataset = %dataset, error = %e, "change_broadcast_failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ClientHandle, Role, SessionConfig, SessionRegistry};
    use crate::store::persist::MemoryPersist;
    use crate::store::StoreConfig;
    use tokio::sync::mpsc;

    fn gateway() -> MutationGateway {
        let store = Arc::new(
            VersionedStore::open(StoreConfig::default(), Arc::new(MemoryPersist::new())).unwrap(),
        );
        let registry = Arc::new(SessionRegistry::new(SessionConfig::default()));
        MutationGateway::new(store, Arc::new(BroadcastRouter::new(registry)))
    }

    fn handle(role: Role) -> (ClientHandle, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientHandle::new(role, tx), rx)
    }

    fn request(mutation: Mutation) -> MutationRequest {
        MutationRequest {
            mutation,
            session: None,
            source: CommitSource::Primary,
            origin: None,
        }
    }

    #[test]
    fn test_apply_without_session_commits() {
        let gw = gateway();
        gw.apply(request(Mutation::CreateDataset {
            dataset: "d".to_string(),
        }))
        .unwrap();
        let outcome = gw
            .apply(request(Mutation::AddCategory {
                dataset: "d".to_string(),
                name: "Mobs".to_string(),
            }))
            .unwrap();

        assert_eq!(outcome.dataset, "d");
        let commit = outcome.commit.unwrap();
        assert_eq!(commit.action, "add_category");
        assert_eq!(gw.store().history("d").unwrap().len(), 1);
    }

    #[test]
    fn test_successful_mutation_broadcasts_excluding_origin() {
        let gw = gateway();
        let code = gw.router().registry().create().unwrap();
        let (primary, mut primary_rx) = handle(Role::Primary);
        let primary_id = primary.id.clone();
        let (secondary, mut secondary_rx) = handle(Role::Secondary);
        gw.router().join(&code, primary).unwrap();
        gw.router().join(&code, secondary).unwrap();
        let _ = primary_rx.try_recv(); // presence event

        gw.apply(request(Mutation::CreateDataset {
            dataset: "d".to_string(),
        }))
        .unwrap();
        gw.apply(MutationRequest {
            mutation: Mutation::AddCategory {
                dataset: "d".to_string(),
                name: "Mobs".to_string(),
            },
            session: Some(code),
            source: CommitSource::Primary,
            origin: Some(primary_id),
        })
        .unwrap();

        let msg: serde_json::Value =
            serde_json::from_str(&secondary_rx.try_recv().unwrap()).unwrap();
        assert_eq!(msg["event"], EVENT_DATA_CHANGED);
        assert_eq!(msg["data"]["dataset"], "d");
        // Originator is not notified of its own change
        assert!(primary_rx.try_recv().is_err());
    }

    #[test]
    fn test_failed_mutation_propagates_and_stays_silent() {
        let gw = gateway();
        let code = gw.router().registry().create().unwrap();
        let (secondary, mut secondary_rx) = handle(Role::Secondary);
        gw.router().join(&code, secondary).unwrap();

        let err = gw
            .apply(MutationRequest {
                mutation: Mutation::AddCategory {
                    dataset: "missing".to_string(),
                    name: "Mobs".to_string(),
                },
                session: Some(code),
                source: CommitSource::Secondary,
                origin: None,
            })
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(secondary_rx.try_recv().is_err());
    }

    #[test]
    fn test_vanished_session_does_not_fail_mutation() {
        let gw = gateway();
        gw.apply(request(Mutation::CreateDataset {
            dataset: "d".to_string(),
        }))
        .unwrap();

        let outcome = gw.apply(MutationRequest {
            mutation: Mutation::AddCategory {
                dataset: "d".to_string(),
                name: "Mobs".to_string(),
            },
            session: Some("GONE42".to_string()),
            source: CommitSource::Primary,
            origin: None,
        });
        assert!(outcome.is_ok());
        assert_eq!(gw.store().history("d").unwrap().len(), 1);
    }

    #[test]
    fn test_mutation_request_wire_shape() {
        let json = r#"{
            "op": "add_chunk",
            "dataset": "wiki",
            "category": "cat-uid",
            "chunk": { "id": "creeper", "text": "hostile" },
            "session": "ABC234",
            "source": "secondary"
        }"#;
        let request: MutationRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.session.as_deref(), Some("ABC234"));
        assert_eq!(request.source, CommitSource::Secondary);
        match request.mutation {
            Mutation::AddChunk { dataset, chunk, .. } => {
                assert_eq!(dataset, "wiki");
                assert_eq!(chunk.id, "creeper");
            }
            other => panic!("unexpected mutation: {other:?}"),
        }
    }
}
