//! Session and broadcast integration tests: the full primary/secondary
//! collaboration flow over the mutation gateway.

use std::sync::Arc;

use chunkvault::session::{start_sweeper, SessionConfig};
use chunkvault::{
    BroadcastRouter, ClientHandle, CommitSource, MemoryPersist, Mutation, MutationGateway,
    MutationRequest, NewChunk, Role, SessionRegistry, StoreConfig, VersionedStore,
};
use tokio::sync::mpsc;

fn gateway() -> MutationGateway {
    let store = Arc::new(
        VersionedStore::open(StoreConfig::default(), Arc::new(MemoryPersist::new())).unwrap(),
    );
    let registry = Arc::new(SessionRegistry::new(SessionConfig::default()));
    MutationGateway::new(store, Arc::new(BroadcastRouter::new(registry)))
}

fn client(role: Role) -> (ClientHandle, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ClientHandle::new(role, tx), rx)
}

fn parse(raw: String) -> serde_json::Value {
    serde_json::from_str(&raw).unwrap()
}

#[test]
fn test_primary_secondary_change_propagation() {
    let gw = gateway();
    let code = gw.router().registry().create().unwrap();

    let (primary, mut primary_rx) = client(Role::Primary);
    let primary_id = primary.id.clone();
    gw.router().join(&code, primary).unwrap();

    let (secondary, mut secondary_rx) = client(Role::Secondary);
    gw.router().join(&code, secondary).unwrap();

    // Primary is told a secondary arrived
    let presence = parse(primary_rx.try_recv().unwrap());
    assert_eq!(presence["event"], "secondary-connected");

    gw.apply(MutationRequest {
        mutation: Mutation::CreateDataset {
            dataset: "wiki".to_string(),
        },
        session: Some(code.clone()),
        source: CommitSource::Primary,
        origin: Some(primary_id.clone()),
    })
    .unwrap();
    gw.apply(MutationRequest {
        mutation: Mutation::AddCategory {
            dataset: "wiki".to_string(),
            name: "Mobs".to_string(),
        },
        session: Some(code.clone()),
        source: CommitSource::Primary,
        origin: Some(primary_id),
    })
    .unwrap();

    // Secondary sees one data-changed per mutation; primary sees none of its own
    for _ in 0..2 {
        let msg = parse(secondary_rx.try_recv().unwrap());
        assert_eq!(msg["event"], "data-changed");
        assert_eq!(msg["data"]["dataset"], "wiki");
    }
    assert!(secondary_rx.try_recv().is_err());
    assert!(primary_rx.try_recv().is_err());
}

#[test]
fn test_secondary_edit_notifies_primary() {
    let gw = gateway();
    let code = gw.router().registry().create().unwrap();

    let (primary, mut primary_rx) = client(Role::Primary);
    gw.router().join(&code, primary).unwrap();
    let (secondary, _secondary_rx) = client(Role::Secondary);
    let secondary_id = secondary.id.clone();
    gw.router().join(&code, secondary).unwrap();
    let _ = primary_rx.try_recv(); // presence

    gw.store().create_dataset("wiki").unwrap();
    gw.store()
        .add_category("wiki", "Mobs", CommitSource::Primary)
        .unwrap();
    let cat = gw.store().get_dataset("wiki").unwrap().categories[0]
        .uid
        .clone();

    let outcome = gw
        .apply(MutationRequest {
            mutation: Mutation::AddChunk {
                dataset: "wiki".to_string(),
                category: cat,
                chunk: NewChunk {
                    id: "creeper".to_string(),
                    text: "hostile".to_string(),
                    ..Default::default()
                },
            },
            session: Some(code),
            source: CommitSource::Secondary,
            origin: Some(secondary_id),
        })
        .unwrap();

    assert_eq!(outcome.commit.unwrap().source, CommitSource::Secondary);
    let msg = parse(primary_rx.try_recv().unwrap());
    assert_eq!(msg["event"], "data-changed");
}

#[test]
fn test_disconnected_secondary_misses_changes_for_good() {
    let gw = gateway();
    let code = gw.router().registry().create().unwrap();
    let (secondary, mut rx) = client(Role::Secondary);
    let secondary_id = secondary.id.clone();
    gw.router().join(&code, secondary).unwrap();

    gw.store().create_dataset("wiki").unwrap();
    gw.router().leave(&code, &secondary_id).unwrap();

    gw.apply(MutationRequest {
        mutation: Mutation::AddCategory {
            dataset: "wiki".to_string(),
            name: "Mobs".to_string(),
        },
        session: Some(code.clone()),
        source: CommitSource::Primary,
        origin: None,
    })
    .unwrap();

    // Delivery is at most once; nothing is replayed on rejoin
    assert!(rx.try_recv().is_err());
    let (rejoined, mut rx2) = client(Role::Secondary);
    gw.router().join(&code, rejoined).unwrap();
    assert!(rx2.try_recv().is_err());
}

#[test]
fn test_two_sessions_are_isolated() {
    let gw = gateway();
    let code_a = gw.router().registry().create().unwrap();
    let code_b = gw.router().registry().create().unwrap();
    let (in_a, mut rx_a) = client(Role::Secondary);
    let (in_b, mut rx_b) = client(Role::Secondary);
    gw.router().join(&code_a, in_a).unwrap();
    gw.router().join(&code_b, in_b).unwrap();

    gw.store().create_dataset("wiki").unwrap();
    gw.apply(MutationRequest {
        mutation: Mutation::AddCategory {
            dataset: "wiki".to_string(),
            name: "Mobs".to_string(),
        },
        session: Some(code_a),
        source: CommitSource::Primary,
        origin: None,
    })
    .unwrap();

    assert!(rx_a.try_recv().is_ok());
    assert!(rx_b.try_recv().is_err());
}

#[tokio::test]
async fn test_sweeper_removes_abandoned_session_while_serving_others() {
    let registry = Arc::new(SessionRegistry::new(SessionConfig {
        max_sessions: 10,
        idle_timeout_secs: 1,
        sweep_interval_secs: 1,
    }));
    let sweeper = start_sweeper(Arc::clone(&registry));

    let abandoned = registry.create().unwrap();
    let occupied = registry.create().unwrap();
    let (member, _rx) = client(Role::Primary);
    registry.join(&occupied, member).unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(2500)).await;

    assert!(!registry.has_session(&abandoned));
    assert!(registry.has_session(&occupied));
    sweeper.stop().await;
}
