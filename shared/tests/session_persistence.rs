#![cfg(feature = "sqlite")]

use std::sync::Arc;

use tempfile::tempdir;
use waymark_state::{
    BoundingBox, BroadcastNotifier, Command, Identity, InMemoryGraph, Map, MemoryAssetStore,
    SessionError, SessionHub, SessionKey, SqliteStateStore, StateReconciler, StateStore,
    StoreConfig, StoreError,
};

type Hub = SessionHub<InMemoryGraph, MemoryAssetStore, SqliteStateStore, BroadcastNotifier>;

fn alice() -> Identity {
    Identity::new("alice", "tenant", "app")
}

fn hub(graph: Arc<InMemoryGraph>, store: Arc<SqliteStateStore>) -> Hub {
    let reconciler = StateReconciler::with_default_config(graph, Arc::new(MemoryAssetStore::new()));
    SessionHub::new(reconciler, store, Arc::new(BroadcastNotifier::default()))
}

fn home() -> Command {
    Command::AddMap {
        map: Map {
            title: "Home".into(),
            primary: true,
            bounding_box: Some(BoundingBox::new(10.0, 10.0, 0.0, -10.0)),
            ..Map::default()
        },
    }
}

#[tokio::test]
async fn mirror_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sessions.db");
    let graph = Arc::new(InMemoryGraph::new());
    let key = SessionKey::new("alice|tab-1").unwrap();

    let saved = {
        let store = Arc::new(SqliteStateStore::open(&path, StoreConfig::default()).unwrap());
        let hub = hub(graph.clone(), store);
        let (state, _) = hub.dispatch(&key, &alice(), home()).await.unwrap();
        let map_id = state.maps[0].id.unwrap();
        let (state, _) = hub
            .dispatch(&key, &alice(), Command::SetSelectedMap { map_id })
            .await
            .unwrap();
        state
    };

    // New process, same database file
    let store = Arc::new(SqliteStateStore::open(&path, StoreConfig::default()).unwrap());
    let hub = hub(graph, store);
    let restored = hub.snapshot(&key).await.unwrap();

    assert_eq!(restored, saved);
    assert_eq!(restored.maps.len(), 1);
    assert_eq!(restored.selected_map_id, saved.maps[0].id);
}

#[tokio::test]
async fn sessions_are_isolated() {
    let store = Arc::new(SqliteStateStore::open_in_memory(StoreConfig::default()).unwrap());
    let hub = hub(Arc::new(InMemoryGraph::new()), store.clone());

    hub.dispatch_raw("alice|tab-1", &alice(), home()).await.unwrap();

    let other = SessionKey::new("alice|tab-2").unwrap();
    assert!(store.load(&other).await.unwrap().is_none());
    assert!(hub.snapshot(&other).await.unwrap().maps.is_empty());
}

#[tokio::test]
async fn oversized_state_is_not_saved() {
    let store = Arc::new(
        SqliteStateStore::open_in_memory(StoreConfig {
            max_state_bytes: 1024,
        })
        .unwrap(),
    );
    let hub = hub(Arc::new(InMemoryGraph::new()), store.clone());
    let key = SessionKey::new("alice").unwrap();

    let long_title = "x".repeat(4096);
    let err = hub
        .dispatch(
            &key,
            &alice(),
            Command::AddMap {
                map: Map {
                    title: long_title,
                    ..Map::default()
                },
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SessionError::Store(StoreError::StateTooLarge { .. })
    ));
    assert!(store.load(&key).await.unwrap().is_none());
}
