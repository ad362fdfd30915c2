use std::sync::Arc;

use waymark_state::{
    Activity, ActivityGroup, BoundingBox, Command, CommandOutcome, GraphError, Identity,
    InMemoryGraph, Itinerary, Location, Map, MemoryAssetStore, ReconcileError, StateReconciler,
    UserState,
};

type Reconciler = StateReconciler<InMemoryGraph, MemoryAssetStore>;

fn alice() -> Identity {
    Identity::new("alice", "tenant", "app")
}

fn setup() -> (Arc<InMemoryGraph>, Reconciler) {
    let graph = Arc::new(InMemoryGraph::new());
    let reconciler =
        StateReconciler::with_default_config(graph.clone(), Arc::new(MemoryAssetStore::new()));
    (graph, reconciler)
}

async fn apply(rec: &Reconciler, state: &mut UserState, command: Command) -> CommandOutcome {
    rec.apply(state, &alice(), command).await.unwrap()
}

#[tokio::test]
async fn map_locations_and_search_flow() {
    let (graph, rec) = setup();
    let layer = graph.seed_layer(&alice(), "User").await;
    let mut state = UserState::new();

    // 1. A primary map whose default layer is the user's own
    apply(
        &rec,
        &mut state,
        Command::AddMap {
            map: Map {
                title: "Home".into(),
                primary: true,
                default_layer_id: Some(layer),
                bounding_box: Some(BoundingBox::new(10.0, 10.0, 0.0, -10.0)),
                ..Map::default()
            },
        },
    )
    .await;

    // 2. Fresh load picks up the layer and selects it
    apply(&rec, &mut state, Command::Load).await;
    assert!(state.error.is_none());
    assert!(state.selected_layer_ids.contains(&layer));
    assert!(!state.loading);

    // 3. One location inside the viewport, one far outside
    for (title, latitude) in [("Cafe In", 5.0), ("Cafe Out", 50.0)] {
        apply(
            &rec,
            &mut state,
            Command::AddLocation(Box::new(Location {
                title: title.into(),
                latitude,
                longitude: 5.0,
                layer_id: Some(layer),
                ..Location::default()
            })),
        )
        .await;
    }
    assert_eq!(state.all_locations.len(), 2);
    assert_eq!(state.visible_locations.len(), 1);
    assert_eq!(state.visible_locations[0].title, "Cafe In");

    // 4. Search splits matches by the viewport
    apply(&rec, &mut state, Command::GlobalSearch { term: "Cafe".into() }).await;
    assert_eq!(state.local_search_locations.len(), 1);
    assert_eq!(state.other_search_locations.len(), 1);
    assert_eq!(state.other_search_locations[0].title, "Cafe Out");

    // 5. A second session sees the same graph
    let mut other = UserState::new();
    apply(&rec, &mut other, Command::Load).await;
    assert_eq!(other.maps, state.maps);
    assert_eq!(other.all_locations.len(), 2);
}

#[tokio::test]
async fn itinerary_lifecycle() {
    let (_graph, rec) = setup();
    let mut state = UserState::new();

    let itinerary = Itinerary {
        title: "Lisbon".into(),
        activity_groups: vec![ActivityGroup {
            title: "Day 1".into(),
            activities: vec![
                Activity {
                    title: "Breakfast".into(),
                    order: 0,
                    ..Activity::default()
                },
                Activity {
                    title: "Museum".into(),
                    order: 1,
                    ..Activity::default()
                },
            ],
            ..ActivityGroup::default()
        }],
        ..Itinerary::default()
    };

    let outcome = apply(&rec, &mut state, Command::AddItinerary(Box::new(itinerary))).await;
    assert!(outcome.is_success());

    let added = &state.itineraries[0];
    assert!(added.editable);
    let itinerary_id = added.id.unwrap();
    assert!(added.activity_groups[0].activities.iter().all(|a| a.id.is_some()));

    // Drop the museum and rename the group
    let mut edited = added.clone();
    edited.activity_groups[0].title = "First day".into();
    edited.activity_groups[0].activities.truncate(1);
    let outcome = apply(&rec, &mut state, Command::EditItinerary(Box::new(edited))).await;
    assert!(outcome.is_success());

    let group = &state.itineraries[0].activity_groups[0];
    assert_eq!(group.title, "First day");
    assert_eq!(group.activities.len(), 1);

    let outcome = apply(&rec, &mut state, Command::DeleteItinerary { itinerary_id }).await;
    assert!(outcome.is_success());
    assert!(state.itineraries.is_empty());
}

#[tokio::test]
async fn outage_and_rejection_use_separate_channels() {
    let (graph, rec) = setup();
    let mut state = UserState::new();

    graph.fail_operation("add_map", GraphError::rejected("add_map", "quota"));
    apply(&rec, &mut state, Command::AddMap { map: Map::default() }).await;
    assert_eq!(state.error.as_deref(), Some("Error adding map."));
    assert!(state.maps.is_empty());

    graph.clear_failures();
    graph.set_unavailable(true);
    let err = rec
        .apply(&mut state, &alice(), Command::AddMap { map: Map::default() })
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Graph(GraphError::Unavailable(_))));
    assert!(state.maps.is_empty());
    assert!(!state.loading);
}
