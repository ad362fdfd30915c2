use tracing::{info, instrument};

use super::{refresh_visible, reject, repair_primary, settle, Operation, ReconcileResult, StateReconciler};
use crate::capabilities::{AssetStore, GraphRepository};
use crate::ids::MapId;
use crate::model::{remove_by_id, replace_by_id, upsert_by_id, BoundingBox, Identity, Map, UserState};

impl<G, A> StateReconciler<G, A>
where
    G: GraphRepository + ?Sized,
    A: AssetStore + ?Sized,
{
    /// Adds a map and makes it the selected one.
    #[instrument(skip_all, fields(user = %identity.username, title = %map.title, shared = map.shared))]
    pub async fn add_map(
        &self,
        state: &mut UserState,
        identity: &Identity,
        mut map: Map,
    ) -> ReconcileResult<()> {
        let mut state = Operation::begin(state);

        let result = if map.shared {
            self.graph
                .add_shared_map(identity, &map, map.inherited_id)
                .await
        } else {
            self.graph.add_map(identity, &map).await
        };
        let Some(map_id) = settle(&mut state, result, "Error adding map.")? else {
            return Ok(());
        };

        map.id = Some(map_id);
        map.deletable = true;
        if !map.shared {
            map.inherited_id = Some(map_id);
        }
        upsert_by_id(&mut state.maps, map);
        state.selected_map_id = Some(map_id);
        refresh_visible(&mut state);

        info!(%map_id, "map added");
        Ok(())
    }

    #[instrument(skip_all, fields(user = %identity.username, map_id = ?map.id))]
    pub async fn edit_map(
        &self,
        state: &mut UserState,
        identity: &Identity,
        map: Map,
    ) -> ReconcileResult<()> {
        let mut state = Operation::begin(state);

        let shared = map
            .id
            .and_then(|id| state.maps.iter().find(|m| m.id == Some(id)))
            .map(|m| m.shared);
        let Some(shared) = shared else {
            reject(&mut state, "Map not found.");
            return Ok(());
        };

        let result = if shared {
            self.graph.edit_shared_map(identity, &map).await
        } else {
            self.graph.edit_map(identity, &map).await
        };
        if settle(&mut state, result, "Error editing map.")?.is_none() {
            return Ok(());
        }

        let selected = map.id == state.selected_map_id;
        replace_by_id(&mut state.maps, map);
        if selected {
            refresh_visible(&mut state);
        }

        info!("map edited");
        Ok(())
    }

    #[instrument(skip_all, fields(user = %identity.username, %map_id))]
    pub async fn delete_map(
        &self,
        state: &mut UserState,
        identity: &Identity,
        map_id: MapId,
    ) -> ReconcileResult<()> {
        let mut state = Operation::begin(state);

        let found = state
            .maps
            .iter()
            .find(|m| m.id == Some(map_id))
            .map(|m| (m.shared, m.deletable));
        let Some((shared, deletable)) = found else {
            reject(&mut state, "Map not found.");
            return Ok(());
        };
        if !deletable {
            reject(&mut state, "This map cannot be deleted.");
            return Ok(());
        }

        let result = if shared {
            self.graph.delete_shared_map(identity, map_id).await
        } else {
            self.graph.delete_map(identity, map_id).await
        };
        if settle(&mut state, result, "Error deleting map.")?.is_none() {
            return Ok(());
        }

        remove_by_id(&mut state.maps, map_id);
        repair_primary(&mut state);

        info!("map deleted");
        Ok(())
    }

    #[instrument(skip_all, fields(user = %identity.username, count = map_ids.len()))]
    pub async fn delete_maps(
        &self,
        state: &mut UserState,
        identity: &Identity,
        map_ids: &[MapId],
    ) -> ReconcileResult<()> {
        let mut state = Operation::begin(state);

        let result = self.graph.delete_maps(identity, map_ids).await;
        if settle(&mut state, result, "Error deleting maps.")?.is_none() {
            return Ok(());
        }

        state
            .maps
            .retain(|m| m.id.map_or(true, |id| !map_ids.contains(&id)));
        repair_primary(&mut state);

        info!(remaining = state.maps.len(), "maps deleted");
        Ok(())
    }

    #[instrument(skip_all, fields(user = %identity.username, %map_id))]
    pub async fn set_selected_map(
        &self,
        state: &mut UserState,
        identity: &Identity,
        map_id: MapId,
    ) -> ReconcileResult<()> {
        let mut state = Operation::begin(state);

        if !state.maps.iter().any(|m| m.id == Some(map_id)) {
            reject(&mut state, "Map not found.");
            return Ok(());
        }
        state.selected_map_id = Some(map_id);
        refresh_visible(&mut state);
        Ok(())
    }

    /// Moves the selected map's viewport. Mirror only.
    #[instrument(skip_all, fields(user = %identity.username))]
    pub async fn change_viewing_area(
        &self,
        state: &mut UserState,
        identity: &Identity,
        bounding_box: BoundingBox,
    ) -> ReconcileResult<()> {
        let mut state = Operation::begin(state);

        if state.selected_map().is_none() {
            reject(&mut state, "No map selected.");
            return Ok(());
        }
        if let Some(map) = state.selected_map_mut() {
            map.bounding_box = Some(bounding_box);
        }
        refresh_visible(&mut state);
        Ok(())
    }

    #[instrument(skip_all, fields(user = %identity.username, %map_id))]
    pub async fn dedup_locations_by_map(
        &self,
        state: &mut UserState,
        identity: &Identity,
        map_id: MapId,
    ) -> ReconcileResult<()> {
        let mut state = Operation::begin(state);

        let result = self.graph.dedup_locations_by_map(identity, map_id).await;
        if settle(&mut state, result, "Error removing duplicate locations.")?.is_some() {
            info!("duplicate locations removed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{alice, reconciler};
    use super::*;
    use crate::capabilities::{GraphError, MapRecord, SharedMapRecord};
    use crate::ids::LayerId;
    use crate::model::Location;

    fn owned(title: &str, primary: bool) -> Map {
        Map {
            title: title.into(),
            primary,
            bounding_box: Some(BoundingBox::new(10.0, 10.0, 0.0, -10.0)),
            default_layer_id: Some(LayerId::generate()),
            ..Map::default()
        }
    }

    #[tokio::test]
    async fn add_map_selects_it() {
        let (_, _, rec) = reconciler();
        let mut state = UserState::new();
        rec.add_map(&mut state, &alice(), owned("Home", true)).await.unwrap();

        assert_eq!(state.maps.len(), 1);
        let map = &state.maps[0];
        assert!(map.id.is_some());
        assert_eq!(map.inherited_id, map.id);
        assert_eq!(state.selected_map_id, map.id);
        assert!(!state.loading);
    }

    #[tokio::test]
    async fn shared_map_with_unknown_parent_is_rejected() {
        let (_, _, rec) = reconciler();
        let mut state = UserState::new();
        let map = Map {
            shared: true,
            inherited_id: Some(MapId::generate()),
            ..owned("Curated", false)
        };
        rec.add_map(&mut state, &alice(), map).await.unwrap();
        assert!(state.maps.is_empty());
        assert_eq!(state.error.as_deref(), Some("Error adding map."));
    }

    #[tokio::test]
    async fn edit_unknown_map_is_rejected_without_calls() {
        let (graph, _, rec) = reconciler();
        let mut state = UserState::new();
        let map = Map {
            id: Some(MapId::generate()),
            ..owned("Ghost", false)
        };
        rec.edit_map(&mut state, &alice(), map).await.unwrap();
        assert_eq!(state.error.as_deref(), Some("Map not found."));
        assert_eq!(graph.call_count("edit_map"), 0);
    }

    #[tokio::test]
    async fn edit_selected_map_refreshes_visible() {
        let (_, _, rec) = reconciler();
        let mut state = UserState::new();
        rec.add_map(&mut state, &alice(), owned("Home", true)).await.unwrap();
        state.all_locations = vec![Location {
            latitude: 40.0,
            longitude: 40.0,
            ..Location::default()
        }];

        let mut map = state.maps[0].clone();
        map.bounding_box = Some(BoundingBox::new(50.0, 50.0, 30.0, 30.0));
        rec.edit_map(&mut state, &alice(), map).await.unwrap();
        assert_eq!(state.visible_locations.len(), 1);
    }

    #[tokio::test]
    async fn deleting_primary_promotes_curated_map() {
        let (graph, _, rec) = reconciler();
        let mut state = UserState::new();
        rec.add_map(&mut state, &alice(), owned("A", true)).await.unwrap();
        let a = state.maps[0].id.unwrap();

        let parent = MapRecord {
            id: a,
            ..MapRecord::default()
        };
        let b = MapId::generate();
        graph
            .seed_shared_map(
                &alice(),
                SharedMapRecord {
                    id: b,
                    title: "B".into(),
                    primary: false,
                    deletable: false,
                    parent,
                },
            )
            .await;
        state.maps.push(Map {
            id: Some(b),
            shared: true,
            deletable: false,
            ..owned("B", false)
        });

        rec.delete_map(&mut state, &alice(), a).await.unwrap();

        assert_eq!(state.maps.len(), 1);
        assert!(state.maps[0].primary);
        assert_eq!(state.selected_map_id, Some(b));
    }

    #[tokio::test]
    async fn non_deletable_map_is_kept() {
        let (graph, _, rec) = reconciler();
        let mut state = UserState::new();
        let id = MapId::generate();
        state.maps.push(Map {
            id: Some(id),
            shared: true,
            deletable: false,
            ..owned("Curated", true)
        });
        rec.delete_map(&mut state, &alice(), id).await.unwrap();
        assert_eq!(state.maps.len(), 1);
        assert!(state.has_error());
        assert_eq!(graph.call_count("delete_shared_map"), 0);
    }

    #[tokio::test]
    async fn bulk_delete_repairs_primary() {
        let (_, _, rec) = reconciler();
        let mut state = UserState::new();
        for (title, primary) in [("A", true), ("B", false), ("C", false)] {
            rec.add_map(&mut state, &alice(), owned(title, primary)).await.unwrap();
        }
        let doomed: Vec<_> = state.maps[..2].iter().filter_map(|m| m.id).collect();

        rec.delete_maps(&mut state, &alice(), &doomed).await.unwrap();

        assert_eq!(state.maps.len(), 1);
        assert_eq!(state.maps[0].title, "C");
        assert!(state.maps[0].primary);
        assert_eq!(state.selected_map_id, state.maps[0].id);
    }

    #[tokio::test]
    async fn transport_failure_leaves_mirror_and_clears_loading() {
        let (graph, _, rec) = reconciler();
        let mut state = UserState::new();
        rec.add_map(&mut state, &alice(), owned("A", true)).await.unwrap();
        let before = state.clone();

        graph.fail_operation("delete_map", GraphError::Unavailable("timeout".into()));
        let id = state.maps[0].id.unwrap();
        let err = rec.delete_map(&mut state, &alice(), id).await.unwrap_err();

        assert!(matches!(err, super::super::ReconcileError::Graph(_)));
        assert_eq!(state, before);
        assert!(!state.loading);
    }

    #[tokio::test]
    async fn viewing_area_change_filters_locally() {
        let (graph, _, rec) = reconciler();
        let mut state = UserState::new();
        rec.add_map(&mut state, &alice(), owned("A", true)).await.unwrap();
        state.all_locations = vec![
            Location {
                latitude: 5.0,
                longitude: 175.0,
                ..Location::default()
            },
            Location {
                latitude: 5.0,
                longitude: 0.0,
                ..Location::default()
            },
        ];
        graph.reset_calls();

        rec.change_viewing_area(&mut state, &alice(), BoundingBox::new(10.0, -170.0, 0.0, 170.0))
            .await
            .unwrap();

        assert_eq!(state.visible_locations.len(), 1);
        assert!((state.visible_locations[0].longitude - 175.0).abs() < f64::EPSILON);
        assert_eq!(graph.call_count("edit_map"), 0);
    }
}
