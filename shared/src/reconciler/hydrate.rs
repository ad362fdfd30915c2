//! Full reads of a user's graph into the mirror.

use std::collections::BTreeSet;

use tracing::{debug, info, instrument};

use super::{refresh_visible, settle, Operation, ReconcileResult, StateReconciler};
use crate::capabilities::{AssetStore, GraphRepository, GraphResult};
use crate::geo::limit_to_box;
use crate::ids::{LayerId, MapId};
use crate::mapping::{
    resolve_layer_id, user_accolade, user_album, user_layers, user_location, user_maps,
    user_top_list,
};
use crate::model::{
    dedup_by_id, find_by_id, Album, Identity, Itinerary, Layer, Location, Map, TopList, UserState,
};

/// Everything a load reads, gathered before the mirror is touched.
struct Snapshot {
    maps: Vec<Map>,
    layers: Vec<Layer>,
    albums: Vec<Album>,
    itineraries: Vec<Itinerary>,
    top_lists: Vec<TopList>,
    excluded_curations: Vec<String>,
    selected_map_id: Option<MapId>,
    selected_layer_ids: BTreeSet<LayerId>,
    /// `None` keeps the locations already mirrored.
    all_locations: Option<Vec<Location>>,
}

impl Snapshot {
    fn commit(self, state: &mut UserState) {
        state.maps = self.maps;
        state.layers = self.layers;
        state.albums = self.albums;
        state.itineraries = self.itineraries;
        state.top_lists = self.top_lists;
        state.excluded_curated_locations = self.excluded_curations;
        state.selected_map_id = self.selected_map_id;
        state.selected_layer_ids = self.selected_layer_ids;
        if let Some(mut locations) = self.all_locations {
            dedup_by_id(&mut locations);
            state.all_locations = locations;
        }
        state.accolades = state
            .all_locations
            .iter()
            .flat_map(|l| l.accolades.iter().cloned())
            .collect();
        dedup_by_id(&mut state.accolades);
        refresh_visible(state);
    }
}

/// The primary map, or the first map when none is flagged.
fn default_selection(maps: &[Map], layers: &[Layer]) -> (Option<MapId>, BTreeSet<LayerId>) {
    let Some(map) = maps.iter().find(|m| m.primary).or_else(|| maps.first()) else {
        return (None, BTreeSet::new());
    };
    let layer_ids = map
        .default_layer_id
        .map(|id| resolve_layer_id(layers, id))
        .into_iter()
        .collect();
    (map.id, layer_ids)
}

impl<G, A> StateReconciler<G, A>
where
    G: GraphRepository + ?Sized,
    A: AssetStore + ?Sized,
{
    /// Replaces the whole mirror with a fresh read of the graph.
    #[instrument(skip_all, fields(user = %identity.username))]
    pub async fn load(&self, state: &mut UserState, identity: &Identity) -> ReconcileResult<()> {
        let mut state = Operation::begin(state);

        let result = self.snapshot(identity, &state, false).await;
        let Some(snapshot) = settle(&mut state, result, "Error loading user state.")? else {
            return Ok(());
        };
        snapshot.commit(&mut state);

        info!(
            maps = state.maps.len(),
            layers = state.layers.len(),
            locations = state.all_locations.len(),
            "user state loaded"
        );
        Ok(())
    }

    /// Like [`load`](Self::load), but keeps the current map selection and
    /// location set when they are still usable.
    #[instrument(skip_all, fields(user = %identity.username))]
    pub async fn ensure(&self, state: &mut UserState, identity: &Identity) -> ReconcileResult<()> {
        let mut state = Operation::begin(state);

        let result = self.snapshot(identity, &state, true).await;
        let Some(snapshot) = settle(&mut state, result, "Error loading user state.")? else {
            return Ok(());
        };
        snapshot.commit(&mut state);

        info!(locations = state.all_locations.len(), "user state ensured");
        Ok(())
    }

    async fn snapshot(
        &self,
        identity: &Identity,
        current: &UserState,
        keep_view: bool,
    ) -> GraphResult<Snapshot> {
        let maps = self.fetch_maps(identity).await?;
        let layers = self.fetch_layers(identity, &maps).await?;
        let albums = self.fetch_albums(identity).await?;
        let itineraries = self.fetch_itineraries(identity).await?;

        let kept_map = current
            .selected_map_id
            .filter(|id| keep_view && find_by_id(&maps, *id).is_some());
        let (selected_map_id, selected_layer_ids) = match kept_map {
            Some(id) => (Some(id), current.selected_layer_ids.clone()),
            None => default_selection(&maps, &layers),
        };

        let all_locations = if keep_view && !current.all_locations.is_empty() {
            None
        } else {
            let layer_ids: Vec<LayerId> = selected_layer_ids.iter().copied().collect();
            Some(self.fetch_locations(identity, &layers, &layer_ids).await?)
        };

        let user_layer_id = layers
            .iter()
            .find(|l| l.title == self.config.user_layer_title)
            .and_then(|l| l.id);
        let top_lists = self.fetch_top_lists(identity, user_layer_id).await?;
        let excluded_curations = self.graph.list_excluded_curations(identity).await?;

        Ok(Snapshot {
            maps,
            layers,
            albums,
            itineraries,
            top_lists,
            excluded_curations,
            selected_map_id,
            selected_layer_ids,
            all_locations,
        })
    }

    pub(super) async fn fetch_maps(&self, identity: &Identity) -> GraphResult<Vec<Map>> {
        let own = self.graph.list_maps(identity).await?;
        let shared = self.graph.list_shared_maps(identity).await?;
        Ok(user_maps(&own, &shared))
    }

    pub(super) async fn fetch_layers(
        &self,
        identity: &Identity,
        maps: &[Map],
    ) -> GraphResult<Vec<Layer>> {
        let own = self.graph.list_layers(identity).await?;
        let shared = self.graph.list_shared_layers(identity).await?;
        Ok(user_layers(&own, &shared, maps))
    }

    pub(super) async fn fetch_albums(&self, identity: &Identity) -> GraphResult<Vec<Album>> {
        let mut albums = Vec::new();
        for record in self.graph.list_albums(identity).await? {
            let photos = self.graph.list_photos(identity, record.id).await?;
            albums.push(user_album(&record, &photos));
        }
        Ok(albums)
    }

    /// Itineraries with their groups and activities, one call per level.
    pub(super) async fn fetch_itineraries(&self, identity: &Identity) -> GraphResult<Vec<Itinerary>> {
        let mut itineraries = self.graph.list_itineraries(identity).await?;
        for itinerary in &mut itineraries {
            let Some(itinerary_id) = itinerary.id else {
                continue;
            };
            let mut groups = self.graph.list_activity_groups(identity, itinerary_id).await?;
            for group in &mut groups {
                if let Some(group_id) = group.id {
                    group.activities = self
                        .graph
                        .list_activities(identity, itinerary_id, group_id)
                        .await?;
                }
            }
            itinerary.activity_groups = groups;
        }
        Ok(itineraries)
    }

    /// Locations for every listed layer, with accolades attached. A layer that
    /// carries its own box only contributes what falls inside it.
    pub(super) async fn fetch_locations(
        &self,
        identity: &Identity,
        layers: &[Layer],
        layer_ids: &[LayerId],
    ) -> GraphResult<Vec<Location>> {
        let mut locations = Vec::new();
        for &layer_id in layer_ids {
            let layer = find_by_id(layers, layer_id);
            let user_owns = layer.is_some_and(|l| !l.shared);

            let mut batch = Vec::new();
            for record in self.graph.list_locations(identity, layer_id).await? {
                let mut location = user_location(&record, layer_id, user_owns);
                location.accolades = self
                    .graph
                    .list_accolades(identity, record.id)
                    .await?
                    .iter()
                    .map(|a| user_accolade(a, record.id))
                    .collect();
                batch.push(location);
            }

            if let Some(bounds) = layer.and_then(|l| l.bounding_box) {
                batch = limit_to_box(&batch, &bounds);
            }
            debug!(%layer_id, count = batch.len(), "fetched layer locations");
            locations.extend(batch);
        }
        Ok(locations)
    }

    async fn fetch_top_lists(
        &self,
        identity: &Identity,
        user_layer_id: Option<LayerId>,
    ) -> GraphResult<Vec<TopList>> {
        let mut lists = Vec::new();
        for record in self.graph.list_top_lists(identity).await? {
            let locations = self.graph.list_top_list_locations(identity, record.id).await?;
            lists.push(user_top_list(&record, &locations, user_layer_id));
        }
        Ok(lists)
    }
}
