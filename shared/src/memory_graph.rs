//! In-process graph store.
//!
//! Backs local development and tests. It enforces the same ownership rules a
//! real graph would (own layers only, parents outlive children) and can be
//! told to fail specific calls or go unavailable as a whole.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::RwLock;
use tracing::debug;

use crate::capabilities::{
    AccoladeRecord, AlbumRecord, GraphError, GraphRepository, GraphResult, LayerRecord,
    LocationRecord, MapRecord, PhotoRecord, SharedLayerRecord, SharedMapRecord, TopListRecord,
};
use crate::ids::{
    AccoladeId, ActivityGroupId, ActivityId, AlbumId, ItineraryId, LayerId, LocationId, MapId,
    PhotoId, TopListId,
};
use crate::mapping::{location_record, map_record};
use crate::model::{
    Accolade, Activity, ActivityGroup, Album, Identity, Itinerary, Location, Map, Photo, TopList,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Owner {
    tenant: String,
    username: String,
}

impl Owner {
    fn of(identity: &Identity) -> Self {
        Self {
            tenant: identity.tenant_key.clone(),
            username: identity.username.clone(),
        }
    }
}

#[derive(Debug)]
struct StoredLocation {
    layer_id: LayerId,
    record: LocationRecord,
}

#[derive(Debug, Clone)]
struct StoredGroup {
    group: ActivityGroup,
    activities: Vec<Activity>,
}

#[derive(Debug, Clone)]
struct StoredItinerary {
    itinerary: Itinerary,
    groups: Vec<StoredGroup>,
}

#[derive(Debug)]
struct StoredAlbum {
    record: AlbumRecord,
    photos: Vec<PhotoRecord>,
}

#[derive(Debug)]
struct StoredTopList {
    record: TopListRecord,
    location_ids: Vec<LocationId>,
}

#[derive(Debug, Default)]
struct UserGraph {
    maps: Vec<MapRecord>,
    shared_maps: Vec<SharedMapRecord>,
    layers: Vec<LayerRecord>,
    shared_layers: Vec<SharedLayerRecord>,
    itineraries: Vec<StoredItinerary>,
    albums: Vec<StoredAlbum>,
    top_lists: Vec<StoredTopList>,
    excluded_curations: Vec<String>,
}

impl UserGraph {
    fn itinerary_mut(&mut self, id: ItineraryId) -> Option<&mut StoredItinerary> {
        self.itineraries
            .iter_mut()
            .find(|s| s.itinerary.id == Some(id))
    }

    fn group_mut(&mut self, id: ActivityGroupId) -> Option<&mut StoredGroup> {
        self.itineraries
            .iter_mut()
            .flat_map(|s| s.groups.iter_mut())
            .find(|g| g.group.id == Some(id))
    }

    fn owns_layer(&self, id: LayerId) -> bool {
        self.layers.iter().any(|l| l.id == id)
    }
}

#[derive(Debug, Default)]
struct GraphData {
    users: HashMap<Owner, UserGraph>,
    locations: Vec<StoredLocation>,
    accolades: HashMap<LocationId, Vec<AccoladeRecord>>,
}

impl GraphData {
    fn user(&self, identity: &Identity) -> Option<&UserGraph> {
        self.users.get(&Owner::of(identity))
    }

    fn user_mut(&mut self, identity: &Identity) -> &mut UserGraph {
        self.users.entry(Owner::of(identity)).or_default()
    }

    fn location_mut(&mut self, id: LocationId) -> Option<&mut StoredLocation> {
        self.locations.iter_mut().find(|l| l.record.id == id)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryGraph {
    data: RwLock<GraphData>,
    unavailable: AtomicBool,
    failures: Mutex<HashMap<String, GraphError>>,
    calls: Mutex<HashMap<String, usize>>,
}

fn require<T>(value: Option<T>, operation: &str, what: &str) -> GraphResult<T> {
    value.ok_or_else(|| GraphError::rejected(operation, format!("{what} not found")))
}

impl InMemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    // --- Fault injection and call accounting ---

    /// Every subsequent call fails with `Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Every subsequent call to `operation` fails with `error`.
    pub fn fail_operation(&self, operation: &str, error: GraphError) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(operation.to_string(), error);
    }

    pub fn clear_failures(&self) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(operation)
            .copied()
            .unwrap_or(0)
    }

    pub fn reset_calls(&self) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn enter(&self, operation: &str) -> GraphResult<()> {
        *self
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(operation.to_string())
            .or_insert(0) += 1;

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GraphError::Unavailable(format!("{operation}: store offline")));
        }

        let injected = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(operation)
            .cloned();
        match injected {
            Some(err) => {
                debug!(operation, "injected graph failure");
                Err(err)
            }
            None => Ok(()),
        }
    }

    // --- Seeding for entities the reconciler only reads ---

    pub async fn seed_layer(&self, identity: &Identity, title: &str) -> LayerId {
        let id = LayerId::generate();
        self.data.write().await.user_mut(identity).layers.push(LayerRecord {
            id,
            title: title.to_string(),
        });
        id
    }

    pub async fn seed_shared_layer(&self, identity: &Identity, record: SharedLayerRecord) {
        self.data
            .write()
            .await
            .user_mut(identity)
            .shared_layers
            .push(record);
    }

    pub async fn seed_shared_map(&self, identity: &Identity, record: SharedMapRecord) {
        self.data
            .write()
            .await
            .user_mut(identity)
            .shared_maps
            .push(record);
    }

    pub async fn seed_location(&self, layer_id: LayerId, record: LocationRecord) {
        self.data
            .write()
            .await
            .locations
            .push(StoredLocation { layer_id, record });
    }
}

#[async_trait::async_trait]
impl GraphRepository for InMemoryGraph {
    // Maps

    async fn list_maps(&self, identity: &Identity) -> GraphResult<Vec<MapRecord>> {
        self.enter("list_maps")?;
        let data = self.data.read().await;
        Ok(data.user(identity).map(|u| u.maps.clone()).unwrap_or_default())
    }

    async fn list_shared_maps(&self, identity: &Identity) -> GraphResult<Vec<SharedMapRecord>> {
        self.enter("list_shared_maps")?;
        let data = self.data.read().await;
        Ok(data
            .user(identity)
            .map(|u| u.shared_maps.clone())
            .unwrap_or_default())
    }

    async fn add_map(&self, identity: &Identity, map: &Map) -> GraphResult<MapId> {
        self.enter("add_map")?;
        let id = MapId::generate();
        self.data
            .write()
            .await
            .user_mut(identity)
            .maps
            .push(map_record(map, id));
        Ok(id)
    }

    async fn add_shared_map(
        &self,
        identity: &Identity,
        map: &Map,
        parent: Option<MapId>,
    ) -> GraphResult<MapId> {
        const OP: &str = "add_shared_map";
        self.enter(OP)?;
        let mut data = self.data.write().await;
        let parent_id = require(parent, OP, "parent map id")?;
        let parent = require(
            data.users
                .values()
                .flat_map(|u| u.maps.iter())
                .find(|m| m.id == parent_id)
                .cloned(),
            OP,
            "parent map",
        )?;
        let id = MapId::generate();
        data.user_mut(identity).shared_maps.push(SharedMapRecord {
            id,
            title: map.title.clone(),
            primary: map.primary,
            deletable: true,
            parent,
        });
        Ok(id)
    }

    async fn edit_map(&self, identity: &Identity, map: &Map) -> GraphResult<()> {
        const OP: &str = "edit_map";
        self.enter(OP)?;
        let id = require(map.id, OP, "map id")?;
        let mut data = self.data.write().await;
        let slot = require(
            data.user_mut(identity).maps.iter_mut().find(|m| m.id == id),
            OP,
            "map",
        )?;
        *slot = map_record(map, id);
        Ok(())
    }

    async fn edit_shared_map(&self, identity: &Identity, map: &Map) -> GraphResult<()> {
        const OP: &str = "edit_shared_map";
        self.enter(OP)?;
        let id = require(map.id, OP, "map id")?;
        let mut data = self.data.write().await;
        let slot = require(
            data.user_mut(identity)
                .shared_maps
                .iter_mut()
                .find(|m| m.id == id),
            OP,
            "shared map",
        )?;
        slot.title = map.title.clone();
        slot.primary = map.primary;
        Ok(())
    }

    async fn delete_map(&self, identity: &Identity, map_id: MapId) -> GraphResult<()> {
        const OP: &str = "delete_map";
        self.enter(OP)?;
        let mut data = self.data.write().await;
        let maps = &mut data.user_mut(identity).maps;
        let before = maps.len();
        maps.retain(|m| m.id != map_id);
        if maps.len() == before {
            return Err(GraphError::rejected(OP, "map not found"));
        }
        Ok(())
    }

    async fn delete_shared_map(&self, identity: &Identity, map_id: MapId) -> GraphResult<()> {
        const OP: &str = "delete_shared_map";
        self.enter(OP)?;
        let mut data = self.data.write().await;
        let maps = &mut data.user_mut(identity).shared_maps;
        let before = maps.len();
        maps.retain(|m| m.id != map_id);
        if maps.len() == before {
            return Err(GraphError::rejected(OP, "shared map not found"));
        }
        Ok(())
    }

    async fn delete_maps(&self, identity: &Identity, map_ids: &[MapId]) -> GraphResult<()> {
        const OP: &str = "delete_maps";
        self.enter(OP)?;
        let mut data = self.data.write().await;
        let user = data.user_mut(identity);
        let known = |id: &MapId| {
            user.maps.iter().any(|m| m.id == *id) || user.shared_maps.iter().any(|m| m.id == *id)
        };
        if let Some(missing) = map_ids.iter().find(|id| !known(id)) {
            return Err(GraphError::rejected(OP, format!("map {missing} not found")));
        }
        user.maps.retain(|m| !map_ids.contains(&m.id));
        user.shared_maps.retain(|m| !map_ids.contains(&m.id));
        Ok(())
    }

    async fn dedup_locations_by_map(&self, identity: &Identity, map_id: MapId) -> GraphResult<()> {
        const OP: &str = "dedup_locations_by_map";
        self.enter(OP)?;
        let mut data = self.data.write().await;
        let (layer_ids, has_map) = match data.user(identity) {
            Some(u) => (
                u.layers.iter().map(|l| l.id).collect::<Vec<_>>(),
                u.maps.iter().any(|m| m.id == map_id)
                    || u.shared_maps.iter().any(|m| m.id == map_id),
            ),
            None => (Vec::new(), false),
        };
        if !has_map {
            return Err(GraphError::rejected(OP, "map not found"));
        }

        let mut seen = std::collections::HashSet::new();
        data.locations.retain(|l| {
            if !layer_ids.contains(&l.layer_id) {
                return true;
            }
            let key = (
                l.layer_id,
                l.record.title.to_lowercase(),
                l.record.latitude.to_bits(),
                l.record.longitude.to_bits(),
            );
            seen.insert(key)
        });
        Ok(())
    }

    // Layers

    async fn list_layers(&self, identity: &Identity) -> GraphResult<Vec<LayerRecord>> {
        self.enter("list_layers")?;
        let data = self.data.read().await;
        Ok(data.user(identity).map(|u| u.layers.clone()).unwrap_or_default())
    }

    async fn list_shared_layers(
        &self,
        identity: &Identity,
    ) -> GraphResult<Vec<SharedLayerRecord>> {
        self.enter("list_shared_layers")?;
        let data = self.data.read().await;
        Ok(data
            .user(identity)
            .map(|u| u.shared_layers.clone())
            .unwrap_or_default())
    }

    // Locations

    async fn list_locations(
        &self,
        _identity: &Identity,
        layer_id: LayerId,
    ) -> GraphResult<Vec<LocationRecord>> {
        self.enter("list_locations")?;
        let data = self.data.read().await;
        Ok(data
            .locations
            .iter()
            .filter(|l| l.layer_id == layer_id)
            .map(|l| l.record.clone())
            .collect())
    }

    async fn add_location(
        &self,
        identity: &Identity,
        location: &Location,
    ) -> GraphResult<LocationId> {
        const OP: &str = "add_location";
        self.enter(OP)?;
        let layer_id = require(location.layer_id, OP, "layer id")?;
        let mut data = self.data.write().await;
        if !data.user(identity).is_some_and(|u| u.owns_layer(layer_id)) {
            return Err(GraphError::rejected(OP, "layer not owned by user"));
        }
        let id = LocationId::generate();
        data.locations.push(StoredLocation {
            layer_id,
            record: location_record(location, id),
        });
        Ok(id)
    }

    async fn edit_location(&self, identity: &Identity, location: &Location) -> GraphResult<()> {
        const OP: &str = "edit_location";
        self.enter(OP)?;
        let id = require(location.id, OP, "location id")?;
        let layer_id = require(location.layer_id, OP, "layer id")?;
        let mut data = self.data.write().await;
        if !data.user(identity).is_some_and(|u| u.owns_layer(layer_id)) {
            return Err(GraphError::rejected(OP, "layer not owned by user"));
        }
        let stored = require(data.location_mut(id), OP, "location")?;
        stored.layer_id = layer_id;
        stored.record = location_record(location, id);
        Ok(())
    }

    async fn delete_location(&self, _identity: &Identity, location_id: LocationId) -> GraphResult<()> {
        const OP: &str = "delete_location";
        self.enter(OP)?;
        let mut data = self.data.write().await;
        let before = data.locations.len();
        data.locations.retain(|l| l.record.id != location_id);
        if data.locations.len() == before {
            return Err(GraphError::rejected(OP, "location not found"));
        }
        data.accolades.remove(&location_id);
        Ok(())
    }

    // Accolades

    async fn list_accolades(
        &self,
        _identity: &Identity,
        location_id: LocationId,
    ) -> GraphResult<Vec<AccoladeRecord>> {
        self.enter("list_accolades")?;
        let data = self.data.read().await;
        Ok(data.accolades.get(&location_id).cloned().unwrap_or_default())
    }

    async fn add_accolade(
        &self,
        _identity: &Identity,
        accolade: &Accolade,
        location_id: LocationId,
    ) -> GraphResult<AccoladeId> {
        const OP: &str = "add_accolade";
        self.enter(OP)?;
        let mut data = self.data.write().await;
        require(data.location_mut(location_id), OP, "location")?;
        let id = AccoladeId::generate();
        data.accolades
            .entry(location_id)
            .or_default()
            .push(AccoladeRecord {
                id,
                title: accolade.title.clone(),
                rank: accolade.rank.clone(),
                year: accolade.year.clone(),
            });
        Ok(id)
    }

    async fn edit_accolade(
        &self,
        _identity: &Identity,
        accolade: &Accolade,
        location_id: LocationId,
    ) -> GraphResult<()> {
        const OP: &str = "edit_accolade";
        self.enter(OP)?;
        let id = require(accolade.id, OP, "accolade id")?;
        let mut data = self.data.write().await;
        let slot = require(
            data.accolades
                .get_mut(&location_id)
                .and_then(|list| list.iter_mut().find(|a| a.id == id)),
            OP,
            "accolade",
        )?;
        slot.title = accolade.title.clone();
        slot.rank = accolade.rank.clone();
        slot.year = accolade.year.clone();
        Ok(())
    }

    async fn delete_accolades(
        &self,
        _identity: &Identity,
        accolade_ids: &[AccoladeId],
        location_id: LocationId,
    ) -> GraphResult<()> {
        const OP: &str = "delete_accolades";
        self.enter(OP)?;
        let mut data = self.data.write().await;
        let list = require(data.accolades.get_mut(&location_id), OP, "location accolades")?;
        list.retain(|a| !accolade_ids.contains(&a.id));
        Ok(())
    }

    // Itineraries

    async fn list_itineraries(&self, identity: &Identity) -> GraphResult<Vec<Itinerary>> {
        self.enter("list_itineraries")?;
        let data = self.data.read().await;
        Ok(data
            .user(identity)
            .map(|u| u.itineraries.iter().map(|s| s.itinerary.clone()).collect())
            .unwrap_or_default())
    }

    async fn list_activity_groups(
        &self,
        identity: &Identity,
        itinerary_id: ItineraryId,
    ) -> GraphResult<Vec<ActivityGroup>> {
        const OP: &str = "list_activity_groups";
        self.enter(OP)?;
        let data = self.data.read().await;
        let stored = require(
            data.user(identity)
                .and_then(|u| u.itineraries.iter().find(|s| s.itinerary.id == Some(itinerary_id))),
            OP,
            "itinerary",
        )?;
        Ok(stored.groups.iter().map(|g| g.group.clone()).collect())
    }

    async fn list_activities(
        &self,
        identity: &Identity,
        itinerary_id: ItineraryId,
        group_id: ActivityGroupId,
    ) -> GraphResult<Vec<Activity>> {
        const OP: &str = "list_activities";
        self.enter(OP)?;
        let data = self.data.read().await;
        let group = require(
            data.user(identity)
                .and_then(|u| u.itineraries.iter().find(|s| s.itinerary.id == Some(itinerary_id)))
                .and_then(|s| s.groups.iter().find(|g| g.group.id == Some(group_id))),
            OP,
            "activity group",
        )?;
        Ok(group.activities.clone())
    }

    async fn add_itinerary(
        &self,
        identity: &Identity,
        itinerary: &Itinerary,
    ) -> GraphResult<ItineraryId> {
        self.enter("add_itinerary")?;
        let id = ItineraryId::generate();
        let stored = Itinerary {
            id: Some(id),
            editable: true,
            shared: false,
            shared_by_username: None,
            activity_groups: Vec::new(),
            ..itinerary.clone()
        };
        self.data
            .write()
            .await
            .user_mut(identity)
            .itineraries
            .push(StoredItinerary {
                itinerary: stored,
                groups: Vec::new(),
            });
        Ok(id)
    }

    async fn edit_itinerary(&self, identity: &Identity, itinerary: &Itinerary) -> GraphResult<()> {
        const OP: &str = "edit_itinerary";
        self.enter(OP)?;
        let id = require(itinerary.id, OP, "itinerary id")?;
        let mut data = self.data.write().await;
        let stored = require(data.user_mut(identity).itinerary_mut(id), OP, "itinerary")?;
        if !stored.itinerary.editable {
            return Err(GraphError::rejected(OP, "itinerary is shared"));
        }
        stored.itinerary.title = itinerary.title.clone();
        Ok(())
    }

    async fn delete_itinerary(
        &self,
        identity: &Identity,
        itinerary_id: ItineraryId,
    ) -> GraphResult<()> {
        const OP: &str = "delete_itinerary";
        self.enter(OP)?;
        let mut data = self.data.write().await;
        let user = data.user_mut(identity);
        let stored = require(user.itinerary_mut(itinerary_id), OP, "itinerary")?;
        if !stored.groups.is_empty() {
            return Err(GraphError::rejected(OP, "itinerary still has activity groups"));
        }
        user.itineraries
            .retain(|s| s.itinerary.id != Some(itinerary_id));
        Ok(())
    }

    async fn add_activity_group(
        &self,
        identity: &Identity,
        itinerary_id: ItineraryId,
        group: &ActivityGroup,
    ) -> GraphResult<ActivityGroupId> {
        const OP: &str = "add_activity_group";
        self.enter(OP)?;
        let mut data = self.data.write().await;
        let stored = require(
            data.user_mut(identity).itinerary_mut(itinerary_id),
            OP,
            "itinerary",
        )?;
        let id = ActivityGroupId::generate();
        stored.groups.push(StoredGroup {
            group: ActivityGroup {
                id: Some(id),
                activities: Vec::new(),
                ..group.clone()
            },
            activities: Vec::new(),
        });
        Ok(id)
    }

    async fn edit_activity_group(
        &self,
        identity: &Identity,
        group: &ActivityGroup,
    ) -> GraphResult<()> {
        const OP: &str = "edit_activity_group";
        self.enter(OP)?;
        let id = require(group.id, OP, "activity group id")?;
        let mut data = self.data.write().await;
        let stored = require(data.user_mut(identity).group_mut(id), OP, "activity group")?;
        stored.group = ActivityGroup {
            activities: Vec::new(),
            ..group.clone()
        };
        Ok(())
    }

    async fn delete_activity_group(
        &self,
        identity: &Identity,
        itinerary_id: ItineraryId,
        group_id: ActivityGroupId,
    ) -> GraphResult<()> {
        const OP: &str = "delete_activity_group";
        self.enter(OP)?;
        let mut data = self.data.write().await;
        let stored = require(
            data.user_mut(identity).itinerary_mut(itinerary_id),
            OP,
            "itinerary",
        )?;
        let group = require(
            stored.groups.iter().find(|g| g.group.id == Some(group_id)),
            OP,
            "activity group",
        )?;
        if !group.activities.is_empty() {
            return Err(GraphError::rejected(OP, "activity group still has activities"));
        }
        stored.groups.retain(|g| g.group.id != Some(group_id));
        Ok(())
    }

    async fn add_activity(
        &self,
        identity: &Identity,
        itinerary_id: ItineraryId,
        group_id: ActivityGroupId,
        activity: &Activity,
    ) -> GraphResult<ActivityId> {
        const OP: &str = "add_activity";
        self.enter(OP)?;
        let mut data = self.data.write().await;
        let group = require(
            data.user_mut(identity)
                .itinerary_mut(itinerary_id)
                .and_then(|s| s.groups.iter_mut().find(|g| g.group.id == Some(group_id))),
            OP,
            "activity group",
        )?;
        let id = ActivityId::generate();
        group.activities.push(Activity {
            id: Some(id),
            ..activity.clone()
        });
        Ok(id)
    }

    async fn edit_activity(&self, identity: &Identity, activity: &Activity) -> GraphResult<()> {
        const OP: &str = "edit_activity";
        self.enter(OP)?;
        let id = require(activity.id, OP, "activity id")?;
        let mut data = self.data.write().await;
        let slot = require(
            data.user_mut(identity)
                .itineraries
                .iter_mut()
                .flat_map(|s| s.groups.iter_mut())
                .flat_map(|g| g.activities.iter_mut())
                .find(|a| a.id == Some(id)),
            OP,
            "activity",
        )?;
        *slot = activity.clone();
        Ok(())
    }

    async fn delete_activity(
        &self,
        identity: &Identity,
        itinerary_id: ItineraryId,
        group_id: ActivityGroupId,
        activity_id: ActivityId,
    ) -> GraphResult<()> {
        const OP: &str = "delete_activity";
        self.enter(OP)?;
        let mut data = self.data.write().await;
        let group = require(
            data.user_mut(identity)
                .itinerary_mut(itinerary_id)
                .and_then(|s| s.groups.iter_mut().find(|g| g.group.id == Some(group_id))),
            OP,
            "activity group",
        )?;
        let before = group.activities.len();
        group.activities.retain(|a| a.id != Some(activity_id));
        if group.activities.len() == before {
            return Err(GraphError::rejected(OP, "activity not found"));
        }
        Ok(())
    }

    async fn share_itinerary(
        &self,
        identity: &Identity,
        itinerary_id: ItineraryId,
        username: &str,
    ) -> GraphResult<()> {
        const OP: &str = "share_itinerary";
        self.enter(OP)?;
        let mut data = self.data.write().await;
        let source = require(
            data.user_mut(identity).itinerary_mut(itinerary_id).cloned(),
            OP,
            "itinerary",
        )?;
        let recipient = Identity {
            username: username.to_string(),
            ..identity.clone()
        };
        let copy = StoredItinerary {
            itinerary: Itinerary {
                editable: false,
                shared: true,
                shared_by_username: Some(identity.username.clone()),
                ..source.itinerary
            },
            groups: source.groups,
        };
        let target = &mut data.user_mut(&recipient).itineraries;
        target.retain(|s| s.itinerary.id != Some(itinerary_id));
        target.push(copy);
        Ok(())
    }

    async fn unshare_itinerary(
        &self,
        identity: &Identity,
        itinerary_id: ItineraryId,
        username: &str,
    ) -> GraphResult<()> {
        const OP: &str = "unshare_itinerary";
        self.enter(OP)?;
        let recipient = Identity {
            username: username.to_string(),
            ..identity.clone()
        };
        let mut data = self.data.write().await;
        let target = &mut data.user_mut(&recipient).itineraries;
        let before = target.len();
        target.retain(|s| {
            !(s.itinerary.id == Some(itinerary_id)
                && s.itinerary.shared_by_username.as_deref() == Some(identity.username.as_str()))
        });
        if target.len() == before {
            return Err(GraphError::rejected(OP, "itinerary not shared with user"));
        }
        Ok(())
    }

    // Albums and photos

    async fn list_albums(&self, identity: &Identity) -> GraphResult<Vec<AlbumRecord>> {
        self.enter("list_albums")?;
        let data = self.data.read().await;
        Ok(data
            .user(identity)
            .map(|u| u.albums.iter().map(|a| a.record.clone()).collect())
            .unwrap_or_default())
    }

    async fn list_photos(
        &self,
        identity: &Identity,
        album_id: AlbumId,
    ) -> GraphResult<Vec<PhotoRecord>> {
        const OP: &str = "list_photos";
        self.enter(OP)?;
        let data = self.data.read().await;
        let album = require(
            data.user(identity)
                .and_then(|u| u.albums.iter().find(|a| a.record.id == album_id)),
            OP,
            "album",
        )?;
        Ok(album.photos.clone())
    }

    async fn add_album(&self, identity: &Identity, album: &Album) -> GraphResult<AlbumId> {
        self.enter("add_album")?;
        let id = AlbumId::generate();
        self.data
            .write()
            .await
            .user_mut(identity)
            .albums
            .push(StoredAlbum {
                record: AlbumRecord {
                    id,
                    title: album.title.clone(),
                },
                photos: Vec::new(),
            });
        Ok(id)
    }

    async fn edit_album(&self, identity: &Identity, album: &Album) -> GraphResult<()> {
        const OP: &str = "edit_album";
        self.enter(OP)?;
        let id = require(album.id, OP, "album id")?;
        let mut data = self.data.write().await;
        let stored = require(
            data.user_mut(identity)
                .albums
                .iter_mut()
                .find(|a| a.record.id == id),
            OP,
            "album",
        )?;
        stored.record.title = album.title.clone();
        Ok(())
    }

    async fn delete_album(&self, identity: &Identity, album_id: AlbumId) -> GraphResult<()> {
        const OP: &str = "delete_album";
        self.enter(OP)?;
        let mut data = self.data.write().await;
        let albums = &mut data.user_mut(identity).albums;
        let before = albums.len();
        albums.retain(|a| a.record.id != album_id);
        if albums.len() == before {
            return Err(GraphError::rejected(OP, "album not found"));
        }
        Ok(())
    }

    async fn add_photo(
        &self,
        identity: &Identity,
        photo: &Photo,
        album_id: AlbumId,
        location_id: Option<LocationId>,
    ) -> GraphResult<PhotoId> {
        const OP: &str = "add_photo";
        self.enter(OP)?;
        let mut data = self.data.write().await;
        let album = require(
            data.user_mut(identity)
                .albums
                .iter_mut()
                .find(|a| a.record.id == album_id),
            OP,
            "album",
        )?;
        let id = PhotoId::generate();
        album.photos.push(PhotoRecord {
            id,
            caption: photo.caption.clone(),
            url: photo.url.clone(),
            location_id,
        });
        Ok(id)
    }

    async fn edit_photo(
        &self,
        identity: &Identity,
        photo: &Photo,
        album_id: AlbumId,
    ) -> GraphResult<()> {
        const OP: &str = "edit_photo";
        self.enter(OP)?;
        let id = require(photo.id, OP, "photo id")?;
        let mut data = self.data.write().await;
        let slot = require(
            data.user_mut(identity)
                .albums
                .iter_mut()
                .find(|a| a.record.id == album_id)
                .and_then(|a| a.photos.iter_mut().find(|p| p.id == id)),
            OP,
            "photo",
        )?;
        slot.caption = photo.caption.clone();
        slot.location_id = photo.location_id;
        if photo.url.is_some() {
            slot.url = photo.url.clone();
        }
        Ok(())
    }

    async fn delete_photo(&self, identity: &Identity, photo_id: PhotoId) -> GraphResult<()> {
        const OP: &str = "delete_photo";
        self.enter(OP)?;
        let mut data = self.data.write().await;
        let mut removed = false;
        for album in &mut data.user_mut(identity).albums {
            let before = album.photos.len();
            album.photos.retain(|p| p.id != photo_id);
            removed |= album.photos.len() != before;
        }
        if !removed {
            return Err(GraphError::rejected(OP, "photo not found"));
        }
        Ok(())
    }

    // Top lists

    async fn list_top_lists(&self, identity: &Identity) -> GraphResult<Vec<TopListRecord>> {
        self.enter("list_top_lists")?;
        let data = self.data.read().await;
        Ok(data
            .user(identity)
            .map(|u| u.top_lists.iter().map(|t| t.record.clone()).collect())
            .unwrap_or_default())
    }

    async fn list_top_list_locations(
        &self,
        identity: &Identity,
        top_list_id: TopListId,
    ) -> GraphResult<Vec<LocationRecord>> {
        const OP: &str = "list_top_list_locations";
        self.enter(OP)?;
        let data = self.data.read().await;
        let list = require(
            data.user(identity)
                .and_then(|u| u.top_lists.iter().find(|t| t.record.id == top_list_id)),
            OP,
            "top list",
        )?;
        Ok(list
            .location_ids
            .iter()
            .filter_map(|id| data.locations.iter().find(|l| l.record.id == *id))
            .map(|l| l.record.clone())
            .collect())
    }

    async fn add_top_list(&self, identity: &Identity, top_list: &TopList) -> GraphResult<TopListId> {
        self.enter("add_top_list")?;
        let id = TopListId::generate();
        self.data
            .write()
            .await
            .user_mut(identity)
            .top_lists
            .push(StoredTopList {
                record: TopListRecord {
                    id,
                    title: top_list.title.clone(),
                    ordered_value: top_list.ordered_value.clone(),
                },
                location_ids: top_list.location_list.iter().filter_map(|l| l.id).collect(),
            });
        Ok(id)
    }

    async fn edit_top_list(&self, identity: &Identity, top_list: &TopList) -> GraphResult<()> {
        const OP: &str = "edit_top_list";
        self.enter(OP)?;
        let id = require(top_list.id, OP, "top list id")?;
        let mut data = self.data.write().await;
        let stored = require(
            data.user_mut(identity)
                .top_lists
                .iter_mut()
                .find(|t| t.record.id == id),
            OP,
            "top list",
        )?;
        stored.record.title = top_list.title.clone();
        stored.record.ordered_value = top_list.ordered_value.clone();
        stored.location_ids = top_list.location_list.iter().filter_map(|l| l.id).collect();
        Ok(())
    }

    async fn delete_top_list(&self, identity: &Identity, top_list_id: TopListId) -> GraphResult<()> {
        const OP: &str = "delete_top_list";
        self.enter(OP)?;
        let mut data = self.data.write().await;
        let lists = &mut data.user_mut(identity).top_lists;
        let before = lists.len();
        lists.retain(|t| t.record.id != top_list_id);
        if lists.len() == before {
            return Err(GraphError::rejected(OP, "top list not found"));
        }
        Ok(())
    }

    // Curation exclusions

    async fn list_excluded_curations(&self, identity: &Identity) -> GraphResult<Vec<String>> {
        self.enter("list_excluded_curations")?;
        let data = self.data.read().await;
        Ok(data
            .user(identity)
            .map(|u| u.excluded_curations.clone())
            .unwrap_or_default())
    }

    async fn edit_excluded_curations(
        &self,
        identity: &Identity,
        curations: &[String],
    ) -> GraphResult<()> {
        self.enter("edit_excluded_curations")?;
        self.data
            .write()
            .await
            .user_mut(identity)
            .excluded_curations = curations.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Identity {
        Identity::new("alice", "tenant", "app")
    }

    #[tokio::test]
    async fn locations_require_owned_layer() {
        let graph = InMemoryGraph::new();
        let layer = graph.seed_layer(&alice(), "User").await;
        let location = Location {
            title: "Cafe".into(),
            layer_id: Some(layer),
            ..Location::default()
        };

        let id = graph.add_location(&alice(), &location).await.unwrap();
        let listed = graph.list_locations(&alice(), layer).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);

        let bob = Identity::new("bob", "tenant", "app");
        let err = graph.add_location(&bob, &location).await.unwrap_err();
        assert!(err.is_rejection());
    }

    #[tokio::test]
    async fn parents_cannot_be_deleted_before_children() {
        let graph = InMemoryGraph::new();
        let it = graph.add_itinerary(&alice(), &Itinerary::default()).await.unwrap();
        let group = graph
            .add_activity_group(&alice(), it, &ActivityGroup::default())
            .await
            .unwrap();
        let act = graph
            .add_activity(&alice(), it, group, &Activity::default())
            .await
            .unwrap();

        assert!(graph.delete_activity_group(&alice(), it, group).await.is_err());
        assert!(graph.delete_itinerary(&alice(), it).await.is_err());

        graph.delete_activity(&alice(), it, group, act).await.unwrap();
        graph.delete_activity_group(&alice(), it, group).await.unwrap();
        graph.delete_itinerary(&alice(), it).await.unwrap();
    }

    #[tokio::test]
    async fn injected_failures_and_counts() {
        let graph = InMemoryGraph::new();
        graph.fail_operation("list_maps", GraphError::rejected("list_maps", "nope"));
        assert!(graph.list_maps(&alice()).await.is_err());
        assert_eq!(graph.call_count("list_maps"), 1);

        graph.clear_failures();
        graph.set_unavailable(true);
        let err = graph.list_layers(&alice()).await.unwrap_err();
        assert!(err.is_retryable());

        graph.set_unavailable(false);
        assert!(graph.list_layers(&alice()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sharing_copies_read_only_itinerary() {
        let graph = InMemoryGraph::new();
        let it = graph
            .add_itinerary(&alice(), &Itinerary { title: "Trip".into(), ..Itinerary::default() })
            .await
            .unwrap();
        graph.share_itinerary(&alice(), it, "bob").await.unwrap();

        let bob = Identity::new("bob", "tenant", "app");
        let shared = graph.list_itineraries(&bob).await.unwrap();
        assert_eq!(shared.len(), 1);
        assert!(!shared[0].editable);
        assert_eq!(shared[0].shared_by_username.as_deref(), Some("alice"));

        graph.unshare_itinerary(&alice(), it, "bob").await.unwrap();
        assert!(graph.list_itineraries(&bob).await.unwrap().is_empty());
        assert!(graph.unshare_itinerary(&alice(), it, "bob").await.is_err());
    }
}
