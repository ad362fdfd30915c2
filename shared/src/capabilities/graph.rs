use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{
    AccoladeId, ActivityGroupId, ActivityId, AlbumId, ItineraryId, LayerId, LocationId, MapId,
    PhotoId, TopListId,
};
use crate::model::{
    Accolade, Activity, ActivityGroup, Album, Identity, Itinerary, Location, Map, Photo, TopList,
};

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum GraphError {
    /// The store refused the call (missing entity, ownership, constraint).
    #[error("{operation} rejected: {reason}")]
    Rejected {
        operation: String,
        reason: String,
    },

    /// The store could not be reached or failed mid-call.
    #[error("graph store unavailable: {0}")]
    Unavailable(String),
}

impl GraphError {
    pub fn rejected(operation: &str, reason: impl Into<String>) -> Self {
        Self::Rejected {
            operation: operation.to_string(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

pub type GraphResult<T> = Result<T, GraphError>;

// --- Records as the graph stores them ---

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MapRecord {
    pub id: MapId,
    pub title: String,
    /// `"north,east,south,west"`, possibly empty.
    pub coordinates: String,
    pub latitude: f64,
    pub longitude: f64,
    pub zoom: i32,
    pub primary: bool,
    pub default_layer_id: Option<LayerId>,
}

/// A map shared with the user, paired with the map it was shared from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedMapRecord {
    pub id: MapId,
    pub title: String,
    pub primary: bool,
    pub deletable: bool,
    pub parent: MapRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub id: LayerId,
    pub title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedLayerRecord {
    pub id: LayerId,
    pub title: String,
    pub deletable: bool,
    pub default_map_id: Option<MapId>,
    pub parent: LayerRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub id: LocationId,
    pub title: String,
    pub latitude: f64,
    pub longitude: f64,
    pub address: Option<String>,
    pub country: Option<String>,
    pub state: Option<String>,
    pub town: Option<String>,
    pub zip_code: Option<String>,
    pub telephone: Option<String>,
    pub website: Option<String>,
    pub instagram: Option<String>,
    pub icon: Option<String>,
    pub google_location_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccoladeRecord {
    pub id: AccoladeId,
    pub title: String,
    pub rank: String,
    pub year: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlbumRecord {
    pub id: AlbumId,
    pub title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhotoRecord {
    pub id: PhotoId,
    pub caption: String,
    pub url: Option<String>,
    pub location_id: Option<LocationId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopListRecord {
    pub id: TopListId,
    pub title: String,
    pub ordered_value: Option<String>,
}

// ============================================================================
// Repository Trait
// ============================================================================

/// Per-entity CRUD against the backing graph store.
///
/// Every call is scoped by the caller's identity and may fail independently.
/// Implementations must not retry on their own; callers decide.
#[async_trait::async_trait]
pub trait GraphRepository: Send + Sync {
    // Maps
    async fn list_maps(&self, identity: &Identity) -> GraphResult<Vec<MapRecord>>;
    async fn list_shared_maps(&self, identity: &Identity) -> GraphResult<Vec<SharedMapRecord>>;
    async fn add_map(&self, identity: &Identity, map: &Map) -> GraphResult<MapId>;
    async fn add_shared_map(
        &self,
        identity: &Identity,
        map: &Map,
        parent: Option<MapId>,
    ) -> GraphResult<MapId>;
    async fn edit_map(&self, identity: &Identity, map: &Map) -> GraphResult<()>;
    async fn edit_shared_map(&self, identity: &Identity, map: &Map) -> GraphResult<()>;
    async fn delete_map(&self, identity: &Identity, map_id: MapId) -> GraphResult<()>;
    async fn delete_shared_map(&self, identity: &Identity, map_id: MapId) -> GraphResult<()>;
    async fn delete_maps(&self, identity: &Identity, map_ids: &[MapId]) -> GraphResult<()>;
    async fn dedup_locations_by_map(&self, identity: &Identity, map_id: MapId) -> GraphResult<()>;

    // Layers
    async fn list_layers(&self, identity: &Identity) -> GraphResult<Vec<LayerRecord>>;
    async fn list_shared_layers(&self, identity: &Identity)
        -> GraphResult<Vec<SharedLayerRecord>>;

    // Locations
    async fn list_locations(
        &self,
        identity: &Identity,
        layer_id: LayerId,
    ) -> GraphResult<Vec<LocationRecord>>;
    async fn add_location(&self, identity: &Identity, location: &Location)
        -> GraphResult<LocationId>;
    async fn edit_location(&self, identity: &Identity, location: &Location) -> GraphResult<()>;
    async fn delete_location(&self, identity: &Identity, location_id: LocationId)
        -> GraphResult<()>;

    // Accolades
    async fn list_accolades(
        &self,
        identity: &Identity,
        location_id: LocationId,
    ) -> GraphResult<Vec<AccoladeRecord>>;
    async fn add_accolade(
        &self,
        identity: &Identity,
        accolade: &Accolade,
        location_id: LocationId,
    ) -> GraphResult<AccoladeId>;
    async fn edit_accolade(
        &self,
        identity: &Identity,
        accolade: &Accolade,
        location_id: LocationId,
    ) -> GraphResult<()>;
    async fn delete_accolades(
        &self,
        identity: &Identity,
        accolade_ids: &[AccoladeId],
        location_id: LocationId,
    ) -> GraphResult<()>;

    // Itineraries
    async fn list_itineraries(&self, identity: &Identity) -> GraphResult<Vec<Itinerary>>;
    async fn list_activity_groups(
        &self,
        identity: &Identity,
        itinerary_id: ItineraryId,
    ) -> GraphResult<Vec<ActivityGroup>>;
    async fn list_activities(
        &self,
        identity: &Identity,
        itinerary_id: ItineraryId,
        group_id: ActivityGroupId,
    ) -> GraphResult<Vec<Activity>>;
    async fn add_itinerary(&self, identity: &Identity, itinerary: &Itinerary)
        -> GraphResult<ItineraryId>;
    async fn edit_itinerary(&self, identity: &Identity, itinerary: &Itinerary) -> GraphResult<()>;
    async fn delete_itinerary(&self, identity: &Identity, itinerary_id: ItineraryId)
        -> GraphResult<()>;
    async fn add_activity_group(
        &self,
        identity: &Identity,
        itinerary_id: ItineraryId,
        group: &ActivityGroup,
    ) -> GraphResult<ActivityGroupId>;
    async fn edit_activity_group(&self, identity: &Identity, group: &ActivityGroup)
        -> GraphResult<()>;
    async fn delete_activity_group(
        &self,
        identity: &Identity,
        itinerary_id: ItineraryId,
        group_id: ActivityGroupId,
    ) -> GraphResult<()>;
    async fn add_activity(
        &self,
        identity: &Identity,
        itinerary_id: ItineraryId,
        group_id: ActivityGroupId,
        activity: &Activity,
    ) -> GraphResult<ActivityId>;
    async fn edit_activity(&self, identity: &Identity, activity: &Activity) -> GraphResult<()>;
    async fn delete_activity(
        &self,
        identity: &Identity,
        itinerary_id: ItineraryId,
        group_id: ActivityGroupId,
        activity_id: ActivityId,
    ) -> GraphResult<()>;
    async fn share_itinerary(
        &self,
        identity: &Identity,
        itinerary_id: ItineraryId,
        username: &str,
    ) -> GraphResult<()>;
    async fn unshare_itinerary(
        &self,
        identity: &Identity,
        itinerary_id: ItineraryId,
        username: &str,
    ) -> GraphResult<()>;

    // Albums and photos
    async fn list_albums(&self, identity: &Identity) -> GraphResult<Vec<AlbumRecord>>;
    async fn list_photos(&self, identity: &Identity, album_id: AlbumId)
        -> GraphResult<Vec<PhotoRecord>>;
    async fn add_album(&self, identity: &Identity, album: &Album) -> GraphResult<AlbumId>;
    async fn edit_album(&self, identity: &Identity, album: &Album) -> GraphResult<()>;
    async fn delete_album(&self, identity: &Identity, album_id: AlbumId) -> GraphResult<()>;
    async fn add_photo(
        &self,
        identity: &Identity,
        photo: &Photo,
        album_id: AlbumId,
        location_id: Option<LocationId>,
    ) -> GraphResult<PhotoId>;
    async fn edit_photo(&self, identity: &Identity, photo: &Photo, album_id: AlbumId)
        -> GraphResult<()>;
    async fn delete_photo(&self, identity: &Identity, photo_id: PhotoId) -> GraphResult<()>;

    // Top lists
    async fn list_top_lists(&self, identity: &Identity) -> GraphResult<Vec<TopListRecord>>;
    async fn list_top_list_locations(
        &self,
        identity: &Identity,
        top_list_id: TopListId,
    ) -> GraphResult<Vec<LocationRecord>>;
    async fn add_top_list(&self, identity: &Identity, top_list: &TopList) -> GraphResult<TopListId>;
    async fn edit_top_list(&self, identity: &Identity, top_list: &TopList) -> GraphResult<()>;
    async fn delete_top_list(&self, identity: &Identity, top_list_id: TopListId)
        -> GraphResult<()>;

    // Curation exclusions
    async fn list_excluded_curations(&self, identity: &Identity) -> GraphResult<Vec<String>>;
    async fn edit_excluded_curations(&self, identity: &Identity, curations: &[String])
        -> GraphResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_is_not_retryable() {
        let err = GraphError::rejected("add_location", "layer is shared");
        assert!(err.is_rejection());
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "add_location rejected: layer is shared");
    }

    #[test]
    fn unavailable_is_retryable() {
        let err = GraphError::Unavailable("connection reset".into());
        assert!(!err.is_rejection());
        assert!(err.is_retryable());
    }
}
