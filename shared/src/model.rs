use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::hash::Hash;

use crate::ids::{
    AccoladeId, ActivityGroupId, ActivityId, AlbumId, ItineraryId, LayerId, LocationId, MapId,
    PhotoId, TopListId,
};

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        let elapsed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
    }
}

/// Caller identity, resolved upstream and trusted verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub username: String,
    pub tenant_key: String,
    pub application_id: String,
}

impl Identity {
    pub fn new(
        username: impl Into<String>,
        tenant_key: impl Into<String>,
        application_id: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            tenant_key: tenant_key.into(),
            application_id: application_id.into(),
        }
    }
}

// --- Bounding box ---

/// Viewport descriptor. Serialized as `[north, east, south, west]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct BoundingBox {
    pub north: f64,
    pub east: f64,
    pub south: f64,
    pub west: f64,
}

impl BoundingBox {
    pub const fn new(north: f64, east: f64, south: f64, west: f64) -> Self {
        Self {
            north,
            east,
            south,
            west,
        }
    }

    /// Accepts exactly four values in `[north, east, south, west]` order.
    pub fn from_slice(values: &[f64]) -> Option<Self> {
        match values {
            [north, east, south, west] => Some(Self::new(*north, *east, *south, *west)),
            _ => None,
        }
    }

    /// Parses the graph's comma-separated `"north,east,south,west"` form.
    pub fn parse(raw: &str) -> Option<Self> {
        let values = raw
            .split(',')
            .map(|part| part.trim().parse::<f64>().ok().filter(|v| v.is_finite()))
            .collect::<Option<Vec<_>>>()?;
        Self::from_slice(&values)
    }

    pub fn to_graph_string(&self) -> String {
        format!("{},{},{},{}", self.north, self.east, self.south, self.west)
    }
}

impl From<[f64; 4]> for BoundingBox {
    fn from([north, east, south, west]: [f64; 4]) -> Self {
        Self::new(north, east, south, west)
    }
}

impl From<BoundingBox> for [f64; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.north, b.east, b.south, b.west]
    }
}

// --- Identity-keyed collections ---

/// Entities whose mirror identity is the repository-assigned id.
pub trait Identified {
    type Id: Copy + Eq + Hash;

    fn id(&self) -> Option<Self::Id>;
}

/// Drops earlier duplicates so the most recently inserted entry for an id wins.
/// Entries that have no id yet are left alone.
pub fn dedup_by_id<T: Identified>(items: &mut Vec<T>) {
    let mut seen = std::collections::HashSet::new();
    let mut keep = vec![true; items.len()];
    for (idx, item) in items.iter().enumerate().rev() {
        if let Some(id) = item.id() {
            if !seen.insert(id) {
                keep[idx] = false;
            }
        }
    }
    let mut flags = keep.into_iter();
    items.retain(|_| flags.next().unwrap_or(true));
}

/// Remove-existing, insert, dedup.
pub fn upsert_by_id<T: Identified>(items: &mut Vec<T>, item: T) {
    if let Some(id) = item.id() {
        items.retain(|existing| existing.id() != Some(id));
    }
    items.push(item);
    dedup_by_id(items);
}

/// Replaces an entry in place, keeping its position. Returns false if absent.
pub fn replace_by_id<T: Identified>(items: &mut [T], item: T) -> bool {
    let Some(id) = item.id() else {
        return false;
    };
    match items.iter_mut().find(|existing| existing.id() == Some(id)) {
        Some(slot) => {
            *slot = item;
            true
        }
        None => false,
    }
}

pub fn remove_by_id<T: Identified>(items: &mut Vec<T>, id: T::Id) -> bool {
    let before = items.len();
    items.retain(|existing| existing.id() != Some(id));
    items.len() != before
}

pub fn find_by_id<T: Identified>(items: &[T], id: T::Id) -> Option<&T> {
    items.iter().find(|item| item.id() == Some(id))
}

macro_rules! identified {
    ($ty:ty, $id:ty) => {
        impl Identified for $ty {
            type Id = $id;

            fn id(&self) -> Option<$id> {
                self.id
            }
        }
    };
}

// --- Entities ---

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Map {
    pub id: Option<MapId>,
    pub title: String,
    pub bounding_box: Option<BoundingBox>,
    pub latitude: f64,
    pub longitude: f64,
    pub zoom: i32,
    pub primary: bool,
    pub shared: bool,
    pub deletable: bool,
    pub default_layer_id: Option<LayerId>,
    pub inherited_id: Option<MapId>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub id: Option<LayerId>,
    pub title: String,
    pub shared: bool,
    pub deletable: bool,
    pub bounding_box: Option<BoundingBox>,
    pub inherited_id: Option<LayerId>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Accolade {
    pub id: Option<AccoladeId>,
    pub title: String,
    pub rank: String,
    pub year: Option<String>,
    pub location_id: Option<LocationId>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: Option<LocationId>,
    pub title: String,
    pub latitude: f64,
    pub longitude: f64,
    pub layer_id: Option<LayerId>,
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
    pub deletable: bool,
    #[serde(default)]
    pub accolades: Vec<Accolade>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Photo {
    pub id: Option<PhotoId>,
    pub caption: String,
    pub url: Option<String>,
    pub location_id: Option<LocationId>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Album {
    pub id: Option<AlbumId>,
    pub title: String,
    #[serde(default)]
    pub photos: Vec<Photo>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: Option<ActivityId>,
    pub title: String,
    pub location_id: Option<LocationId>,
    pub notes: Option<String>,
    pub order: i32,
    pub time_of_day: Option<String>,
    pub transport_icon: Option<String>,
    pub widget_icon: Option<String>,
    pub checked: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityGroup {
    pub id: Option<ActivityGroupId>,
    pub title: String,
    pub group_type: Option<String>,
    pub order: i32,
    pub created_at: UnixTimeMs,
    #[serde(default)]
    pub activities: Vec<Activity>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Itinerary {
    pub id: Option<ItineraryId>,
    pub title: String,
    pub editable: bool,
    pub shared: bool,
    pub shared_by_username: Option<String>,
    pub created_at: UnixTimeMs,
    #[serde(default)]
    pub activity_groups: Vec<ActivityGroup>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TopList {
    pub id: Option<TopListId>,
    pub title: String,
    pub ordered_value: Option<String>,
    #[serde(default)]
    pub location_list: Vec<Location>,
}

identified!(Map, MapId);
identified!(Layer, LayerId);
identified!(Accolade, AccoladeId);
identified!(Location, LocationId);
identified!(Photo, PhotoId);
identified!(Album, AlbumId);
identified!(Activity, ActivityId);
identified!(ActivityGroup, ActivityGroupId);
identified!(Itinerary, ItineraryId);
identified!(TopList, TopListId);

// --- Root aggregate ---

/// Server-authoritative mirror of one user's data for one session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserState {
    pub maps: Vec<Map>,
    pub layers: Vec<Layer>,
    pub all_locations: Vec<Location>,
    pub visible_locations: Vec<Location>,
    pub local_search_locations: Vec<Location>,
    pub other_search_locations: Vec<Location>,
    pub selected_map_id: Option<MapId>,
    pub selected_layer_ids: BTreeSet<LayerId>,
    pub albums: Vec<Album>,
    pub itineraries: Vec<Itinerary>,
    pub top_lists: Vec<TopList>,
    pub accolades: Vec<Accolade>,
    pub excluded_curated_locations: Vec<String>,
    pub error: Option<String>,
    pub loading: bool,
}

impl UserState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn selected_map(&self) -> Option<&Map> {
        let id = self.selected_map_id?;
        find_by_id(&self.maps, id)
    }

    pub fn selected_map_mut(&mut self) -> Option<&mut Map> {
        let id = self.selected_map_id?;
        self.maps.iter_mut().find(|m| m.id == Some(id))
    }

    pub fn primary_map(&self) -> Option<&Map> {
        self.maps.iter().find(|m| m.primary)
    }

    pub fn layer(&self, id: LayerId) -> Option<&Layer> {
        find_by_id(&self.layers, id)
    }

    pub fn itinerary(&self, id: ItineraryId) -> Option<&Itinerary> {
        find_by_id(&self.itineraries, id)
    }

    /// Records a business-rule failure for the caller to display.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}
