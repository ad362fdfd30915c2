//! Graph records → mirror entities, and back where the graph needs a record.

use crate::capabilities::{
    AccoladeRecord, AlbumRecord, LayerRecord, LocationRecord, MapRecord, PhotoRecord,
    SharedLayerRecord, SharedMapRecord, TopListRecord,
};
use crate::ids::{LayerId, LocationId, MapId};
use crate::model::{Accolade, Album, BoundingBox, Layer, Location, Map, Photo, TopList};

/// A map the user owns. Owned maps inherit from themselves.
pub fn user_map(record: &MapRecord) -> Map {
    Map {
        id: Some(record.id),
        title: record.title.clone(),
        bounding_box: BoundingBox::parse(&record.coordinates),
        latitude: record.latitude,
        longitude: record.longitude,
        zoom: record.zoom,
        primary: record.primary,
        shared: false,
        deletable: true,
        default_layer_id: record.default_layer_id,
        inherited_id: Some(record.id),
    }
}

/// A map shared with the user; viewport and default layer come from the parent.
pub fn shared_map(record: &SharedMapRecord) -> Map {
    let parent = &record.parent;
    Map {
        id: Some(record.id),
        title: record.title.clone(),
        bounding_box: BoundingBox::parse(&parent.coordinates),
        latitude: parent.latitude,
        longitude: parent.longitude,
        zoom: parent.zoom,
        primary: record.primary,
        shared: true,
        deletable: record.deletable,
        default_layer_id: parent.default_layer_id,
        inherited_id: Some(parent.id),
    }
}

pub fn user_maps(own: &[MapRecord], shared: &[SharedMapRecord]) -> Vec<Map> {
    own.iter()
        .map(user_map)
        .chain(shared.iter().map(shared_map))
        .collect()
}

pub fn user_layer(record: &LayerRecord) -> Layer {
    Layer {
        id: Some(record.id),
        title: record.title.clone(),
        shared: false,
        deletable: true,
        bounding_box: None,
        inherited_id: Some(record.id),
    }
}

/// Shared layers take their bounding box from the map they are curated for.
pub fn shared_layer(record: &SharedLayerRecord, maps: &[Map]) -> Layer {
    let bounding_box = record.default_map_id.and_then(|map_id| {
        maps.iter()
            .find(|m| m.id == Some(map_id) || m.inherited_id == Some(map_id))
            .and_then(|m| m.bounding_box)
    });

    Layer {
        id: Some(record.id),
        title: record.title.clone(),
        shared: true,
        deletable: record.deletable,
        bounding_box,
        inherited_id: Some(record.parent.id),
    }
}

/// Curated (shared) layers are listed ahead of the user's own layers.
pub fn user_layers(own: &[LayerRecord], shared: &[SharedLayerRecord], maps: &[Map]) -> Vec<Layer> {
    let mut layers: Vec<Layer> = own.iter().map(user_layer).collect();
    for record in shared {
        layers.insert(0, shared_layer(record, maps));
    }
    layers
}

/// Resolves a map's default layer against the loaded layers, matching either
/// the layer itself or a layer inherited from it.
pub fn resolve_layer_id(layers: &[Layer], layer_id: LayerId) -> LayerId {
    layers
        .iter()
        .find(|l| l.id == Some(layer_id))
        .or_else(|| layers.iter().find(|l| l.inherited_id == Some(layer_id)))
        .and_then(|l| l.id)
        .unwrap_or(layer_id)
}

pub fn user_location(record: &LocationRecord, layer_id: LayerId, user_owns: bool) -> Location {
    location_in(record, Some(layer_id), user_owns)
}

fn location_in(record: &LocationRecord, layer_id: Option<LayerId>, user_owns: bool) -> Location {
    Location {
        id: Some(record.id),
        title: record.title.clone(),
        latitude: record.latitude,
        longitude: record.longitude,
        layer_id,
        address: record.address.clone(),
        country: record.country.clone(),
        state: record.state.clone(),
        town: record.town.clone(),
        zip_code: record.zip_code.clone(),
        telephone: record.telephone.clone(),
        website: record.website.clone(),
        instagram: record.instagram.clone(),
        icon: record.icon.clone(),
        google_location_name: record.google_location_name.clone(),
        deletable: user_owns,
        accolades: Vec::new(),
    }
}

pub fn location_record(location: &Location, id: LocationId) -> LocationRecord {
    LocationRecord {
        id,
        title: location.title.clone(),
        latitude: location.latitude,
        longitude: location.longitude,
        address: location.address.clone(),
        country: location.country.clone(),
        state: location.state.clone(),
        town: location.town.clone(),
        zip_code: location.zip_code.clone(),
        telephone: location.telephone.clone(),
        website: location.website.clone(),
        instagram: location.instagram.clone(),
        icon: location.icon.clone(),
        google_location_name: location.google_location_name.clone(),
    }
}

pub fn map_record(map: &Map, id: MapId) -> MapRecord {
    MapRecord {
        id,
        title: map.title.clone(),
        coordinates: map
            .bounding_box
            .map(|b| b.to_graph_string())
            .unwrap_or_default(),
        latitude: map.latitude,
        longitude: map.longitude,
        zoom: map.zoom,
        primary: map.primary,
        default_layer_id: map.default_layer_id,
    }
}

pub fn user_accolade(record: &AccoladeRecord, location_id: LocationId) -> Accolade {
    Accolade {
        id: Some(record.id),
        title: record.title.clone(),
        rank: record.rank.clone(),
        year: record.year.clone(),
        location_id: Some(location_id),
    }
}

pub fn user_photo(record: &PhotoRecord) -> Photo {
    Photo {
        id: Some(record.id),
        caption: record.caption.clone(),
        url: record.url.clone(),
        location_id: record.location_id,
    }
}

pub fn user_album(record: &AlbumRecord, photos: &[PhotoRecord]) -> Album {
    Album {
        id: Some(record.id),
        title: record.title.clone(),
        photos: photos.iter().map(user_photo).collect(),
    }
}

/// Top-list entries always belong to the user's own layer.
pub fn user_top_list(
    record: &TopListRecord,
    locations: &[LocationRecord],
    user_layer_id: Option<LayerId>,
) -> TopList {
    TopList {
        id: Some(record.id),
        title: record.title.clone(),
        ordered_value: record.ordered_value.clone(),
        location_list: locations
            .iter()
            .map(|l| location_in(l, user_layer_id, true))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_record_with(coordinates: &str) -> MapRecord {
        MapRecord {
            id: MapId::generate(),
            title: "Parent".into(),
            coordinates: coordinates.into(),
            latitude: 1.0,
            longitude: 2.0,
            zoom: 7,
            primary: true,
            default_layer_id: Some(LayerId::generate()),
        }
    }

    #[test]
    fn owned_map_inherits_from_itself() {
        let record = map_record_with("10,10,0,-10");
        let map = user_map(&record);
        assert_eq!(map.inherited_id, map.id);
        assert!(map.deletable);
        assert!(!map.shared);
        assert_eq!(map.bounding_box, Some(BoundingBox::new(10.0, 10.0, 0.0, -10.0)));
    }

    #[test]
    fn owned_map_with_bad_coordinates_has_no_box() {
        assert!(user_map(&map_record_with("")).bounding_box.is_none());
        assert!(user_map(&map_record_with("1,2,3")).bounding_box.is_none());
    }

    #[test]
    fn shared_map_takes_parent_viewport() {
        let parent = map_record_with("5,5,-5,-5");
        let record = SharedMapRecord {
            id: MapId::generate(),
            title: "Curated".into(),
            primary: false,
            deletable: false,
            parent: parent.clone(),
        };
        let map = shared_map(&record);
        assert_eq!(map.id, Some(record.id));
        assert_eq!(map.inherited_id, Some(parent.id));
        assert_eq!(map.default_layer_id, parent.default_layer_id);
        assert_eq!(map.zoom, 7);
        assert!(map.shared);
        assert!(!map.deletable);
    }

    #[test]
    fn shared_layers_come_first_with_map_box() {
        let parent_map = map_record_with("5,5,-5,-5");
        let maps = vec![user_map(&parent_map)];
        let own = vec![LayerRecord {
            id: LayerId::generate(),
            title: "User".into(),
        }];
        let shared = vec![SharedLayerRecord {
            id: LayerId::generate(),
            title: "Curated".into(),
            deletable: false,
            default_map_id: Some(parent_map.id),
            parent: LayerRecord {
                id: LayerId::generate(),
                title: "Source".into(),
            },
        }];

        let layers = user_layers(&own, &shared, &maps);
        assert_eq!(layers[0].title, "Curated");
        assert!(layers[0].shared);
        assert_eq!(layers[0].bounding_box, maps[0].bounding_box);
        assert_eq!(layers[1].title, "User");
        assert!(layers[1].deletable);
    }

    #[test]
    fn resolve_layer_matches_inherited_id() {
        let source = LayerId::generate();
        let local = LayerId::generate();
        let layers = vec![Layer {
            id: Some(local),
            inherited_id: Some(source),
            ..Layer::default()
        }];
        assert_eq!(resolve_layer_id(&layers, source), local);
        assert_eq!(resolve_layer_id(&layers, local), local);
        let unknown = LayerId::generate();
        assert_eq!(resolve_layer_id(&layers, unknown), unknown);
    }

    #[test]
    fn top_list_locations_belong_to_user_layer() {
        let layer = LayerId::generate();
        let record = TopListRecord {
            id: crate::ids::TopListId::generate(),
            title: "Best".into(),
            ordered_value: Some("1,2".into()),
        };
        let loc = LocationRecord {
            id: LocationId::generate(),
            title: "Spot".into(),
            ..LocationRecord::default()
        };
        let list = user_top_list(&record, &[loc], Some(layer));
        assert_eq!(list.location_list[0].layer_id, Some(layer));
        assert!(list.location_list[0].deletable);
    }
}
