//! Wire form of every user mutation, and the dispatcher that routes one to
//! its reconciler operation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::capabilities::{AssetStore, GraphRepository};
use crate::ids::{
    AccoladeId, AlbumId, ItineraryId, LayerId, LocationId, MapId, PhotoId, TopListId,
};
use crate::import::{CuratedLocationRecord, ImportReport};
use crate::itinerary_diff::CascadeOutcome;
use crate::model::{
    Accolade, Activity, Album, BoundingBox, Identity, Itinerary, Location, Map, Photo, TopList,
    UserState,
};
use crate::reconciler::{PhotoUpload, ReconcileResult, StateReconciler};

// --- Command enum: one variant per operation, large payloads boxed ---

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum Command {
    // Hydration
    Load,
    Ensure,

    // Maps
    AddMap {
        map: Map,
    },
    EditMap {
        map: Map,
    },
    DeleteMap {
        map_id: MapId,
    },
    DeleteMaps {
        map_ids: Vec<MapId>,
    },
    SetSelectedMap {
        map_id: MapId,
    },
    ChangeViewingArea {
        bounding_box: BoundingBox,
    },
    DedupLocationsByMap {
        map_id: MapId,
    },

    // Layers and locations
    AddSelectedLayer {
        layer_id: LayerId,
    },
    RemoveSelectedLayer {
        layer_id: LayerId,
    },
    AddLocation(Box<Location>),
    EditLocation(Box<Location>),
    DeleteLocation {
        location_id: LocationId,
    },

    // Itineraries
    AddItinerary(Box<Itinerary>),
    EditItinerary(Box<Itinerary>),
    EditItineraryActivity {
        activity: Activity,
        itinerary_id: ItineraryId,
    },
    DeleteItinerary {
        itinerary_id: ItineraryId,
    },
    ShareItinerary {
        itinerary_ids: Vec<ItineraryId>,
        usernames: Vec<String>,
    },
    UnshareItinerary {
        itinerary_ids: Vec<ItineraryId>,
        usernames: Vec<String>,
    },

    // Albums and photos
    AddAlbum {
        album: Box<Album>,
        #[serde(default)]
        uploads: BTreeMap<usize, PhotoUpload>,
    },
    EditAlbum {
        album: Album,
    },
    DeleteAlbum {
        album_id: AlbumId,
    },
    AddPhoto {
        photo: Photo,
        #[serde(default)]
        upload: Option<PhotoUpload>,
        album_id: AlbumId,
    },
    EditPhoto {
        photo: Photo,
        album_id: AlbumId,
    },
    DeletePhoto {
        photo_id: PhotoId,
    },

    // Top lists
    AddTopList(Box<TopList>),
    EditTopList(Box<TopList>),
    DeleteTopList {
        top_list_id: TopListId,
    },

    // Accolades
    AddAccolade {
        accolade: Accolade,
        location_id: LocationId,
    },
    EditAccolade {
        accolade: Accolade,
        location_id: LocationId,
    },
    DeleteAccolades {
        accolade_ids: Vec<AccoladeId>,
        location_id: LocationId,
    },

    // Curation, search and import
    ChangeExcludedCurations {
        curations: Vec<String>,
    },
    GlobalSearch {
        term: String,
    },
    ImportCuratedLocations {
        owner: String,
        records: Vec<CuratedLocationRecord>,
        layer_id: LayerId,
        #[serde(default)]
        fields: Option<Vec<String>>,
    },
}

impl Command {
    /// Stable snake_case name, used for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Load => "load",
            Command::Ensure => "ensure",
            Command::AddMap { .. } => "add_map",
            Command::EditMap { .. } => "edit_map",
            Command::DeleteMap { .. } => "delete_map",
            Command::DeleteMaps { .. } => "delete_maps",
            Command::SetSelectedMap { .. } => "set_selected_map",
            Command::ChangeViewingArea { .. } => "change_viewing_area",
            Command::DedupLocationsByMap { .. } => "dedup_locations_by_map",
            Command::AddSelectedLayer { .. } => "add_selected_layer",
            Command::RemoveSelectedLayer { .. } => "remove_selected_layer",
            Command::AddLocation(_) => "add_location",
            Command::EditLocation(_) => "edit_location",
            Command::DeleteLocation { .. } => "delete_location",
            Command::AddItinerary(_) => "add_itinerary",
            Command::EditItinerary(_) => "edit_itinerary",
            Command::EditItineraryActivity { .. } => "edit_itinerary_activity",
            Command::DeleteItinerary { .. } => "delete_itinerary",
            Command::ShareItinerary { .. } => "share_itinerary",
            Command::UnshareItinerary { .. } => "unshare_itinerary",
            Command::AddAlbum { .. } => "add_album",
            Command::EditAlbum { .. } => "edit_album",
            Command::DeleteAlbum { .. } => "delete_album",
            Command::AddPhoto { .. } => "add_photo",
            Command::EditPhoto { .. } => "edit_photo",
            Command::DeletePhoto { .. } => "delete_photo",
            Command::AddTopList(_) => "add_top_list",
            Command::EditTopList(_) => "edit_top_list",
            Command::DeleteTopList { .. } => "delete_top_list",
            Command::AddAccolade { .. } => "add_accolade",
            Command::EditAccolade { .. } => "edit_accolade",
            Command::DeleteAccolades { .. } => "delete_accolades",
            Command::ChangeExcludedCurations { .. } => "change_excluded_curations",
            Command::GlobalSearch { .. } => "global_search",
            Command::ImportCuratedLocations { .. } => "import_curated_locations",
        }
    }

    /// Whether the command only touches the mirror.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Command::SetSelectedMap { .. }
                | Command::ChangeViewingArea { .. }
                | Command::RemoveSelectedLayer { .. }
                | Command::GlobalSearch { .. }
        )
    }
}

/// Structured result beyond the mirror itself, for commands that fan out.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandOutcome {
    #[default]
    Applied,
    Cascade(CascadeOutcome),
    Import(ImportReport),
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        match self {
            CommandOutcome::Applied => true,
            CommandOutcome::Cascade(outcome) => outcome.is_success(),
            CommandOutcome::Import(report) => report.is_clean(),
        }
    }
}

impl<G, A> StateReconciler<G, A>
where
    G: GraphRepository + ?Sized,
    A: AssetStore + ?Sized,
{
    /// Routes a command to its operation.
    pub async fn apply(
        &self,
        state: &mut UserState,
        identity: &Identity,
        command: Command,
    ) -> ReconcileResult<CommandOutcome> {
        use CommandOutcome::{Applied, Cascade, Import};

        let outcome = match command {
            Command::Load => self.load(state, identity).await.map(|()| Applied)?,
            Command::Ensure => self.ensure(state, identity).await.map(|()| Applied)?,

            Command::AddMap { map } => self.add_map(state, identity, map).await.map(|()| Applied)?,
            Command::EditMap { map } => self.edit_map(state, identity, map).await.map(|()| Applied)?,
            Command::DeleteMap { map_id } => {
                self.delete_map(state, identity, map_id).await.map(|()| Applied)?
            }
            Command::DeleteMaps { map_ids } => {
                self.delete_maps(state, identity, &map_ids).await.map(|()| Applied)?
            }
            Command::SetSelectedMap { map_id } => {
                self.set_selected_map(state, identity, map_id).await.map(|()| Applied)?
            }
            Command::ChangeViewingArea { bounding_box } => self
                .change_viewing_area(state, identity, bounding_box)
                .await
                .map(|()| Applied)?,
            Command::DedupLocationsByMap { map_id } => self
                .dedup_locations_by_map(state, identity, map_id)
                .await
                .map(|()| Applied)?,

            Command::AddSelectedLayer { layer_id } => {
                self.add_selected_layer(state, identity, layer_id).await.map(|()| Applied)?
            }
            Command::RemoveSelectedLayer { layer_id } => {
                self.remove_selected_layer(state, identity, layer_id).await.map(|()| Applied)?
            }
            Command::AddLocation(location) => {
                self.add_location(state, identity, *location).await.map(|()| Applied)?
            }
            Command::EditLocation(location) => {
                self.edit_location(state, identity, *location).await.map(|()| Applied)?
            }
            Command::DeleteLocation { location_id } => {
                self.delete_location(state, identity, location_id).await.map(|()| Applied)?
            }

            Command::AddItinerary(itinerary) => {
                Cascade(self.add_itinerary(state, identity, *itinerary).await?)
            }
            Command::EditItinerary(itinerary) => {
                Cascade(self.edit_itinerary(state, identity, *itinerary).await?)
            }
            Command::EditItineraryActivity {
                activity,
                itinerary_id,
            } => self
                .edit_itinerary_activity(state, identity, activity, itinerary_id)
                .await
                .map(|()| Applied)?,
            Command::DeleteItinerary { itinerary_id } => {
                Cascade(self.delete_itinerary(state, identity, itinerary_id).await?)
            }
            Command::ShareItinerary {
                itinerary_ids,
                usernames,
            } => Cascade(
                self.share_itinerary(state, identity, &itinerary_ids, &usernames)
                    .await?,
            ),
            Command::UnshareItinerary {
                itinerary_ids,
                usernames,
            } => Cascade(
                self.unshare_itinerary(state, identity, &itinerary_ids, &usernames)
                    .await?,
            ),

            Command::AddAlbum { album, uploads } => {
                Cascade(self.add_album(state, identity, *album, uploads).await?)
            }
            Command::EditAlbum { album } => {
                self.edit_album(state, identity, album).await.map(|()| Applied)?
            }
            Command::DeleteAlbum { album_id } => {
                self.delete_album(state, identity, album_id).await.map(|()| Applied)?
            }
            Command::AddPhoto {
                photo,
                upload,
                album_id,
            } => self
                .add_photo(state, identity, photo, upload, album_id)
                .await
                .map(|()| Applied)?,
            Command::EditPhoto { photo, album_id } => self
                .edit_photo(state, identity, photo, album_id)
                .await
                .map(|()| Applied)?,
            Command::DeletePhoto { photo_id } => {
                self.delete_photo(state, identity, photo_id).await.map(|()| Applied)?
            }

            Command::AddTopList(top_list) => {
                self.add_top_list(state, identity, *top_list).await.map(|()| Applied)?
            }
            Command::EditTopList(top_list) => {
                self.edit_top_list(state, identity, *top_list).await.map(|()| Applied)?
            }
            Command::DeleteTopList { top_list_id } => {
                self.delete_top_list(state, identity, top_list_id).await.map(|()| Applied)?
            }

            Command::AddAccolade {
                accolade,
                location_id,
            } => self
                .add_accolade(state, identity, accolade, location_id)
                .await
                .map(|()| Applied)?,
            Command::EditAccolade {
                accolade,
                location_id,
            } => self
                .edit_accolade(state, identity, accolade, location_id)
                .await
                .map(|()| Applied)?,
            Command::DeleteAccolades {
                accolade_ids,
                location_id,
            } => self
                .delete_accolades(state, identity, &accolade_ids, location_id)
                .await
                .map(|()| Applied)?,

            Command::ChangeExcludedCurations { curations } => self
                .change_excluded_curations(state, identity, curations)
                .await
                .map(|()| Applied)?,
            Command::GlobalSearch { term } => {
                self.global_search(state, identity, &term).await.map(|()| Applied)?
            }
            Command::ImportCuratedLocations {
                owner,
                records,
                layer_id,
                fields,
            } => Import(
                self.import_curated_locations(
                    state,
                    identity,
                    &owner,
                    &records,
                    layer_id,
                    fields.as_deref(),
                )
                .await?,
            ),
        };
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{GraphError, MemoryAssetStore};
    use crate::memory_graph::InMemoryGraph;
    use crate::reconciler::ReconcileError;
    use std::sync::Arc;

    fn setup() -> (Arc<InMemoryGraph>, StateReconciler<InMemoryGraph, MemoryAssetStore>) {
        let graph = Arc::new(InMemoryGraph::new());
        let rec = StateReconciler::with_default_config(graph.clone(), Arc::new(MemoryAssetStore::new()));
        (graph, rec)
    }

    fn alice() -> Identity {
        Identity::new("alice", "tenant", "app")
    }

    #[test]
    fn command_json_shape() {
        let raw = r#"{"DeleteMap": {"map_id": "6f1c1d9e-8d0c-4a5e-9a57-6f2b1f1f3a10"}}"#;
        let command: Command = serde_json::from_str(raw).unwrap();
        assert_eq!(command.name(), "delete_map");

        let unit: Command = serde_json::from_str(r#""Load""#).unwrap();
        assert_eq!(unit, Command::Load);

        let unknown = r#"{"DeleteMap": {"map_id": "6f1c1d9e-8d0c-4a5e-9a57-6f2b1f1f3a10", "force": true}}"#;
        assert!(serde_json::from_str::<Command>(unknown).is_err());
    }

    #[test]
    fn viewport_commands_are_local() {
        let command = Command::ChangeViewingArea {
            bounding_box: BoundingBox::new(1.0, 1.0, 0.0, 0.0),
        };
        assert!(command.is_local());
        assert!(!Command::Load.is_local());
    }

    #[tokio::test]
    async fn apply_routes_to_operation() {
        let (graph, rec) = setup();
        let mut state = UserState::new();

        let outcome = rec
            .apply(
                &mut state,
                &alice(),
                Command::AddMap {
                    map: Map {
                        title: "Home".into(),
                        primary: true,
                        ..Map::default()
                    },
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome, CommandOutcome::Applied);
        assert_eq!(state.maps.len(), 1);
        assert_eq!(graph.call_count("add_map"), 1);
    }

    #[tokio::test]
    async fn cascade_outcome_is_surfaced() {
        let (_, rec) = setup();
        let mut state = UserState::new();

        let outcome = rec
            .apply(
                &mut state,
                &alice(),
                Command::ShareItinerary {
                    itinerary_ids: vec![ItineraryId::generate()],
                    usernames: vec!["bob".into()],
                },
            )
            .await
            .unwrap();

        assert!(matches!(&outcome, CommandOutcome::Cascade(c) if c.failure_count() == 1));
        assert!(!outcome.is_success());
        assert!(state.has_error());
    }

    #[tokio::test]
    async fn transport_errors_propagate_through_apply() {
        let (graph, rec) = setup();
        graph.set_unavailable(true);
        let mut state = UserState::new();

        let err = rec.apply(&mut state, &alice(), Command::Load).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Graph(GraphError::Unavailable(_))));
        assert!(!state.loading);
    }
}
