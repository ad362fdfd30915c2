use tracing::{info, instrument};

use super::{reject, settle, Operation, ReconcileResult, StateReconciler};
use crate::capabilities::{AssetStore, GraphRepository};
use crate::geo::limit_geographically;
use crate::ids::{LayerId, LocationId};
use crate::model::{dedup_by_id, remove_by_id, upsert_by_id, Identity, Location, UserState};

/// Only the user's own layers accept writes.
fn writable_layer(state: &UserState, layer_id: Option<LayerId>) -> bool {
    layer_id
        .and_then(|id| state.layer(id))
        .is_some_and(|layer| !layer.shared)
}

fn relimit_visible(state: &mut UserState) {
    let bounds = state.selected_map().and_then(|m| m.bounding_box);
    state.visible_locations = limit_geographically(&state.visible_locations, bounds.as_ref());
    dedup_by_id(&mut state.visible_locations);
}

/// Folds a saved location into the mirror. Applying the same saved location
/// twice leaves one entry.
pub(crate) fn commit_location(state: &mut UserState, location: Location) {
    let Some(layer_id) = location.layer_id else {
        return;
    };
    if !state.selected_layer_ids.contains(&layer_id) {
        return;
    }
    upsert_by_id(&mut state.all_locations, location.clone());
    upsert_by_id(&mut state.visible_locations, location);
    relimit_visible(state);
}

impl<G, A> StateReconciler<G, A>
where
    G: GraphRepository + ?Sized,
    A: AssetStore + ?Sized,
{
    #[instrument(skip_all, fields(user = %identity.username, layer_id = ?location.layer_id))]
    pub async fn add_location(
        &self,
        state: &mut UserState,
        identity: &Identity,
        mut location: Location,
    ) -> ReconcileResult<()> {
        let mut state = Operation::begin(state);

        if !writable_layer(&state, location.layer_id) {
            reject(&mut state, "Cannot add a location to a shared or unknown layer.");
            return Ok(());
        }

        let result = self.graph.add_location(identity, &location).await;
        let Some(location_id) = settle(&mut state, result, "Error adding location.")? else {
            return Ok(());
        };

        location.id = Some(location_id);
        location.deletable = true;
        commit_location(&mut state, location);

        info!(%location_id, "location added");
        Ok(())
    }

    #[instrument(skip_all, fields(user = %identity.username, location_id = ?location.id))]
    pub async fn edit_location(
        &self,
        state: &mut UserState,
        identity: &Identity,
        location: Location,
    ) -> ReconcileResult<()> {
        let mut state = Operation::begin(state);

        if !writable_layer(&state, location.layer_id) {
            reject(&mut state, "Cannot edit a location on a shared or unknown layer.");
            return Ok(());
        }

        let result = self.graph.edit_location(identity, &location).await;
        if settle(&mut state, result, "Error editing location.")?.is_none() {
            return Ok(());
        }

        // The layer may have changed: drop the old copies, then re-add if the
        // new layer is selected.
        if let Some(location_id) = location.id {
            remove_by_id(&mut state.all_locations, location_id);
            remove_by_id(&mut state.visible_locations, location_id);
        }
        commit_location(&mut state, location);

        info!("location edited");
        Ok(())
    }

    #[instrument(skip_all, fields(user = %identity.username, %location_id))]
    pub async fn delete_location(
        &self,
        state: &mut UserState,
        identity: &Identity,
        location_id: LocationId,
    ) -> ReconcileResult<()> {
        let mut state = Operation::begin(state);

        let result = self.graph.delete_location(identity, location_id).await;
        if settle(&mut state, result, "Error deleting location.")?.is_none() {
            return Ok(());
        }

        remove_by_id(&mut state.all_locations, location_id);
        remove_by_id(&mut state.visible_locations, location_id);
        remove_by_id(&mut state.local_search_locations, location_id);
        remove_by_id(&mut state.other_search_locations, location_id);
        state
            .accolades
            .retain(|a| a.location_id != Some(location_id));

        info!("location deleted");
        Ok(())
    }

    /// Turns a layer on and pulls its locations into the mirror.
    #[instrument(skip_all, fields(user = %identity.username, %layer_id))]
    pub async fn add_selected_layer(
        &self,
        state: &mut UserState,
        identity: &Identity,
        layer_id: LayerId,
    ) -> ReconcileResult<()> {
        let mut state = Operation::begin(state);

        if state.layer(layer_id).is_none() {
            reject(&mut state, "Layer not found.");
            return Ok(());
        }

        let result = self
            .fetch_locations(identity, &state.layers, &[layer_id])
            .await;
        let Some(fetched) = settle(&mut state, result, "Error loading layer locations.")? else {
            return Ok(());
        };

        state.selected_layer_ids.insert(layer_id);

        let bounds = state.selected_map().and_then(|m| m.bounding_box);
        let visible = limit_geographically(&fetched, bounds.as_ref());
        state
            .accolades
            .extend(fetched.iter().flat_map(|l| l.accolades.iter().cloned()));
        dedup_by_id(&mut state.accolades);
        state.all_locations.extend(fetched);
        dedup_by_id(&mut state.all_locations);
        state.visible_locations.extend(visible);
        dedup_by_id(&mut state.visible_locations);

        info!(total = state.all_locations.len(), "layer selected");
        Ok(())
    }

    /// Turns a layer off. Mirror only.
    #[instrument(skip_all, fields(user = %identity.username, %layer_id))]
    pub async fn remove_selected_layer(
        &self,
        state: &mut UserState,
        identity: &Identity,
        layer_id: LayerId,
    ) -> ReconcileResult<()> {
        let mut state = Operation::begin(state);

        state.selected_layer_ids.remove(&layer_id);
        state
            .visible_locations
            .retain(|l| l.layer_id != Some(layer_id));
        state.all_locations.retain(|l| l.layer_id != Some(layer_id));
        Ok(())
    }
}
