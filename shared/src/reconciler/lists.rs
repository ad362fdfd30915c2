use tracing::{debug, info, instrument, warn};

use super::{reject, settle, Operation, ReconcileResult, StateReconciler};
use crate::capabilities::{AssetStore, GraphRepository};
use crate::geo::split_search;
use crate::ids::{AccoladeId, LayerId, LocationId, TopListId};
use crate::import::{CuratedLocationRecord, ImportReport, SkippedRecord};
use crate::itinerary_diff::{CascadeOutcome, SubOperation};
use crate::model::{
    find_by_id, remove_by_id, replace_by_id, upsert_by_id, Accolade, Identity, Location, TopList,
    UserState,
};

/// Every mirrored copy of a location, across the loaded and search sets.
fn copies_of(state: &mut UserState, location_id: LocationId) -> impl Iterator<Item = &mut Location> {
    state
        .all_locations
        .iter_mut()
        .chain(state.visible_locations.iter_mut())
        .chain(state.local_search_locations.iter_mut())
        .chain(state.other_search_locations.iter_mut())
        .filter(move |l| l.id == Some(location_id))
}

impl<G, A> StateReconciler<G, A>
where
    G: GraphRepository + ?Sized,
    A: AssetStore + ?Sized,
{
    // --- Top lists ---

    #[instrument(skip_all, fields(user = %identity.username, title = %top_list.title))]
    pub async fn add_top_list(
        &self,
        state: &mut UserState,
        identity: &Identity,
        mut top_list: TopList,
    ) -> ReconcileResult<()> {
        let mut state = Operation::begin(state);

        let result = self.graph.add_top_list(identity, &top_list).await;
        let Some(top_list_id) = settle(&mut state, result, "Error adding top list.")? else {
            return Ok(());
        };

        top_list.id = Some(top_list_id);
        upsert_by_id(&mut state.top_lists, top_list);
        info!(%top_list_id, "top list added");
        Ok(())
    }

    #[instrument(skip_all, fields(user = %identity.username, top_list_id = ?top_list.id))]
    pub async fn edit_top_list(
        &self,
        state: &mut UserState,
        identity: &Identity,
        top_list: TopList,
    ) -> ReconcileResult<()> {
        let mut state = Operation::begin(state);

        if !top_list
            .id
            .is_some_and(|id| find_by_id(&state.top_lists, id).is_some())
        {
            reject(&mut state, "Top list not found.");
            return Ok(());
        }

        let result = self.graph.edit_top_list(identity, &top_list).await;
        if settle(&mut state, result, "Error editing top list.")?.is_none() {
            return Ok(());
        }

        replace_by_id(&mut state.top_lists, top_list);
        info!("top list edited");
        Ok(())
    }

    #[instrument(skip_all, fields(user = %identity.username, %top_list_id))]
    pub async fn delete_top_list(
        &self,
        state: &mut UserState,
        identity: &Identity,
        top_list_id: TopListId,
    ) -> ReconcileResult<()> {
        let mut state = Operation::begin(state);

        let result = self.graph.delete_top_list(identity, top_list_id).await;
        if settle(&mut state, result, "Error deleting top list.")?.is_none() {
            return Ok(());
        }

        remove_by_id(&mut state.top_lists, top_list_id);
        info!("top list deleted");
        Ok(())
    }

    // --- Accolades ---

    #[instrument(skip_all, fields(user = %identity.username, %location_id, title = %accolade.title))]
    pub async fn add_accolade(
        &self,
        state: &mut UserState,
        identity: &Identity,
        mut accolade: Accolade,
        location_id: LocationId,
    ) -> ReconcileResult<()> {
        let mut state = Operation::begin(state);

        let result = self.graph.add_accolade(identity, &accolade, location_id).await;
        let Some(accolade_id) = settle(&mut state, result, "Error adding accolade.")? else {
            return Ok(());
        };

        accolade.id = Some(accolade_id);
        accolade.location_id = Some(location_id);
        for location in copies_of(&mut state, location_id) {
            upsert_by_id(&mut location.accolades, accolade.clone());
        }
        upsert_by_id(&mut state.accolades, accolade);

        info!(%accolade_id, "accolade added");
        Ok(())
    }

    #[instrument(skip_all, fields(user = %identity.username, %location_id, accolade_id = ?accolade.id))]
    pub async fn edit_accolade(
        &self,
        state: &mut UserState,
        identity: &Identity,
        mut accolade: Accolade,
        location_id: LocationId,
    ) -> ReconcileResult<()> {
        let mut state = Operation::begin(state);

        if accolade.id.is_none() {
            reject(&mut state, "Accolade not found.");
            return Ok(());
        }

        let result = self.graph.edit_accolade(identity, &accolade, location_id).await;
        if settle(&mut state, result, "Error editing accolade.")?.is_none() {
            return Ok(());
        }

        accolade.location_id = Some(location_id);
        for location in copies_of(&mut state, location_id) {
            replace_by_id(&mut location.accolades, accolade.clone());
        }
        upsert_by_id(&mut state.accolades, accolade);

        info!("accolade edited");
        Ok(())
    }

    #[instrument(skip_all, fields(user = %identity.username, %location_id, count = accolade_ids.len()))]
    pub async fn delete_accolades(
        &self,
        state: &mut UserState,
        identity: &Identity,
        accolade_ids: &[AccoladeId],
        location_id: LocationId,
    ) -> ReconcileResult<()> {
        let mut state = Operation::begin(state);

        let result = self
            .graph
            .delete_accolades(identity, accolade_ids, location_id)
            .await;
        if settle(&mut state, result, "Error deleting accolades.")?.is_none() {
            return Ok(());
        }

        let doomed = |a: &Accolade| a.id.is_some_and(|id| accolade_ids.contains(&id));
        for location in copies_of(&mut state, location_id) {
            location.accolades.retain(|a| !doomed(a));
        }
        state.accolades.retain(|a| !doomed(a));

        info!("accolades deleted");
        Ok(())
    }

    // --- Curations ---

    /// Replaces the curated sources the user has hidden. The mirror only
    /// changes once the graph has accepted the new list.
    #[instrument(skip_all, fields(user = %identity.username, count = curations.len()))]
    pub async fn change_excluded_curations(
        &self,
        state: &mut UserState,
        identity: &Identity,
        curations: Vec<String>,
    ) -> ReconcileResult<()> {
        let mut state = Operation::begin(state);

        let result = self.graph.edit_excluded_curations(identity, &curations).await;
        if settle(&mut state, result, "Error changing excluded curations.")?.is_none() {
            return Ok(());
        }

        state.excluded_curated_locations = curations;
        info!("excluded curations changed");
        Ok(())
    }

    // --- Search ---

    /// Title search over everything loaded, split into matches near the
    /// selected map's viewport and matches elsewhere. Mirror only.
    #[instrument(skip_all, fields(user = %identity.username, term = %term))]
    pub async fn global_search(
        &self,
        state: &mut UserState,
        identity: &Identity,
        term: &str,
    ) -> ReconcileResult<()> {
        let mut state = Operation::begin(state);

        let viewport = state.selected_map().and_then(|m| m.bounding_box);
        let split = split_search(&state.all_locations, term, viewport.as_ref());
        debug!(local = split.local.len(), other = split.other.len(), "search split");

        state.local_search_locations = split.local;
        state.other_search_locations = split.other;
        Ok(())
    }

    // --- Import ---

    /// Adds curated records to `layer_id` on behalf of `owner`, each followed by
    /// its mapped accolades. Unusable rows are skipped and failed calls are
    /// collected; neither stops the batch. The mirror is left alone.
    ///
    /// `fields` narrows the configured accolade columns to the named ones.
    #[instrument(skip_all, fields(user = %identity.username, owner = %owner, %layer_id, records = records.len()))]
    pub async fn import_curated_locations(
        &self,
        state: &mut UserState,
        identity: &Identity,
        owner: &str,
        records: &[CuratedLocationRecord],
        layer_id: LayerId,
        fields: Option<&[String]>,
    ) -> ReconcileResult<ImportReport> {
        let mut state = Operation::begin(state);

        Self::check_limit("import records", records.len(), self.config.max_import_records)?;

        let owner = Identity {
            username: owner.to_string(),
            ..identity.clone()
        };
        let accolade_fields = match fields {
            Some(names) => self.config.accolade_fields.restricted_to(names),
            None => self.config.accolade_fields.clone(),
        };

        let mut report = ImportReport::default();
        let mut outcome = CascadeOutcome::new();
        for (index, record) in records.iter().enumerate() {
            let location = match record.to_location(layer_id) {
                Ok(location) => location,
                Err(reason) => {
                    warn!(index, reason = reason.as_str(), "skipping import record");
                    report.skipped.push(SkippedRecord {
                        index,
                        title: record.title.clone(),
                        reason,
                    });
                    continue;
                }
            };

            let target = format!("location '{}'", location.title);
            let result = self.graph.add_location(&owner, &location).await;
            let Some(location_id) = outcome.settle(SubOperation::AddLocation, target, result) else {
                continue;
            };
            report.imported += 1;

            for accolade in record.accolades(&accolade_fields) {
                let target = format!("{} accolade on '{}'", accolade.title, location.title);
                let result = self.graph.add_accolade(&owner, &accolade, location_id).await;
                outcome.settle(SubOperation::AddAccolade, target, result);
            }
        }
        report.failures = outcome.failures;

        if report.is_clean() {
            info!(imported = report.imported, "curated locations imported");
        } else {
            warn!(
                imported = report.imported,
                skipped = report.skipped.len(),
                failed = report.failures.len(),
                "curated import incomplete"
            );
            state.fail("Error importing some curated locations.");
        }
        Ok(report)
    }
}
