use tracing::{error, info, instrument, warn};

use super::{reject, settle, Operation, ReconcileResult, StateReconciler};
use crate::capabilities::{AssetStore, GraphRepository, GraphResult};
use crate::ids::ItineraryId;
use crate::itinerary_diff::{self, CascadeOutcome, SubOperation};
use crate::model::{remove_by_id, upsert_by_id, Activity, Identity, Itinerary, UnixTimeMs, UserState};

const UPDATE_FAILED: &str = "General Error updating user itinerary.";
const SHARE_FAILED: &str = "General Error sharing itinerary.";
const UNSHARE_FAILED: &str = "General Error unsharing itinerary.";

/// The call that heads a cascade. A rejection is both recorded in the outcome
/// and shown to the user; a transport failure aborts before any child call.
fn settle_head<T>(
    state: &mut UserState,
    outcome: &mut CascadeOutcome,
    kind: SubOperation,
    target: String,
    result: GraphResult<T>,
    message: &str,
) -> ReconcileResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_rejection() => {
            outcome.record(kind, target, err.to_string());
            reject(state, message);
            Ok(None)
        }
        Err(err) => {
            error!(error = %err, %kind, "graph unavailable");
            Err(err.into())
        }
    }
}

impl<G, A> StateReconciler<G, A>
where
    G: GraphRepository + ?Sized,
    A: AssetStore + ?Sized,
{
    /// Adds an itinerary and every group and activity under it. Children that
    /// fail are left out of the mirror and reported in the outcome.
    #[instrument(skip_all, fields(user = %identity.username, groups = itinerary.activity_groups.len()))]
    pub async fn add_itinerary(
        &self,
        state: &mut UserState,
        identity: &Identity,
        mut itinerary: Itinerary,
    ) -> ReconcileResult<CascadeOutcome> {
        let mut state = Operation::begin(state);
        let mut outcome = CascadeOutcome::new();

        itinerary.created_at = UnixTimeMs::now();
        itinerary.editable = true;
        itinerary.shared = false;
        itinerary.shared_by_username = None;

        let result = self.graph.add_itinerary(identity, &itinerary).await;
        let target = format!("itinerary '{}'", itinerary.title);
        let Some(itinerary_id) = settle_head(
            &mut state,
            &mut outcome,
            SubOperation::AddItinerary,
            target,
            result,
            "Error adding itinerary.",
        )?
        else {
            return Ok(outcome);
        };

        let groups = itinerary_diff::create_groups(
            &*self.graph,
            identity,
            itinerary_id,
            &itinerary.activity_groups,
            &mut outcome,
        )
        .await;
        itinerary.id = Some(itinerary_id);
        itinerary.activity_groups = groups;
        upsert_by_id(&mut state.itineraries, itinerary);

        if outcome.is_success() {
            info!(%itinerary_id, "itinerary added");
        } else {
            warn!(%itinerary_id, failures = outcome.failure_count(), "itinerary added with failures");
            state.fail("Error adding some itinerary items.");
        }
        Ok(outcome)
    }

    /// Brings the graph in line with an edited itinerary, then reloads the
    /// itinerary list. Any failed step leaves the mirror alone.
    #[instrument(skip_all, fields(user = %identity.username, itinerary_id = ?itinerary.id))]
    pub async fn edit_itinerary(
        &self,
        state: &mut UserState,
        identity: &Identity,
        itinerary: Itinerary,
    ) -> ReconcileResult<CascadeOutcome> {
        let mut state = Operation::begin(state);
        let mut outcome = CascadeOutcome::new();

        let existing = itinerary.id.and_then(|id| state.itinerary(id).cloned());
        let (Some(itinerary_id), Some(existing)) = (itinerary.id, existing) else {
            reject(&mut state, "Itinerary not found.");
            return Ok(outcome);
        };
        if !existing.editable {
            reject(&mut state, "Cannot edit a shared itinerary.");
            return Ok(outcome);
        }

        let result = self.graph.edit_itinerary(identity, &itinerary).await;
        let head = settle_head(
            &mut state,
            &mut outcome,
            SubOperation::EditItinerary,
            format!("itinerary {itinerary_id}"),
            result,
            UPDATE_FAILED,
        )?;
        if head.is_none() {
            return Ok(outcome);
        }

        outcome.merge(
            itinerary_diff::apply_diff(&*self.graph, identity, itinerary_id, &existing, &itinerary)
                .await,
        );
        if !outcome.is_success() {
            warn!(failures = outcome.failure_count(), "itinerary update incomplete");
            state.fail(UPDATE_FAILED);
            return Ok(outcome);
        }

        let reloaded = self.fetch_itineraries(identity).await;
        if let Some(itineraries) = settle(&mut state, reloaded, UPDATE_FAILED)? {
            state.itineraries = itineraries;
            info!("itinerary updated");
        }
        Ok(outcome)
    }

    #[instrument(skip_all, fields(user = %identity.username, %itinerary_id, activity_id = ?activity.id))]
    pub async fn edit_itinerary_activity(
        &self,
        state: &mut UserState,
        identity: &Identity,
        activity: Activity,
        itinerary_id: ItineraryId,
    ) -> ReconcileResult<()> {
        let mut state = Operation::begin(state);

        let Some(editable) = state.itinerary(itinerary_id).map(|i| i.editable) else {
            reject(&mut state, "Itinerary not found.");
            return Ok(());
        };
        if !editable {
            reject(&mut state, "Cannot edit a shared itinerary.");
            return Ok(());
        }
        let known = activity.id.is_some_and(|id| {
            state.itinerary(itinerary_id).is_some_and(|i| {
                i.activity_groups
                    .iter()
                    .any(|g| g.activities.iter().any(|a| a.id == Some(id)))
            })
        });
        if !known {
            reject(&mut state, "Activity not found.");
            return Ok(());
        }

        let result = self.graph.edit_activity(identity, &activity).await;
        if settle(&mut state, result, "Error editing itinerary activity.")?.is_none() {
            return Ok(());
        }

        let slot = state
            .itineraries
            .iter_mut()
            .filter(|i| i.id == Some(itinerary_id))
            .flat_map(|i| i.activity_groups.iter_mut())
            .flat_map(|g| g.activities.iter_mut())
            .find(|a| a.id == activity.id);
        if let Some(slot) = slot {
            *slot = activity;
        }

        info!("itinerary activity edited");
        Ok(())
    }

    /// Activities, then groups, then the itinerary. The itinerary only leaves
    /// the mirror if its own delete went through.
    #[instrument(skip_all, fields(user = %identity.username, %itinerary_id))]
    pub async fn delete_itinerary(
        &self,
        state: &mut UserState,
        identity: &Identity,
        itinerary_id: ItineraryId,
    ) -> ReconcileResult<CascadeOutcome> {
        let mut state = Operation::begin(state);

        let Some(itinerary) = state.itinerary(itinerary_id).cloned() else {
            reject(&mut state, "Itinerary not found.");
            return Ok(CascadeOutcome::new());
        };

        let outcome = itinerary_diff::delete_itinerary(&*self.graph, identity, &itinerary).await;
        if outcome.is_success() {
            remove_by_id(&mut state.itineraries, itinerary_id);
            info!("itinerary deleted");
        } else {
            warn!(failures = outcome.failure_count(), "itinerary delete incomplete");
            state.fail("Error deleting itinerary.");
        }
        Ok(outcome)
    }

    #[instrument(skip_all, fields(user = %identity.username, itineraries = itinerary_ids.len(), usernames = usernames.len()))]
    pub async fn share_itinerary(
        &self,
        state: &mut UserState,
        identity: &Identity,
        itinerary_ids: &[ItineraryId],
        usernames: &[String],
    ) -> ReconcileResult<CascadeOutcome> {
        self.share_cascade(state, identity, itinerary_ids, usernames, true)
            .await
    }

    #[instrument(skip_all, fields(user = %identity.username, itineraries = itinerary_ids.len(), usernames = usernames.len()))]
    pub async fn unshare_itinerary(
        &self,
        state: &mut UserState,
        identity: &Identity,
        itinerary_ids: &[ItineraryId],
        usernames: &[String],
    ) -> ReconcileResult<CascadeOutcome> {
        self.share_cascade(state, identity, itinerary_ids, usernames, false)
            .await
    }

    async fn share_cascade(
        &self,
        state: &mut UserState,
        identity: &Identity,
        itinerary_ids: &[ItineraryId],
        usernames: &[String],
        share: bool,
    ) -> ReconcileResult<CascadeOutcome> {
        let mut state = Operation::begin(state);

        Self::check_limit(
            "share targets",
            itinerary_ids.len().saturating_mul(usernames.len()),
            self.config.max_share_targets,
        )?;

        let outcome =
            itinerary_diff::share_all(&*self.graph, identity, itinerary_ids, usernames, share).await;
        if outcome.is_success() {
            info!(share, "itinerary sharing updated");
        } else {
            state.fail(if share { SHARE_FAILED } else { UNSHARE_FAILED });
        }
        Ok(outcome)
    }
}
