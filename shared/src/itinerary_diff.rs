//! Cascading itinerary writes.
//!
//! Groups and activities are separate graph entities, so every structural
//! change to an itinerary fans out into many calls. They are issued one at a
//! time, in parent/child order, and a failure never stops its siblings: it is
//! recorded in a [`CascadeOutcome`] and the walk continues.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

use crate::capabilities::{GraphRepository, GraphResult};
use crate::ids::{ActivityGroupId, ActivityId, ItineraryId};
use crate::model::{find_by_id, Activity, ActivityGroup, Identity, Itinerary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubOperation {
    AddItinerary,
    EditItinerary,
    AddGroup,
    EditGroup,
    DeleteGroup,
    AddActivity,
    EditActivity,
    DeleteActivity,
    DeleteItinerary,
    Share,
    Unshare,
    AddLocation,
    AddAccolade,
    AddPhoto,
}

impl SubOperation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AddItinerary => "add_itinerary",
            Self::EditItinerary => "edit_itinerary",
            Self::AddGroup => "add_group",
            Self::EditGroup => "edit_group",
            Self::DeleteGroup => "delete_group",
            Self::AddActivity => "add_activity",
            Self::EditActivity => "edit_activity",
            Self::DeleteActivity => "delete_activity",
            Self::DeleteItinerary => "delete_itinerary",
            Self::Share => "share",
            Self::Unshare => "unshare",
            Self::AddLocation => "add_location",
            Self::AddAccolade => "add_accolade",
            Self::AddPhoto => "add_photo",
        }
    }
}

impl fmt::Display for SubOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sub-operation that did not happen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedOp {
    pub kind: SubOperation,
    /// Human-readable name of the entity the call was about.
    pub target: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeOutcome {
    pub failures: Vec<FailedOp>,
}

impl CascadeOutcome {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    pub fn record(&mut self, kind: SubOperation, target: impl Into<String>, reason: impl Into<String>) {
        let failed = FailedOp {
            kind,
            target: target.into(),
            reason: reason.into(),
        };
        warn!(kind = %failed.kind, target = %failed.target, reason = %failed.reason, "cascade step failed");
        self.failures.push(failed);
    }

    /// Unwraps a graph result, recording the error and yielding `None` on failure.
    pub fn settle<T>(
        &mut self,
        kind: SubOperation,
        target: impl Into<String>,
        result: GraphResult<T>,
    ) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.record(kind, target, err.to_string());
                None
            }
        }
    }

    pub fn merge(&mut self, other: Self) {
        self.failures.extend(other.failures);
    }

    pub fn has_kind(&self, kind: SubOperation) -> bool {
        self.failures.iter().any(|f| f.kind == kind)
    }
}

fn group_label(group: &ActivityGroup) -> String {
    match group.id {
        Some(id) => format!("group {id}"),
        None => format!("group '{}'", group.title),
    }
}

fn activity_label(activity: &Activity) -> String {
    match activity.id {
        Some(id) => format!("activity {id}"),
        None => format!("activity '{}'", activity.title),
    }
}

const SKIPPED_PARENT: &str = "skipped: parent group was not created";
const SKIPPED_CHILDREN: &str = "skipped: child deletes failed";

// --- Create ---

/// Creates a group and then each of its activities. Returns the group with
/// assigned ids, minus any activity that failed; `None` if the group itself
/// could not be created.
pub async fn create_group<G>(
    graph: &G,
    identity: &Identity,
    itinerary_id: ItineraryId,
    group: &ActivityGroup,
    outcome: &mut CascadeOutcome,
) -> Option<ActivityGroup>
where
    G: GraphRepository + ?Sized,
{
    let result = graph.add_activity_group(identity, itinerary_id, group).await;
    let Some(group_id) = outcome.settle(SubOperation::AddGroup, group_label(group), result) else {
        for activity in &group.activities {
            outcome.record(SubOperation::AddActivity, activity_label(activity), SKIPPED_PARENT);
        }
        return None;
    };

    let mut created = ActivityGroup {
        id: Some(group_id),
        activities: Vec::with_capacity(group.activities.len()),
        ..group.clone()
    };
    for activity in &group.activities {
        if let Some(added) = add_activity(graph, identity, itinerary_id, group_id, activity, outcome).await {
            created.activities.push(added);
        }
    }
    Some(created)
}

/// Creates every group of a freshly added itinerary, in order.
pub async fn create_groups<G>(
    graph: &G,
    identity: &Identity,
    itinerary_id: ItineraryId,
    groups: &[ActivityGroup],
    outcome: &mut CascadeOutcome,
) -> Vec<ActivityGroup>
where
    G: GraphRepository + ?Sized,
{
    let mut created = Vec::with_capacity(groups.len());
    for group in groups {
        if let Some(group) = create_group(graph, identity, itinerary_id, group, outcome).await {
            created.push(group);
        }
    }
    created
}

async fn add_activity<G>(
    graph: &G,
    identity: &Identity,
    itinerary_id: ItineraryId,
    group_id: ActivityGroupId,
    activity: &Activity,
    outcome: &mut CascadeOutcome,
) -> Option<Activity>
where
    G: GraphRepository + ?Sized,
{
    let result = graph
        .add_activity(identity, itinerary_id, group_id, activity)
        .await;
    outcome
        .settle(SubOperation::AddActivity, activity_label(activity), result)
        .map(|id: ActivityId| Activity {
            id: Some(id),
            ..activity.clone()
        })
}

// --- Diff ---

/// Applies the difference between the mirrored itinerary and its replacement.
///
/// All creates and updates run before any group that disappeared is deleted.
/// Within a deleted group the activities go first, and the group delete is
/// skipped when any of them failed.
pub async fn apply_diff<G>(
    graph: &G,
    identity: &Identity,
    itinerary_id: ItineraryId,
    old: &Itinerary,
    new: &Itinerary,
) -> CascadeOutcome
where
    G: GraphRepository + ?Sized,
{
    let mut outcome = CascadeOutcome::new();

    for group in &new.activity_groups {
        let previous = group.id.and_then(|id| find_by_id(&old.activity_groups, id));
        match (group.id, previous) {
            (Some(group_id), Some(previous)) => {
                update_group(graph, identity, itinerary_id, group_id, previous, group, &mut outcome)
                    .await;
            }
            _ => {
                create_group(graph, identity, itinerary_id, group, &mut outcome).await;
            }
        }
    }

    for group in &old.activity_groups {
        let Some(group_id) = group.id else {
            continue;
        };
        match find_by_id(&new.activity_groups, group_id) {
            None => {
                delete_group(graph, identity, itinerary_id, group, &mut outcome).await;
            }
            Some(kept) => {
                for activity in &group.activities {
                    let Some(activity_id) = activity.id else {
                        continue;
                    };
                    if find_by_id(&kept.activities, activity_id).is_none() {
                        let result = graph
                            .delete_activity(identity, itinerary_id, group_id, activity_id)
                            .await;
                        outcome.settle(SubOperation::DeleteActivity, activity_label(activity), result);
                    }
                }
            }
        }
    }

    outcome
}

async fn update_group<G>(
    graph: &G,
    identity: &Identity,
    itinerary_id: ItineraryId,
    group_id: ActivityGroupId,
    previous: &ActivityGroup,
    group: &ActivityGroup,
    outcome: &mut CascadeOutcome,
) where
    G: GraphRepository + ?Sized,
{
    for activity in &group.activities {
        let existing = activity
            .id
            .and_then(|id| find_by_id(&previous.activities, id));
        if existing.is_some() {
            let result = graph.edit_activity(identity, activity).await;
            outcome.settle(SubOperation::EditActivity, activity_label(activity), result);
        } else {
            add_activity(graph, identity, itinerary_id, group_id, activity, outcome).await;
        }
    }

    let result = graph.edit_activity_group(identity, group).await;
    outcome.settle(SubOperation::EditGroup, group_label(group), result);
}

// --- Delete ---

/// Deletes a group's activities and then the group. Returns whether the group
/// itself is gone.
pub async fn delete_group<G>(
    graph: &G,
    identity: &Identity,
    itinerary_id: ItineraryId,
    group: &ActivityGroup,
    outcome: &mut CascadeOutcome,
) -> bool
where
    G: GraphRepository + ?Sized,
{
    let Some(group_id) = group.id else {
        return true;
    };

    let mut children_ok = true;
    for activity in &group.activities {
        let Some(activity_id) = activity.id else {
            continue;
        };
        let result = graph
            .delete_activity(identity, itinerary_id, group_id, activity_id)
            .await;
        children_ok &= outcome
            .settle(SubOperation::DeleteActivity, activity_label(activity), result)
            .is_some();
    }

    if !children_ok {
        outcome.record(SubOperation::DeleteGroup, group_label(group), SKIPPED_CHILDREN);
        return false;
    }

    let result = graph
        .delete_activity_group(identity, itinerary_id, group_id)
        .await;
    outcome
        .settle(SubOperation::DeleteGroup, group_label(group), result)
        .is_some()
}

/// Activities, then groups, then the itinerary itself.
pub async fn delete_itinerary<G>(
    graph: &G,
    identity: &Identity,
    itinerary: &Itinerary,
) -> CascadeOutcome
where
    G: GraphRepository + ?Sized,
{
    let mut outcome = CascadeOutcome::new();
    let Some(itinerary_id) = itinerary.id else {
        return outcome;
    };

    let mut children_ok = true;
    for group in &itinerary.activity_groups {
        children_ok &= delete_group(graph, identity, itinerary_id, group, &mut outcome).await;
    }

    let target = format!("itinerary {itinerary_id}");
    if !children_ok {
        outcome.record(SubOperation::DeleteItinerary, target, SKIPPED_CHILDREN);
        return outcome;
    }

    let result = graph.delete_itinerary(identity, itinerary_id).await;
    outcome.settle(SubOperation::DeleteItinerary, target, result);
    outcome
}

// --- Share ---

/// Shares (or unshares) every itinerary with every username.
pub async fn share_all<G>(
    graph: &G,
    identity: &Identity,
    itinerary_ids: &[ItineraryId],
    usernames: &[String],
    share: bool,
) -> CascadeOutcome
where
    G: GraphRepository + ?Sized,
{
    let kind = if share {
        SubOperation::Share
    } else {
        SubOperation::Unshare
    };

    let mut outcome = CascadeOutcome::new();
    for &itinerary_id in itinerary_ids {
        for username in usernames {
            let result = if share {
                graph.share_itinerary(identity, itinerary_id, username).await
            } else {
                graph.unshare_itinerary(identity, itinerary_id, username).await
            };
            outcome.settle(kind, format!("itinerary {itinerary_id} / {username}"), result);
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::GraphError;
    use crate::memory_graph::InMemoryGraph;

    fn alice() -> Identity {
        Identity::new("alice", "tenant", "app")
    }

    fn activity(title: &str) -> Activity {
        Activity {
            title: title.into(),
            ..Activity::default()
        }
    }

    fn group(title: &str, activities: Vec<Activity>) -> ActivityGroup {
        ActivityGroup {
            title: title.into(),
            activities,
            ..ActivityGroup::default()
        }
    }

    /// Adds an itinerary with its groups and returns the mirrored form.
    async fn seeded(graph: &InMemoryGraph, groups: Vec<ActivityGroup>) -> Itinerary {
        let id = graph.add_itinerary(&alice(), &Itinerary::default()).await.unwrap();
        let mut outcome = CascadeOutcome::new();
        let activity_groups = create_groups(graph, &alice(), id, &groups, &mut outcome).await;
        assert!(outcome.is_success());
        Itinerary {
            id: Some(id),
            editable: true,
            activity_groups,
            ..Itinerary::default()
        }
    }

    #[tokio::test]
    async fn removed_group_and_new_group_issue_exact_calls() {
        let graph = InMemoryGraph::new();
        let old = seeded(
            &graph,
            vec![
                group("G1", vec![activity("keep")]),
                group("G2", vec![activity("a"), activity("b")]),
            ],
        )
        .await;
        let id = old.id.unwrap();

        let mut new = old.clone();
        new.activity_groups.retain(|g| g.title != "G2");
        new.activity_groups.push(group("G3", vec![activity("c")]));

        graph.reset_calls();
        let outcome = apply_diff(&graph, &alice(), id, &old, &new).await;

        assert!(outcome.is_success());
        assert_eq!(graph.call_count("delete_activity"), 2);
        assert_eq!(graph.call_count("delete_activity_group"), 1);
        assert_eq!(graph.call_count("add_activity_group"), 1);
        assert_eq!(graph.call_count("add_activity"), 1);

        let groups = graph.list_activity_groups(&alice(), id).await.unwrap();
        let titles: Vec<_> = groups.iter().map(|g| g.title.as_str()).collect();
        assert_eq!(titles, vec!["G1", "G3"]);
    }

    #[tokio::test]
    async fn failed_group_create_skips_its_activities() {
        let graph = InMemoryGraph::new();
        let old = seeded(&graph, vec![]).await;
        let mut new = old.clone();
        new.activity_groups.push(group("G3", vec![activity("x"), activity("y")]));

        graph.fail_operation(
            "add_activity_group",
            GraphError::rejected("add_activity_group", "nope"),
        );
        graph.reset_calls();
        let outcome = apply_diff(&graph, &alice(), old.id.unwrap(), &old, &new).await;

        assert_eq!(outcome.failure_count(), 3);
        assert!(outcome.has_kind(SubOperation::AddGroup));
        assert_eq!(graph.call_count("add_activity"), 0);
    }

    #[tokio::test]
    async fn matched_group_edits_adds_and_removes_activities() {
        let graph = InMemoryGraph::new();
        let old = seeded(&graph, vec![group("G1", vec![activity("a"), activity("b")])]).await;
        let id = old.id.unwrap();

        let mut new = old.clone();
        let g = &mut new.activity_groups[0];
        g.title = "Renamed".into();
        g.activities[0].title = "a2".into();
        g.activities.remove(1);
        g.activities.push(activity("c"));

        graph.reset_calls();
        let outcome = apply_diff(&graph, &alice(), id, &old, &new).await;
        assert!(outcome.is_success());
        assert_eq!(graph.call_count("edit_activity"), 1);
        assert_eq!(graph.call_count("add_activity"), 1);
        assert_eq!(graph.call_count("delete_activity"), 1);
        assert_eq!(graph.call_count("edit_activity_group"), 1);

        let group_id = new.activity_groups[0].id.unwrap();
        let titles: Vec<_> = graph
            .list_activities(&alice(), id, group_id)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.title)
            .collect();
        assert_eq!(titles, vec!["a2", "c"]);
    }

    #[tokio::test]
    async fn failures_do_not_stop_siblings() {
        let graph = InMemoryGraph::new();
        let old = seeded(
            &graph,
            vec![group("G1", vec![activity("a")]), group("G2", vec![activity("b")])],
        )
        .await;

        graph.fail_operation("delete_activity", GraphError::Unavailable("reset".into()));
        graph.reset_calls();
        let outcome = delete_itinerary(&graph, &alice(), &old).await;

        // Both activity deletes attempted; no group or itinerary delete issued.
        assert_eq!(graph.call_count("delete_activity"), 2);
        assert_eq!(graph.call_count("delete_activity_group"), 0);
        assert_eq!(graph.call_count("delete_itinerary"), 0);
        assert!(outcome.has_kind(SubOperation::DeleteItinerary));
        assert_eq!(outcome.failure_count(), 5);
    }

    #[tokio::test]
    async fn delete_cascade_removes_everything() {
        let graph = InMemoryGraph::new();
        let old = seeded(&graph, vec![group("G1", vec![activity("a"), activity("b")])]).await;
        let outcome = delete_itinerary(&graph, &alice(), &old).await;
        assert!(outcome.is_success());
        assert!(graph.list_itineraries(&alice()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn share_covers_cross_product() {
        let graph = InMemoryGraph::new();
        let a = seeded(&graph, vec![]).await.id.unwrap();
        let b = seeded(&graph, vec![]).await.id.unwrap();
        let users = vec!["bob".to_string(), "carol".to_string()];

        graph.reset_calls();
        let outcome = share_all(&graph, &alice(), &[a, b], &users, true).await;
        assert!(outcome.is_success());
        assert_eq!(graph.call_count("share_itinerary"), 4);

        let outcome = share_all(&graph, &alice(), &[a], &["dave".to_string()], false).await;
        assert_eq!(outcome.failure_count(), 1);
        assert!(outcome.has_kind(SubOperation::Unshare));
    }
}
