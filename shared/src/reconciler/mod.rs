//! Server-side reconciliation of a user's mirrored state.
//!
//! Each operation issues the graph calls for one user mutation and then
//! patches the session mirror, never the other way round. A graph rejection
//! leaves the mirror as it was and records a message in `UserState::error`;
//! an unreachable graph surfaces as `Err`.

mod hydrate;
mod itineraries;
mod lists;
mod locations;
mod maps;
mod media;

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, warn};

use crate::capabilities::{AssetError, AssetStore, GraphError, GraphRepository, GraphResult};
use crate::config::{ConfigError, ReconcilerConfig};
use crate::geo::limit_geographically;
use crate::model::UserState;

pub use self::media::PhotoUpload;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("asset error: {0}")]
    Asset(#[from] AssetError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("too many {what}: {count}, max {max}")]
    LimitExceeded {
        what: &'static str,
        count: usize,
        max: usize,
    },
}

impl ReconcileError {
    /// Business rejections that callers report in the mirror rather than abort on.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        match self {
            Self::Graph(err) => err.is_rejection(),
            Self::Asset(err) => err.is_rejection(),
            Self::Config(_) | Self::LimitExceeded { .. } => false,
        }
    }
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;

pub struct StateReconciler<G: ?Sized, A: ?Sized> {
    graph: Arc<G>,
    assets: Arc<A>,
    config: ReconcilerConfig,
}

impl<G, A> StateReconciler<G, A>
where
    G: GraphRepository + ?Sized,
    A: AssetStore + ?Sized,
{
    pub fn new(graph: Arc<G>, assets: Arc<A>, config: ReconcilerConfig) -> ReconcileResult<Self> {
        config.validate()?;
        Ok(Self {
            graph,
            assets,
            config,
        })
    }

    pub fn with_default_config(graph: Arc<G>, assets: Arc<A>) -> Self {
        Self {
            graph,
            assets,
            config: ReconcilerConfig::default(),
        }
    }

    fn check_limit(what: &'static str, count: usize, max: usize) -> ReconcileResult<()> {
        if count > max {
            warn!(what, count, max, "request over limit");
            return Err(ReconcileError::LimitExceeded { what, count, max });
        }
        Ok(())
    }
}

// --- Operation bookkeeping ---

/// Marks the mirror busy for the length of one operation.
///
/// `loading` goes true and `error` is cleared on entry; `loading` goes false
/// again when the guard drops, on every exit path.
pub(crate) struct Operation<'a> {
    state: &'a mut UserState,
}

impl<'a> Operation<'a> {
    pub(crate) fn begin(state: &'a mut UserState) -> Self {
        state.loading = true;
        state.error = None;
        Self { state }
    }
}

impl Deref for Operation<'_> {
    type Target = UserState;

    fn deref(&self) -> &UserState {
        self.state
    }
}

impl DerefMut for Operation<'_> {
    fn deref_mut(&mut self) -> &mut UserState {
        self.state
    }
}

impl Drop for Operation<'_> {
    fn drop(&mut self) {
        self.state.loading = false;
    }
}

/// Splits a graph result into the two error channels: rejections become a
/// mirror message and `Ok(None)`, transport failures propagate.
pub(crate) fn settle<T>(
    state: &mut UserState,
    result: GraphResult<T>,
    message: &str,
) -> ReconcileResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err @ GraphError::Rejected { .. }) => {
            warn!(error = %err, "{message}");
            state.fail(message);
            Ok(None)
        }
        Err(err) => {
            error!(error = %err, "graph unavailable");
            Err(err.into())
        }
    }
}

/// A precondition failed before any graph call.
pub(crate) fn reject(state: &mut UserState, message: &str) {
    warn!("{message}");
    state.fail(message);
}

/// Recomputes the visible set from everything loaded and the selected map's box.
pub(crate) fn refresh_visible(state: &mut UserState) {
    let bounds = state.selected_map().and_then(|m| m.bounding_box);
    state.visible_locations = limit_geographically(&state.all_locations, bounds.as_ref());
}

/// Restores "exactly one primary, and it is selected" after maps are removed.
pub(crate) fn repair_primary(state: &mut UserState) {
    if !state.maps.iter().any(|m| m.primary) {
        let promoted = state
            .maps
            .iter()
            .position(|m| m.shared && !m.deletable)
            .or_else(|| (!state.maps.is_empty()).then_some(0));
        if let Some(idx) = promoted {
            state.maps[idx].primary = true;
        }
    }

    match state.primary_map().map(|m| (m.id, m.default_layer_id)) {
        Some((map_id, default_layer)) => {
            state.selected_map_id = map_id;
            state.selected_layer_ids = default_layer.into_iter().collect();
            refresh_visible(state);
        }
        None => {
            state.selected_map_id = None;
            state.visible_locations.clear();
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::capabilities::MemoryAssetStore;
    use crate::memory_graph::InMemoryGraph;
    use crate::model::Identity;

    pub(crate) type TestReconciler = StateReconciler<InMemoryGraph, MemoryAssetStore>;

    pub(crate) fn alice() -> Identity {
        Identity::new("alice", "tenant", "app")
    }

    pub(crate) fn reconciler() -> (Arc<InMemoryGraph>, Arc<MemoryAssetStore>, TestReconciler) {
        let graph = Arc::new(InMemoryGraph::new());
        let assets = Arc::new(MemoryAssetStore::new());
        let reconciler = StateReconciler::with_default_config(graph.clone(), assets.clone());
        (graph, assets, reconciler)
    }
}
