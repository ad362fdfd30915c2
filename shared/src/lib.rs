// lib.rs - user-state reconciliation and viewport filtering

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod capabilities;
pub mod command;
pub mod config;
pub mod geo;
pub mod ids;
pub mod import;
pub mod itinerary_diff;
pub mod mapping;
#[cfg(any(test, feature = "test-util"))]
pub mod memory_graph;
pub mod model;
pub mod reconciler;
pub mod session;
pub mod state_store;

pub use capabilities::{
    AssetError, AssetPath, AssetStore, BroadcastNotifier, FsAssetStore, GraphError,
    GraphRepository, GraphResult, KeyError, MemoryAssetStore, NotificationChannel, SessionGroup,
    SessionKey,
};
pub use command::{Command, CommandOutcome};
pub use config::{AccoladeField, AccoladeFieldMap, ConfigError, ReconcilerConfig, StoreConfig};
pub use import::{CuratedLocationRecord, ImportReport, SkipReason, SkippedRecord};
pub use itinerary_diff::{CascadeOutcome, FailedOp, SubOperation};
#[cfg(any(test, feature = "test-util"))]
pub use memory_graph::InMemoryGraph;
pub use model::{
    Accolade, Activity, ActivityGroup, Album, BoundingBox, Identity, Itinerary, Layer, Location,
    Map, Photo, TopList, UnixTimeMs, UserState,
};
pub use reconciler::{PhotoUpload, ReconcileError, ReconcileResult, StateReconciler};
pub use session::{SessionError, SessionHub};
pub use state_store::{MemoryStateStore, StateStore, StoreError};

#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub use state_store::SqliteStateStore;

/// Earth radius used for great-circle distances between viewport points.
pub const GREAT_CIRCLE_RADIUS_M: f64 = 6_376_500.0;
pub const METERS_PER_MILE: f64 = 1609.344;
pub const DEFAULT_USER_LAYER_TITLE: &str = "User";
pub const DEFAULT_ASSET_ROOT: &str = "admin";
pub const MAX_IMPORT_RECORDS: usize = 5_000;
pub const MAX_SHARE_TARGETS: usize = 256;
pub const MAX_STATE_BYTES: usize = 16 * 1024 * 1024;
pub const MAX_ASSET_BYTES: usize = 10 * 1024 * 1024;
