//! Seams to the outside world.
//!
//! The reconciler only talks to these traits; concrete adapters live next to
//! them so a host can wire up a working engine without extra crates.

mod assets;
mod graph;
mod kv;
mod notify;

pub use self::assets::{check_image, AssetError, AssetPath, AssetStore, FsAssetStore, MemoryAssetStore};
pub use self::graph::{
    AccoladeRecord, AlbumRecord, GraphError, GraphRepository, GraphResult, LayerRecord,
    LocationRecord, MapRecord, PhotoRecord, SharedLayerRecord, SharedMapRecord, TopListRecord,
};
pub use self::kv::{KeyError, SessionGroup, SessionKey, MAX_KEY_LENGTH};
pub use self::notify::{BroadcastNotifier, NotificationChannel, StateUpdate, DEFAULT_CHANNEL_CAPACITY};

#[cfg(test)]
pub(crate) use self::assets::tests::PNG_BYTES;
