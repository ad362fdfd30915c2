//! Persistence of session mirrors between requests.
//!
//! A state document is written as a CBOR envelope: magic bytes, a schema
//! version, a blake3 checksum of the payload and the payload itself (the
//! CBOR-encoded `UserState`). Readers reject anything whose magic, version or
//! checksum does not line up before deserializing the payload.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, instrument};

use crate::capabilities::SessionKey;
use crate::config::{ConfigError, StoreConfig};
use crate::model::UserState;

const CURRENT_SCHEMA_VERSION: u32 = 1;
const STORE_MAGIC: &[u8; 4] = b"WMST";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("corrupted state: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("unknown schema version: {0}")]
    UnknownSchema(u32),

    #[error("state too large: {size} bytes, max {max}")]
    StateTooLarge { size: usize, max: usize },

    #[error("database error: {0}")]
    Database(String),

    #[error("blocking task failed: {0}")]
    Task(String),

    #[error("lock acquisition failed")]
    LockFailed,
}

impl From<ciborium::de::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct StateEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    payload: Vec<u8>,
}

// --- Envelope codec ---

/// Encodes a mirror into its on-disk form, refusing documents over `max_bytes`.
pub fn encode_state(state: &UserState, max_bytes: usize) -> Result<Vec<u8>, StoreError> {
    let mut payload = Vec::new();
    ciborium::into_writer(state, &mut payload)?;

    let checksum = blake3::hash(&payload);
    let envelope = StateEnvelope {
        magic: *STORE_MAGIC,
        schema_version: CURRENT_SCHEMA_VERSION,
        checksum: *checksum.as_bytes(),
        payload,
    };

    let mut bytes = Vec::new();
    ciborium::into_writer(&envelope, &mut bytes)?;
    if bytes.len() > max_bytes {
        return Err(StoreError::StateTooLarge {
            size: bytes.len(),
            max: max_bytes,
        });
    }
    Ok(bytes)
}

/// Verifies and decodes an envelope written by [`encode_state`].
pub fn decode_state(bytes: &[u8], max_bytes: usize) -> Result<UserState, StoreError> {
    if bytes.is_empty() {
        return Err(StoreError::Corrupted {
            reason: "empty document",
        });
    }
    if bytes.len() > max_bytes {
        return Err(StoreError::StateTooLarge {
            size: bytes.len(),
            max: max_bytes,
        });
    }

    let envelope: StateEnvelope = ciborium::from_reader(bytes)?;

    if envelope.magic != *STORE_MAGIC {
        return Err(StoreError::Corrupted {
            reason: "invalid magic bytes",
        });
    }

    if envelope.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::FutureSchema {
            found: envelope.schema_version,
            max: CURRENT_SCHEMA_VERSION,
        });
    }

    let actual = blake3::hash(&envelope.payload);
    if actual.as_bytes() != &envelope.checksum {
        let err = StoreError::IntegrityCheckFailed {
            expected: hex::encode(envelope.checksum),
            actual: hex::encode(actual.as_bytes()),
        };
        error!(error = %err, "state document failed integrity check");
        return Err(err);
    }

    if envelope.schema_version < CURRENT_SCHEMA_VERSION {
        return migrate(envelope.schema_version, &envelope.payload);
    }
    Ok(ciborium::from_reader(&envelope.payload[..])?)
}

fn migrate(from_version: u32, payload: &[u8]) -> Result<UserState, StoreError> {
    match from_version {
        // v0 documents predate the envelope version bump but share its shape;
        // missing collections fill from `#[serde(default)]`.
        0 => Ok(ciborium::from_reader(payload)?),
        _ => Err(StoreError::UnknownSchema(from_version)),
    }
}

// ============================================================================
// Storage Trait
// ============================================================================

#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, key: &SessionKey) -> Result<Option<UserState>, StoreError>;
    async fn save(&self, key: &SessionKey, state: &UserState) -> Result<(), StoreError>;
}

/// Keeps encoded envelopes in memory, so documents go through the same codec
/// as the on-disk store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    config: StoreConfig,
    documents: RwLock<HashMap<SessionKey, Vec<u8>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        Ok(Self {
            config,
            documents: RwLock::default(),
        })
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, key: &SessionKey) -> Result<Option<UserState>, StoreError> {
        let documents = self.documents.read().await;
        documents
            .get(key)
            .map(|bytes| decode_state(bytes, self.config.max_state_bytes))
            .transpose()
    }

    async fn save(&self, key: &SessionKey, state: &UserState) -> Result<(), StoreError> {
        let bytes = encode_state(state, self.config.max_state_bytes)?;
        self.documents.write().await.insert(key.clone(), bytes);
        Ok(())
    }
}

// ============================================================================
// SQLite Implementation
// ============================================================================

#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
mod sqlite {
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use rusqlite::{params, Connection, OptionalExtension};
    use tracing::{debug, info, instrument};

    use super::{decode_state, encode_state, StateStore, StoreError};
    use crate::capabilities::SessionKey;
    use crate::config::StoreConfig;
    use crate::model::{UnixTimeMs, UserState};

    impl From<rusqlite::Error> for StoreError {
        fn from(e: rusqlite::Error) -> Self {
            StoreError::Database(e.to_string())
        }
    }

    /// One row per session key. Blocking SQLite calls run on the blocking pool.
    #[derive(Debug, Clone)]
    pub struct SqliteStateStore {
        conn: Arc<Mutex<Connection>>,
        config: StoreConfig,
    }

    impl SqliteStateStore {
        pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self, StoreError> {
            Self::init(Connection::open(path)?, config)
        }

        pub fn open_in_memory(config: StoreConfig) -> Result<Self, StoreError> {
            Self::init(Connection::open_in_memory()?, config)
        }

        fn init(conn: Connection, config: StoreConfig) -> Result<Self, StoreError> {
            config.validate()?;
            conn.execute_batch(
                r#"
                PRAGMA journal_mode = WAL;
                CREATE TABLE IF NOT EXISTS user_states (
                    session_key TEXT PRIMARY KEY,
                    envelope BLOB NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                "#,
            )?;
            info!("state store ready");
            Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
                config,
            })
        }

        async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
        where
            T: Send + 'static,
            F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        {
            let conn = Arc::clone(&self.conn);
            tokio::task::spawn_blocking(move || {
                let guard = conn.lock().map_err(|_| StoreError::LockFailed)?;
                f(&*guard)
            })
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
        }
    }

    #[async_trait::async_trait]
    impl StateStore for SqliteStateStore {
        #[instrument(skip_all, fields(key = %key))]
        async fn load(&self, key: &SessionKey) -> Result<Option<UserState>, StoreError> {
            let raw = key.raw();
            let bytes: Option<Vec<u8>> = self
                .with_conn(move |conn| {
                    Ok(conn
                        .query_row(
                            "SELECT envelope FROM user_states WHERE session_key = ?1",
                            params![raw],
                            |row| row.get(0),
                        )
                        .optional()?)
                })
                .await?;

            debug!(found = bytes.is_some(), "state loaded");
            bytes
                .map(|b| decode_state(&b, self.config.max_state_bytes))
                .transpose()
        }

        #[instrument(skip_all, fields(key = %key))]
        async fn save(&self, key: &SessionKey, state: &UserState) -> Result<(), StoreError> {
            let bytes = encode_state(state, self.config.max_state_bytes)?;
            let size = bytes.len();
            let raw = key.raw();
            let updated_at = i64::try_from(UnixTimeMs::now().0).unwrap_or(i64::MAX);

            self.with_conn(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO user_states (session_key, envelope, updated_at)
                    VALUES (?1, ?2, ?3)
                    ON CONFLICT(session_key) DO UPDATE SET
                        envelope = excluded.envelope,
                        updated_at = excluded.updated_at
                    "#,
                    params![raw, bytes, updated_at],
                )?;
                Ok(())
            })
            .await?;

            debug!(size, "state saved");
            Ok(())
        }
    }
}

#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub use self::sqlite::SqliteStateStore;

#[instrument(skip_all)]
pub(crate) async fn load_or_new<S>(store: &S, key: &SessionKey) -> Result<UserState, StoreError>
where
    S: StateStore + ?Sized,
{
    match store.load(key).await? {
        Some(state) => Ok(state),
        None => {
            debug!(key = %key, "no stored state, starting fresh");
            Ok(UserState::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ItineraryId, LayerId, MapId};
    use crate::model::{BoundingBox, Itinerary, Location, Map};
    use crate::MAX_STATE_BYTES;

    fn populated() -> UserState {
        let mut state = UserState::new();
        let map_id = MapId::generate();
        state.maps.push(Map {
            id: Some(map_id),
            title: "Home".into(),
            primary: true,
            bounding_box: Some(BoundingBox::new(10.0, 10.0, 0.0, -10.0)),
            ..Map::default()
        });
        state.selected_map_id = Some(map_id);
        state.selected_layer_ids.insert(LayerId::generate());
        state.all_locations.push(Location {
            title: "Cafe".into(),
            latitude: 5.0,
            longitude: 5.0,
            ..Location::default()
        });
        state.itineraries.push(Itinerary {
            id: Some(ItineraryId::generate()),
            title: "Trip".into(),
            editable: true,
            ..Itinerary::default()
        });
        state.error = Some("last error".into());
        state
    }

    fn key(name: &str) -> SessionKey {
        SessionKey::new(name).unwrap()
    }

    fn reenvelope(bytes: &[u8], edit: impl FnOnce(&mut StateEnvelope)) -> Vec<u8> {
        let mut envelope: StateEnvelope = ciborium::from_reader(bytes).unwrap();
        edit(&mut envelope);
        let mut out = Vec::new();
        ciborium::into_writer(&envelope, &mut out).unwrap();
        out
    }

    #[test]
    fn envelope_roundtrip() {
        let state = populated();
        let bytes = encode_state(&state, MAX_STATE_BYTES).unwrap();
        assert_eq!(decode_state(&bytes, MAX_STATE_BYTES).unwrap(), state);
    }

    #[test]
    fn corrupted_checksum_fails() {
        let bytes = encode_state(&populated(), MAX_STATE_BYTES).unwrap();
        let tampered = reenvelope(&bytes, |e| {
            if let Some(byte) = e.payload.last_mut() {
                *byte ^= 0xFF;
            }
        });

        let result = decode_state(&tampered, MAX_STATE_BYTES);
        assert!(matches!(result, Err(StoreError::IntegrityCheckFailed { .. })));
    }

    #[test]
    fn wrong_magic_and_future_schema_rejected() {
        let bytes = encode_state(&UserState::new(), MAX_STATE_BYTES).unwrap();

        let bad_magic = reenvelope(&bytes, |e| e.magic = *b"OFST");
        assert!(matches!(
            decode_state(&bad_magic, MAX_STATE_BYTES),
            Err(StoreError::Corrupted { .. })
        ));

        let future = reenvelope(&bytes, |e| e.schema_version = CURRENT_SCHEMA_VERSION + 1);
        assert!(matches!(
            decode_state(&future, MAX_STATE_BYTES),
            Err(StoreError::FutureSchema { found: 2, max: 1 })
        ));
    }

    #[test]
    fn v0_documents_migrate() {
        let state = populated();
        let bytes = encode_state(&state, MAX_STATE_BYTES).unwrap();
        let v0 = reenvelope(&bytes, |e| e.schema_version = 0);
        assert_eq!(decode_state(&v0, MAX_STATE_BYTES).unwrap(), state);
    }

    #[test]
    fn size_limits_enforced() {
        let bytes = encode_state(&populated(), MAX_STATE_BYTES).unwrap();
        assert!(matches!(
            decode_state(&bytes, 16),
            Err(StoreError::StateTooLarge { .. })
        ));
        assert!(matches!(
            encode_state(&populated(), 16),
            Err(StoreError::StateTooLarge { .. })
        ));
        assert!(matches!(
            decode_state(&[], MAX_STATE_BYTES),
            Err(StoreError::Corrupted { .. })
        ));
    }

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryStateStore::new();
        assert!(store.load(&key("alice")).await.unwrap().is_none());

        let state = populated();
        store.save(&key("alice"), &state).await.unwrap();
        assert_eq!(store.load(&key("alice")).await.unwrap(), Some(state));
        assert_eq!(store.len().await, 1);

        let fresh = load_or_new(&store, &key("bob")).await.unwrap();
        assert_eq!(fresh, UserState::new());
    }

    #[test]
    fn invalid_store_config_rejected() {
        let config = StoreConfig { max_state_bytes: 1 };
        assert!(matches!(
            MemoryStateStore::with_config(config),
            Err(StoreError::Config(_))
        ));
    }

    #[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
    mod sqlite_tests {
        use super::*;
        use tempfile::tempdir;

        #[tokio::test]
        async fn file_roundtrip_survives_reopen() {
            let dir = tempdir().unwrap();
            let path = dir.path().join("states.db");
            let state = populated();

            {
                let store = SqliteStateStore::open(&path, StoreConfig::default()).unwrap();
                store.save(&key("alice|t1"), &state).await.unwrap();
            }

            let store = SqliteStateStore::open(&path, StoreConfig::default()).unwrap();
            assert_eq!(store.load(&key("alice|t1")).await.unwrap(), Some(state));
            assert!(store.load(&key("bob|t1")).await.unwrap().is_none());
        }

        #[tokio::test]
        async fn save_overwrites_previous_document() {
            let store = SqliteStateStore::open_in_memory(StoreConfig::default()).unwrap();
            let mut state = populated();
            store.save(&key("alice"), &state).await.unwrap();

            state.error = None;
            state.maps.clear();
            store.save(&key("alice"), &state).await.unwrap();

            assert_eq!(store.load(&key("alice")).await.unwrap(), Some(state));
        }

        #[tokio::test]
        async fn tampered_row_is_rejected() {
            let dir = tempdir().unwrap();
            let path = dir.path().join("states.db");
            let store = SqliteStateStore::open(&path, StoreConfig::default()).unwrap();
            store.save(&key("alice"), &populated()).await.unwrap();

            let conn = rusqlite::Connection::open(&path).unwrap();
            let bytes: Vec<u8> = conn
                .query_row(
                    "SELECT envelope FROM user_states WHERE session_key = ?1",
                    [key("alice").raw()],
                    |row| row.get(0),
                )
                .unwrap();
            let tampered = reenvelope(&bytes, |e| e.checksum[0] ^= 0xFF);
            conn.execute(
                "UPDATE user_states SET envelope = ?1 WHERE session_key = ?2",
                rusqlite::params![tampered, key("alice").raw()],
            )
            .unwrap();
            drop(conn);

            let result = store.load(&key("alice")).await;
            assert!(matches!(result, Err(StoreError::IntegrityCheckFailed { .. })));
        }
    }
}
