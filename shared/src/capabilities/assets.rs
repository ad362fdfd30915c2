use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use image::ImageFormat;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use super::kv::{validate_key, KeyError};
use crate::ids::AlbumId;
use crate::model::Identity;
use crate::MAX_ASSET_BYTES;

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("invalid asset path: {0}")]
    InvalidPath(#[from] KeyError),

    #[error("asset too large: {size} bytes, max {max}")]
    TooLarge { size: usize, max: usize },

    #[error("unsupported image format")]
    UnsupportedFormat,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("asset write task failed: {0}")]
    Task(String),
}

impl AssetError {
    /// The upload itself was unacceptable, as opposed to the store failing.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::InvalidPath(_) | Self::TooLarge { .. } | Self::UnsupportedFormat
        )
    }
}

/// Slash-separated location of an uploaded asset, e.g.
/// `admin/alice/albums/<album>/beach.jpg`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssetPath {
    segments: Vec<String>,
}

impl AssetPath {
    pub fn new<I, S>(segments: I) -> Result<Self, AssetError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(KeyError::InvalidKey {
                key: String::new(),
                reason: "asset path has no segments".into(),
            }
            .into());
        }
        for segment in &segments {
            validate_key(segment)?;
            if segment.contains('/') || segment.contains('\\') {
                return Err(KeyError::InvalidKey {
                    key: segment.clone(),
                    reason: "segment cannot contain path separators".into(),
                }
                .into());
            }
        }
        Ok(Self { segments })
    }

    /// Where album photos for a user live.
    pub fn album_photo(
        root: &str,
        identity: &Identity,
        album_id: AlbumId,
        file_name: &str,
    ) -> Result<Self, AssetError> {
        Self::new([
            root.to_string(),
            identity.username.clone(),
            "albums".to_string(),
            album_id.to_string(),
            file_name.to_string(),
        ])
    }

    pub fn as_relative(&self) -> String {
        self.segments.join("/")
    }

    /// Root-relative URL the asset is served from.
    pub fn url(&self) -> String {
        format!("/{}", self.as_relative())
    }

    fn to_fs_path(&self, root: &Path) -> PathBuf {
        self.segments.iter().fold(root.to_path_buf(), |p, s| p.join(s))
    }
}

/// Accepts PNG, JPEG and WebP uploads up to the size cap.
pub fn check_image(bytes: &[u8]) -> Result<ImageFormat, AssetError> {
    if bytes.len() > MAX_ASSET_BYTES {
        return Err(AssetError::TooLarge {
            size: bytes.len(),
            max: MAX_ASSET_BYTES,
        });
    }
    match image::guess_format(bytes) {
        Ok(format @ (ImageFormat::Png | ImageFormat::Jpeg | ImageFormat::WebP)) => Ok(format),
        _ => Err(AssetError::UnsupportedFormat),
    }
}

#[async_trait::async_trait]
pub trait AssetStore: Send + Sync {
    /// Stores the bytes and returns the URL they are reachable at.
    async fn store(
        &self,
        identity: &Identity,
        path: &AssetPath,
        bytes: Vec<u8>,
    ) -> Result<String, AssetError>;
}

/// Writes assets under a root directory with tmp-then-rename.
#[derive(Debug, Clone)]
pub struct FsAssetStore {
    root: PathBuf,
}

impl FsAssetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), AssetError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp_path = path.with_extension("tmp");
        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;

        std::fs::rename(&tmp_path, path)?;

        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl AssetStore for FsAssetStore {
    #[instrument(skip(self, identity, bytes), fields(user = %identity.username, path = %path.as_relative(), size = bytes.len()))]
    async fn store(
        &self,
        identity: &Identity,
        path: &AssetPath,
        bytes: Vec<u8>,
    ) -> Result<String, AssetError> {
        if let Err(e) = check_image(&bytes) {
            warn!(error = %e, "rejected asset upload");
            return Err(e);
        }

        let target = path.to_fs_path(&self.root);
        tokio::task::spawn_blocking(move || Self::write_atomic(&target, &bytes))
            .await
            .map_err(|e| AssetError::Task(e.to_string()))??;

        info!("asset stored");
        Ok(path.url())
    }
}

/// Keeps assets in memory; useful for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryAssetStore {
    assets: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, path: &AssetPath) -> Option<Vec<u8>> {
        self.assets.read().await.get(&path.as_relative()).cloned()
    }

    pub async fn len(&self) -> usize {
        self.assets.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.assets.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl AssetStore for MemoryAssetStore {
    async fn store(
        &self,
        _identity: &Identity,
        path: &AssetPath,
        bytes: Vec<u8>,
    ) -> Result<String, AssetError> {
        check_image(&bytes)?;
        self.assets.write().await.insert(path.as_relative(), bytes);
        Ok(path.url())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::tempdir;

    /// Smallest byte prefix `image::guess_format` recognises as PNG.
    pub(crate) const PNG_BYTES: &[u8] = &[0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n', 0, 0];

    fn identity() -> Identity {
        Identity::new("alice", "tenant", "app")
    }

    #[test]
    fn album_photo_path_and_url() {
        let album = AlbumId::generate();
        let path = AssetPath::album_photo("admin", &identity(), album, "beach.png").unwrap();
        assert_eq!(path.url(), format!("/admin/alice/albums/{album}/beach.png"));
    }

    #[test]
    fn path_rejects_traversal_and_separators() {
        assert!(AssetPath::new(["admin", ".."]).is_err());
        assert!(AssetPath::new(["admin", "a/b"]).is_err());
        assert!(AssetPath::new(Vec::<String>::new()).is_err());
    }

    #[test]
    fn check_image_rejects_text() {
        assert!(matches!(check_image(b"hello"), Err(AssetError::UnsupportedFormat)));
        assert!(check_image(PNG_BYTES).is_ok());
    }

    #[tokio::test]
    async fn fs_store_writes_file() {
        let dir = tempdir().unwrap();
        let store = FsAssetStore::new(dir.path());
        let path = AssetPath::new(["admin", "alice", "albums", "a1", "p.png"]).unwrap();

        let url = store.store(&identity(), &path, PNG_BYTES.to_vec()).await.unwrap();

        assert_eq!(url, "/admin/alice/albums/a1/p.png");
        let written = std::fs::read(dir.path().join("admin/alice/albums/a1/p.png")).unwrap();
        assert_eq!(written, PNG_BYTES);
        assert!(!dir.path().join("admin/alice/albums/a1/p.tmp").exists());
    }

    #[tokio::test]
    async fn memory_store_keeps_bytes() {
        let store = MemoryAssetStore::new();
        let path = AssetPath::new(["admin", "x.png"]).unwrap();
        store.store(&identity(), &path, PNG_BYTES.to_vec()).await.unwrap();
        assert_eq!(store.get(&path).await.as_deref(), Some(PNG_BYTES));
        assert!(store.store(&identity(), &path, b"nope".to_vec()).await.is_err());
    }
}
