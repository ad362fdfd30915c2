use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use super::{reject, settle, Operation, ReconcileResult, StateReconciler};
use crate::capabilities::{AssetPath, AssetStore, GraphRepository};
use crate::ids::{AlbumId, PhotoId};
use crate::itinerary_diff::{CascadeOutcome, SubOperation};
use crate::model::{find_by_id, remove_by_id, replace_by_id, upsert_by_id, Album, Identity, Photo, UserState};

/// Raw image bytes for a photo. Only the stored URL survives into the mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoUpload {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl PhotoUpload {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes,
        }
    }
}

fn photo_label(photo: &Photo) -> String {
    match photo.id {
        Some(id) => format!("photo {id}"),
        None => format!("photo '{}'", photo.caption),
    }
}

impl<G, A> StateReconciler<G, A>
where
    G: GraphRepository + ?Sized,
    A: AssetStore + ?Sized,
{
    /// Stores the upload (if any), then records the photo in the graph.
    async fn put_photo(
        &self,
        identity: &Identity,
        mut photo: Photo,
        upload: Option<PhotoUpload>,
        album_id: AlbumId,
    ) -> ReconcileResult<Photo> {
        if let Some(upload) = upload {
            let path =
                AssetPath::album_photo(&self.config.asset_root, identity, album_id, &upload.file_name)?;
            let url = self.assets.store(identity, &path, upload.bytes).await?;
            photo.url = Some(url);
        }

        let photo_id = self
            .graph
            .add_photo(identity, &photo, album_id, photo.location_id)
            .await?;
        photo.id = Some(photo_id);
        Ok(photo)
    }

    /// Adds an album and then each of its photos in order. `uploads` is keyed
    /// by the photo's index in `album.photos`.
    #[instrument(skip_all, fields(user = %identity.username, title = %album.title, photos = album.photos.len()))]
    pub async fn add_album(
        &self,
        state: &mut UserState,
        identity: &Identity,
        mut album: Album,
        mut uploads: BTreeMap<usize, PhotoUpload>,
    ) -> ReconcileResult<CascadeOutcome> {
        let mut state = Operation::begin(state);
        let mut outcome = CascadeOutcome::new();

        let result = self.graph.add_album(identity, &album).await;
        let Some(album_id) = settle(&mut state, result, "Error adding album.")? else {
            return Ok(outcome);
        };

        let photos = std::mem::take(&mut album.photos);
        for (index, photo) in photos.into_iter().enumerate() {
            let label = photo_label(&photo);
            match self
                .put_photo(identity, photo, uploads.remove(&index), album_id)
                .await
            {
                Ok(added) => album.photos.push(added),
                Err(err) => outcome.record(SubOperation::AddPhoto, label, err.to_string()),
            }
        }
        if !uploads.is_empty() {
            warn!(unmatched = uploads.len(), "uploads without a matching photo were dropped");
        }

        album.id = Some(album_id);
        upsert_by_id(&mut state.albums, album);

        if outcome.is_success() {
            info!(%album_id, "album added");
        } else {
            state.fail("Error adding some album photos.");
        }
        Ok(outcome)
    }

    /// Renames an album. Photos are managed through the photo operations.
    #[instrument(skip_all, fields(user = %identity.username, album_id = ?album.id))]
    pub async fn edit_album(
        &self,
        state: &mut UserState,
        identity: &Identity,
        album: Album,
    ) -> ReconcileResult<()> {
        let mut state = Operation::begin(state);

        let Some(album_id) = album.id.filter(|&id| find_by_id(&state.albums, id).is_some()) else {
            reject(&mut state, "Album not found.");
            return Ok(());
        };

        let result = self.graph.edit_album(identity, &album).await;
        if settle(&mut state, result, "Error editing album.")?.is_none() {
            return Ok(());
        }

        if let Some(stored) = state.albums.iter_mut().find(|a| a.id == Some(album_id)) {
            stored.title = album.title;
        }
        info!("album edited");
        Ok(())
    }

    #[instrument(skip_all, fields(user = %identity.username, %album_id))]
    pub async fn delete_album(
        &self,
        state: &mut UserState,
        identity: &Identity,
        album_id: AlbumId,
    ) -> ReconcileResult<()> {
        let mut state = Operation::begin(state);

        let result = self.graph.delete_album(identity, album_id).await;
        if settle(&mut state, result, "Error deleting album.")?.is_none() {
            return Ok(());
        }

        remove_by_id(&mut state.albums, album_id);
        info!("album deleted");
        Ok(())
    }

    #[instrument(skip_all, fields(user = %identity.username, %album_id, upload = upload.is_some()))]
    pub async fn add_photo(
        &self,
        state: &mut UserState,
        identity: &Identity,
        photo: Photo,
        upload: Option<PhotoUpload>,
        album_id: AlbumId,
    ) -> ReconcileResult<()> {
        let mut state = Operation::begin(state);

        if find_by_id(&state.albums, album_id).is_none() {
            reject(&mut state, "Album not found.");
            return Ok(());
        }

        let added = match self.put_photo(identity, photo, upload, album_id).await {
            Ok(added) => added,
            Err(err) if err.is_rejection() => {
                warn!(error = %err, "photo not added");
                state.fail("Error adding photo.");
                return Ok(());
            }
            Err(err) => {
                error!(error = %err, "photo upload failed");
                return Err(err);
            }
        };

        let photo_id = added.id;
        if let Some(album) = state.albums.iter_mut().find(|a| a.id == Some(album_id)) {
            upsert_by_id(&mut album.photos, added);
        }
        info!(?photo_id, "photo added");
        Ok(())
    }

    #[instrument(skip_all, fields(user = %identity.username, %album_id, photo_id = ?photo.id))]
    pub async fn edit_photo(
        &self,
        state: &mut UserState,
        identity: &Identity,
        mut photo: Photo,
        album_id: AlbumId,
    ) -> ReconcileResult<()> {
        let mut state = Operation::begin(state);

        let existing = photo.id.and_then(|id| {
            find_by_id(&state.albums, album_id).and_then(|a| find_by_id(&a.photos, id))
        });
        let Some(existing_url) = existing.map(|p| p.url.clone()) else {
            reject(&mut state, "Photo not found.");
            return Ok(());
        };

        let result = self.graph.edit_photo(identity, &photo, album_id).await;
        if settle(&mut state, result, "Error editing photo.")?.is_none() {
            return Ok(());
        }

        if photo.url.is_none() {
            photo.url = existing_url;
        }
        if let Some(album) = state.albums.iter_mut().find(|a| a.id == Some(album_id)) {
            replace_by_id(&mut album.photos, photo);
        }
        info!("photo edited");
        Ok(())
    }

    #[instrument(skip_all, fields(user = %identity.username, %photo_id))]
    pub async fn delete_photo(
        &self,
        state: &mut UserState,
        identity: &Identity,
        photo_id: PhotoId,
    ) -> ReconcileResult<()> {
        let mut state = Operation::begin(state);

        let result = self.graph.delete_photo(identity, photo_id).await;
        if settle(&mut state, result, "Error deleting photo.")?.is_none() {
            return Ok(());
        }

        for album in &mut state.albums {
            remove_by_id(&mut album.photos, photo_id);
        }
        info!("photo deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{alice, reconciler, TestReconciler};
    use super::super::ReconcileError;
    use super::*;
    use crate::capabilities::{GraphError, PNG_BYTES};

    fn photo(caption: &str) -> Photo {
        Photo {
            caption: caption.into(),
            ..Photo::default()
        }
    }

    async fn with_album(rec: &TestReconciler) -> (UserState, AlbumId) {
        let mut state = UserState::new();
        let album = Album {
            title: "Lisbon".into(),
            ..Album::default()
        };
        rec.add_album(&mut state, &alice(), album, BTreeMap::new())
            .await
            .unwrap();
        let id = state.albums[0].id.unwrap();
        (state, id)
    }

    #[tokio::test]
    async fn album_photos_are_matched_to_uploads_by_index() {
        let (_, assets, rec) = reconciler();
        let mut state = UserState::new();
        let album = Album {
            title: "Porto".into(),
            photos: vec![photo("bridge"), photo("tiles"), photo("river")],
            ..Album::default()
        };
        let uploads = BTreeMap::from([
            (0, PhotoUpload::new("bridge.png", PNG_BYTES.to_vec())),
            (1, PhotoUpload::new("tiles.txt", b"not an image".to_vec())),
        ]);

        let outcome = rec
            .add_album(&mut state, &alice(), album, uploads)
            .await
            .unwrap();

        assert_eq!(outcome.failure_count(), 1);
        assert!(outcome.has_kind(SubOperation::AddPhoto));
        assert_eq!(state.error.as_deref(), Some("Error adding some album photos."));

        let album = &state.albums[0];
        let album_id = album.id.unwrap();
        let captions: Vec<_> = album.photos.iter().map(|p| p.caption.as_str()).collect();
        assert_eq!(captions, vec!["bridge", "river"]);
        assert_eq!(
            album.photos[0].url.as_deref(),
            Some(format!("/admin/alice/albums/{album_id}/bridge.png").as_str())
        );
        assert!(album.photos[1].url.is_none());
        assert_eq!(assets.len().await, 1);
    }

    #[tokio::test]
    async fn rejected_upload_skips_graph_call() {
        let (graph, _, rec) = reconciler();
        let (mut state, album_id) = with_album(&rec).await;

        rec.add_photo(
            &mut state,
            &alice(),
            photo("nope"),
            Some(PhotoUpload::new("nope.gif", b"GIF89a".to_vec())),
            album_id,
        )
        .await
        .unwrap();

        assert_eq!(state.error.as_deref(), Some("Error adding photo."));
        assert_eq!(graph.call_count("add_photo"), 0);
        assert!(state.albums[0].photos.is_empty());
    }

    #[tokio::test]
    async fn unsafe_file_name_is_rejected() {
        let (_, assets, rec) = reconciler();
        let (mut state, album_id) = with_album(&rec).await;

        rec.add_photo(
            &mut state,
            &alice(),
            photo("escape"),
            Some(PhotoUpload::new("..", PNG_BYTES.to_vec())),
            album_id,
        )
        .await
        .unwrap();

        assert!(state.has_error());
        assert!(assets.is_empty().await);
    }

    #[tokio::test]
    async fn graph_outage_propagates_after_upload() {
        let (graph, _, rec) = reconciler();
        let (mut state, album_id) = with_album(&rec).await;
        graph.fail_operation("add_photo", GraphError::Unavailable("down".into()));

        let err = rec
            .add_photo(
                &mut state,
                &alice(),
                photo("beach"),
                Some(PhotoUpload::new("beach.png", PNG_BYTES.to_vec())),
                album_id,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::Graph(GraphError::Unavailable(_))));
        assert!(state.albums[0].photos.is_empty());
        assert!(!state.loading);
    }

    #[tokio::test]
    async fn photo_edit_keeps_url_and_delete_removes() {
        let (_, _, rec) = reconciler();
        let (mut state, album_id) = with_album(&rec).await;
        rec.add_photo(
            &mut state,
            &alice(),
            photo("sunset"),
            Some(PhotoUpload::new("sunset.png", PNG_BYTES.to_vec())),
            album_id,
        )
        .await
        .unwrap();

        let mut edited = state.albums[0].photos[0].clone();
        let url = edited.url.take();
        edited.caption = "golden hour".into();
        rec.edit_photo(&mut state, &alice(), edited, album_id)
            .await
            .unwrap();

        let stored = &state.albums[0].photos[0];
        assert_eq!(stored.caption, "golden hour");
        assert_eq!(stored.url, url);

        let photo_id = stored.id.unwrap();
        rec.delete_photo(&mut state, &alice(), photo_id).await.unwrap();
        assert!(state.albums[0].photos.is_empty());
    }

    #[tokio::test]
    async fn album_rename_and_delete() {
        let (graph, _, rec) = reconciler();
        let (mut state, album_id) = with_album(&rec).await;

        let renamed = Album {
            id: Some(album_id),
            title: "Lisboa".into(),
            ..Album::default()
        };
        rec.edit_album(&mut state, &alice(), renamed).await.unwrap();
        assert_eq!(state.albums[0].title, "Lisboa");

        rec.edit_album(&mut state, &alice(), Album::default())
            .await
            .unwrap();
        assert_eq!(state.error.as_deref(), Some("Album not found."));
        assert_eq!(graph.call_count("edit_album"), 1);

        rec.delete_album(&mut state, &alice(), album_id).await.unwrap();
        assert!(state.albums.is_empty());
        assert!(state.error.is_none());
    }
}
