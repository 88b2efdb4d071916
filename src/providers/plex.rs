use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::canonical::Canonicalizer;
use crate::constants::PLEX_PROVIDER;
use crate::dispatch::{DispatchResult, ProviderHandler};
use crate::domain::{ExternalRef, IdNamespace, TrackPosition};
use crate::error::{PlaylogError, Result};

/// Media-server webhook payload, reduced to the fields the catalog needs.
#[derive(Debug, Deserialize)]
struct PlexWebhook {
    event: String,
    #[serde(rename = "Metadata")]
    metadata: Option<PlexMetadata>,
}

#[derive(Debug, Deserialize)]
struct PlexMetadata {
    #[serde(rename = "type")]
    media_type: String,
    title: String,
    /// Artist name for track items.
    #[serde(rename = "grandparentTitle")]
    grandparent_title: Option<String>,
    /// Album title for track items.
    #[serde(rename = "parentTitle")]
    parent_title: Option<String>,
    year: Option<i32>,
    #[serde(rename = "parentYear")]
    parent_year: Option<i32>,
    /// Track number within the album.
    index: Option<i32>,
    /// Disc number.
    #[serde(rename = "parentIndex")]
    parent_index: Option<i32>,
    /// Duration in milliseconds.
    duration: Option<i64>,
    /// Server-relative cover path of the item itself.
    thumb: Option<String>,
    /// Cover path of the parent (the album, for tracks).
    #[serde(rename = "parentThumb")]
    parent_thumb: Option<String>,
    guid: Option<String>,
    #[serde(rename = "Guid", default)]
    guids: Vec<PlexGuid>,
}

#[derive(Debug, Deserialize)]
struct PlexGuid {
    id: String,
}

impl PlexMetadata {
    fn external_refs(&self) -> Vec<ExternalRef> {
        let mut refs = Vec::new();
        for guid in &self.guids {
            if let Some(r) = guid_to_ref(&guid.id) {
                refs.push(r);
            }
        }
        if let Some(guid) = &self.guid {
            if let Some(r) = guid_to_ref(guid) {
                refs.push(r);
            }
        }
        refs
    }
}

/// "mbid://...", "tmdb://603", "plex://track/..." style item guids.
fn guid_to_ref(guid: &str) -> Option<ExternalRef> {
    let (scheme, value) = guid.split_once("://")?;
    if value.is_empty() {
        return None;
    }
    let namespace = match scheme {
        "mbid" | "musicbrainz" => IdNamespace::MusicBrainz,
        "tmdb" => IdNamespace::Tmdb,
        "spotify" => IdNamespace::Spotify,
        "plex" => IdNamespace::Plex,
        _ => return None,
    };
    Some(ExternalRef::new(namespace, value))
}

/// Handles media-server scrobble webhooks: track scrobbles feed the music
/// catalog, movie scrobbles the movie catalog. Episode watches are seen but
/// not tracked.
pub struct PlexHandler {
    canon: Arc<Canonicalizer>,
}

impl PlexHandler {
    pub fn new(canon: Arc<Canonicalizer>) -> Self {
        Self { canon }
    }

    async fn apply_track(&self, meta: &PlexMetadata) -> Result<DispatchResult> {
        let Some(artist_name) = meta.grandparent_title.as_deref() else {
            return Err(PlaylogError::Provider {
                message: format!("track scrobble '{}' carries no artist", meta.title),
            });
        };

        let artist = self.canon.ensure_artist(artist_name, &[]).await?;
        let track = self
            .canon
            .ensure_track(
                &artist,
                &meta.title,
                meta.duration.map(|ms| ms / 1000),
                &meta.external_refs(),
            )
            .await?;

        if let Some(album_title) = meta.parent_title.as_deref() {
            let album = self
                .canon
                .ensure_album(&artist, album_title, meta.parent_year, &[])
                .await?;
            let position = match (meta.parent_index, meta.index) {
                (Some(disc_no), Some(track_no)) => Some(TrackPosition { disc_no, track_no }),
                _ => None,
            };
            self.canon.link_track_to_album(&album, &track, position).await?;
            if let Some(thumb) = meta.parent_thumb.as_deref() {
                self.canon.fill_album_cover(&album, thumb).await?;
            }
        }

        Ok(DispatchResult::Success)
    }

    async fn apply_movie(&self, meta: &PlexMetadata) -> Result<DispatchResult> {
        let movie = self
            .canon
            .ensure_movie(&meta.title, meta.year, &meta.external_refs())
            .await?;
        if let Some(thumb) = meta.thumb.as_deref() {
            self.canon.fill_movie_cover(&movie, thumb).await?;
        }
        Ok(DispatchResult::Success)
    }
}

#[async_trait]
impl ProviderHandler for PlexHandler {
    fn provider(&self) -> &'static str {
        PLEX_PROVIDER
    }

    #[instrument(skip(self, payload))]
    async fn dispatch(&self, payload: &str, _event_id: Option<i64>) -> Result<DispatchResult> {
        let webhook: PlexWebhook = serde_json::from_str(payload)?;

        if webhook.event != "media.scrobble" {
            debug!(event = %webhook.event, "Non-scrobble webhook, nothing to apply");
            return Ok(DispatchResult::Ignored);
        }
        let Some(meta) = &webhook.metadata else {
            return Ok(DispatchResult::Unsupported);
        };

        match meta.media_type.as_str() {
            "track" => self.apply_track(meta).await,
            "movie" => self.apply_movie(meta).await,
            // Episode watches are seen but not part of the catalog.
            "episode" => Ok(DispatchResult::Ignored),
            _ => Ok(DispatchResult::Unsupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;
    use crate::storage::CatalogStore;

    fn handler() -> (PlexHandler, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let canon = Arc::new(Canonicalizer::new(store.clone()));
        (PlexHandler::new(canon), store)
    }

    #[tokio::test]
    async fn track_scrobble_builds_catalog_rows() {
        let (handler, store) = handler();
        let payload = r#"{
            "event": "media.scrobble",
            "Metadata": {
                "type": "track",
                "title": "Svefn-g-englar",
                "grandparentTitle": "Sigur Ros",
                "parentTitle": "Agaetis byrjun",
                "parentYear": 1999,
                "parentIndex": 1,
                "index": 2,
                "duration": 600000,
                "Guid": [{"id": "mbid://7e84f845-ac16-41fe-9ff8-df12eb32af55"}]
            }
        }"#;
        let outcome = handler.dispatch(payload, None).await.unwrap();
        assert_eq!(outcome, DispatchResult::Success);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.artists, 1);
        assert_eq!(stats.albums, 1);
        assert_eq!(stats.tracks, 1);
        assert_eq!(stats.external_ids, 1);
    }

    #[tokio::test]
    async fn episode_scrobble_is_ignored() {
        let (handler, store) = handler();
        let payload = r#"{
            "event": "media.scrobble",
            "Metadata": {"type": "episode", "title": "Pilot"}
        }"#;
        let outcome = handler.dispatch(payload, None).await.unwrap();
        assert_eq!(outcome, DispatchResult::Ignored);
        assert_eq!(store.stats().await.unwrap().movies, 0);
    }

    #[tokio::test]
    async fn play_event_is_ignored() {
        let (handler, _) = handler();
        let payload = r#"{"event": "media.play"}"#;
        let outcome = handler.dispatch(payload, None).await.unwrap();
        assert_eq!(outcome, DispatchResult::Ignored);
    }

    #[tokio::test]
    async fn unknown_media_type_is_unsupported() {
        let (handler, _) = handler();
        let payload = r#"{
            "event": "media.scrobble",
            "Metadata": {"type": "photo", "title": "IMG_0001"}
        }"#;
        let outcome = handler.dispatch(payload, None).await.unwrap();
        assert_eq!(outcome, DispatchResult::Unsupported);
    }

    #[tokio::test]
    async fn movie_scrobble_records_movie_with_cover() {
        let (handler, store) = handler();
        let payload = r#"{
            "event": "media.scrobble",
            "Metadata": {
                "type": "movie",
                "title": "Stalker",
                "year": 1979,
                "thumb": "/library/metadata/100/thumb/1",
                "Guid": [{"id": "tmdb://1398"}]
            }
        }"#;
        let outcome = handler.dispatch(payload, None).await.unwrap();
        assert_eq!(outcome, DispatchResult::Success);

        let movies = store.movies_by_key("stalker").await.unwrap();
        assert_eq!(movies.len(), 1);
        assert_eq!(movies[0].cover_path.as_deref(), Some("/library/metadata/100/thumb/1"));

        // A later scrobble with a different thumb does not overwrite.
        let payload = payload.replace("/thumb/1", "/thumb/2");
        handler.dispatch(&payload, None).await.unwrap();
        let movies = store.movies_by_key("stalker").await.unwrap();
        assert_eq!(movies[0].cover_path.as_deref(), Some("/library/metadata/100/thumb/1"));
    }
}
