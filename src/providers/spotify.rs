use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::canonical::Canonicalizer;
use crate::client::{ClientError, ResilientClient};
use crate::constants::SPOTIFY_PROVIDER;
use crate::dispatch::{DispatchEngine, DispatchResult, ProviderHandler};
use crate::domain::{ExternalRef, IdNamespace, TrackPosition};
use crate::error::{PlaylogError, Result};
use crate::single_flight::SingleFlight;
use crate::storage::EventStore;

/// One recently-played item as the streaming API returns it. The importer
/// stores the item verbatim; this is the shape the handler reads back.
#[derive(Debug, Deserialize)]
struct PlayedItem {
    track: PlayedTrack,
}

#[derive(Debug, Deserialize)]
struct PlayedTrack {
    id: Option<String>,
    name: String,
    duration_ms: Option<i64>,
    track_number: Option<i32>,
    disc_number: Option<i32>,
    #[serde(default)]
    artists: Vec<PlayedArtist>,
    album: Option<PlayedAlbum>,
}

#[derive(Debug, Deserialize)]
struct PlayedArtist {
    id: Option<String>,
    name: String,
}

#[derive(Debug, Deserialize)]
struct PlayedAlbum {
    id: Option<String>,
    name: String,
    /// "1998", "1998-03" or "1998-03-09".
    release_date: Option<String>,
}

fn release_year(release_date: Option<&str>) -> Option<i32> {
    release_date?.get(0..4)?.parse().ok()
}

fn spotify_ref(id: &Option<String>) -> Vec<ExternalRef> {
    match id {
        Some(id) if !id.is_empty() => vec![ExternalRef::new(IdNamespace::Spotify, id.clone())],
        _ => Vec::new(),
    }
}

/// Applies stored recently-played items to the catalog.
pub struct SpotifyHandler {
    canon: Arc<Canonicalizer>,
}

impl SpotifyHandler {
    pub fn new(canon: Arc<Canonicalizer>) -> Self {
        Self { canon }
    }
}

#[async_trait]
impl ProviderHandler for SpotifyHandler {
    fn provider(&self) -> &'static str {
        SPOTIFY_PROVIDER
    }

    #[instrument(skip(self, payload))]
    async fn dispatch(&self, payload: &str, _event_id: Option<i64>) -> Result<DispatchResult> {
        let item: PlayedItem = serde_json::from_str(payload)?;
        let Some(first_artist) = item.track.artists.first() else {
            return Ok(DispatchResult::Unsupported);
        };

        let artist = self
            .canon
            .ensure_artist(&first_artist.name, &spotify_ref(&first_artist.id))
            .await?;
        let track = self
            .canon
            .ensure_track(
                &artist,
                &item.track.name,
                item.track.duration_ms.map(|ms| ms / 1000),
                &spotify_ref(&item.track.id),
            )
            .await?;

        if let Some(played_album) = &item.track.album {
            let album = self
                .canon
                .ensure_album(
                    &artist,
                    &played_album.name,
                    release_year(played_album.release_date.as_deref()),
                    &spotify_ref(&played_album.id),
                )
                .await?;
            let position = match (item.track.disc_number, item.track.track_number) {
                (Some(disc_no), Some(track_no)) => Some(TrackPosition { disc_no, track_no }),
                _ => None,
            };
            self.canon.link_track_to_album(&album, &track, position).await?;
        }

        Ok(DispatchResult::Success)
    }
}

#[derive(Debug, Deserialize)]
struct RecentlyPlayedPage {
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOutcome {
    /// Another import run holds the single-flight guard.
    AlreadyRunning,
    Completed { fetched: u64, processed: u64 },
}

/// Pulls the recently-played feed through the resilient client and funnels
/// each item through the normal ingest path: save (dedup by fingerprint),
/// then dispatch. Re-importing an overlapping window is free.
pub struct SpotifyImporter {
    client: ResilientClient,
    events: Arc<dyn EventStore>,
    engine: Arc<DispatchEngine>,
    base_url: String,
    page_limit: u32,
    flight: SingleFlight,
}

impl SpotifyImporter {
    pub fn new(
        client: ResilientClient,
        events: Arc<dyn EventStore>,
        engine: Arc<DispatchEngine>,
        base_url: String,
        page_limit: u32,
    ) -> Self {
        Self {
            client,
            events,
            engine,
            base_url,
            page_limit,
            flight: SingleFlight::new(),
        }
    }

    #[instrument(skip(self))]
    pub async fn import_recent(&self) -> Result<ImportOutcome> {
        let Some(_guard) = self.flight.try_begin() else {
            warn!("Import already running, skipping");
            return Ok(ImportOutcome::AlreadyRunning);
        };

        let url = format!(
            "{}/v1/me/player/recently-played?limit={}",
            self.base_url, self.page_limit
        );
        let page: RecentlyPlayedPage = match self.client.get_json(&url).await {
            Ok(page) => page,
            Err(ClientError::NotFound { .. }) => {
                info!("No recent plays available");
                return Ok(ImportOutcome::Completed {
                    fetched: 0,
                    processed: 0,
                });
            }
            Err(e) => {
                return Err(PlaylogError::Provider {
                    message: format!("recently-played fetch failed: {}", e),
                })
            }
        };

        let fetched = page.items.len() as u64;
        let mut processed = 0u64;
        for item in &page.items {
            let payload = item.to_string();
            let event = self.events.save(SPOTIFY_PROVIDER, &payload).await?;
            self.engine.execute_sync(event.id).await?;
            processed += 1;
        }

        info!(fetched, processed, "Finished recently-played import");
        Ok(ImportOutcome::Completed { fetched, processed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CatalogStore, InMemoryStore};

    #[test]
    fn release_year_takes_date_prefix() {
        assert_eq!(release_year(Some("1998-03-09")), Some(1998));
        assert_eq!(release_year(Some("1998")), Some(1998));
        assert_eq!(release_year(Some("19")), None);
        assert_eq!(release_year(None), None);
    }

    #[tokio::test]
    async fn played_item_builds_catalog_rows_with_ids() {
        let store = Arc::new(InMemoryStore::new());
        let canon = Arc::new(Canonicalizer::new(store.clone()));
        let handler = SpotifyHandler::new(canon);

        let payload = r#"{
            "played_at": "2020-01-01T00:00:00Z",
            "track": {
                "id": "tr1",
                "name": "Ageispolis",
                "duration_ms": 322000,
                "track_number": 3,
                "disc_number": 1,
                "artists": [{"id": "ar1", "name": "Aphex Twin"}],
                "album": {"id": "al1", "name": "Selected Ambient Works 85-92", "release_date": "1992-11-09"}
            }
        }"#;
        let outcome = handler.dispatch(payload, None).await.unwrap();
        assert_eq!(outcome, DispatchResult::Success);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.artists, 1);
        assert_eq!(stats.albums, 1);
        assert_eq!(stats.tracks, 1);
        // artist, album and track ids all linked
        assert_eq!(stats.external_ids, 3);
    }

    #[tokio::test]
    async fn item_without_artists_is_unsupported() {
        let store = Arc::new(InMemoryStore::new());
        let canon = Arc::new(Canonicalizer::new(store));
        let handler = SpotifyHandler::new(canon);

        let payload = r#"{"track": {"name": "???", "artists": []}}"#;
        let outcome = handler.dispatch(payload, None).await.unwrap();
        assert_eq!(outcome, DispatchResult::Unsupported);
    }
}
