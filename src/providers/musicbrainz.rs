use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::canonical::Canonicalizer;
use crate::client::{ClientError, ResilientClient};
use crate::error::Result;
use crate::single_flight::SingleFlight;
use crate::storage::CatalogStore;

#[derive(Debug, Deserialize)]
struct ReleaseGroupSearch {
    #[serde(rename = "release-groups", default)]
    release_groups: Vec<ReleaseGroup>,
}

#[derive(Debug, Deserialize)]
struct ReleaseGroup {
    #[serde(rename = "first-release-date")]
    first_release_date: Option<String>,
}

/// Release-group lookups against the MusicBrainz web service. The wrapped
/// client carries the 1 req/s admission gate the service asks for; a miss
/// is data ("no such release group"), not an error.
pub struct MusicBrainzClient {
    client: ResilientClient,
    base_url: String,
}

impl MusicBrainzClient {
    pub fn new(client: ResilientClient, base_url: String) -> Self {
        Self { client, base_url }
    }

    /// Year of the earliest release of (artist, album title), when the
    /// service knows one.
    pub async fn first_release_year(
        &self,
        artist: &str,
        album: &str,
    ) -> std::result::Result<Option<i32>, ClientError> {
        let query = format!("releasegroup:\"{}\" AND artist:\"{}\"", album, artist);
        let url = format!(
            "{}/release-group/?query={}&limit=5&fmt=json",
            self.base_url,
            urlencoding::encode(&query)
        );

        let search: ReleaseGroupSearch = match self.client.get_json(&url).await {
            Ok(search) => search,
            Err(ClientError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        let year = search
            .release_groups
            .iter()
            .filter_map(|rg| rg.first_release_date.as_deref())
            .filter_map(|date| date.get(0..4)?.parse::<i32>().ok())
            .min();
        Ok(year)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichOutcome {
    /// Another enrichment run holds the single-flight guard.
    AlreadyRunning,
    Completed { examined: u64, updated: u64 },
}

/// Batch enrichment of null-year albums from MusicBrainz. Each album is
/// handled in isolation: a failed lookup is logged and the run moves on;
/// promotion goes through the canonicalizer so a lost race converges on
/// the winning row.
pub struct AlbumYearEnricher {
    mb: MusicBrainzClient,
    catalog: Arc<dyn CatalogStore>,
    canon: Arc<Canonicalizer>,
    flight: SingleFlight,
}

impl AlbumYearEnricher {
    pub fn new(mb: MusicBrainzClient, catalog: Arc<dyn CatalogStore>, canon: Arc<Canonicalizer>) -> Self {
        Self {
            mb,
            catalog,
            canon,
            flight: SingleFlight::new(),
        }
    }

    #[instrument(skip(self))]
    pub async fn enrich(&self, limit: u32) -> Result<EnrichOutcome> {
        let Some(_guard) = self.flight.try_begin() else {
            warn!("Enrichment already running, skipping");
            return Ok(EnrichOutcome::AlreadyRunning);
        };

        let albums = self.catalog.albums_missing_year(limit).await?;
        info!(count = albums.len(), "Starting album year enrichment");

        let mut examined = 0u64;
        let mut updated = 0u64;
        for album in albums {
            examined += 1;
            let Some(artist) = self.catalog.artist_by_id(album.artist_id).await? else {
                warn!(album_id = ?album.id, artist_id = album.artist_id, "Album without artist row");
                continue;
            };

            match self.mb.first_release_year(&artist.name, &album.title).await {
                Ok(Some(year)) => {
                    self.canon.promote_album_year(&album, year).await?;
                    updated += 1;
                }
                Ok(None) => {
                    debug!(album_id = ?album.id, title = %album.title, "No release year found");
                }
                Err(e) => {
                    warn!(album_id = ?album.id, title = %album.title, error = %e, "Lookup failed");
                }
            }
        }

        info!(examined, updated, "Finished album year enrichment");
        Ok(EnrichOutcome::Completed { examined, updated })
    }
}
