use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::domain::*;
use crate::error::{PlaylogError, Result};
use crate::fingerprint::title_key;
use crate::storage::CatalogStore;

pub mod books;
pub mod video;

/// Resolves provider observations of artists, albums and tracks (and the
/// movie/book analogues in the submodules) to one canonical row each,
/// creating rows as needed and recording provider identifier linkage.
///
/// Resolution order, applied identically per entity type: external
/// identifier lookup in namespace priority order, then structural lookup,
/// then fingerprint, then create. Identity races during create/promote are
/// recovered by re-running resolution against the competing winner.
pub struct Canonicalizer {
    catalog: Arc<dyn CatalogStore>,
}

impl std::fmt::Debug for Canonicalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Canonicalizer").finish_non_exhaustive()
    }
}

impl Canonicalizer {
    pub fn new(catalog: Arc<dyn CatalogStore>) -> Self {
        Self { catalog }
    }

    pub(crate) fn catalog(&self) -> &dyn CatalogStore {
        self.catalog.as_ref()
    }

    /// First external id that resolves to an entity of the expected kind,
    /// checked in fixed namespace priority order.
    pub(crate) async fn resolve_external(
        &self,
        kind: EntityKind,
        ids: &[ExternalRef],
    ) -> Result<Option<i64>> {
        let mut ordered: Vec<&ExternalRef> = ids.iter().collect();
        ordered.sort_by_key(|r| r.namespace.rank());
        for r in ordered {
            if let Some(link) = self.catalog.find_external(r.namespace, &r.value).await? {
                if link.entity == kind {
                    debug!(
                        namespace = %r.namespace,
                        value = %r.value,
                        entity_id = link.entity_id,
                        "Resolved entity via external identifier"
                    );
                    return Ok(Some(link.entity_id));
                }
            }
        }
        Ok(None)
    }

    /// Link every supplied identifier to the resolved entity. Additive:
    /// already-claimed identifiers are left pointing where they point.
    pub(crate) async fn link_all(
        &self,
        kind: EntityKind,
        entity_id: i64,
        ids: &[ExternalRef],
    ) -> Result<()> {
        for r in ids {
            self.catalog
                .link_external(&ExternalId {
                    entity: kind,
                    entity_id,
                    namespace: r.namespace,
                    value: r.value.clone(),
                })
                .await?;
        }
        Ok(())
    }

    #[instrument(skip(self, ids))]
    pub async fn ensure_artist(&self, name: &str, ids: &[ExternalRef]) -> Result<Artist> {
        match self.try_resolve_artist(name, ids).await {
            Ok(artist) => self.finish_artist(artist, ids).await,
            Err(e) if is_race(&e, "artists.") => {
                debug!(name, "Artist identity race, re-resolving");
                let artist = self.try_resolve_artist(name, ids).await?;
                self.finish_artist(artist, ids).await
            }
            Err(e) => Err(e),
        }
    }

    async fn finish_artist(&self, artist: Artist, ids: &[ExternalRef]) -> Result<Artist> {
        let id = required_id(EntityKind::Artist, artist.id)?;
        self.link_all(EntityKind::Artist, id, ids).await?;
        Ok(artist)
    }

    async fn try_resolve_artist(&self, name: &str, ids: &[ExternalRef]) -> Result<Artist> {
        if let Some(entity_id) = self.resolve_external(EntityKind::Artist, ids).await? {
            if let Some(artist) = self.catalog.artist_by_id(entity_id).await? {
                return Ok(artist);
            }
        }

        let key = title_key(name);
        if let Some(artist) = self.catalog.artist_by_key(&key).await? {
            return Ok(artist);
        }

        let candidate = Artist::new(name);
        if let Some(artist) = self.catalog.artist_by_fingerprint(&candidate.fingerprint).await? {
            return Ok(artist);
        }

        let mut fresh = candidate;
        self.catalog.insert_artist(&mut fresh).await?;
        info!(artist_id = fresh.id, name, "Created artist");
        Ok(fresh)
    }

    #[instrument(skip(self, artist, ids), fields(artist_id = ?artist.id))]
    pub async fn ensure_album(
        &self,
        artist: &Artist,
        title: &str,
        year: Option<i32>,
        ids: &[ExternalRef],
    ) -> Result<Album> {
        let artist_id = required_id(EntityKind::Artist, artist.id)?;
        match self.try_resolve_album(artist_id, title, year, ids).await {
            Ok(album) => self.finish_album(album, ids).await,
            Err(e) if is_race(&e, "albums.") => {
                debug!(title, "Album identity race, re-resolving");
                let album = self.try_resolve_album(artist_id, title, year, ids).await?;
                self.finish_album(album, ids).await
            }
            Err(e) => Err(e),
        }
    }

    async fn finish_album(&self, album: Album, ids: &[ExternalRef]) -> Result<Album> {
        let id = required_id(EntityKind::Album, album.id)?;
        self.link_all(EntityKind::Album, id, ids).await?;
        Ok(album)
    }

    async fn try_resolve_album(
        &self,
        artist_id: i64,
        title: &str,
        year: Option<i32>,
        ids: &[ExternalRef],
    ) -> Result<Album> {
        if let Some(entity_id) = self.resolve_external(EntityKind::Album, ids).await? {
            if let Some(album) = self.catalog.album_by_id(entity_id).await? {
                return self.maybe_promote_album(album, year).await;
            }
        }

        let key = title_key(title);
        let rows = self.catalog.albums_by_artist_and_key(artist_id, &key).await?;
        if let Some(hit) = select_by_year(&rows, year, |a: &Album| a.year, |a| a.id) {
            return self.maybe_promote_album(hit.clone(), year).await;
        }

        let fingerprint = Album::identity_fingerprint(artist_id, &key, year);
        if let Some(album) = self.catalog.album_by_fingerprint(&fingerprint).await? {
            return self.maybe_promote_album(album, year).await;
        }

        let mut fresh = Album::new(artist_id, title, year);
        self.catalog.insert_album(&mut fresh).await?;
        info!(album_id = fresh.id, title, year, "Created album");
        Ok(fresh)
    }

    async fn maybe_promote_album(&self, album: Album, year: Option<i32>) -> Result<Album> {
        match (album.year, year) {
            (None, Some(y)) => self.promote_album_year(&album, y).await,
            _ => Ok(album),
        }
    }

    /// Promote a null-year album to a concrete year in place. Losing the
    /// race to a competing writer is recovered by adopting the row that won
    /// the (artist, title key, year) triple; the abandoned placeholder is
    /// left behind.
    #[instrument(skip(self, album), fields(album_id = ?album.id))]
    pub async fn promote_album_year(&self, album: &Album, year: i32) -> Result<Album> {
        if album.year == Some(year) {
            return Ok(album.clone());
        }
        if album.year.is_some() {
            // Known years are never overwritten.
            return Ok(album.clone());
        }
        let id = required_id(EntityKind::Album, album.id)?;
        match self.catalog.set_album_year(id, year).await {
            Ok(()) => {
                info!(album_id = id, year, "Promoted album year");
                let mut updated = album.clone();
                updated.year = Some(year);
                updated.fingerprint =
                    Album::identity_fingerprint(album.artist_id, &album.title_key, Some(year));
                Ok(updated)
            }
            Err(e) if is_race(&e, "albums.") => {
                debug!(album_id = id, year, "Lost year promotion race, adopting winner");
                let rows = self
                    .catalog
                    .albums_by_artist_and_key(album.artist_id, &album.title_key)
                    .await?;
                rows.into_iter().find(|a| a.year == Some(year)).ok_or(e)
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, artist, ids), fields(artist_id = ?artist.id))]
    pub async fn ensure_track(
        &self,
        artist: &Artist,
        title: &str,
        duration_secs: Option<i64>,
        ids: &[ExternalRef],
    ) -> Result<Track> {
        let artist_id = required_id(EntityKind::Artist, artist.id)?;
        match self.try_resolve_track(artist_id, title, duration_secs, ids).await {
            Ok(track) => self.finish_track(track, ids).await,
            Err(e) if is_race(&e, "tracks.") => {
                debug!(title, "Track identity race, re-resolving");
                let track = self.try_resolve_track(artist_id, title, duration_secs, ids).await?;
                self.finish_track(track, ids).await
            }
            Err(e) => Err(e),
        }
    }

    async fn finish_track(&self, track: Track, ids: &[ExternalRef]) -> Result<Track> {
        let id = required_id(EntityKind::Track, track.id)?;
        self.link_all(EntityKind::Track, id, ids).await?;
        Ok(track)
    }

    async fn try_resolve_track(
        &self,
        artist_id: i64,
        title: &str,
        duration_secs: Option<i64>,
        ids: &[ExternalRef],
    ) -> Result<Track> {
        if let Some(entity_id) = self.resolve_external(EntityKind::Track, ids).await? {
            if let Some(track) = self.catalog.track_by_id(entity_id).await? {
                return self.maybe_fill_duration(track, duration_secs).await;
            }
        }

        let key = title_key(title);
        let rows = self.catalog.tracks_by_artist_and_key(artist_id, &key).await?;
        if let Some(hit) = rows.first() {
            return self.maybe_fill_duration(hit.clone(), duration_secs).await;
        }

        let candidate = Track::new(artist_id, title, duration_secs);
        if let Some(track) = self.catalog.track_by_fingerprint(&candidate.fingerprint).await? {
            return self.maybe_fill_duration(track, duration_secs).await;
        }

        let mut fresh = candidate;
        self.catalog.insert_track(&mut fresh).await?;
        info!(track_id = fresh.id, title, "Created track");
        Ok(fresh)
    }

    /// Monotonic cover fill: a provider-supplied cover path only ever
    /// lands on an album that has none.
    pub async fn fill_album_cover(&self, album: &Album, cover_path: &str) -> Result<Album> {
        if album.cover_path.is_some() || cover_path.is_empty() {
            return Ok(album.clone());
        }
        let id = required_id(EntityKind::Album, album.id)?;
        self.catalog.set_album_cover(id, cover_path).await?;
        debug!(album_id = id, "Filled album cover path");
        let mut updated = album.clone();
        updated.cover_path = Some(cover_path.to_string());
        Ok(updated)
    }

    async fn maybe_fill_duration(&self, track: Track, duration_secs: Option<i64>) -> Result<Track> {
        match (track.duration_secs, duration_secs) {
            (None, Some(d)) => {
                let id = required_id(EntityKind::Track, track.id)?;
                self.catalog.set_track_duration(id, d).await?;
                let mut updated = track;
                updated.duration_secs = Some(d);
                Ok(updated)
            }
            _ => Ok(track),
        }
    }

    /// Idempotent track-on-album membership. With a position, the (disc,
    /// track) slot is authoritative: an occupying link is reassigned to the
    /// incoming track, and a stale link for the same pair elsewhere is
    /// dropped (last-writer-wins). Without a position, the bare pair is
    /// inserted if absent. Never errors on a duplicate link.
    #[instrument(skip(self, album, track), fields(album_id = ?album.id, track_id = ?track.id))]
    pub async fn link_track_to_album(
        &self,
        album: &Album,
        track: &Track,
        position: Option<TrackPosition>,
    ) -> Result<()> {
        let album_id = required_id(EntityKind::Album, album.id)?;
        let track_id = required_id(EntityKind::Track, track.id)?;

        let links = self.catalog.links_for_album(album_id).await?;
        let Some(pos) = position else {
            if links.iter().any(|l| l.track_id == track_id) {
                return Ok(());
            }
            return self
                .catalog
                .insert_album_track(&AlbumTrack {
                    album_id,
                    track_id,
                    disc_no: None,
                    track_no: None,
                })
                .await;
        };

        let at_slot = links
            .iter()
            .find(|l| l.disc_no == Some(pos.disc_no) && l.track_no == Some(pos.track_no));
        let for_pair = links.iter().find(|l| l.track_id == track_id);

        match (at_slot, for_pair) {
            // Already linked at this position.
            (Some(slot), _) if slot.track_id == track_id => Ok(()),
            // Slot occupied by another track: steal it, and drop our stale
            // link elsewhere if one exists.
            (Some(_), maybe_pair) => {
                if maybe_pair.is_some() {
                    self.catalog.delete_link(album_id, track_id).await?;
                }
                debug!(
                    album_id,
                    disc_no = pos.disc_no,
                    track_no = pos.track_no,
                    "Reassigning occupied album position"
                );
                self.catalog
                    .set_link_track(album_id, pos.disc_no, pos.track_no, track_id)
                    .await
            }
            // Pair exists at a different (or no) position: move it.
            (None, Some(_)) => {
                self.catalog
                    .set_link_position(album_id, track_id, pos.disc_no, pos.track_no)
                    .await
            }
            (None, None) => {
                self.catalog
                    .insert_album_track(&AlbumTrack {
                        album_id,
                        track_id,
                        disc_no: Some(pos.disc_no),
                        track_no: Some(pos.track_no),
                    })
                    .await
            }
        }
    }
}

fn required_id(kind: EntityKind, id: Option<i64>) -> Result<i64> {
    // id 0 marks an unpersisted parent handed in by the caller
    id.ok_or(PlaylogError::MissingParent { kind, id: 0 })
}

pub(crate) fn is_race(e: &PlaylogError, table_prefix: &str) -> bool {
    e.conflict_constraint()
        .map(|c| c.starts_with(table_prefix))
        .unwrap_or(false)
}

/// Year-aware structural selection, shared by albums and movies.
///
/// With a known year: the exact row wins; otherwise the oldest null-year
/// placeholder is chosen for promotion. With an unknown year: a dated row
/// is preferred (lowest year, then lowest id) over a placeholder, so
/// observations converge onto the enriched row as information arrives.
pub(crate) fn select_by_year<T>(
    rows: &[T],
    year: Option<i32>,
    get_year: impl Fn(&T) -> Option<i32>,
    get_id: impl Fn(&T) -> Option<i64>,
) -> Option<&T> {
    match year {
        Some(y) => rows
            .iter()
            .find(|r| get_year(r) == Some(y))
            .or_else(|| {
                rows.iter()
                    .filter(|r| get_year(r).is_none())
                    .min_by_key(|r| get_id(r))
            }),
        None => rows
            .iter()
            .filter(|r| get_year(r).is_some())
            .min_by_key(|r| (get_year(r), get_id(r)))
            .or_else(|| {
                rows.iter()
                    .filter(|r| get_year(r).is_none())
                    .min_by_key(|r| get_id(r))
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;

    fn canon() -> Canonicalizer {
        Canonicalizer::new(Arc::new(InMemoryStore::new()))
    }

    #[test]
    fn select_by_year_prefers_exact_then_placeholder() {
        let rows = vec![
            Album::with_test_id(1, Album::new(9, "X", None)),
            Album::with_test_id(2, Album::new(9, "X", Some(2001))),
            Album::with_test_id(3, Album::new(9, "X", Some(1999))),
        ];
        let exact = select_by_year(&rows, Some(2001), |a| a.year, |a| a.id);
        assert_eq!(exact.and_then(|a| a.id), Some(2));

        // Unknown target year converges on the lowest dated year.
        let fuzzy = select_by_year(&rows, None, |a| a.year, |a| a.id);
        assert_eq!(fuzzy.and_then(|a| a.id), Some(3));

        // Known year with no dated match picks the placeholder to promote.
        let promote = select_by_year(&rows, Some(1980), |a| a.year, |a| a.id);
        assert_eq!(promote.and_then(|a| a.id), Some(1));
    }

    #[tokio::test]
    async fn ensure_artist_is_idempotent_across_spellings() {
        let canon = canon();
        let first = canon.ensure_artist("Björk", &[]).await.unwrap();
        let second = canon.ensure_artist("BJORK", &[]).await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn external_id_of_wrong_kind_is_ignored() {
        let canon = canon();
        let artist = canon
            .ensure_artist("Stereolab", &[ExternalRef::new(IdNamespace::Spotify, "xyz")])
            .await
            .unwrap();

        // The same identifier value under the same namespace points at an
        // artist; resolving an album with it must not return the artist row.
        let album = canon
            .ensure_album(
                &artist,
                "Dots and Loops",
                None,
                &[ExternalRef::new(IdNamespace::Spotify, "xyz")],
            )
            .await
            .unwrap();
        assert_ne!(album.id, artist.id);
    }

    #[tokio::test]
    async fn track_link_upsert_by_position() {
        let canon = canon();
        let artist = canon.ensure_artist("Tortoise", &[]).await.unwrap();
        let album = canon.ensure_album(&artist, "TNT", Some(1998), &[]).await.unwrap();
        let a = canon.ensure_track(&artist, "TNT", None, &[]).await.unwrap();
        let b = canon.ensure_track(&artist, "Swung from the Gutters", None, &[]).await.unwrap();

        let pos = TrackPosition { disc_no: 1, track_no: 1 };
        canon.link_track_to_album(&album, &a, Some(pos)).await.unwrap();
        // Duplicate link is a no-op.
        canon.link_track_to_album(&album, &a, Some(pos)).await.unwrap();

        // Another track claiming the slot steals it.
        canon.link_track_to_album(&album, &b, Some(pos)).await.unwrap();
        let links = canon.catalog().links_for_album(album.id.unwrap()).await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].track_id, b.id.unwrap());

        // Repositioning an existing pair moves it instead of duplicating.
        let pos2 = TrackPosition { disc_no: 1, track_no: 2 };
        canon.link_track_to_album(&album, &b, Some(pos2)).await.unwrap();
        let links = canon.catalog().links_for_album(album.id.unwrap()).await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].track_no, Some(2));
    }
}

#[cfg(test)]
impl Album {
    /// Test helper: a row as it would come back from storage.
    fn with_test_id(id: i64, mut album: Album) -> Album {
        album.id = Some(id);
        album
    }
}
