use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::*;
use crate::domain::*;
use crate::error::{PlaylogError, Result};
use crate::fingerprint::payload_fingerprint;

/// In-memory store for development/testing. Enforces the same uniqueness
/// guards as the sqlite backend, with identical constraint strings, so the
/// canonicalizer's race recovery is exercised against either.
pub struct InMemoryStore {
    next_id: AtomicI64,
    events: Arc<Mutex<HashMap<i64, EventRecord>>>,
    event_fingerprints: Arc<Mutex<HashMap<String, i64>>>,
    external_ids: Arc<Mutex<HashMap<(IdNamespace, String), ExternalId>>>,
    artists: Arc<Mutex<HashMap<i64, Artist>>>,
    albums: Arc<Mutex<HashMap<i64, Album>>>,
    tracks: Arc<Mutex<HashMap<i64, Track>>>,
    album_tracks: Arc<Mutex<Vec<AlbumTrack>>>,
    movies: Arc<Mutex<HashMap<i64, Movie>>>,
    books: Arc<Mutex<HashMap<i64, Book>>>,
    editions: Arc<Mutex<HashMap<i64, BookEdition>>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            events: Arc::new(Mutex::new(HashMap::new())),
            event_fingerprints: Arc::new(Mutex::new(HashMap::new())),
            external_ids: Arc::new(Mutex::new(HashMap::new())),
            artists: Arc::new(Mutex::new(HashMap::new())),
            albums: Arc::new(Mutex::new(HashMap::new())),
            tracks: Arc::new(Mutex::new(HashMap::new())),
            album_tracks: Arc::new(Mutex::new(Vec::new())),
            movies: Arc::new(Mutex::new(HashMap::new())),
            books: Arc::new(Mutex::new(HashMap::new())),
            editions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn alloc_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn conflict(constraint: &str) -> PlaylogError {
        PlaylogError::Conflict {
            constraint: constraint.to_string(),
        }
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn save(&self, provider: &str, payload: &str) -> Result<EventRecord> {
        let fingerprint = payload_fingerprint(payload.as_bytes());

        let mut fingerprints = self.event_fingerprints.lock().unwrap();
        let mut events = self.events.lock().unwrap();

        if let Some(existing_id) = fingerprints.get(&fingerprint) {
            let existing = events[existing_id].clone();
            debug!(event_id = existing.id, "Duplicate payload, returning existing event");
            return Ok(existing);
        }

        let id = self.alloc_id();
        let now = Utc::now();
        let record = EventRecord {
            id,
            provider: provider.to_string(),
            payload: payload.to_string(),
            fingerprint: fingerprint.clone(),
            status: EventStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        };
        fingerprints.insert(fingerprint, id);
        events.insert(id, record.clone());

        debug!(event_id = id, provider, "Recorded new event");
        Ok(record)
    }

    async fn get(&self, id: i64) -> Result<Option<EventRecord>> {
        let events = self.events.lock().unwrap();
        Ok(events.get(&id).cloned())
    }

    async fn set_status(&self, id: i64, status: EventStatus, error: Option<&str>) -> Result<()> {
        let mut events = self.events.lock().unwrap();
        if let Some(event) = events.get_mut(&id) {
            event.status = status;
            event.error = error.map(|e| e.to_string());
            event.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn count(&self, filter: &EventFilter, after_id: i64) -> Result<u64> {
        let events = self.events.lock().unwrap();
        let count = events
            .values()
            .filter(|e| e.id > after_id && filter.matches(e))
            .count();
        Ok(count as u64)
    }

    async fn page_after(
        &self,
        filter: &EventFilter,
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<EventRecord>> {
        let events = self.events.lock().unwrap();
        let mut page: Vec<EventRecord> = events
            .values()
            .filter(|e| e.id > after_id && filter.matches(e))
            .cloned()
            .collect();
        page.sort_by_key(|e| e.id);
        page.truncate(limit as usize);
        Ok(page)
    }
}

#[async_trait]
impl CatalogStore for InMemoryStore {
    async fn find_external(&self, ns: IdNamespace, value: &str) -> Result<Option<ExternalId>> {
        let ids = self.external_ids.lock().unwrap();
        Ok(ids.get(&(ns, value.to_string())).cloned())
    }

    async fn link_external(&self, link: &ExternalId) -> Result<()> {
        let mut ids = self.external_ids.lock().unwrap();
        let key = (link.namespace, link.value.clone());
        if !ids.contains_key(&key) {
            debug!(
                namespace = %link.namespace,
                value = %link.value,
                entity = %link.entity,
                entity_id = link.entity_id,
                "Linked external identifier"
            );
            ids.insert(key, link.clone());
        }
        Ok(())
    }

    async fn insert_artist(&self, artist: &mut Artist) -> Result<()> {
        let mut artists = self.artists.lock().unwrap();
        if artists.values().any(|a| a.fingerprint == artist.fingerprint) {
            return Err(Self::conflict(ARTIST_FINGERPRINT_CONSTRAINT));
        }
        let id = self.alloc_id();
        artist.id = Some(id);
        artists.insert(id, artist.clone());
        debug!(artist_id = id, name = %artist.name, "Created artist");
        Ok(())
    }

    async fn artist_by_id(&self, id: i64) -> Result<Option<Artist>> {
        let artists = self.artists.lock().unwrap();
        Ok(artists.get(&id).cloned())
    }

    async fn artist_by_key(&self, title_key: &str) -> Result<Option<Artist>> {
        let artists = self.artists.lock().unwrap();
        let mut matches: Vec<&Artist> =
            artists.values().filter(|a| a.title_key == title_key).collect();
        matches.sort_by_key(|a| a.id);
        Ok(matches.first().map(|a| (*a).clone()))
    }

    async fn artist_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Artist>> {
        let artists = self.artists.lock().unwrap();
        Ok(artists.values().find(|a| a.fingerprint == fingerprint).cloned())
    }

    async fn insert_album(&self, album: &mut Album) -> Result<()> {
        {
            let artists = self.artists.lock().unwrap();
            if !artists.contains_key(&album.artist_id) {
                return Err(PlaylogError::MissingParent {
                    kind: EntityKind::Artist,
                    id: album.artist_id,
                });
            }
        }
        let mut albums = self.albums.lock().unwrap();
        if albums.values().any(|a| a.fingerprint == album.fingerprint) {
            return Err(Self::conflict(ALBUM_FINGERPRINT_CONSTRAINT));
        }
        if album.year.is_some()
            && albums.values().any(|a| {
                a.artist_id == album.artist_id
                    && a.title_key == album.title_key
                    && a.year == album.year
            })
        {
            return Err(Self::conflict(ALBUM_IDENTITY_CONSTRAINT));
        }
        let id = self.alloc_id();
        album.id = Some(id);
        albums.insert(id, album.clone());
        debug!(album_id = id, title = %album.title, "Created album");
        Ok(())
    }

    async fn album_by_id(&self, id: i64) -> Result<Option<Album>> {
        let albums = self.albums.lock().unwrap();
        Ok(albums.get(&id).cloned())
    }

    async fn albums_by_artist_and_key(
        &self,
        artist_id: i64,
        title_key: &str,
    ) -> Result<Vec<Album>> {
        let albums = self.albums.lock().unwrap();
        let mut matches: Vec<Album> = albums
            .values()
            .filter(|a| a.artist_id == artist_id && a.title_key == title_key)
            .cloned()
            .collect();
        matches.sort_by_key(|a| a.id);
        Ok(matches)
    }

    async fn album_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Album>> {
        let albums = self.albums.lock().unwrap();
        Ok(albums.values().find(|a| a.fingerprint == fingerprint).cloned())
    }

    async fn set_album_year(&self, album_id: i64, year: i32) -> Result<()> {
        let mut albums = self.albums.lock().unwrap();
        let Some(current) = albums.get(&album_id).cloned() else {
            return Ok(());
        };
        // The uniqueness guard: another row already owning the triple makes
        // this promotion lose the race.
        if albums.values().any(|a| {
            a.id != Some(album_id)
                && a.artist_id == current.artist_id
                && a.title_key == current.title_key
                && a.year == Some(year)
        }) {
            return Err(Self::conflict(ALBUM_IDENTITY_CONSTRAINT));
        }
        if let Some(album) = albums.get_mut(&album_id) {
            album.year = Some(year);
            album.fingerprint =
                Album::identity_fingerprint(album.artist_id, &album.title_key, Some(year));
            album.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_album_cover(&self, album_id: i64, cover_path: &str) -> Result<()> {
        let mut albums = self.albums.lock().unwrap();
        if let Some(album) = albums.get_mut(&album_id) {
            album.cover_path = Some(cover_path.to_string());
            album.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn albums_missing_year(&self, limit: u32) -> Result<Vec<Album>> {
        let albums = self.albums.lock().unwrap();
        let mut matches: Vec<Album> =
            albums.values().filter(|a| a.year.is_none()).cloned().collect();
        matches.sort_by_key(|a| a.id);
        matches.truncate(limit as usize);
        Ok(matches)
    }

    async fn insert_track(&self, track: &mut Track) -> Result<()> {
        {
            let artists = self.artists.lock().unwrap();
            if !artists.contains_key(&track.artist_id) {
                return Err(PlaylogError::MissingParent {
                    kind: EntityKind::Artist,
                    id: track.artist_id,
                });
            }
        }
        let mut tracks = self.tracks.lock().unwrap();
        if tracks.values().any(|t| t.fingerprint == track.fingerprint) {
            return Err(Self::conflict(TRACK_FINGERPRINT_CONSTRAINT));
        }
        let id = self.alloc_id();
        track.id = Some(id);
        tracks.insert(id, track.clone());
        debug!(track_id = id, title = %track.title, "Created track");
        Ok(())
    }

    async fn track_by_id(&self, id: i64) -> Result<Option<Track>> {
        let tracks = self.tracks.lock().unwrap();
        Ok(tracks.get(&id).cloned())
    }

    async fn tracks_by_artist_and_key(
        &self,
        artist_id: i64,
        title_key: &str,
    ) -> Result<Vec<Track>> {
        let tracks = self.tracks.lock().unwrap();
        let mut matches: Vec<Track> = tracks
            .values()
            .filter(|t| t.artist_id == artist_id && t.title_key == title_key)
            .cloned()
            .collect();
        matches.sort_by_key(|t| t.id);
        Ok(matches)
    }

    async fn track_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Track>> {
        let tracks = self.tracks.lock().unwrap();
        Ok(tracks.values().find(|t| t.fingerprint == fingerprint).cloned())
    }

    async fn set_track_duration(&self, track_id: i64, duration_secs: i64) -> Result<()> {
        let mut tracks = self.tracks.lock().unwrap();
        if let Some(track) = tracks.get_mut(&track_id) {
            track.duration_secs = Some(duration_secs);
            track.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn links_for_album(&self, album_id: i64) -> Result<Vec<AlbumTrack>> {
        let links = self.album_tracks.lock().unwrap();
        Ok(links.iter().filter(|l| l.album_id == album_id).cloned().collect())
    }

    async fn insert_album_track(&self, link: &AlbumTrack) -> Result<()> {
        let mut links = self.album_tracks.lock().unwrap();
        if links
            .iter()
            .any(|l| l.album_id == link.album_id && l.track_id == link.track_id)
        {
            return Ok(());
        }
        links.push(link.clone());
        Ok(())
    }

    async fn set_link_track(
        &self,
        album_id: i64,
        disc_no: i32,
        track_no: i32,
        track_id: i64,
    ) -> Result<()> {
        let mut links = self.album_tracks.lock().unwrap();
        if let Some(link) = links.iter_mut().find(|l| {
            l.album_id == album_id && l.disc_no == Some(disc_no) && l.track_no == Some(track_no)
        }) {
            link.track_id = track_id;
        }
        Ok(())
    }

    async fn set_link_position(
        &self,
        album_id: i64,
        track_id: i64,
        disc_no: i32,
        track_no: i32,
    ) -> Result<()> {
        let mut links = self.album_tracks.lock().unwrap();
        if let Some(link) = links
            .iter_mut()
            .find(|l| l.album_id == album_id && l.track_id == track_id)
        {
            link.disc_no = Some(disc_no);
            link.track_no = Some(track_no);
        }
        Ok(())
    }

    async fn delete_link(&self, album_id: i64, track_id: i64) -> Result<()> {
        let mut links = self.album_tracks.lock().unwrap();
        links.retain(|l| !(l.album_id == album_id && l.track_id == track_id));
        Ok(())
    }

    async fn insert_movie(&self, movie: &mut Movie) -> Result<()> {
        let mut movies = self.movies.lock().unwrap();
        if movies.values().any(|m| m.fingerprint == movie.fingerprint) {
            return Err(Self::conflict(MOVIE_FINGERPRINT_CONSTRAINT));
        }
        if movie.year.is_some()
            && movies
                .values()
                .any(|m| m.title_key == movie.title_key && m.year == movie.year)
        {
            return Err(Self::conflict(MOVIE_IDENTITY_CONSTRAINT));
        }
        let id = self.alloc_id();
        movie.id = Some(id);
        movies.insert(id, movie.clone());
        debug!(movie_id = id, title = %movie.title, "Created movie");
        Ok(())
    }

    async fn movie_by_id(&self, id: i64) -> Result<Option<Movie>> {
        let movies = self.movies.lock().unwrap();
        Ok(movies.get(&id).cloned())
    }

    async fn movies_by_key(&self, title_key: &str) -> Result<Vec<Movie>> {
        let movies = self.movies.lock().unwrap();
        let mut matches: Vec<Movie> = movies
            .values()
            .filter(|m| m.title_key == title_key)
            .cloned()
            .collect();
        matches.sort_by_key(|m| m.id);
        Ok(matches)
    }

    async fn movie_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Movie>> {
        let movies = self.movies.lock().unwrap();
        Ok(movies.values().find(|m| m.fingerprint == fingerprint).cloned())
    }

    async fn set_movie_year(&self, movie_id: i64, year: i32) -> Result<()> {
        let mut movies = self.movies.lock().unwrap();
        let Some(current) = movies.get(&movie_id).cloned() else {
            return Ok(());
        };
        if movies.values().any(|m| {
            m.id != Some(movie_id) && m.title_key == current.title_key && m.year == Some(year)
        }) {
            return Err(Self::conflict(MOVIE_IDENTITY_CONSTRAINT));
        }
        if let Some(movie) = movies.get_mut(&movie_id) {
            movie.year = Some(year);
            movie.fingerprint = Movie::identity_fingerprint(&movie.title_key, Some(year));
            movie.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_movie_cover(&self, movie_id: i64, cover_path: &str) -> Result<()> {
        let mut movies = self.movies.lock().unwrap();
        if let Some(movie) = movies.get_mut(&movie_id) {
            movie.cover_path = Some(cover_path.to_string());
            movie.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn insert_book(&self, book: &mut Book) -> Result<()> {
        let mut books = self.books.lock().unwrap();
        if books.values().any(|b| b.fingerprint == book.fingerprint) {
            return Err(Self::conflict(BOOK_FINGERPRINT_CONSTRAINT));
        }
        if books
            .values()
            .any(|b| b.title_key == book.title_key && b.author_key == book.author_key)
        {
            return Err(Self::conflict(BOOK_IDENTITY_CONSTRAINT));
        }
        let id = self.alloc_id();
        book.id = Some(id);
        books.insert(id, book.clone());
        debug!(book_id = id, title = %book.title, "Created book");
        Ok(())
    }

    async fn book_by_id(&self, id: i64) -> Result<Option<Book>> {
        let books = self.books.lock().unwrap();
        Ok(books.get(&id).cloned())
    }

    async fn book_by_keys(&self, title_key: &str, author_key: &str) -> Result<Option<Book>> {
        let books = self.books.lock().unwrap();
        Ok(books
            .values()
            .find(|b| b.title_key == title_key && b.author_key == author_key)
            .cloned())
    }

    async fn book_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Book>> {
        let books = self.books.lock().unwrap();
        Ok(books.values().find(|b| b.fingerprint == fingerprint).cloned())
    }

    async fn set_book_year(&self, book_id: i64, year: i32) -> Result<()> {
        let mut books = self.books.lock().unwrap();
        if let Some(book) = books.get_mut(&book_id) {
            book.year = Some(year);
            book.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn insert_book_edition(&self, edition: &mut BookEdition) -> Result<()> {
        {
            let books = self.books.lock().unwrap();
            if !books.contains_key(&edition.book_id) {
                return Err(PlaylogError::MissingParent {
                    kind: EntityKind::Book,
                    id: edition.book_id,
                });
            }
        }
        let mut editions = self.editions.lock().unwrap();
        if editions.values().any(|e| e.isbn == edition.isbn) {
            return Err(Self::conflict(EDITION_ISBN_CONSTRAINT));
        }
        let id = self.alloc_id();
        edition.id = Some(id);
        editions.insert(id, edition.clone());
        debug!(edition_id = id, isbn = %edition.isbn, "Created book edition");
        Ok(())
    }

    async fn edition_by_isbn(&self, isbn: &str) -> Result<Option<BookEdition>> {
        let editions = self.editions.lock().unwrap();
        Ok(editions.values().find(|e| e.isbn == isbn).cloned())
    }

    async fn stats(&self) -> Result<CatalogStats> {
        Ok(CatalogStats {
            artists: self.artists.lock().unwrap().len() as u64,
            albums: self.albums.lock().unwrap().len() as u64,
            tracks: self.tracks.lock().unwrap().len() as u64,
            movies: self.movies.lock().unwrap().len() as u64,
            books: self.books.lock().unwrap().len() as u64,
            book_editions: self.editions.lock().unwrap().len() as u64,
            external_ids: self.external_ids.lock().unwrap().len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_is_idempotent_by_fingerprint() {
        let store = InMemoryStore::new();
        let first = store.save("plex", r#"{"a":1}"#).await.unwrap();
        let second = store.save("plex", r#"{"a":1}"#).await.unwrap();
        assert_eq!(first.id, second.id);

        store
            .set_status(first.id, EventStatus::Success, None)
            .await
            .unwrap();
        let third = store.save("plex", r#"{"a":1}"#).await.unwrap();
        assert_eq!(third.status, EventStatus::Success);
    }

    #[tokio::test]
    async fn album_identity_guard_fires() {
        let store = InMemoryStore::new();
        let mut artist = Artist::new("Low");
        store.insert_artist(&mut artist).await.unwrap();
        let artist_id = artist.id.unwrap();

        let mut a = Album::new(artist_id, "Double Negative", Some(2018));
        store.insert_album(&mut a).await.unwrap();

        // A placeholder row next to a dated row is legal.
        let mut placeholder = Album::new(artist_id, "Double Negative", None);
        store.insert_album(&mut placeholder).await.unwrap();

        // The same dated identity twice is not.
        let mut b = Album::new(artist_id, "Double Negative", Some(2018));
        let err = store.insert_album(&mut b).await.unwrap_err();
        assert!(err.conflict_constraint().is_some());

        // Promoting the placeholder into the occupied triple loses the race.
        let err = store
            .set_album_year(placeholder.id.unwrap(), 2018)
            .await
            .unwrap_err();
        assert_eq!(err.conflict_constraint(), Some(ALBUM_IDENTITY_CONSTRAINT));
    }

    #[tokio::test]
    async fn album_insert_requires_parent_artist() {
        let store = InMemoryStore::new();
        let mut orphan = Album::new(999, "Nowhere", None);
        let err = store.insert_album(&mut orphan).await.unwrap_err();
        assert!(matches!(err, PlaylogError::MissingParent { id: 999, .. }));
    }
}
