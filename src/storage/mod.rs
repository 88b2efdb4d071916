use async_trait::async_trait;

use crate::domain::*;
use crate::error::Result;

pub mod in_memory;
pub mod sqlite;

pub use in_memory::InMemoryStore;
pub use sqlite::SqliteStore;

/// Constraint descriptions surfaced by both store implementations when an
/// identity uniqueness guard fires. The canonicalizer matches on the
/// table-scoped prefix of these to recognize the races it knows how to
/// recover from; anything else propagates. The sqlite backend produces the
/// same strings natively (column lists from `UNIQUE constraint failed: ...`).
pub const ALBUM_IDENTITY_CONSTRAINT: &str = "albums.artist_id, albums.title_key, albums.year";
pub const MOVIE_IDENTITY_CONSTRAINT: &str = "movies.title_key, movies.year";
pub const BOOK_IDENTITY_CONSTRAINT: &str = "books.title_key, books.author_key";
pub const ARTIST_FINGERPRINT_CONSTRAINT: &str = "artists.fingerprint";
pub const ALBUM_FINGERPRINT_CONSTRAINT: &str = "albums.fingerprint";
pub const TRACK_FINGERPRINT_CONSTRAINT: &str = "tracks.fingerprint";
pub const MOVIE_FINGERPRINT_CONSTRAINT: &str = "movies.fingerprint";
pub const BOOK_FINGERPRINT_CONSTRAINT: &str = "books.fingerprint";
pub const EDITION_ISBN_CONSTRAINT: &str = "book_editions.isbn";

/// Status/provider conjunction for counting and paging event records.
/// An empty provider list means no provider filter; `statuses: None`
/// bypasses the status filter entirely (the `all` flag).
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub statuses: Option<Vec<EventStatus>>,
    pub providers: Vec<String>,
}

impl EventFilter {
    pub fn matches(&self, event: &EventRecord) -> bool {
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&event.status) {
                return false;
            }
        }
        if !self.providers.is_empty() && !self.providers.contains(&event.provider) {
            return false;
        }
        true
    }
}

/// Durable, idempotent log of inbound provider payloads.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Record a payload once. A byte-identical payload returns the existing
    /// record unchanged: no new row, no status reset.
    async fn save(&self, provider: &str, payload: &str) -> Result<EventRecord>;

    async fn get(&self, id: i64) -> Result<Option<EventRecord>>;

    /// Exactly one status write per dispatch attempt goes through here.
    async fn set_status(&self, id: i64, status: EventStatus, error: Option<&str>) -> Result<()>;

    async fn count(&self, filter: &EventFilter, after_id: i64) -> Result<u64>;

    /// Next page of matching events with id strictly greater than
    /// `after_id`, ascending. Cursor-based so rows that change status
    /// mid-run cannot shift later pages.
    async fn page_after(
        &self,
        filter: &EventFilter,
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<EventRecord>>;
}

/// Storage seam for canonical entities and their external identifiers.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    // External identifiers
    async fn find_external(&self, ns: IdNamespace, value: &str) -> Result<Option<ExternalId>>;
    /// Insert-if-absent; an existing (namespace, value) row is left untouched.
    async fn link_external(&self, link: &ExternalId) -> Result<()>;

    // Artists
    async fn insert_artist(&self, artist: &mut Artist) -> Result<()>;
    async fn artist_by_id(&self, id: i64) -> Result<Option<Artist>>;
    async fn artist_by_key(&self, title_key: &str) -> Result<Option<Artist>>;
    async fn artist_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Artist>>;

    // Albums
    async fn insert_album(&self, album: &mut Album) -> Result<()>;
    async fn album_by_id(&self, id: i64) -> Result<Option<Album>>;
    async fn albums_by_artist_and_key(&self, artist_id: i64, title_key: &str)
        -> Result<Vec<Album>>;
    async fn album_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Album>>;
    /// Guarded in-place year promotion; fails with a Conflict on the album
    /// identity constraint when a competing row already owns the triple.
    async fn set_album_year(&self, album_id: i64, year: i32) -> Result<()>;
    async fn set_album_cover(&self, album_id: i64, cover_path: &str) -> Result<()>;
    async fn albums_missing_year(&self, limit: u32) -> Result<Vec<Album>>;

    // Tracks
    async fn insert_track(&self, track: &mut Track) -> Result<()>;
    async fn track_by_id(&self, id: i64) -> Result<Option<Track>>;
    async fn tracks_by_artist_and_key(&self, artist_id: i64, title_key: &str)
        -> Result<Vec<Track>>;
    async fn track_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Track>>;
    async fn set_track_duration(&self, track_id: i64, duration_secs: i64) -> Result<()>;

    // Album-track links
    async fn links_for_album(&self, album_id: i64) -> Result<Vec<AlbumTrack>>;
    async fn insert_album_track(&self, link: &AlbumTrack) -> Result<()>;
    async fn set_link_track(
        &self,
        album_id: i64,
        disc_no: i32,
        track_no: i32,
        track_id: i64,
    ) -> Result<()>;
    async fn set_link_position(
        &self,
        album_id: i64,
        track_id: i64,
        disc_no: i32,
        track_no: i32,
    ) -> Result<()>;
    async fn delete_link(&self, album_id: i64, track_id: i64) -> Result<()>;

    // Movies
    async fn insert_movie(&self, movie: &mut Movie) -> Result<()>;
    async fn movie_by_id(&self, id: i64) -> Result<Option<Movie>>;
    async fn movies_by_key(&self, title_key: &str) -> Result<Vec<Movie>>;
    async fn movie_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Movie>>;
    async fn set_movie_year(&self, movie_id: i64, year: i32) -> Result<()>;
    async fn set_movie_cover(&self, movie_id: i64, cover_path: &str) -> Result<()>;

    // Books and editions
    async fn insert_book(&self, book: &mut Book) -> Result<()>;
    async fn book_by_id(&self, id: i64) -> Result<Option<Book>>;
    async fn book_by_keys(&self, title_key: &str, author_key: &str) -> Result<Option<Book>>;
    async fn book_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Book>>;
    async fn set_book_year(&self, book_id: i64, year: i32) -> Result<()>;
    async fn insert_book_edition(&self, edition: &mut BookEdition) -> Result<()>;
    async fn edition_by_isbn(&self, isbn: &str) -> Result<Option<BookEdition>>;

    async fn stats(&self) -> Result<CatalogStats>;
}
