use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, Row};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use super::*;
use crate::domain::*;
use crate::error::{PlaylogError, Result};
use crate::fingerprint::payload_fingerprint;

/// Durable store backed by a local SQLite file. The uniqueness guards the
/// canonicalizer recovers from live here as UNIQUE indexes; their violation
/// messages carry the column lists the conflict matching keys on.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::bootstrap(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;
            CREATE TABLE IF NOT EXISTS events (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                provider    TEXT NOT NULL,
                payload     TEXT NOT NULL,
                fingerprint TEXT NOT NULL UNIQUE,
                status      TEXT NOT NULL,
                error       TEXT,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS artists (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                name        TEXT NOT NULL,
                title_key   TEXT NOT NULL,
                fingerprint TEXT NOT NULL UNIQUE,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_artists_title_key ON artists(title_key);
            CREATE TABLE IF NOT EXISTS albums (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                artist_id   INTEGER NOT NULL REFERENCES artists(id),
                title       TEXT NOT NULL,
                title_key   TEXT NOT NULL,
                year        INTEGER,
                cover_path  TEXT,
                fingerprint TEXT NOT NULL UNIQUE,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_albums_identity
                ON albums(artist_id, title_key, year);
            CREATE TABLE IF NOT EXISTS tracks (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                artist_id     INTEGER NOT NULL REFERENCES artists(id),
                title         TEXT NOT NULL,
                title_key     TEXT NOT NULL,
                duration_secs INTEGER,
                fingerprint   TEXT NOT NULL UNIQUE,
                created_at    TEXT NOT NULL,
                updated_at    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tracks_artist_key ON tracks(artist_id, title_key);
            CREATE TABLE IF NOT EXISTS album_tracks (
                album_id INTEGER NOT NULL REFERENCES albums(id),
                track_id INTEGER NOT NULL REFERENCES tracks(id),
                disc_no  INTEGER,
                track_no INTEGER,
                UNIQUE(album_id, track_id)
            );
            CREATE TABLE IF NOT EXISTS movies (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                title       TEXT NOT NULL,
                title_key   TEXT NOT NULL,
                year        INTEGER,
                cover_path  TEXT,
                fingerprint TEXT NOT NULL UNIQUE,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_movies_identity ON movies(title_key, year);
            CREATE TABLE IF NOT EXISTS books (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                title       TEXT NOT NULL,
                title_key   TEXT NOT NULL,
                author      TEXT NOT NULL,
                author_key  TEXT NOT NULL,
                year        INTEGER,
                fingerprint TEXT NOT NULL UNIQUE,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_books_identity ON books(title_key, author_key);
            CREATE TABLE IF NOT EXISTS book_editions (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                book_id     INTEGER NOT NULL REFERENCES books(id),
                isbn        TEXT NOT NULL UNIQUE,
                fingerprint TEXT NOT NULL UNIQUE,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS external_ids (
                entity    TEXT NOT NULL,
                entity_id INTEGER NOT NULL,
                namespace TEXT NOT NULL,
                value     TEXT NOT NULL,
                UNIQUE(namespace, value)
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn parent_exists(conn: &Connection, table: &str, id: i64) -> Result<bool> {
        let sql = format!("SELECT 1 FROM {} WHERE id = ?1", table);
        let mut stmt = conn.prepare(&sql)?;
        let found = stmt.exists(params![id])?;
        Ok(found)
    }
}

fn text_enum_error(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unrecognized enum value: {}", value).into(),
    )
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<EventRecord> {
    let status_s: String = row.get(4)?;
    let status = EventStatus::parse(&status_s).ok_or_else(|| text_enum_error(4, &status_s))?;
    Ok(EventRecord {
        id: row.get(0)?,
        provider: row.get(1)?,
        payload: row.get(2)?,
        fingerprint: row.get(3)?,
        status,
        error: row.get(5)?,
        created_at: row.get::<_, DateTime<Utc>>(6)?,
        updated_at: row.get::<_, DateTime<Utc>>(7)?,
    })
}

const EVENT_COLUMNS: &str = "id, provider, payload, fingerprint, status, error, created_at, updated_at";

fn row_to_artist(row: &Row<'_>) -> rusqlite::Result<Artist> {
    Ok(Artist {
        id: Some(row.get(0)?),
        name: row.get(1)?,
        title_key: row.get(2)?,
        fingerprint: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn row_to_album(row: &Row<'_>) -> rusqlite::Result<Album> {
    Ok(Album {
        id: Some(row.get(0)?),
        artist_id: row.get(1)?,
        title: row.get(2)?,
        title_key: row.get(3)?,
        year: row.get(4)?,
        cover_path: row.get(5)?,
        fingerprint: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn row_to_track(row: &Row<'_>) -> rusqlite::Result<Track> {
    Ok(Track {
        id: Some(row.get(0)?),
        artist_id: row.get(1)?,
        title: row.get(2)?,
        title_key: row.get(3)?,
        duration_secs: row.get(4)?,
        fingerprint: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn row_to_movie(row: &Row<'_>) -> rusqlite::Result<Movie> {
    Ok(Movie {
        id: Some(row.get(0)?),
        title: row.get(1)?,
        title_key: row.get(2)?,
        year: row.get(3)?,
        cover_path: row.get(4)?,
        fingerprint: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn row_to_book(row: &Row<'_>) -> rusqlite::Result<Book> {
    Ok(Book {
        id: Some(row.get(0)?),
        title: row.get(1)?,
        title_key: row.get(2)?,
        author: row.get(3)?,
        author_key: row.get(4)?,
        year: row.get(5)?,
        fingerprint: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn row_to_edition(row: &Row<'_>) -> rusqlite::Result<BookEdition> {
    Ok(BookEdition {
        id: Some(row.get(0)?),
        book_id: row.get(1)?,
        isbn: row.get(2)?,
        fingerprint: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn save(&self, provider: &str, payload: &str) -> Result<EventRecord> {
        let fingerprint = payload_fingerprint(payload.as_bytes());
        let now = Utc::now();

        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO events (provider, payload, fingerprint, status, error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?5)",
            params![provider, payload, fingerprint, EventStatus::Pending.as_str(), now],
        )?;
        if inserted > 0 {
            debug!(provider, "Recorded new event");
        }

        let sql = format!("SELECT {} FROM events WHERE fingerprint = ?1", EVENT_COLUMNS);
        let record = conn.query_row(&sql, params![fingerprint], row_to_event)?;
        Ok(record)
    }

    async fn get(&self, id: i64) -> Result<Option<EventRecord>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {} FROM events WHERE id = ?1", EVENT_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![id], row_to_event)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    async fn set_status(&self, id: i64, status: EventStatus, error: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE events SET status = ?1, error = ?2, updated_at = ?3 WHERE id = ?4",
            params![status.as_str(), error, Utc::now(), id],
        )?;
        Ok(())
    }

    async fn count(&self, filter: &EventFilter, after_id: i64) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let (clause, args) = filter_clause(filter, after_id);
        let sql = format!("SELECT COUNT(*) FROM events WHERE {}", clause);
        let mut stmt = conn.prepare(&sql)?;
        let total: i64 =
            stmt.query_row(params_from_iter(args.iter().map(|a| a.as_ref())), |row| row.get(0))?;
        Ok(total as u64)
    }

    async fn page_after(
        &self,
        filter: &EventFilter,
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<EventRecord>> {
        let conn = self.conn.lock().unwrap();
        let (clause, args) = filter_clause(filter, after_id);
        let sql = format!(
            "SELECT {} FROM events WHERE {} ORDER BY id ASC LIMIT {}",
            EVENT_COLUMNS, clause, limit
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter().map(|a| a.as_ref())), row_to_event)?;
        let mut page = Vec::new();
        for row in rows {
            page.push(row?);
        }
        Ok(page)
    }
}

/// Builds the WHERE clause for the reprocess filter conjunction.
fn filter_clause(filter: &EventFilter, after_id: i64) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
    let mut clause = String::from("id > ?");
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(after_id)];

    if let Some(statuses) = &filter.statuses {
        if statuses.is_empty() {
            // An explicitly empty status set matches nothing.
            clause.push_str(" AND 0 = 1");
        } else {
            let placeholders = vec!["?"; statuses.len()].join(", ");
            clause.push_str(&format!(" AND status IN ({})", placeholders));
            args.extend(
                statuses
                    .iter()
                    .map(|s| Box::new(s.as_str()) as Box<dyn rusqlite::ToSql>),
            );
        }
    }
    if !filter.providers.is_empty() {
        let placeholders = vec!["?"; filter.providers.len()].join(", ");
        clause.push_str(&format!(" AND provider IN ({})", placeholders));
        args.extend(
            filter
                .providers
                .iter()
                .map(|p| Box::new(p.clone()) as Box<dyn rusqlite::ToSql>),
        );
    }
    (clause, args)
}

#[async_trait]
impl CatalogStore for SqliteStore {
    async fn find_external(&self, ns: IdNamespace, value: &str) -> Result<Option<ExternalId>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT entity, entity_id, namespace, value FROM external_ids
             WHERE namespace = ?1 AND value = ?2",
        )?;
        let mut rows = stmt.query_map(params![ns.as_str(), value], |row| {
            let entity_s: String = row.get(0)?;
            let namespace_s: String = row.get(2)?;
            Ok((entity_s, row.get::<_, i64>(1)?, namespace_s, row.get::<_, String>(3)?))
        })?;
        match rows.next() {
            Some(row) => {
                let (entity_s, entity_id, namespace_s, value) = row?;
                let entity =
                    EntityKind::parse(&entity_s).ok_or_else(|| text_enum_error(0, &entity_s))?;
                let namespace = IdNamespace::parse(&namespace_s)
                    .ok_or_else(|| text_enum_error(2, &namespace_s))?;
                Ok(Some(ExternalId {
                    entity,
                    entity_id,
                    namespace,
                    value,
                }))
            }
            None => Ok(None),
        }
    }

    async fn link_external(&self, link: &ExternalId) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO external_ids (entity, entity_id, namespace, value)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                link.entity.as_str(),
                link.entity_id,
                link.namespace.as_str(),
                link.value
            ],
        )?;
        if inserted > 0 {
            debug!(
                namespace = %link.namespace,
                value = %link.value,
                entity = %link.entity,
                entity_id = link.entity_id,
                "Linked external identifier"
            );
        }
        Ok(())
    }

    async fn insert_artist(&self, artist: &mut Artist) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO artists (name, title_key, fingerprint, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                artist.name,
                artist.title_key,
                artist.fingerprint,
                artist.created_at,
                artist.updated_at
            ],
        )?;
        artist.id = Some(conn.last_insert_rowid());
        Ok(())
    }

    async fn artist_by_id(&self, id: i64) -> Result<Option<Artist>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, title_key, fingerprint, created_at, updated_at
             FROM artists WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], row_to_artist)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    async fn artist_by_key(&self, title_key: &str) -> Result<Option<Artist>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, title_key, fingerprint, created_at, updated_at
             FROM artists WHERE title_key = ?1 ORDER BY id ASC LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![title_key], row_to_artist)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    async fn artist_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Artist>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, title_key, fingerprint, created_at, updated_at
             FROM artists WHERE fingerprint = ?1",
        )?;
        let mut rows = stmt.query_map(params![fingerprint], row_to_artist)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    async fn insert_album(&self, album: &mut Album) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        if !Self::parent_exists(&conn, "artists", album.artist_id)? {
            return Err(PlaylogError::MissingParent {
                kind: EntityKind::Artist,
                id: album.artist_id,
            });
        }
        conn.execute(
            "INSERT INTO albums (artist_id, title, title_key, year, cover_path, fingerprint, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                album.artist_id,
                album.title,
                album.title_key,
                album.year,
                album.cover_path,
                album.fingerprint,
                album.created_at,
                album.updated_at
            ],
        )?;
        album.id = Some(conn.last_insert_rowid());
        Ok(())
    }

    async fn album_by_id(&self, id: i64) -> Result<Option<Album>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, artist_id, title, title_key, year, cover_path, fingerprint, created_at, updated_at
             FROM albums WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], row_to_album)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    async fn albums_by_artist_and_key(
        &self,
        artist_id: i64,
        title_key: &str,
    ) -> Result<Vec<Album>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, artist_id, title, title_key, year, cover_path, fingerprint, created_at, updated_at
             FROM albums WHERE artist_id = ?1 AND title_key = ?2 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![artist_id, title_key], row_to_album)?;
        let mut albums = Vec::new();
        for row in rows {
            albums.push(row?);
        }
        Ok(albums)
    }

    async fn album_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Album>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, artist_id, title, title_key, year, cover_path, fingerprint, created_at, updated_at
             FROM albums WHERE fingerprint = ?1",
        )?;
        let mut rows = stmt.query_map(params![fingerprint], row_to_album)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    async fn set_album_year(&self, album_id: i64, year: i32) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT artist_id, title_key FROM albums WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![album_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        let Some(row) = rows.next() else {
            return Ok(());
        };
        let (artist_id, title_key) = row?;
        drop(rows);
        drop(stmt);

        let fingerprint = Album::identity_fingerprint(artist_id, &title_key, Some(year));
        conn.execute(
            "UPDATE albums SET year = ?1, fingerprint = ?2, updated_at = ?3 WHERE id = ?4",
            params![year, fingerprint, Utc::now(), album_id],
        )?;
        Ok(())
    }

    async fn set_album_cover(&self, album_id: i64, cover_path: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE albums SET cover_path = ?1, updated_at = ?2 WHERE id = ?3",
            params![cover_path, Utc::now(), album_id],
        )?;
        Ok(())
    }

    async fn albums_missing_year(&self, limit: u32) -> Result<Vec<Album>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, artist_id, title, title_key, year, cover_path, fingerprint, created_at, updated_at
             FROM albums WHERE year IS NULL ORDER BY id ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], row_to_album)?;
        let mut albums = Vec::new();
        for row in rows {
            albums.push(row?);
        }
        Ok(albums)
    }

    async fn insert_track(&self, track: &mut Track) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        if !Self::parent_exists(&conn, "artists", track.artist_id)? {
            return Err(PlaylogError::MissingParent {
                kind: EntityKind::Artist,
                id: track.artist_id,
            });
        }
        conn.execute(
            "INSERT INTO tracks (artist_id, title, title_key, duration_secs, fingerprint, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                track.artist_id,
                track.title,
                track.title_key,
                track.duration_secs,
                track.fingerprint,
                track.created_at,
                track.updated_at
            ],
        )?;
        track.id = Some(conn.last_insert_rowid());
        Ok(())
    }

    async fn track_by_id(&self, id: i64) -> Result<Option<Track>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, artist_id, title, title_key, duration_secs, fingerprint, created_at, updated_at
             FROM tracks WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], row_to_track)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    async fn tracks_by_artist_and_key(
        &self,
        artist_id: i64,
        title_key: &str,
    ) -> Result<Vec<Track>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, artist_id, title, title_key, duration_secs, fingerprint, created_at, updated_at
             FROM tracks WHERE artist_id = ?1 AND title_key = ?2 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![artist_id, title_key], row_to_track)?;
        let mut tracks = Vec::new();
        for row in rows {
            tracks.push(row?);
        }
        Ok(tracks)
    }

    async fn track_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Track>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, artist_id, title, title_key, duration_secs, fingerprint, created_at, updated_at
             FROM tracks WHERE fingerprint = ?1",
        )?;
        let mut rows = stmt.query_map(params![fingerprint], row_to_track)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    async fn set_track_duration(&self, track_id: i64, duration_secs: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE tracks SET duration_secs = ?1, updated_at = ?2 WHERE id = ?3",
            params![duration_secs, Utc::now(), track_id],
        )?;
        Ok(())
    }

    async fn links_for_album(&self, album_id: i64) -> Result<Vec<AlbumTrack>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT album_id, track_id, disc_no, track_no FROM album_tracks WHERE album_id = ?1",
        )?;
        let rows = stmt.query_map(params![album_id], |row| {
            Ok(AlbumTrack {
                album_id: row.get(0)?,
                track_id: row.get(1)?,
                disc_no: row.get(2)?,
                track_no: row.get(3)?,
            })
        })?;
        let mut links = Vec::new();
        for row in rows {
            links.push(row?);
        }
        Ok(links)
    }

    async fn insert_album_track(&self, link: &AlbumTrack) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO album_tracks (album_id, track_id, disc_no, track_no)
             VALUES (?1, ?2, ?3, ?4)",
            params![link.album_id, link.track_id, link.disc_no, link.track_no],
        )?;
        Ok(())
    }

    async fn set_link_track(
        &self,
        album_id: i64,
        disc_no: i32,
        track_no: i32,
        track_id: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE album_tracks SET track_id = ?1
             WHERE album_id = ?2 AND disc_no = ?3 AND track_no = ?4",
            params![track_id, album_id, disc_no, track_no],
        )?;
        Ok(())
    }

    async fn set_link_position(
        &self,
        album_id: i64,
        track_id: i64,
        disc_no: i32,
        track_no: i32,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE album_tracks SET disc_no = ?1, track_no = ?2
             WHERE album_id = ?3 AND track_id = ?4",
            params![disc_no, track_no, album_id, track_id],
        )?;
        Ok(())
    }

    async fn delete_link(&self, album_id: i64, track_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM album_tracks WHERE album_id = ?1 AND track_id = ?2",
            params![album_id, track_id],
        )?;
        Ok(())
    }

    async fn insert_movie(&self, movie: &mut Movie) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO movies (title, title_key, year, cover_path, fingerprint, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                movie.title,
                movie.title_key,
                movie.year,
                movie.cover_path,
                movie.fingerprint,
                movie.created_at,
                movie.updated_at
            ],
        )?;
        movie.id = Some(conn.last_insert_rowid());
        Ok(())
    }

    async fn movie_by_id(&self, id: i64) -> Result<Option<Movie>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, title, title_key, year, cover_path, fingerprint, created_at, updated_at
             FROM movies WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], row_to_movie)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    async fn movies_by_key(&self, title_key: &str) -> Result<Vec<Movie>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, title, title_key, year, cover_path, fingerprint, created_at, updated_at
             FROM movies WHERE title_key = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![title_key], row_to_movie)?;
        let mut movies = Vec::new();
        for row in rows {
            movies.push(row?);
        }
        Ok(movies)
    }

    async fn movie_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Movie>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, title, title_key, year, cover_path, fingerprint, created_at, updated_at
             FROM movies WHERE fingerprint = ?1",
        )?;
        let mut rows = stmt.query_map(params![fingerprint], row_to_movie)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    async fn set_movie_year(&self, movie_id: i64, year: i32) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT title_key FROM movies WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![movie_id], |row| row.get::<_, String>(0))?;
        let Some(row) = rows.next() else {
            return Ok(());
        };
        let title_key = row?;
        drop(rows);
        drop(stmt);

        let fingerprint = Movie::identity_fingerprint(&title_key, Some(year));
        conn.execute(
            "UPDATE movies SET year = ?1, fingerprint = ?2, updated_at = ?3 WHERE id = ?4",
            params![year, fingerprint, Utc::now(), movie_id],
        )?;
        Ok(())
    }

    async fn set_movie_cover(&self, movie_id: i64, cover_path: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE movies SET cover_path = ?1, updated_at = ?2 WHERE id = ?3",
            params![cover_path, Utc::now(), movie_id],
        )?;
        Ok(())
    }

    async fn insert_book(&self, book: &mut Book) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO books (title, title_key, author, author_key, year, fingerprint, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                book.title,
                book.title_key,
                book.author,
                book.author_key,
                book.year,
                book.fingerprint,
                book.created_at,
                book.updated_at
            ],
        )?;
        book.id = Some(conn.last_insert_rowid());
        Ok(())
    }

    async fn book_by_id(&self, id: i64) -> Result<Option<Book>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, title, title_key, author, author_key, year, fingerprint, created_at, updated_at
             FROM books WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], row_to_book)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    async fn book_by_keys(&self, title_key: &str, author_key: &str) -> Result<Option<Book>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, title, title_key, author, author_key, year, fingerprint, created_at, updated_at
             FROM books WHERE title_key = ?1 AND author_key = ?2",
        )?;
        let mut rows = stmt.query_map(params![title_key, author_key], row_to_book)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    async fn book_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Book>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, title, title_key, author, author_key, year, fingerprint, created_at, updated_at
             FROM books WHERE fingerprint = ?1",
        )?;
        let mut rows = stmt.query_map(params![fingerprint], row_to_book)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    async fn set_book_year(&self, book_id: i64, year: i32) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE books SET year = ?1, updated_at = ?2 WHERE id = ?3",
            params![year, Utc::now(), book_id],
        )?;
        Ok(())
    }

    async fn insert_book_edition(&self, edition: &mut BookEdition) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        if !Self::parent_exists(&conn, "books", edition.book_id)? {
            return Err(PlaylogError::MissingParent {
                kind: EntityKind::Book,
                id: edition.book_id,
            });
        }
        conn.execute(
            "INSERT INTO book_editions (book_id, isbn, fingerprint, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                edition.book_id,
                edition.isbn,
                edition.fingerprint,
                edition.created_at,
                edition.updated_at
            ],
        )?;
        edition.id = Some(conn.last_insert_rowid());
        Ok(())
    }

    async fn edition_by_isbn(&self, isbn: &str) -> Result<Option<BookEdition>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, book_id, isbn, fingerprint, created_at, updated_at
             FROM book_editions WHERE isbn = ?1",
        )?;
        let mut rows = stmt.query_map(params![isbn], row_to_edition)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    async fn stats(&self) -> Result<CatalogStats> {
        let conn = self.conn.lock().unwrap();
        let count = |table: &str| -> Result<u64> {
            let sql = format!("SELECT COUNT(*) FROM {}", table);
            let n: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
            Ok(n as u64)
        };
        Ok(CatalogStats {
            artists: count("artists")?,
            albums: count("albums")?,
            tracks: count("tracks")?,
            movies: count("movies")?,
            books: count("books")?,
            book_editions: count("book_editions")?,
            external_ids: count("external_ids")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_deduplicates_and_preserves_status() {
        let store = SqliteStore::open_in_memory().unwrap();
        let first = store.save("spotify", r#"{"x":1}"#).await.unwrap();
        assert_eq!(first.status, EventStatus::Pending);

        store
            .set_status(first.id, EventStatus::Failed, Some("boom"))
            .await
            .unwrap();
        let second = store.save("spotify", r#"{"x":1}"#).await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.status, EventStatus::Failed);
        assert_eq!(second.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn duplicate_album_identity_is_a_conflict() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut artist = Artist::new("Can");
        store.insert_artist(&mut artist).await.unwrap();
        let artist_id = artist.id.unwrap();

        let mut a = Album::new(artist_id, "Future Days", Some(1973));
        store.insert_album(&mut a).await.unwrap();

        let mut b = Album::new(artist_id, "Future Days", Some(1973));
        let err = store.insert_album(&mut b).await.unwrap_err();
        assert!(err.conflict_constraint().is_some(), "got {err:?}");
    }

    #[tokio::test]
    async fn promotion_into_occupied_triple_conflicts() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut artist = Artist::new("Neu");
        store.insert_artist(&mut artist).await.unwrap();
        let artist_id = artist.id.unwrap();

        let mut dated = Album::new(artist_id, "Neu 2", Some(1973));
        store.insert_album(&mut dated).await.unwrap();
        let mut placeholder = Album::new(artist_id, "Neu 2", None);
        store.insert_album(&mut placeholder).await.unwrap();

        let err = store
            .set_album_year(placeholder.id.unwrap(), 1973)
            .await
            .unwrap_err();
        let constraint = err.conflict_constraint().map(str::to_string);
        assert!(constraint.is_some(), "expected conflict, got {err:?}");
        assert!(constraint.as_deref().map(|c| c.starts_with("albums.")).unwrap_or(false));
    }

    #[tokio::test]
    async fn filter_paging_orders_by_id() {
        let store = SqliteStore::open_in_memory().unwrap();
        for i in 0..5 {
            store.save("plex", &format!(r#"{{"n":{i}}}"#)).await.unwrap();
        }
        let filter = EventFilter::default();
        let page = store.page_after(&filter, 2, 10).await.unwrap();
        let ids: Vec<i64> = page.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        assert_eq!(store.count(&filter, 2).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn external_ids_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut artist = Artist::new("Broadcast");
        store.insert_artist(&mut artist).await.unwrap();
        let link = ExternalId {
            entity: EntityKind::Artist,
            entity_id: artist.id.unwrap(),
            namespace: IdNamespace::MusicBrainz,
            value: "mbid-123".into(),
        };
        store.link_external(&link).await.unwrap();
        // Second link with same key is a silent no-op.
        store.link_external(&link).await.unwrap();

        let found = store
            .find_external(IdNamespace::MusicBrainz, "mbid-123")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.entity_id, artist.id.unwrap());
        assert_eq!(found.entity, EntityKind::Artist);
    }
}
