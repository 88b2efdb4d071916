use tracing::{debug, info, instrument};

use super::{is_race, select_by_year, Canonicalizer};
use crate::domain::*;
use crate::error::{PlaylogError, Result};
use crate::fingerprint::title_key;

/// Movie canonicalization. Same resolution and year-promotion rules as
/// albums, with (title key, year) as the structural identity.
impl Canonicalizer {
    #[instrument(skip(self, ids))]
    pub async fn ensure_movie(
        &self,
        title: &str,
        year: Option<i32>,
        ids: &[ExternalRef],
    ) -> Result<Movie> {
        match self.try_resolve_movie(title, year, ids).await {
            Ok(movie) => self.finish_movie(movie, ids).await,
            Err(e) if is_race(&e, "movies.") => {
                debug!(title, "Movie identity race, re-resolving");
                let movie = self.try_resolve_movie(title, year, ids).await?;
                self.finish_movie(movie, ids).await
            }
            Err(e) => Err(e),
        }
    }

    async fn finish_movie(&self, movie: Movie, ids: &[ExternalRef]) -> Result<Movie> {
        let id = movie.id.ok_or(PlaylogError::MissingParent {
            kind: EntityKind::Movie,
            id: 0,
        })?;
        self.link_all(EntityKind::Movie, id, ids).await?;
        Ok(movie)
    }

    async fn try_resolve_movie(
        &self,
        title: &str,
        year: Option<i32>,
        ids: &[ExternalRef],
    ) -> Result<Movie> {
        if let Some(entity_id) = self.resolve_external(EntityKind::Movie, ids).await? {
            if let Some(movie) = self.catalog().movie_by_id(entity_id).await? {
                return self.maybe_promote_movie(movie, year).await;
            }
        }

        let key = title_key(title);
        let rows = self.catalog().movies_by_key(&key).await?;
        if let Some(hit) = select_by_year(&rows, year, |m: &Movie| m.year, |m| m.id) {
            return self.maybe_promote_movie(hit.clone(), year).await;
        }

        let fingerprint = Movie::identity_fingerprint(&key, year);
        if let Some(movie) = self.catalog().movie_by_fingerprint(&fingerprint).await? {
            return self.maybe_promote_movie(movie, year).await;
        }

        let mut fresh = Movie::new(title, year);
        self.catalog().insert_movie(&mut fresh).await?;
        info!(movie_id = fresh.id, title, year, "Created movie");
        Ok(fresh)
    }

    /// Monotonic cover fill, as for albums.
    pub async fn fill_movie_cover(&self, movie: &Movie, cover_path: &str) -> Result<Movie> {
        if movie.cover_path.is_some() || cover_path.is_empty() {
            return Ok(movie.clone());
        }
        let id = movie.id.ok_or(PlaylogError::MissingParent {
            kind: EntityKind::Movie,
            id: 0,
        })?;
        self.catalog().set_movie_cover(id, cover_path).await?;
        debug!(movie_id = id, "Filled movie cover path");
        let mut updated = movie.clone();
        updated.cover_path = Some(cover_path.to_string());
        Ok(updated)
    }

    async fn maybe_promote_movie(&self, movie: Movie, year: Option<i32>) -> Result<Movie> {
        match (movie.year, year) {
            (None, Some(y)) => self.promote_movie_year(&movie, y).await,
            _ => Ok(movie),
        }
    }

    async fn promote_movie_year(&self, movie: &Movie, year: i32) -> Result<Movie> {
        let id = movie.id.ok_or(PlaylogError::MissingParent {
            kind: EntityKind::Movie,
            id: 0,
        })?;
        match self.catalog().set_movie_year(id, year).await {
            Ok(()) => {
                info!(movie_id = id, year, "Promoted movie year");
                let mut updated = movie.clone();
                updated.year = Some(year);
                updated.fingerprint = Movie::identity_fingerprint(&movie.title_key, Some(year));
                Ok(updated)
            }
            Err(e) if is_race(&e, "movies.") => {
                debug!(movie_id = id, year, "Lost year promotion race, adopting winner");
                let rows = self.catalog().movies_by_key(&movie.title_key).await?;
                rows.into_iter().find(|m| m.year == Some(year)).ok_or(e)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn movie_year_promotion_converges() {
        let canon = Canonicalizer::new(Arc::new(InMemoryStore::new()));
        let placeholder = canon.ensure_movie("Stalker", None, &[]).await.unwrap();
        assert_eq!(placeholder.year, None);

        let dated = canon.ensure_movie("Stalker", Some(1979), &[]).await.unwrap();
        assert_eq!(dated.id, placeholder.id);
        assert_eq!(dated.year, Some(1979));

        let again = canon.ensure_movie("Stalker", None, &[]).await.unwrap();
        assert_eq!(again.id, placeholder.id);
        assert_eq!(again.year, Some(1979));
    }

    #[tokio::test]
    async fn distinct_years_stay_distinct() {
        let canon = Canonicalizer::new(Arc::new(InMemoryStore::new()));
        let original = canon.ensure_movie("Solaris", Some(1972), &[]).await.unwrap();
        let remake = canon.ensure_movie("Solaris", Some(2002), &[]).await.unwrap();
        assert_ne!(original.id, remake.id);
    }
}
