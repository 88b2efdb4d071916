use tracing::{debug, info, instrument};

use super::{is_race, Canonicalizer};
use crate::domain::*;
use crate::error::{PlaylogError, Result};
use crate::fingerprint::title_key;

/// Book and book-edition canonicalization. Books are identified by
/// (title key, author key); editions hang off a book and are keyed by ISBN
/// through the isbn10/isbn13 pseudo-namespaces.
impl Canonicalizer {
    #[instrument(skip(self, ids))]
    pub async fn ensure_book(
        &self,
        title: &str,
        author: &str,
        year: Option<i32>,
        ids: &[ExternalRef],
    ) -> Result<Book> {
        match self.try_resolve_book(title, author, year, ids).await {
            Ok(book) => self.finish_book(book, ids).await,
            Err(e) if is_race(&e, "books.") => {
                debug!(title, "Book identity race, re-resolving");
                let book = self.try_resolve_book(title, author, year, ids).await?;
                self.finish_book(book, ids).await
            }
            Err(e) => Err(e),
        }
    }

    async fn finish_book(&self, book: Book, ids: &[ExternalRef]) -> Result<Book> {
        let id = book.id.ok_or(PlaylogError::MissingParent {
            kind: EntityKind::Book,
            id: 0,
        })?;
        self.link_all(EntityKind::Book, id, ids).await?;
        Ok(book)
    }

    async fn try_resolve_book(
        &self,
        title: &str,
        author: &str,
        year: Option<i32>,
        ids: &[ExternalRef],
    ) -> Result<Book> {
        if let Some(entity_id) = self.resolve_external(EntityKind::Book, ids).await? {
            if let Some(book) = self.catalog().book_by_id(entity_id).await? {
                return self.maybe_fill_book_year(book, year).await;
            }
        }

        let key = title_key(title);
        let author_key = title_key(author);
        if let Some(book) = self.catalog().book_by_keys(&key, &author_key).await? {
            return self.maybe_fill_book_year(book, year).await;
        }

        let candidate = Book::new(title, author, year);
        if let Some(book) = self.catalog().book_by_fingerprint(&candidate.fingerprint).await? {
            return self.maybe_fill_book_year(book, year).await;
        }

        let mut fresh = candidate;
        self.catalog().insert_book(&mut fresh).await?;
        info!(book_id = fresh.id, title, author, "Created book");
        Ok(fresh)
    }

    async fn maybe_fill_book_year(&self, book: Book, year: Option<i32>) -> Result<Book> {
        match (book.year, year) {
            (None, Some(y)) => {
                let id = book.id.ok_or(PlaylogError::MissingParent {
                    kind: EntityKind::Book,
                    id: 0,
                })?;
                self.catalog().set_book_year(id, y).await?;
                let mut updated = book;
                updated.year = Some(y);
                Ok(updated)
            }
            _ => Ok(book),
        }
    }

    /// Resolve or create the edition of `book` carrying `isbn`. Dashes and
    /// spaces in the ISBN are insignificant; the digit count selects the
    /// pseudo-namespace the identifier is linked under.
    #[instrument(skip(self, book), fields(book_id = ?book.id))]
    pub async fn ensure_book_edition(&self, book: &Book, isbn: &str) -> Result<BookEdition> {
        let book_id = book.id.ok_or(PlaylogError::MissingParent {
            kind: EntityKind::Book,
            id: 0,
        })?;
        let isbn = normalize_isbn(isbn);
        let isbn_ref = ExternalRef::new(isbn_namespace(&isbn), isbn.clone());

        match self.try_resolve_edition(book_id, &isbn, &isbn_ref).await {
            Ok(edition) => self.finish_edition(edition, &isbn_ref).await,
            Err(e) if is_race(&e, "book_editions.") => {
                debug!(isbn = %isbn, "Edition identity race, re-resolving");
                let edition = self.try_resolve_edition(book_id, &isbn, &isbn_ref).await?;
                self.finish_edition(edition, &isbn_ref).await
            }
            Err(e) => Err(e),
        }
    }

    async fn finish_edition(
        &self,
        edition: BookEdition,
        isbn_ref: &ExternalRef,
    ) -> Result<BookEdition> {
        let id = edition.id.ok_or(PlaylogError::MissingParent {
            kind: EntityKind::BookEdition,
            id: 0,
        })?;
        self.link_all(EntityKind::BookEdition, id, std::slice::from_ref(isbn_ref))
            .await?;
        Ok(edition)
    }

    async fn try_resolve_edition(
        &self,
        book_id: i64,
        isbn: &str,
        isbn_ref: &ExternalRef,
    ) -> Result<BookEdition> {
        if let Some(entity_id) = self
            .resolve_external(EntityKind::BookEdition, std::slice::from_ref(isbn_ref))
            .await?
        {
            if let Some(edition) = self.catalog().edition_by_isbn(isbn).await? {
                if edition.id == Some(entity_id) {
                    return Ok(edition);
                }
            }
        }

        if let Some(edition) = self.catalog().edition_by_isbn(isbn).await? {
            return Ok(edition);
        }

        let mut fresh = BookEdition::new(book_id, isbn);
        self.catalog().insert_book_edition(&mut fresh).await?;
        info!(edition_id = fresh.id, isbn = %isbn, "Created book edition");
        Ok(fresh)
    }
}

fn normalize_isbn(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

fn isbn_namespace(isbn: &str) -> IdNamespace {
    if isbn.len() == 13 {
        IdNamespace::Isbn13
    } else {
        IdNamespace::Isbn10
    }
}
