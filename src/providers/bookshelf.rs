use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::canonical::Canonicalizer;
use crate::constants::BOOKSHELF_PROVIDER;
use crate::dispatch::{DispatchResult, ProviderHandler};
use crate::domain::{ExternalRef, IdNamespace};
use crate::error::Result;

/// Book-tracker webhook payload.
#[derive(Debug, Deserialize)]
struct BookshelfEvent {
    event: String,
    book: Option<BookshelfBook>,
}

#[derive(Debug, Deserialize)]
struct BookshelfBook {
    title: String,
    author: String,
    year: Option<i32>,
    isbn13: Option<String>,
    isbn10: Option<String>,
    openlibrary_id: Option<String>,
}

/// Handles reading-activity events: a finished book lands in the catalog
/// with its editions; progress-style events are seen but not tracked.
pub struct BookshelfHandler {
    canon: Arc<Canonicalizer>,
}

impl BookshelfHandler {
    pub fn new(canon: Arc<Canonicalizer>) -> Self {
        Self { canon }
    }
}

#[async_trait]
impl ProviderHandler for BookshelfHandler {
    fn provider(&self) -> &'static str {
        BOOKSHELF_PROVIDER
    }

    #[instrument(skip(self, payload))]
    async fn dispatch(&self, payload: &str, _event_id: Option<i64>) -> Result<DispatchResult> {
        let event: BookshelfEvent = serde_json::from_str(payload)?;

        match event.event.as_str() {
            "finished" => {}
            "started" | "progress" | "rated" => {
                debug!(event = %event.event, "Reading-progress event, nothing to apply");
                return Ok(DispatchResult::Ignored);
            }
            _ => return Ok(DispatchResult::Unsupported),
        }
        let Some(payload_book) = &event.book else {
            return Ok(DispatchResult::Unsupported);
        };

        let mut refs = Vec::new();
        if let Some(ol) = &payload_book.openlibrary_id {
            refs.push(ExternalRef::new(IdNamespace::OpenLibrary, ol.clone()));
        }

        let book = self
            .canon
            .ensure_book(&payload_book.title, &payload_book.author, payload_book.year, &refs)
            .await?;

        for isbn in [&payload_book.isbn13, &payload_book.isbn10].into_iter().flatten() {
            self.canon.ensure_book_edition(&book, isbn).await?;
        }

        Ok(DispatchResult::Success)
    }
}
