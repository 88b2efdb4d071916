use std::sync::Arc;

use crate::canonical::Canonicalizer;
use crate::dispatch::ProviderHandler;

pub mod bookshelf;
pub mod musicbrainz;
pub mod plex;
pub mod spotify;

pub use bookshelf::BookshelfHandler;
pub use musicbrainz::{AlbumYearEnricher, EnrichOutcome, MusicBrainzClient};
pub use plex::PlexHandler;
pub use spotify::{ImportOutcome, SpotifyHandler, SpotifyImporter};

/// The fixed handler set, one per supported provider tag. Built once at
/// startup and handed to the dispatch engine's constructor.
pub fn build_handlers(canon: Arc<Canonicalizer>) -> Vec<Arc<dyn ProviderHandler>> {
    vec![
        Arc::new(PlexHandler::new(canon.clone())),
        Arc::new(SpotifyHandler::new(canon.clone())),
        Arc::new(BookshelfHandler::new(canon)),
    ]
}
