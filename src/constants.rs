/// Provider tag constants to ensure consistency across the codebase.
/// These tags key the handler registry and the `provider` column on events.

pub const PLEX_PROVIDER: &str = "plex";
pub const SPOTIFY_PROVIDER: &str = "spotify";
pub const BOOKSHELF_PROVIDER: &str = "bookshelf";

/// Stored error messages are clipped to fit the event record's error column.
pub const ERROR_MESSAGE_MAX_LEN: usize = 255;

/// Get all provider tags with a registered handler
pub fn supported_providers() -> Vec<&'static str> {
    vec![PLEX_PROVIDER, SPOTIFY_PROVIDER, BOOKSHELF_PROVIDER]
}
