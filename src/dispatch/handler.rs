use async_trait::async_trait;

use crate::error::Result;

/// Domain outcome of handling one event. Anything that is not one of these
/// three is signaled by returning an error, never by a fourth implicit
/// state; errors mark the event FAILED, these do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// The payload was applied to the catalog.
    Success,
    /// Seen and intentionally producing no side effect (e.g. a watch event
    /// for a media type we do not track).
    Ignored,
    /// The payload shape is not one this handler understands.
    Unsupported,
}

/// Contract every provider handler conforms to. Handlers own payload
/// parsing and drive the canonicalizer (and, for remote providers, the
/// resilient client) internally.
#[async_trait]
pub trait ProviderHandler: Send + Sync {
    /// Provider tag this handler is registered under.
    fn provider(&self) -> &'static str;

    async fn dispatch(&self, payload: &str, event_id: Option<i64>) -> Result<DispatchResult>;
}
