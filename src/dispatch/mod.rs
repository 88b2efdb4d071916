use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::constants::ERROR_MESSAGE_MAX_LEN;
use crate::domain::{EventStatus, EventRecord};
use crate::error::Result;
use crate::single_flight::SingleFlight;
use crate::storage::{EventFilter, EventStore};

pub mod handler;

pub use handler::{DispatchResult, ProviderHandler};

pub const DEFAULT_PAGE_SIZE: u32 = 1000;
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Filter shape consumed by the bulk reprocess operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReprocessRequest {
    /// Bypass the status filter entirely.
    pub all: bool,
    /// Statuses to match; ignored when `all` is set.
    pub statuses: Vec<EventStatus>,
    /// Provider allow-list; empty means no provider filter.
    pub providers: Vec<String>,
    pub page_size: u32,
    /// Exclusive lower-bound cursor on event id.
    pub from_id_exclusive: i64,
}

impl Default for ReprocessRequest {
    fn default() -> Self {
        Self {
            all: false,
            statuses: vec![EventStatus::Failed],
            providers: Vec::new(),
            page_size: DEFAULT_PAGE_SIZE,
            from_id_exclusive: 0,
        }
    }
}

impl ReprocessRequest {
    pub fn effective_page_size(&self) -> u32 {
        self.page_size.clamp(1, MAX_PAGE_SIZE)
    }

    fn filter(&self) -> EventFilter {
        EventFilter {
            statuses: if self.all {
                None
            } else {
                Some(self.statuses.clone())
            },
            providers: self.providers.clone(),
        }
    }
}

/// Count response for a reprocess filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReprocessCount {
    pub total: u64,
    pub page_size: u32,
    pub pages: u64,
    pub from_id_exclusive: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReprocessOutcome {
    /// Another reprocess run holds the single-flight guard.
    AlreadyRunning,
    Completed { processed: u64 },
}

/// Drives pending events through their provider handler and records the
/// outcome. One status write per dispatch attempt, always after the handler
/// returns or errors; a handler failure is persisted, never re-raised.
pub struct DispatchEngine {
    events: Arc<dyn EventStore>,
    handlers: HashMap<String, Arc<dyn ProviderHandler>>,
    async_slots: Arc<Semaphore>,
    reprocess_flight: SingleFlight,
}

impl std::fmt::Debug for DispatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchEngine")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl DispatchEngine {
    /// The handler set is fixed at construction; routing is a plain map
    /// from provider tag to handler.
    pub fn new(
        events: Arc<dyn EventStore>,
        handlers: Vec<Arc<dyn ProviderHandler>>,
        async_workers: usize,
    ) -> Self {
        let handlers = handlers
            .into_iter()
            .map(|h| (h.provider().to_string(), h))
            .collect();
        Self {
            events,
            handlers,
            async_slots: Arc::new(Semaphore::new(async_workers.max(1))),
            reprocess_flight: SingleFlight::new(),
        }
    }

    /// Dispatch one event and persist the outcome. An unknown id returns
    /// silently; an unregistered provider is a data problem recorded on the
    /// event, not a programming error. Only a failing store write escapes.
    #[instrument(skip(self))]
    pub async fn execute_sync(&self, event_id: i64) -> Result<()> {
        let Some(event) = self.events.get(event_id).await? else {
            debug!(event_id, "Event not found, nothing to dispatch");
            return Ok(());
        };

        let Some(handler) = self.handlers.get(&event.provider) else {
            let message = format!("Unsupported provider: {}", event.provider);
            warn!(event_id, provider = %event.provider, "No handler registered");
            counter!("playlog_dispatch_total", "outcome" => "unsupported_provider").increment(1);
            self.events
                .set_status(event_id, EventStatus::Failed, Some(&truncate_error(&message)))
                .await?;
            return Ok(());
        };

        match handler.dispatch(&event.payload, Some(event_id)).await {
            Ok(outcome) => {
                debug!(event_id, ?outcome, "Handler finished");
                counter!("playlog_dispatch_total", "outcome" => "success").increment(1);
                self.events
                    .set_status(event_id, EventStatus::Success, None)
                    .await
            }
            Err(e) => {
                warn!(event_id, provider = %event.provider, error = %e, "Handler failed");
                counter!("playlog_dispatch_total", "outcome" => "failed").increment(1);
                self.events
                    .set_status(event_id, EventStatus::Failed, Some(&truncate_error(&e.to_string())))
                    .await
            }
        }
    }

    /// Same semantics as `execute_sync`, on a detached task. The submitter
    /// gets nothing back; the outcome is only observable via the stored
    /// status. Concurrency is bounded by the engine's worker slots.
    pub fn execute_async(self: &Arc<Self>, event_id: i64) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = engine
                .async_slots
                .clone()
                .acquire_owned()
                .await
                .expect("dispatch semaphore closed");
            if let Err(e) = engine.execute_sync(event_id).await {
                error!(event_id, error = %e, "Async dispatch could not record outcome");
            }
        });
    }

    pub async fn count(&self, req: &ReprocessRequest) -> Result<ReprocessCount> {
        let page_size = req.effective_page_size();
        let total = self.events.count(&req.filter(), req.from_id_exclusive).await?;
        Ok(ReprocessCount {
            total,
            page_size,
            pages: total.div_ceil(page_size as u64),
            from_id_exclusive: req.from_id_exclusive,
        })
    }

    /// Re-dispatch every matching event, paging by id cursor so rows whose
    /// status flips mid-run cannot shift later pages. The cursor advances
    /// past each event regardless of outcome: every event is visited once,
    /// none can stall the run. Single-flight guarded per engine instance.
    #[instrument(skip(self, req))]
    pub async fn reprocess(&self, req: &ReprocessRequest) -> Result<ReprocessOutcome> {
        let Some(_guard) = self.reprocess_flight.try_begin() else {
            warn!("Reprocess already running, skipping");
            return Ok(ReprocessOutcome::AlreadyRunning);
        };

        let run_id = Uuid::new_v4();
        let filter = req.filter();
        let page_size = req.effective_page_size();
        let mut cursor = req.from_id_exclusive;
        let mut processed = 0u64;
        let mut pages = 0u64;

        info!(run_id = %run_id, from_id = cursor, page_size, "Starting reprocess run");

        loop {
            let page = self.events.page_after(&filter, cursor, page_size).await?;
            if page.is_empty() {
                break;
            }
            pages += 1;
            for event in &page {
                self.execute_sync(event.id).await?;
                cursor = event.id;
                processed += 1;
            }
            info!(run_id = %run_id, page = pages, processed, cursor, "Reprocessed page");
        }

        info!(run_id = %run_id, processed, pages, "Finished reprocess run");
        Ok(ReprocessOutcome::Completed { processed })
    }

    /// Manual retry of one event: reset to PENDING (clearing the stored
    /// error), then dispatch synchronously.
    #[instrument(skip(self))]
    pub async fn reprocess_by_id(&self, event_id: i64) -> Result<()> {
        self.events
            .set_status(event_id, EventStatus::Pending, None)
            .await?;
        self.execute_sync(event_id).await
    }

    pub async fn event(&self, event_id: i64) -> Result<Option<EventRecord>> {
        self.events.get(event_id).await
    }
}

fn truncate_error(message: &str) -> String {
    if message.chars().count() <= ERROR_MESSAGE_MAX_LEN {
        message.to_string()
    } else {
        message.chars().take(ERROR_MESSAGE_MAX_LEN).collect()
    }
}
