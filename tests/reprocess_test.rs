use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;

use playlog::dispatch::{
    DispatchEngine, DispatchResult, ProviderHandler, ReprocessOutcome, ReprocessRequest,
};
use playlog::domain::EventStatus;
use playlog::error::PlaylogError;
use playlog::storage::{EventFilter, EventStore, InMemoryStore};

/// Fails on payloads containing the word "poison", succeeds otherwise.
struct PoisonAwareHandler;

#[async_trait]
impl ProviderHandler for PoisonAwareHandler {
    fn provider(&self) -> &'static str {
        "batch"
    }

    async fn dispatch(
        &self,
        payload: &str,
        _event_id: Option<i64>,
    ) -> playlog::error::Result<DispatchResult> {
        if payload.contains("poison") {
            Err(PlaylogError::Provider {
                message: "poisoned payload".to_string(),
            })
        } else {
            Ok(DispatchResult::Success)
        }
    }
}

fn engine(store: Arc<InMemoryStore>) -> Arc<DispatchEngine> {
    Arc::new(DispatchEngine::new(
        store as Arc<dyn EventStore>,
        vec![Arc::new(PoisonAwareHandler)],
        4,
    ))
}

#[tokio::test]
async fn one_bad_event_does_not_stall_the_batch() -> Result<()> {
    let store = Arc::new(InMemoryStore::new());
    let engine = engine(store.clone());

    let mut ids = Vec::new();
    for i in 0..10 {
        let payload = if i == 4 {
            format!("{{\"i\":{i},\"poison\":true}}")
        } else {
            format!("{{\"i\":{i}}}")
        };
        ids.push(store.save("batch", &payload).await?.id);
    }

    let req = ReprocessRequest {
        all: true,
        page_size: 3,
        ..Default::default()
    };
    let outcome = engine.reprocess(&req).await?;
    assert_eq!(outcome, ReprocessOutcome::Completed { processed: 10 });

    let mut success = 0;
    let mut failed = 0;
    for id in ids {
        match store.get(id).await?.unwrap().status {
            EventStatus::Success => success += 1,
            EventStatus::Failed => failed += 1,
            EventStatus::Pending => panic!("event {id} was skipped"),
        }
    }
    assert_eq!(success, 9);
    assert_eq!(failed, 1);
    Ok(())
}

#[tokio::test]
async fn count_math_and_full_drain_at_page_boundaries() -> Result<()> {
    let store = Arc::new(InMemoryStore::new());
    let engine = engine(store.clone());

    for i in 0..2501 {
        store.save("batch", &format!("{{\"i\":{i}}}")).await?;
    }

    let req = ReprocessRequest {
        all: true,
        page_size: 1000,
        ..Default::default()
    };
    let count = engine.count(&req).await?;
    assert_eq!(count.total, 2501);
    assert_eq!(count.pages, 3);
    assert_eq!(count.page_size, 1000);

    let outcome = engine.reprocess(&req).await?;
    assert_eq!(outcome, ReprocessOutcome::Completed { processed: 2501 });

    // Nothing left pending.
    let pending = store
        .count(
            &EventFilter {
                statuses: Some(vec![EventStatus::Pending]),
                providers: Vec::new(),
            },
            0,
        )
        .await?;
    assert_eq!(pending, 0);
    Ok(())
}

#[tokio::test]
async fn status_filter_pages_do_not_shift_as_statuses_flip() -> Result<()> {
    let store = Arc::new(InMemoryStore::new());
    let engine = engine(store.clone());

    // Everything starts FAILED; reprocessing flips rows to SUCCESS while
    // later pages are still being fetched against the FAILED filter.
    let mut ids = Vec::new();
    for i in 0..10 {
        let id = store.save("batch", &format!("{{\"i\":{i}}}")).await?.id;
        store.set_status(id, EventStatus::Failed, Some("old")).await?;
        ids.push(id);
    }

    let req = ReprocessRequest {
        page_size: 2,
        ..Default::default()
    };
    let outcome = engine.reprocess(&req).await?;
    assert_eq!(outcome, ReprocessOutcome::Completed { processed: 10 });

    for id in ids {
        assert_eq!(store.get(id).await?.unwrap().status, EventStatus::Success);
    }
    Ok(())
}

#[tokio::test]
async fn cursor_respects_provider_filter_and_lower_bound() -> Result<()> {
    let store = Arc::new(InMemoryStore::new());
    let engine = engine(store.clone());

    let a = store.save("batch", "{\"n\":1}").await?.id;
    let _other = store.save("elsewhere", "{\"n\":2}").await?.id;
    let b = store.save("batch", "{\"n\":3}").await?.id;

    let req = ReprocessRequest {
        all: true,
        providers: vec!["batch".to_string()],
        from_id_exclusive: a,
        ..Default::default()
    };
    assert_eq!(engine.count(&req).await?.total, 1);

    let outcome = engine.reprocess(&req).await?;
    assert_eq!(outcome, ReprocessOutcome::Completed { processed: 1 });

    // The event before the cursor and the filtered-out provider stay put.
    assert_eq!(store.get(a).await?.unwrap().status, EventStatus::Pending);
    assert_eq!(store.get(b).await?.unwrap().status, EventStatus::Success);
    Ok(())
}

/// Handler that parks until the test releases it, to hold a reprocess run
/// open while a second one is attempted.
struct ParkedHandler {
    release: Arc<Semaphore>,
}

#[async_trait]
impl ProviderHandler for ParkedHandler {
    fn provider(&self) -> &'static str {
        "slow"
    }

    async fn dispatch(
        &self,
        _payload: &str,
        _event_id: Option<i64>,
    ) -> playlog::error::Result<DispatchResult> {
        let _permit = self.release.acquire().await.expect("release semaphore closed");
        Ok(DispatchResult::Success)
    }
}

#[tokio::test]
async fn second_concurrent_reprocess_returns_already_running() -> Result<()> {
    let store = Arc::new(InMemoryStore::new());
    let release = Arc::new(Semaphore::new(0));
    let engine = Arc::new(DispatchEngine::new(
        store.clone() as Arc<dyn EventStore>,
        vec![Arc::new(ParkedHandler {
            release: release.clone(),
        })],
        4,
    ));

    store.save("slow", "{}").await?;

    let req = ReprocessRequest {
        all: true,
        ..Default::default()
    };
    let first = {
        let engine = engine.clone();
        let req = req.clone();
        tokio::spawn(async move { engine.reprocess(&req).await })
    };

    // Let the first run claim the guard and park inside the handler.
    tokio::task::yield_now().await;
    let second = engine.reprocess(&req).await?;
    assert_eq!(second, ReprocessOutcome::AlreadyRunning);

    release.add_permits(1);
    let first = first.await??;
    assert_eq!(first, ReprocessOutcome::Completed { processed: 1 });

    // Guard released: a fresh run may start.
    release.add_permits(1);
    let third = engine.reprocess(&req).await?;
    assert_eq!(third, ReprocessOutcome::Completed { processed: 1 });
    Ok(())
}
