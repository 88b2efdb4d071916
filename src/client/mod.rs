use rand::Rng;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

pub mod transport;

pub use transport::{HttpResponse, HttpTransport, ReqwestTransport};

/// Terminal classification of one logical outbound call. Callers branch on
/// this: a NotFound from a lookup is "no data", not "system down", and only
/// Retryable ever triggered backoff on the way here.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not found: {url}")]
    NotFound { url: String },

    #[error("retryable failure after {attempts} attempts: {message}")]
    Retryable { attempts: u32, message: String },

    #[error("request failed: {message}")]
    Fatal { status: Option<u16>, message: String },
}

/// Retry tuning for one provider client.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retryable_statuses: Vec<u16>,
    /// First-attempt backoff; doubles per attempt.
    pub base_backoff: Duration,
    /// Upper bound on the random jitter added to each computed backoff.
    pub max_jitter: Duration,
    /// Assumed Retry-After when a retryable response carries no header.
    pub default_retry_after: Option<Duration>,
    /// Whether transport failures (timeouts, resets) are retried or
    /// propagated unchanged.
    pub retry_transport_errors: bool,
}

impl RetryPolicy {
    /// Full backoff ladder against the usual transient statuses.
    pub fn standard() -> Self {
        Self {
            max_attempts: 3,
            retryable_statuses: vec![429, 502, 503, 504],
            base_backoff: Duration::from_secs(1),
            max_jitter: Duration::from_millis(350),
            default_retry_after: None,
            retry_transport_errors: true,
        }
    }

    /// Minimal policy for APIs that only ever push back with 429: honor
    /// Retry-After (or a small default), propagate everything else as-is.
    pub fn rate_limit_only() -> Self {
        Self {
            max_attempts: 3,
            retryable_statuses: vec![429],
            base_backoff: Duration::from_secs(1),
            max_jitter: Duration::from_millis(350),
            default_retry_after: Some(Duration::from_secs(2)),
            retry_transport_errors: false,
        }
    }
}

/// One logical GET against a flaky third-party API: admission throttling,
/// bounded retries with exponential backoff and jitter, and error
/// classification. The throttle gate serializes only the admission check;
/// admitted calls run concurrently, but no two admissions happen within the
/// minimum interval of each other.
pub struct ResilientClient {
    transport: Arc<dyn HttpTransport>,
    policy: RetryPolicy,
    min_interval: Option<Duration>,
    last_admitted: Mutex<Option<Instant>>,
}

impl ResilientClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        policy: RetryPolicy,
        min_interval: Option<Duration>,
    ) -> Self {
        Self {
            transport,
            policy,
            min_interval,
            last_admitted: Mutex::new(None),
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, ClientError> {
        let body = self.get_bytes(url).await?;
        serde_json::from_slice(&body).map_err(|e| ClientError::Fatal {
            status: None,
            message: format!("invalid response body from {}: {}", url, e),
        })
    }

    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, ClientError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.admit().await;

            match self.transport.get(url).await {
                Ok(resp) if resp.status == 404 => {
                    return Err(ClientError::NotFound {
                        url: url.to_string(),
                    });
                }
                Ok(resp) if (200..300).contains(&resp.status) => {
                    return Ok(resp.body);
                }
                Ok(resp) if self.policy.retryable_statuses.contains(&resp.status) => {
                    if attempt >= self.policy.max_attempts {
                        return Err(ClientError::Retryable {
                            attempts: attempt,
                            message: format!("HTTP {} from {}", resp.status, url),
                        });
                    }
                    let delay = self.backoff_delay(attempt, resp.retry_after);
                    warn!(
                        url,
                        status = resp.status,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Retryable response, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(resp) => {
                    return Err(ClientError::Fatal {
                        status: Some(resp.status),
                        message: format!("HTTP {} from {}", resp.status, url),
                    });
                }
                Err(transport_err) => {
                    if !self.policy.retry_transport_errors {
                        return Err(ClientError::Fatal {
                            status: None,
                            message: transport_err,
                        });
                    }
                    if attempt >= self.policy.max_attempts {
                        return Err(ClientError::Retryable {
                            attempts: attempt,
                            message: transport_err,
                        });
                    }
                    let delay = self.backoff_delay(attempt, None);
                    warn!(
                        url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %transport_err,
                        "Transport failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Sleep as needed so admissions stay at least `min_interval` apart.
    /// The gate check-and-update is the only serialized section.
    async fn admit(&self) {
        let Some(min) = self.min_interval else {
            return;
        };
        let mut last = self.last_admitted.lock().await;
        if let Some(prev) = *last {
            let next_allowed = prev + min;
            if next_allowed > Instant::now() {
                debug!("Throttle gate engaged, waiting for admission slot");
                tokio::time::sleep_until(next_allowed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// `max(server Retry-After, base * 2^(attempt-1) + jitter)`. The jitter
    /// keeps a fleet of stalled callers from retrying in lockstep.
    fn backoff_delay(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        let exponential = self.policy.base_backoff * 2u32.saturating_pow(attempt - 1);
        let jitter_ms = self.policy.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        let computed = exponential + jitter;

        let server = retry_after_secs
            .map(Duration::from_secs)
            .or(self.policy.default_retry_after);
        match server {
            Some(s) => s.max(computed),
            None => computed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Transport scripted with a fixed sequence of outcomes.
    struct Script {
        steps: StdMutex<Vec<std::result::Result<HttpResponse, String>>>,
        calls: StdMutex<Vec<Instant>>,
    }

    impl Script {
        fn new(steps: Vec<std::result::Result<HttpResponse, String>>) -> Arc<Self> {
            Arc::new(Self {
                steps: StdMutex::new(steps),
                calls: StdMutex::new(Vec::new()),
            })
        }

        fn call_times(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpTransport for Script {
        async fn get(&self, _url: &str) -> std::result::Result<HttpResponse, String> {
            self.calls.lock().unwrap().push(Instant::now());
            let mut steps = self.steps.lock().unwrap();
            if steps.is_empty() {
                return Err("script exhausted".to_string());
            }
            steps.remove(0)
        }
    }

    fn ok_response(body: &str) -> HttpResponse {
        HttpResponse {
            status: 200,
            body: body.as_bytes().to_vec(),
            retry_after: None,
        }
    }

    fn status_response(status: u16, retry_after: Option<u64>) -> HttpResponse {
        HttpResponse {
            status,
            body: Vec::new(),
            retry_after,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn success_passes_body_through() {
        let script = Script::new(vec![Ok(ok_response("{\"ok\":true}"))]);
        let client = ResilientClient::new(script, RetryPolicy::standard(), None);
        let body = client.get_bytes("http://x/y").await.unwrap();
        assert_eq!(body, b"{\"ok\":true}");
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_is_not_retried() {
        let script = Script::new(vec![Ok(status_response(404, None))]);
        let client = ResilientClient::new(script.clone(), RetryPolicy::standard(), None);
        let err = client.get_bytes("http://x/y").await.unwrap_err();
        assert!(matches!(err, ClientError::NotFound { .. }));
        assert_eq!(script.call_times().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_status_is_not_retried() {
        let script = Script::new(vec![Ok(status_response(500, None))]);
        let client = ResilientClient::new(script.clone(), RetryPolicy::standard(), None);
        let err = client.get_bytes("http://x/y").await.unwrap_err();
        assert!(matches!(err, ClientError::Fatal { status: Some(500), .. }));
        assert_eq!(script.call_times().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_status_retries_then_succeeds() {
        let script = Script::new(vec![
            Ok(status_response(503, None)),
            Ok(ok_response("done")),
        ]);
        let client = ResilientClient::new(script.clone(), RetryPolicy::standard(), None);
        let body = client.get_bytes("http://x/y").await.unwrap();
        assert_eq!(body, b"done");

        // Second attempt must come after the first backoff step (>= 1s).
        let times = script.call_times();
        assert_eq!(times.len(), 2);
        assert!(times[1] - times[0] >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_overrides_smaller_computed_backoff() {
        let script = Script::new(vec![
            Ok(status_response(429, Some(5))),
            Ok(ok_response("ok")),
        ]);
        let client = ResilientClient::new(script.clone(), RetryPolicy::standard(), None);
        client.get_bytes("http://x/y").await.unwrap();

        let times = script.call_times();
        assert!(
            times[1] - times[0] >= Duration::from_secs(5),
            "waited {:?}",
            times[1] - times[0]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retries_exhaust_into_retryable_classification() {
        let script = Script::new(vec![
            Ok(status_response(503, None)),
            Ok(status_response(503, None)),
            Ok(status_response(503, None)),
        ]);
        let client = ResilientClient::new(script.clone(), RetryPolicy::standard(), None);
        let err = client.get_bytes("http://x/y").await.unwrap_err();
        assert!(matches!(err, ClientError::Retryable { attempts: 3, .. }));
        assert_eq!(script.call_times().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_policy_only_retries_429() {
        let script = Script::new(vec![Ok(status_response(503, None))]);
        let client = ResilientClient::new(script.clone(), RetryPolicy::rate_limit_only(), None);
        let err = client.get_bytes("http://x/y").await.unwrap_err();
        assert!(matches!(err, ClientError::Fatal { status: Some(503), .. }));

        // 429 with no header waits at least the default fallback.
        let script = Script::new(vec![
            Ok(status_response(429, None)),
            Ok(ok_response("ok")),
        ]);
        let client = ResilientClient::new(script.clone(), RetryPolicy::rate_limit_only(), None);
        client.get_bytes("http://x/y").await.unwrap();
        let times = script.call_times();
        assert!(times[1] - times[0] >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_policy_propagates_transport_errors() {
        let script = Script::new(vec![Err("connection reset".to_string())]);
        let client = ResilientClient::new(script.clone(), RetryPolicy::rate_limit_only(), None);
        let err = client.get_bytes("http://x/y").await.unwrap_err();
        assert!(matches!(err, ClientError::Fatal { status: None, .. }));
        assert_eq!(script.call_times().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_gate_spaces_admissions() {
        let script = Script::new(vec![
            Ok(ok_response("a")),
            Ok(ok_response("b")),
            Ok(ok_response("c")),
        ]);
        let client = Arc::new(ResilientClient::new(
            script.clone(),
            RetryPolicy::standard(),
            Some(Duration::from_secs(1)),
        ));

        for _ in 0..3 {
            client.get_bytes("http://x/y").await.unwrap();
        }

        let times = script.call_times();
        assert_eq!(times.len(), 3);
        assert!(times[1] - times[0] >= Duration::from_secs(1));
        assert!(times[2] - times[1] >= Duration::from_secs(1));
    }
}
