use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use std::time::Duration;

use crate::error::Result;

/// Raw outcome of one HTTP GET. Transport-level failures (timeouts,
/// connection resets) come back as the error string; any response with a
/// status code, including errors, comes back as Ok.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
    /// Parsed Retry-After header, in seconds, when the server sent one.
    pub retry_after: Option<u64>,
}

/// Seam between the retry/throttle layer and the wire. Tests script this;
/// production uses the reqwest adapter below.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, url: &str) -> std::result::Result<HttpResponse, String>;
}

/// reqwest-backed transport with per-destination timeouts, a User-Agent
/// (some upstreams require one) and optional bearer auth.
pub struct ReqwestTransport {
    client: reqwest::Client,
    user_agent: String,
    bearer: Option<String>,
}

impl ReqwestTransport {
    pub fn new(
        user_agent: &str,
        connect_timeout: Duration,
        timeout: Duration,
        bearer: Option<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            user_agent: user_agent.to_string(),
            bearer,
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &str) -> std::result::Result<HttpResponse, String> {
        let mut request = self.client.get(url).header("User-Agent", &self.user_agent);
        if let Some(token) = &self.bearer {
            request = request.bearer_auth(token);
        }

        let resp = request.send().await.map_err(|e| e.to_string())?;
        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok());
        let body = resp.bytes().await.map_err(|e| e.to_string())?.to_vec();

        Ok(HttpResponse {
            status,
            body,
            retry_after,
        })
    }
}
