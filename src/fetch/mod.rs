//! HTTP fetch layer
//!
//! A shared `reqwest` client (rustls, keep-alive pooling, transparent
//! gzip/deflate/brotli decompression) behind a fetcher that adds what
//! the stock client must not do for us automatically: manual redirect
//! following with guard re-validation on every hop, a streaming body
//! read with a hard byte cap, per-hop timeouts plus a total deadline
//! across retries, retry classification with backoff, and the per-host
//! circuit breaker.

pub mod breaker;
pub mod retry;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::Method;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{FetchConfig, RetryConfig};
use crate::error::{HarvestError, HarvestResult};
use crate::guard::{CanonicalUrl, UrlGuard};

use breaker::CircuitBreaker;
use retry::{RetrySchedule, parse_retry_after, status_is_retryable};

/// Request headers callers may set. Anything else is rejected before a
/// connection is attempted.
const ALLOWED_HEADERS: &[&str] = &[
    "accept",
    "accept-language",
    "authorization",
    "cache-control",
    "content-type",
    "cookie",
    "if-modified-since",
    "if-none-match",
    "origin",
    "pragma",
    "referer",
    "user-agent",
    "x-requested-with",
];

/// A validated outgoing request.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: CanonicalUrl,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl FetchRequest {
    #[must_use]
    pub fn get(url: CanonicalUrl) -> Self {
        Self {
            url,
            method: Method::GET,
            headers: Vec::new(),
            body: None,
        }
    }

    /// Reject header names outside the allowlist and any name or value
    /// containing CR/LF.
    pub fn validate_headers(&self) -> HarvestResult<()> {
        for (name, value) in &self.headers {
            if name.contains(['\r', '\n']) || value.contains(['\r', '\n']) {
                return Err(HarvestError::InvalidArgument(format!(
                    "header '{}' contains CR/LF",
                    name.escape_default()
                )));
            }
            let lower = name.to_ascii_lowercase();
            if !ALLOWED_HEADERS.contains(&lower.as_str()) {
                return Err(HarvestError::InvalidArgument(format!(
                    "header '{lower}' not allowed"
                )));
            }
        }
        Ok(())
    }
}

/// Per-fetch limits, defaulted from [`FetchConfig`].
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    /// Per-hop timeout.
    pub timeout: Duration,
    /// Deadline across every hop and retry of one logical fetch.
    pub total_timeout: Duration,
    pub max_redirects: u32,
    pub max_bytes: u64,
}

impl FetchPolicy {
    #[must_use]
    pub fn from_config(config: &FetchConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.timeout_ms),
            total_timeout: Duration::from_millis(config.total_timeout_ms),
            max_redirects: config.max_redirects,
            max_bytes: config.max_bytes,
        }
    }
}

/// A completed fetch, body fully read and decompressed.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    /// URL after redirects, canonical.
    pub final_url: CanonicalUrl,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub fetched_at: DateTime<Utc>,
    pub duration: Duration,
    /// Redirect hops followed.
    pub hops: u32,
    /// Attempts consumed, 1 for a first-try success.
    pub attempts: u32,
}

impl FetchedResponse {
    /// First header with the given name, case-insensitive.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// Body as UTF-8 text, lossy.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

enum HopOutcome {
    Response(FetchedResponse),
    Redirect {
        next: CanonicalUrl,
        method: Method,
        body: Option<Vec<u8>>,
    },
}

/// The fetch layer: connection pool + redirect policy + retries +
/// breaker.
pub struct Fetcher {
    client: reqwest::Client,
    guard: Arc<UrlGuard>,
    breaker: Arc<CircuitBreaker>,
    schedule: RetrySchedule,
    user_agent: String,
}

impl Fetcher {
    pub fn new(
        fetch_config: &FetchConfig,
        retry_config: RetryConfig,
        guard: Arc<UrlGuard>,
        breaker: Arc<CircuitBreaker>,
    ) -> HarvestResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(fetch_config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(fetch_config.max_idle_per_host)
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .build()
            .map_err(|e| HarvestError::internal(format!("client build: {e}")))?;
        Ok(Self {
            client,
            guard,
            breaker,
            schedule: RetrySchedule::new(retry_config),
            user_agent: fetch_config.user_agent.clone(),
        })
    }

    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    #[must_use]
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Raw client for side-channel fetches (robots.txt, sitemaps) that
    /// manage their own policy.
    #[must_use]
    pub fn client(&self) -> reqwest::Client {
        self.client.clone()
    }

    /// Fetch with retries, breaker gating, and the total deadline.
    ///
    /// The request URL must already have passed the guard; redirect
    /// targets are re-validated here on every hop.
    pub async fn fetch(
        &self,
        request: FetchRequest,
        policy: &FetchPolicy,
        cancel: &CancellationToken,
    ) -> HarvestResult<FetchedResponse> {
        request.validate_headers()?;
        let host = request.url.host().to_string();
        self.breaker.preflight(&host)?;

        let deadline = Instant::now() + policy.total_timeout;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(HarvestError::Cancelled);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(HarvestError::Timeout(policy.total_timeout));
            }

            let outcome = self
                .fetch_attempt(&request, policy, remaining, cancel)
                .await;

            match outcome {
                Ok(mut response) => {
                    if response.status < 400 {
                        self.breaker.record_success(&host);
                        response.attempts = attempt;
                        return Ok(response);
                    }
                    let status = response.status;
                    self.breaker
                        .record_failure(&host, &format!("http {status}"));
                    if status_is_retryable(status) && attempt < self.schedule.max_attempts() {
                        let hint = response
                            .header("retry-after")
                            .and_then(parse_retry_after)
                            .filter(|_| status == 429);
                        let wait = self.schedule.backoff_with_hint(attempt, hint);
                        debug!(
                            url = %request.url,
                            status,
                            attempt,
                            wait_ms = wait.as_millis() as u64,
                            "retrying after status"
                        );
                        self.sleep_or_cancel(wait, deadline, cancel).await?;
                        continue;
                    }
                    return Err(HarvestError::HttpStatus(status));
                }
                Err(e) => {
                    let retryable = e.is_retryable();
                    if matches!(
                        e,
                        HarvestError::Timeout(_)
                            | HarvestError::Connect(_)
                            | HarvestError::Dns(_)
                            | HarvestError::Tls(_)
                    ) {
                        self.breaker.record_failure(&host, e.kind());
                    }
                    if retryable && attempt < self.schedule.max_attempts() {
                        let wait = self.schedule.backoff(attempt);
                        warn!(
                            url = %request.url,
                            error = %e,
                            attempt,
                            wait_ms = wait.as_millis() as u64,
                            "retrying after error"
                        );
                        self.sleep_or_cancel(wait, deadline, cancel).await?;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn sleep_or_cancel(
        &self,
        wait: Duration,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> HarvestResult<()> {
        if Instant::now() + wait >= deadline {
            return Err(HarvestError::Timeout(
                deadline.saturating_duration_since(Instant::now()),
            ));
        }
        tokio::select! {
            () = tokio::time::sleep(wait) => Ok(()),
            () = cancel.cancelled() => Err(HarvestError::Cancelled),
        }
    }

    /// One attempt: follow redirects up to the budget, each hop guarded
    /// and individually timed.
    async fn fetch_attempt(
        &self,
        request: &FetchRequest,
        policy: &FetchPolicy,
        remaining: Duration,
        cancel: &CancellationToken,
    ) -> HarvestResult<FetchedResponse> {
        let started = Instant::now();
        let mut url = request.url.clone();
        let mut method = request.method.clone();
        let mut body = request.body.clone();
        let mut hops: u32 = 0;

        loop {
            let hop_timeout = policy.timeout.min(
                remaining.saturating_sub(started.elapsed()),
            );
            if hop_timeout.is_zero() {
                return Err(HarvestError::Timeout(policy.timeout));
            }

            let hop = self.fetch_hop(
                &url,
                method.clone(),
                &request.headers,
                body.clone(),
                policy,
                hops,
                started,
            );
            let outcome = tokio::select! {
                res = tokio::time::timeout(hop_timeout, hop) => {
                    res.map_err(|_| HarvestError::Timeout(hop_timeout))?
                }
                () = cancel.cancelled() => return Err(HarvestError::Cancelled),
            }?;

            match outcome {
                HopOutcome::Response(response) => return Ok(response),
                HopOutcome::Redirect {
                    next,
                    method: next_method,
                    body: next_body,
                } => {
                    hops += 1;
                    if hops > policy.max_redirects {
                        return Err(HarvestError::InvalidRedirect(format!(
                            "redirect budget ({}) exhausted",
                            policy.max_redirects
                        )));
                    }
                    // Every hop target goes back through the guard.
                    self.guard.validate(&next).await?;
                    debug!(from = %url, to = %next, hop = hops, "following redirect");
                    url = next;
                    method = next_method;
                    body = next_body;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn fetch_hop(
        &self,
        url: &CanonicalUrl,
        method: Method,
        headers: &[(String, String)],
        body: Option<Vec<u8>>,
        policy: &FetchPolicy,
        hops: u32,
        started: Instant,
    ) -> HarvestResult<HopOutcome> {
        let mut builder = self.client.request(method.clone(), url.as_url().clone());
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        if let Some(bytes) = body.clone() {
            builder = builder.body(bytes);
        }

        let response = builder.send().await.map_err(HarvestError::from)?;
        let status = response.status();

        if status.is_redirection() {
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| {
                    HarvestError::InvalidRedirect(format!("{status} without location"))
                })?;
            let next = url
                .join(location)
                .map_err(|e| HarvestError::InvalidRedirect(format!("'{location}': {e}")))?;
            // 303 switches to GET and drops the body; 301/302 follow
            // historical practice for POST.
            let (next_method, next_body) = if status.as_u16() == 303
                || (matches!(status.as_u16(), 301 | 302) && method == Method::POST)
            {
                (Method::GET, None)
            } else {
                (method, body)
            };
            return Ok(HopOutcome::Redirect {
                next,
                method: next_method,
                body: next_body,
            });
        }

        // Content-Length lets us refuse oversized bodies before
        // streaming them.
        if let Some(len) = response.content_length() {
            if len > policy.max_bytes {
                return Err(HarvestError::ResponseTooLarge {
                    limit: policy.max_bytes,
                });
            }
        }

        let final_url = CanonicalUrl::parse(response.url().as_str())?;
        let status_code = status.as_u16();
        let header_pairs: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(n, v)| v.to_str().ok().map(|v| (n.as_str().to_string(), v.to_string())))
            .collect();

        let mut collected: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(HarvestError::from)?;
            if collected.len() as u64 + chunk.len() as u64 > policy.max_bytes {
                return Err(HarvestError::ResponseTooLarge {
                    limit: policy.max_bytes,
                });
            }
            collected.extend_from_slice(&chunk);
        }

        Ok(HopOutcome::Response(FetchedResponse {
            final_url,
            status: status_code,
            headers: header_pairs,
            body: Bytes::from(collected),
            fetched_at: Utc::now(),
            duration: started.elapsed(),
            hops,
            attempts: 1,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_allowlist_enforced() {
        let url = CanonicalUrl::parse("https://example.com/").expect("url");
        let mut request = FetchRequest::get(url);
        request
            .headers
            .push(("Accept".into(), "text/html".into()));
        assert!(request.validate_headers().is_ok());

        request
            .headers
            .push(("X-Internal-Debug".into(), "1".into()));
        assert!(request.validate_headers().is_err());
    }

    #[test]
    fn crlf_in_header_rejected() {
        let url = CanonicalUrl::parse("https://example.com/").expect("url");
        let mut request = FetchRequest::get(url);
        request
            .headers
            .push(("Accept".into(), "text/html\r\nHost: evil".into()));
        let err = request.validate_headers().unwrap_err();
        assert_eq!(err.kind(), "InvalidArgument");
    }

    #[test]
    fn response_header_lookup_is_case_insensitive() {
        let response = FetchedResponse {
            final_url: CanonicalUrl::parse("https://example.com/").expect("url"),
            status: 200,
            headers: vec![("Content-Type".into(), "text/html".into())],
            body: Bytes::from_static(b"ok"),
            fetched_at: Utc::now(),
            duration: Duration::from_millis(5),
            hops: 0,
            attempts: 1,
        };
        assert_eq!(response.header("content-type"), Some("text/html"));
        assert_eq!(response.content_type(), Some("text/html"));
        assert_eq!(response.header("x-missing"), None);
    }
}
