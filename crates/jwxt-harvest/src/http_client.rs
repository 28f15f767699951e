//! Async HTTP client wrapping reqwest.
//!
//! Two reqwest clients share one cookie jar: `client` follows redirects the
//! way a browser would, `manual` stops at every 3xx so the login flow can
//! walk the SSO chain hop by hop. Every request first passes the shared
//! [`RateLimiter`].

use std::sync::Arc;
use std::time::Duration;

use reqwest::redirect::Policy;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::{HarvestConfig, USER_AGENT};
use crate::session::SessionJar;
use crate::types::{HarvestError, HarvestResult};

/// Redirect budget for the following client.
const MAX_REDIRECTS: usize = 10;

/// Characters of a body kept in error messages.
const SNIPPET_LEN: usize = 200;

/// A fully read response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Requested URL.
    pub url: String,
    /// URL after redirects.
    pub final_url: String,
    pub status: u16,
    /// All response headers, lowercase names.
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    /// First header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }

    /// `Location` resolved against the URL that produced it.
    pub fn location(&self) -> Option<String> {
        let raw = self.header("location")?.trim();
        if raw.is_empty() {
            return None;
        }
        match url::Url::parse(&self.final_url) {
            Ok(base) => base.join(raw).ok().map(|u| u.to_string()),
            Err(_) => Some(raw.to_string()),
        }
    }

    /// Leading part of the body for error messages.
    pub fn snippet(&self) -> String {
        self.body.chars().take(SNIPPET_LEN).collect()
    }

    /// Fail with `UnexpectedStatus` unless the status is 200.
    pub fn require_ok(&self, context: &str) -> HarvestResult<()> {
        if self.status == 200 {
            Ok(())
        } else {
            Err(HarvestError::UnexpectedStatus {
                context: context.to_string(),
                status: self.status,
                snippet: self.snippet(),
            })
        }
    }

    /// Decode the body as JSON.
    pub fn json(&self, context: &str) -> HarvestResult<Value> {
        serde_json::from_str(&self.body)
            .map_err(|e| HarvestError::Parse(format!("{context}: invalid JSON: {e}")))
    }
}

/// Global minimum spacing between requests.
///
/// The lock is held across the sleep, so concurrent callers queue up behind
/// each other and the interval bounds the aggregate request rate.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait until the interval since the previous request has elapsed.
    pub async fn wait(&self) {
        if self.interval.is_zero() {
            return;
        }
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.interval {
                tokio::time::sleep(self.interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// HTTP client for the portal and SSO hosts.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    /// Redirect-less twin of `client` over the same jar.
    manual: reqwest::Client,
    jar: Arc<SessionJar>,
    limiter: Arc<RateLimiter>,
}

impl HttpClient {
    /// Build both clients over `jar`, gated by `limiter`.
    pub fn new(
        jar: Arc<SessionJar>,
        limiter: Arc<RateLimiter>,
        config: &HarvestConfig,
    ) -> HarvestResult<Self> {
        let client = Self::builder(&jar, config)
            .redirect(Policy::limited(MAX_REDIRECTS))
            .build()?;
        let manual = Self::builder(&jar, config)
            .redirect(Policy::none())
            .build()?;

        Ok(Self {
            client,
            manual,
            jar,
            limiter,
        })
    }

    fn builder(jar: &Arc<SessionJar>, config: &HarvestConfig) -> reqwest::ClientBuilder {
        reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(USER_AGENT)
            .cookie_provider(Arc::clone(jar))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
    }

    /// The jar this client reads and writes.
    pub fn jar(&self) -> &Arc<SessionJar> {
        &self.jar
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// GET, following redirects.
    pub async fn get(&self, url: &str) -> HarvestResult<HttpResponse> {
        self.limiter.wait().await;
        tracing::debug!("GET {url}");
        let resp = self.client.get(url).send().await?;
        Self::read(url, resp).await
    }

    /// GET without following redirects.
    pub async fn get_manual(&self, url: &str) -> HarvestResult<HttpResponse> {
        self.limiter.wait().await;
        tracing::debug!("GET {url} (no redirect)");
        let resp = self.manual.get(url).send().await?;
        Self::read(url, resp).await
    }

    /// POST url-encoded form data, following redirects.
    pub async fn post_form(
        &self,
        url: &str,
        form_fields: &[(String, String)],
        extra_headers: &[(String, String)],
    ) -> HarvestResult<HttpResponse> {
        self.limiter.wait().await;
        tracing::debug!("POST {url} ({} fields)", form_fields.len());

        let mut builder = self.client.post(url);
        for (name, value) in extra_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        // An explicit Content-Type above takes precedence over the form default.
        builder = builder.form(form_fields);

        let resp = builder.send().await?;
        Self::read(url, resp).await
    }

    /// Parallel GETs with bounded concurrency, results in input order.
    pub async fn get_many(
        &self,
        urls: &[String],
        concurrency: usize,
    ) -> Vec<HarvestResult<HttpResponse>> {
        use futures::stream::{self, StreamExt};

        stream::iter(urls.iter().cloned())
            .map(|url| {
                let client = self.clone();
                async move { client.get(&url).await }
            })
            .buffered(concurrency.max(1))
            .collect()
            .await
    }

    async fn read(url: &str, r: reqwest::Response) -> HarvestResult<HttpResponse> {
        let status = r.status().as_u16();
        let final_url = r.url().to_string();
        let headers: Vec<(String, String)> = r
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();
        let body = r.text().await?;

        Ok(HttpResponse {
            url: url.to_string(),
            final_url,
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, headers: &[(&str, &str)]) -> HttpResponse {
        HttpResponse {
            url: "http://portal.test/sso/shulogin".into(),
            final_url: "http://portal.test/sso/shulogin".into(),
            status,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: "x".repeat(500),
        }
    }

    #[test]
    fn test_relative_location_resolves() {
        let resp = response(302, &[("location", "/login?next=a")]);
        assert!(resp.is_redirect());
        assert_eq!(
            resp.location().unwrap(),
            "http://portal.test/login?next=a"
        );

        let absolute = response(302, &[("Location", "https://sso.test/x")]);
        assert_eq!(absolute.location().unwrap(), "https://sso.test/x");
    }

    #[test]
    fn test_require_ok_truncates_snippet() {
        let err = response(404, &[]).require_ok("selection page").unwrap_err();
        match err {
            HarvestError::UnexpectedStatus {
                status, snippet, ..
            } => {
                assert_eq!(status, 404);
                assert_eq!(snippet.len(), SNIPPET_LEN);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rate_limiter_spaces_requests() {
        let limiter = RateLimiter::new(Duration::from_millis(40));
        let start = Instant::now();
        for _ in 0..3 {
            limiter.wait().await;
        }
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_unlimited_limiter_never_sleeps() {
        let limiter = RateLimiter::unlimited();
        let start = Instant::now();
        for _ in 0..100 {
            limiter.wait().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
