//! Stale-while-revalidate HTTP fetching as [`Outcome`] streams.
//!
//! For a single request this adapter produces a short outcome stream: the
//! cached value first (as `Progress`, when a revalidation is still needed),
//! then the terminal result of the real fetch. Standard `Cache-Control`
//! semantics decide whether the network round-trip happens at all and
//! whether it is made conditional (`If-None-Match` / `If-Modified-Since`).
//!
//! # Sequence
//!
//! 1. Cache lookup (skipped when the request carries
//!    [`BYPASS_CACHE_HEADER`]). Lookup failures are reported and suppressed
//!    as long as a network path exists.
//! 2. A fresh entry is served as a single `Success` — no network call.
//! 3. A stale-but-usable entry is served as `Progress(data)` while the
//!    conditional request runs.
//! 4. `304 Not Modified` resolves to `Success(cached)`; otherwise the body
//!    is parsed into `Success(parsed)` or `Error(cause, cached_if_any)`.
//! 5. When neither a cached value nor a network request can be derived
//!    (`only-if-cached` against an empty store), a single structural
//!    `Error` is emitted.
//!
//! Dropping the returned stream aborts both phases promptly.

mod freshness;
mod store;

pub use store::{HttpCacheStore, MemoryStore, StoredResponse};

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::SystemTime;

use futures_util::Stream;
use futures_util::future::{AbortHandle, Abortable};
use loadstone_types::{Cause, ErrorReporter, NoopReporter, Outcome, cause};
use reqwest::StatusCode;
use reqwest::header::{
    CACHE_CONTROL, ETAG, HeaderMap, HeaderName, HeaderValue, IF_MODIFIED_SINCE, IF_NONE_MATCH,
    LAST_MODIFIED,
};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::mpsc;

use freshness::{Freshness, evaluate, parse_cache_control, request_forces_revalidation};

/// Synthetic request header that forces a cache bypass. Stripped before the
/// request goes on the wire; used when a caller explicitly demands fresh
/// data.
pub const BYPASS_CACHE_HEADER: &str = "x-loadstone-no-cache";

/// Structural failures of the adapter itself.
#[derive(Debug, Error)]
pub enum SwrError {
    /// The request forbids the network and the cache had nothing usable.
    #[error("no cached value available and no network request could be derived")]
    NoSource,
    /// The origin answered with a non-success, non-304 status.
    #[error("unexpected HTTP status {0}")]
    UnexpectedStatus(StatusCode),
    /// Transport-level failure (connect, TLS, body read, invalid URL).
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// A GET request as seen by the adapter.
#[derive(Debug, Clone)]
pub struct SwrRequest {
    url: reqwest::Url,
    headers: HeaderMap,
}

impl SwrRequest {
    /// Build a GET request for `url`.
    pub fn get(url: impl reqwest::IntoUrl) -> Result<Self, SwrError> {
        Ok(Self {
            url: url.into_url()?,
            headers: HeaderMap::new(),
        })
    }

    /// Add a request header. Request-side `Cache-Control` is honored:
    /// `only-if-cached` forbids the network phase entirely, and `no-cache`
    /// (or a `max-age` tighter than the entry's age) forces revalidation of
    /// an otherwise fresh entry.
    #[must_use]
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Force-bypass the cache layer for this request.
    #[must_use]
    pub fn bypass_cache(self) -> Self {
        self.header(
            HeaderName::from_static(BYPASS_CACHE_HEADER),
            HeaderValue::from_static("1"),
        )
    }
}

/// Stale-while-revalidate HTTP client.
///
/// Cheap to clone; clones share the HTTP connection pool, the store, and
/// the error reporter.
pub struct SwrClient {
    http: reqwest::Client,
    store: Arc<dyn HttpCacheStore>,
    reporter: Arc<dyn ErrorReporter>,
}

impl Clone for SwrClient {
    fn clone(&self) -> Self {
        Self {
            http: self.http.clone(),
            store: Arc::clone(&self.store),
            reporter: Arc::clone(&self.reporter),
        }
    }
}

impl SwrClient {
    /// Client over an existing HTTP client and response store.
    #[must_use]
    pub fn new(http: reqwest::Client, store: Arc<dyn HttpCacheStore>) -> Self {
        Self {
            http,
            store,
            reporter: Arc::new(NoopReporter),
        }
    }

    /// Install an error-reporting collaborator for suppressed failures.
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Execute `request`, producing an outcome stream.
    ///
    /// `parse` converts a response body (cached or freshly fetched) into the
    /// domain value; see [`json_parser`] for the common case. Dropping the
    /// stream cancels whatever phase is in flight.
    pub fn fetch<T, P>(&self, request: SwrRequest, parse: P) -> SwrStream<T>
    where
        T: Clone + Send + 'static,
        P: Fn(&[u8]) -> Result<T, Cause> + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (abort, abort_registration) = AbortHandle::new_pair();
        let client = self.clone();
        tokio::spawn(async move {
            let _ = Abortable::new(run(client, request, parse, tx), abort_registration).await;
        });
        SwrStream { rx, abort }
    }
}

/// Outcome stream returned by [`SwrClient::fetch`].
pub struct SwrStream<T> {
    rx: mpsc::UnboundedReceiver<Outcome<T>>,
    abort: AbortHandle,
}

impl<T> Stream for SwrStream<T> {
    type Item = Outcome<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl<T> Drop for SwrStream<T> {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

/// Body parser deserializing JSON into any `serde` type.
pub fn json_parser<T>() -> impl Fn(&[u8]) -> Result<T, Cause> + Send + Sync + Clone
where
    T: DeserializeOwned,
{
    |body: &[u8]| serde_json::from_slice(body).map_err(cause)
}

fn cache_key(url: &reqwest::Url) -> String {
    format!("GET {url}")
}

fn header_string(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn run<T, P>(
    client: SwrClient,
    request: SwrRequest,
    parse: P,
    tx: mpsc::UnboundedSender<Outcome<T>>,
) where
    T: Clone + Send + 'static,
    P: Fn(&[u8]) -> Result<T, Cause> + Send + Sync + 'static,
{
    let SwrRequest { url, mut headers } = request;
    let bypass = headers.remove(BYPASS_CACHE_HEADER).is_some();
    let request_cc = parse_cache_control(
        headers
            .get(CACHE_CONTROL)
            .and_then(|v| v.to_str().ok()),
    );
    let network_allowed = !request_cc.only_if_cached;
    let key = cache_key(&url);

    // Phase 1: cache read.
    let found = if bypass {
        None
    } else {
        match client.store.lookup(&key) {
            Ok(found) => found,
            Err(lookup_err) => {
                if network_allowed {
                    // Never fail the whole call for a broken cache while the
                    // network can still answer.
                    tracing::warn!(error = %lookup_err, "cache lookup failed; continuing to network");
                    client.reporter.report(&lookup_err);
                    None
                } else {
                    let _ = tx.send(Outcome::failure(lookup_err, None));
                    return;
                }
            }
        }
    };

    // Stale value parsed from the cache, retained through the network phase.
    let mut stale: Option<T> = None;
    // The entry whose validators make the network request conditional.
    let mut revalidating: Option<StoredResponse> = None;

    if let Some(entry) = found {
        let now = SystemTime::now();
        let mut freshness = evaluate(&entry, now);
        if freshness == Freshness::Fresh && request_forces_revalidation(request_cc, &entry, now) {
            // The caller's own Cache-Control outranks the stored response's
            // freshness lifetime.
            freshness = Freshness::MustRevalidate;
        }
        match freshness {
            Freshness::Unusable => {}
            freshness => match parse(&entry.body) {
                Ok(data) => {
                    if !network_allowed || freshness == Freshness::Fresh {
                        // Fresh cache, or the best we are allowed to do:
                        // terminal success, no network call.
                        let _ = tx.send(Outcome::success(data));
                        return;
                    }
                    let _ = tx.send(Outcome::progress(Some(data.clone())));
                    stale = Some(data);
                    revalidating = Some(entry);
                }
                Err(parse_err) => {
                    if network_allowed {
                        tracing::warn!(error = %parse_err, "cached body failed to parse; refetching");
                        client.reporter.report(&parse_err);
                    } else {
                        let _ = tx.send(Outcome::failure(parse_err, None));
                        return;
                    }
                }
            },
        }
    }

    if !network_allowed {
        let _ = tx.send(Outcome::failure(cause(SwrError::NoSource), None));
        return;
    }

    // Phase 2: network read, conditional when validators exist.
    let mut builder = client.http.get(url).headers(headers);
    if let Some(entry) = &revalidating {
        if let Some(etag) = &entry.etag {
            builder = builder.header(IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = &entry.last_modified {
            builder = builder.header(IF_MODIFIED_SINCE, last_modified);
        }
    }

    let response = match builder.send().await {
        Ok(response) => response,
        Err(send_err) => {
            let _ = tx.send(Outcome::failure(cause(SwrError::Transport(send_err)), stale));
            return;
        }
    };

    let status = response.status();
    if status == StatusCode::NOT_MODIFIED
        && let Some(data) = stale
    {
        // The cached value is still good: refresh its clock and any updated
        // caching headers so the next call can skip the round-trip.
        if let Some(mut entry) = revalidating {
            entry.stored_at = SystemTime::now();
            if let Some(cc) = header_string(response.headers(), CACHE_CONTROL) {
                entry.cache_control = Some(cc);
            }
            if let Err(store_err) = client.store.store(&key, entry) {
                tracing::warn!(error = %store_err, "failed to refresh cache entry after 304");
                client.reporter.report(&store_err);
            }
        }
        let _ = tx.send(Outcome::success(data));
        return;
    }

    if !status.is_success() {
        let _ = tx.send(Outcome::failure(
            cause(SwrError::UnexpectedStatus(status)),
            stale,
        ));
        return;
    }

    let response_headers = response.headers().clone();
    let body = match response.bytes().await {
        Ok(body) => body,
        Err(body_err) => {
            let _ = tx.send(Outcome::failure(cause(SwrError::Transport(body_err)), stale));
            return;
        }
    };

    match parse(&body) {
        Ok(data) => {
            write_back(&client, &key, &response_headers, &body);
            let _ = tx.send(Outcome::success(data));
        }
        Err(parse_err) => {
            let _ = tx.send(Outcome::failure(parse_err, stale));
        }
    }
}

/// Persist a successful response. Failures never fail the fetch; they are
/// reported and suppressed. `no-store` responses are not persisted.
fn write_back(client: &SwrClient, key: &str, headers: &HeaderMap, body: &[u8]) {
    let response_cc = parse_cache_control(
        headers
            .get(CACHE_CONTROL)
            .and_then(|v| v.to_str().ok()),
    );
    if response_cc.no_store {
        return;
    }
    let entry = StoredResponse {
        body: body.to_vec(),
        etag: header_string(headers, ETAG),
        last_modified: header_string(headers, LAST_MODIFIED),
        cache_control: header_string(headers, CACHE_CONTROL),
        stored_at: SystemTime::now(),
    };
    if let Err(store_err) = client.store.store(key, entry) {
        tracing::warn!(error = %store_err, "cache write failed");
        client.reporter.report(&store_err);
    }
}
