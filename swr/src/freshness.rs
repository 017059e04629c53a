//! HTTP cache-control computation.
//!
//! Freshness is decided from the stored response's own `Cache-Control` and
//! the local time it was stored, so validators never need to be parsed: they
//! are echoed verbatim in conditional requests.

use std::time::{Duration, SystemTime};

use crate::store::StoredResponse;

/// Parsed subset of `Cache-Control` directives the adapter acts on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CacheControl {
    pub max_age: Option<Duration>,
    pub no_cache: bool,
    pub no_store: bool,
    pub must_revalidate: bool,
    pub only_if_cached: bool,
}

/// Parse a `Cache-Control` header value. Unknown directives are ignored;
/// malformed `max-age` values are treated as absent.
pub(crate) fn parse_cache_control(value: Option<&str>) -> CacheControl {
    let mut parsed = CacheControl::default();
    let Some(value) = value else {
        return parsed;
    };

    for directive in value.split(',') {
        let directive = directive.trim();
        let (name, arg) = match directive.split_once('=') {
            Some((name, arg)) => (name.trim(), Some(arg.trim().trim_matches('"'))),
            None => (directive, None),
        };
        match name.to_ascii_lowercase().as_str() {
            "max-age" => {
                parsed.max_age = arg.and_then(|a| a.parse::<u64>().ok()).map(Duration::from_secs);
            }
            "no-cache" => parsed.no_cache = true,
            "no-store" => parsed.no_store = true,
            "must-revalidate" => parsed.must_revalidate = true,
            "only-if-cached" => parsed.only_if_cached = true,
            _ => {}
        }
    }
    parsed
}

/// Whether the request's own `Cache-Control` overrides a fresh stored
/// response: `no-cache` always revalidates, and a request `max-age` tighter
/// than the entry's age does too.
pub(crate) fn request_forces_revalidation(
    request: CacheControl,
    entry: &StoredResponse,
    now: SystemTime,
) -> bool {
    if request.no_cache {
        return true;
    }
    let Some(limit) = request.max_age else {
        return false;
    };
    let age = now
        .duration_since(entry.stored_at)
        .unwrap_or(Duration::ZERO);
    age > limit
}

/// What a stored response is good for right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Freshness {
    /// Within its freshness lifetime: serve directly, no network needed.
    Fresh,
    /// Usable as stale data, but a (conditional) revalidation is required.
    MustRevalidate,
    /// Must not be served at all (`no-store`).
    Unusable,
}

/// Evaluate a stored response against the current time.
///
/// `no-cache`/`must-revalidate` force revalidation regardless of age; a
/// response without `max-age` is conservatively revalidated every time.
pub(crate) fn evaluate(entry: &StoredResponse, now: SystemTime) -> Freshness {
    let cc = parse_cache_control(entry.cache_control.as_deref());
    if cc.no_store {
        return Freshness::Unusable;
    }
    if cc.no_cache || cc.must_revalidate {
        return Freshness::MustRevalidate;
    }
    let Some(max_age) = cc.max_age else {
        return Freshness::MustRevalidate;
    };
    let age = now
        .duration_since(entry.stored_at)
        .unwrap_or(Duration::ZERO);
    if age <= max_age {
        Freshness::Fresh
    } else {
        Freshness::MustRevalidate
    }
}
