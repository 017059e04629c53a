use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use futures_util::StreamExt;
use loadstone_swr::{
    HttpCacheStore, MemoryStore, StoredResponse, SwrClient, SwrRequest, json_parser,
};
use loadstone_types::{Cause, ErrorReporter, MessageError, Outcome};
use pretty_assertions::assert_eq;
use reqwest::Client;
use reqwest::header::{CACHE_CONTROL, HeaderValue};
use serde::Deserialize;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct Profile {
    name: String,
}

fn profile_entry(name: &str, cache_control: &str, age: Duration) -> StoredResponse {
    StoredResponse {
        body: format!(r#"{{"name":"{name}"}}"#).into_bytes(),
        etag: Some("\"v1\"".to_string()),
        last_modified: Some("Mon, 01 Jan 2024 00:00:00 GMT".to_string()),
        cache_control: Some(cache_control.to_string()),
        stored_at: SystemTime::now() - age,
    }
}

fn names(outcomes: &[Outcome<Profile>]) -> Vec<(bool, Option<String>)> {
    outcomes
        .iter()
        .map(|o| (o.is_terminal(), o.data().map(|p| p.name.clone())))
        .collect()
}

struct FailingStore;

impl HttpCacheStore for FailingStore {
    fn lookup(&self, _key: &str) -> Result<Option<StoredResponse>, Cause> {
        Err(MessageError::caused("disk on fire"))
    }

    fn store(&self, _key: &str, _response: StoredResponse) -> Result<(), Cause> {
        Err(MessageError::caused("disk on fire"))
    }
}

#[derive(Default)]
struct CapturingReporter {
    seen: Mutex<Vec<String>>,
}

impl ErrorReporter for CapturingReporter {
    fn report(&self, cause: &Cause) {
        self.seen.lock().unwrap().push(cause.to_string());
    }
}

#[tokio::test]
async fn fresh_cache_entry_skips_the_network() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/profile"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let url = format!("{}/profile", server.uri());
    let store = Arc::new(MemoryStore::new());
    store
        .store(
            &format!("GET {url}"),
            profile_entry("cached", "max-age=60", Duration::from_secs(5)),
        )
        .unwrap();

    let client = SwrClient::new(Client::new(), store);
    let outcomes: Vec<Outcome<Profile>> = client
        .fetch(SwrRequest::get(&url).unwrap(), json_parser())
        .collect()
        .await;

    assert_eq!(names(&outcomes), vec![(true, Some("cached".to_string()))]);
    assert!(outcomes[0].is_success());
}

#[tokio::test]
async fn stale_entry_yields_progress_then_revalidated_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/profile"))
        .and(header("if-none-match", "\"v1\""))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(r#"{"name":"network"}"#),
        )
        .expect(1)
        .mount(&server)
        .await;

    let url = format!("{}/profile", server.uri());
    let store = Arc::new(MemoryStore::new());
    store
        .store(
            &format!("GET {url}"),
            profile_entry("cached", "max-age=1", Duration::from_secs(30)),
        )
        .unwrap();

    let client = SwrClient::new(Client::new(), store);
    let outcomes: Vec<Outcome<Profile>> = client
        .fetch(SwrRequest::get(&url).unwrap(), json_parser())
        .collect()
        .await;

    assert_eq!(
        names(&outcomes),
        vec![
            (false, Some("cached".to_string())),
            (true, Some("network".to_string())),
        ]
    );

    // The date validator contains a comma, which wiremock's header matcher
    // would split as an HTTP list; check the raw request instead.
    let requests = server.received_requests().await.unwrap();
    assert_eq!(
        requests[0]
            .headers
            .get("if-modified-since")
            .map(|v| v.to_str().unwrap()),
        Some("Mon, 01 Jan 2024 00:00:00 GMT")
    );
}

#[tokio::test]
async fn not_modified_serves_cached_body_and_refreshes_the_entry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/profile"))
        .respond_with(
            ResponseTemplate::new(304).insert_header("cache-control", "max-age=120"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let url = format!("{}/profile", server.uri());
    let store = Arc::new(MemoryStore::new());
    store
        .store(
            &format!("GET {url}"),
            profile_entry("cached", "max-age=1", Duration::from_secs(30)),
        )
        .unwrap();

    let client = SwrClient::new(Client::new(), Arc::clone(&store) as _);
    let outcomes: Vec<Outcome<Profile>> = client
        .fetch(SwrRequest::get(&url).unwrap(), json_parser())
        .collect()
        .await;

    assert_eq!(
        names(&outcomes),
        vec![
            (false, Some("cached".to_string())),
            (true, Some("cached".to_string())),
        ]
    );
    assert!(outcomes[1].is_success());

    // The refreshed entry is fresh again: a second fetch stays cache-only.
    let outcomes: Vec<Outcome<Profile>> = client
        .fetch(SwrRequest::get(&url).unwrap(), json_parser())
        .collect()
        .await;
    assert_eq!(names(&outcomes), vec![(true, Some("cached".to_string()))]);
}

#[tokio::test]
async fn parse_failure_keeps_the_stale_value_attached() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/profile"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json at all"))
        .expect(1)
        .mount(&server)
        .await;

    let url = format!("{}/profile", server.uri());
    let store = Arc::new(MemoryStore::new());
    store
        .store(
            &format!("GET {url}"),
            profile_entry("cached", "max-age=1", Duration::from_secs(30)),
        )
        .unwrap();

    let client = SwrClient::new(Client::new(), store);
    let outcomes: Vec<Outcome<Profile>> = client
        .fetch(SwrRequest::get(&url).unwrap(), json_parser())
        .collect()
        .await;

    assert_eq!(outcomes.len(), 2);
    assert!(outcomes[1].is_error());
    assert_eq!(
        outcomes[1].data().map(|p| p.name.as_str()),
        Some("cached"),
        "the terminal error keeps the last good value for display"
    );
}

#[tokio::test]
async fn bypass_header_forces_a_network_hit_past_a_fresh_entry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/profile"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(r#"{"name":"network"}"#),
        )
        .expect(1)
        .mount(&server)
        .await;

    let url = format!("{}/profile", server.uri());
    let store = Arc::new(MemoryStore::new());
    store
        .store(
            &format!("GET {url}"),
            profile_entry("cached", "max-age=3600", Duration::from_secs(1)),
        )
        .unwrap();

    let client = SwrClient::new(Client::new(), store);
    let outcomes: Vec<Outcome<Profile>> = client
        .fetch(
            SwrRequest::get(&url).unwrap().bypass_cache(),
            json_parser(),
        )
        .collect()
        .await;

    assert_eq!(names(&outcomes), vec![(true, Some("network".to_string()))]);

    // The bypass header itself must never reach the origin.
    let requests = server.received_requests().await.unwrap();
    assert!(
        requests
            .iter()
            .all(|r| !r.headers.contains_key("x-loadstone-no-cache"))
    );
}

#[tokio::test]
async fn broken_store_is_reported_and_the_network_still_answers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/profile"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(r#"{"name":"network"}"#),
        )
        .expect(1)
        .mount(&server)
        .await;

    let reporter = Arc::new(CapturingReporter::default());
    let client = SwrClient::new(Client::new(), Arc::new(FailingStore))
        .with_reporter(Arc::clone(&reporter) as _);

    let url = format!("{}/profile", server.uri());
    let outcomes: Vec<Outcome<Profile>> = client
        .fetch(SwrRequest::get(&url).unwrap(), json_parser())
        .collect()
        .await;

    assert_eq!(names(&outcomes), vec![(true, Some("network".to_string()))]);
    // Both the failed lookup and the failed write-back were surfaced.
    let seen = reporter.seen.lock().unwrap();
    assert_eq!(seen.as_slice(), ["disk on fire", "disk on fire"]);
}

#[tokio::test]
async fn only_if_cached_against_an_empty_store_is_a_single_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let client = SwrClient::new(Client::new(), Arc::new(MemoryStore::new()));
    let url = format!("{}/profile", server.uri());
    let request = SwrRequest::get(&url)
        .unwrap()
        .header(CACHE_CONTROL, HeaderValue::from_static("only-if-cached"));

    let outcomes: Vec<Outcome<Profile>> = client.fetch(request, json_parser()).collect().await;

    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].is_error());
    assert!(outcomes[0].data().is_none());
}

#[tokio::test]
async fn only_if_cached_serves_a_stale_entry_without_revalidating() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let url = format!("{}/profile", server.uri());
    let store = Arc::new(MemoryStore::new());
    store
        .store(
            &format!("GET {url}"),
            profile_entry("cached", "max-age=1", Duration::from_secs(30)),
        )
        .unwrap();

    let client = SwrClient::new(Client::new(), store);
    let request = SwrRequest::get(&url)
        .unwrap()
        .header(CACHE_CONTROL, HeaderValue::from_static("only-if-cached"));
    let outcomes: Vec<Outcome<Profile>> = client.fetch(request, json_parser()).collect().await;

    assert_eq!(names(&outcomes), vec![(true, Some("cached".to_string()))]);
}

#[tokio::test]
async fn successful_fetch_writes_back_so_the_next_call_is_cache_only() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/profile"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(r#"{"name":"network"}"#)
                .insert_header("cache-control", "max-age=300"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let client = SwrClient::new(Client::new(), Arc::clone(&store) as _);
    let url = format!("{}/profile", server.uri());

    let first: Vec<Outcome<Profile>> = client
        .fetch(SwrRequest::get(&url).unwrap(), json_parser())
        .collect()
        .await;
    assert_eq!(names(&first), vec![(true, Some("network".to_string()))]);
    assert_eq!(store.len(), 1);

    let second: Vec<Outcome<Profile>> = client
        .fetch(SwrRequest::get(&url).unwrap(), json_parser())
        .collect()
        .await;
    assert_eq!(names(&second), vec![(true, Some("network".to_string()))]);
}

#[tokio::test]
async fn request_no_cache_revalidates_a_fresh_entry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/profile"))
        .and(header("if-none-match", "\"v1\""))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(r#"{"name":"network"}"#),
        )
        .expect(1)
        .mount(&server)
        .await;

    let url = format!("{}/profile", server.uri());
    let store = Arc::new(MemoryStore::new());
    store
        .store(
            &format!("GET {url}"),
            profile_entry("cached", "max-age=3600", Duration::from_secs(1)),
        )
        .unwrap();

    let client = SwrClient::new(Client::new(), store);
    let request = SwrRequest::get(&url)
        .unwrap()
        .header(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    let outcomes: Vec<Outcome<Profile>> = client.fetch(request, json_parser()).collect().await;

    // The fresh entry is still served, but only as interim data.
    assert_eq!(
        names(&outcomes),
        vec![
            (false, Some("cached".to_string())),
            (true, Some("network".to_string())),
        ]
    );
}

#[tokio::test]
async fn http_error_status_carries_the_stale_value() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/profile"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let url = format!("{}/profile", server.uri());
    let store = Arc::new(MemoryStore::new());
    store
        .store(
            &format!("GET {url}"),
            profile_entry("cached", "max-age=1", Duration::from_secs(30)),
        )
        .unwrap();

    let client = SwrClient::new(Client::new(), store);
    let outcomes: Vec<Outcome<Profile>> = client
        .fetch(SwrRequest::get(&url).unwrap(), json_parser())
        .collect()
        .await;

    assert_eq!(outcomes.len(), 2);
    assert!(outcomes[1].is_error());
    assert_eq!(outcomes[1].data().map(|p| p.name.as_str()), Some("cached"));
    let cause = outcomes[1].error_cause().unwrap();
    assert!(cause.to_string().contains("503"));
}
