use arc_swap::ArcSwap;
use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Request, StatusCode};
use causeway_core::config::{Config, IdempotencyConfig};
use causeway_core::error::{ApiError, ErrorCode};
use causeway_core::idempotency::IdempotencyStore;
use causeway_server::location::{AirportLocations, GeoPoint};
use causeway_server::{build_router, AppState};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const KEY: &str = "123e4567-e89b-12d3-a456-426614174000";

// ---------------------------------------------------------------------------
// Helper: build a test AppState backed by a static airport gazetteer
// ---------------------------------------------------------------------------

struct StaticAirportLocations {
    airports: HashMap<&'static str, GeoPoint>,
    lookups: AtomicUsize,
    delay: Duration,
}

impl StaticAirportLocations {
    fn new(delay: Duration) -> Self {
        let mut airports = HashMap::new();
        airports.insert("LAX", GeoPoint { lat: 33.94, lon: -118.41 });
        airports.insert("JFK", GeoPoint { lat: 40.64, lon: -73.78 });
        Self {
            airports,
            lookups: AtomicUsize::new(0),
            delay,
        }
    }

    fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AirportLocations for StaticAirportLocations {
    async fn lookup(&self, iata_code: &str) -> Result<GeoPoint, ApiError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.airports
            .get(iata_code)
            .copied()
            .ok_or_else(|| ApiError::Domain {
                code: ErrorCode::AirportNotFound,
                message: format!("Unknown IATA code {iata_code}."),
            })
    }
}

/// Gazetteer that always fails with an unclassified error.
struct FailingLocations;

#[async_trait]
impl AirportLocations for FailingLocations {
    async fn lookup(&self, _iata_code: &str) -> Result<GeoPoint, ApiError> {
        Err(ApiError::Internal(
            "location backend exploded".to_string(),
        ))
    }
}

fn test_config(idempotency_enabled: bool) -> Config {
    let mut config = Config {
        airport_api: "http://localhost:0/unused".to_string(),
        idempotency: IdempotencyConfig {
            enabled: idempotency_enabled,
            wait_timeout_ms: 2_000,
            ..IdempotencyConfig::default()
        },
        ..Config::default()
    };
    config.sanitize();
    config
}

fn build_state(config: Config, locations: Arc<dyn AirportLocations>) -> AppState {
    let idempotency = Arc::new(IdempotencyStore::new(&config.idempotency));
    AppState {
        config: Arc::new(ArcSwap::from_pointee(config)),
        idempotency,
        locations,
    }
}

/// Helper: send a request through the full router and return
/// (status, headers, raw body).
async fn send_request(state: &AppState, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
    let router = build_router(state.clone());
    let response = router.oneshot(request).await.expect("request failed");
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("failed to read body");
    (status, headers, body)
}

fn measure_request(key: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/airport/measure-distance")
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header("Idempotency-Key", key);
    }
    builder.body(Body::from(body.to_string())).expect("request")
}

fn expected_distance() -> f64 {
    ((-73.78f64 - -118.41).powi(2) + (40.64f64 - 33.94).powi(2)).sqrt()
}

// ---------------------------------------------------------------------------
// Idempotency guard
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_measure_distance_then_replay_without_recomputation() {
    let locations = Arc::new(StaticAirportLocations::new(Duration::ZERO));
    let state = build_state(test_config(true), locations.clone());
    let body = json!({"airIATAPortCodes": ["LAX", "JFK"]});

    let (status, _, first) = send_request(&state, measure_request(Some(KEY), body.clone())).await;
    assert_eq!(status, StatusCode::OK);
    let parsed: Value = serde_json::from_slice(&first).expect("json body");
    let distance = parsed["distance"].as_f64().expect("distance");
    assert!((distance - expected_distance()).abs() < 1e-9);
    assert_eq!(locations.lookup_count(), 2);

    // Identical retry: byte-identical response, no recomputation
    let (status, _, second) = send_request(&state, measure_request(Some(KEY), body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second, first);
    assert_eq!(locations.lookup_count(), 2);
}

#[tokio::test]
async fn test_missing_key_rejected_before_handler_runs() {
    let locations = Arc::new(StaticAirportLocations::new(Duration::ZERO));
    let state = build_state(test_config(true), locations.clone());

    let (status, headers, body) = send_request(
        &state,
        measure_request(None, json!({"airIATAPortCodes": ["LAX", "JFK"]})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        headers["content-type"].to_str().expect("content type"),
        "application/problem+json"
    );
    let problem: Value = serde_json::from_slice(&body).expect("problem json");
    assert!(
        problem["title"]
            .as_str()
            .expect("title")
            .contains("Idempotency-Key")
    );
    assert_eq!(locations.lookup_count(), 0);
}

#[tokio::test]
async fn test_malformed_key_rejected_before_handler_runs() {
    let locations = Arc::new(StaticAirportLocations::new(Duration::ZERO));
    let state = build_state(test_config(true), locations.clone());

    let (status, _, _) = send_request(
        &state,
        measure_request(Some("not-a-uuid"), json!({"airIATAPortCodes": ["LAX", "JFK"]})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(locations.lookup_count(), 0);
}

#[tokio::test]
async fn test_same_key_different_parameters_conflicts() {
    let locations = Arc::new(StaticAirportLocations::new(Duration::ZERO));
    let state = build_state(test_config(true), locations.clone());
    let body = json!({"airIATAPortCodes": ["LAX", "JFK"]});

    let (status, _, _) = send_request(&state, measure_request(Some(KEY), body.clone())).await;
    assert_eq!(status, StatusCode::OK);

    // Same key, different query string → different operation fingerprint
    let request = Request::builder()
        .method("POST")
        .uri("/airport/measure-distance?unit=km")
        .header("content-type", "application/json")
        .header("Idempotency-Key", KEY)
        .body(Body::from(body.to_string()))
        .expect("request");
    let (status, headers, _) = send_request(&state, request).await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(
        headers["content-type"].to_str().expect("content type"),
        "application/problem+json"
    );
    assert_eq!(locations.lookup_count(), 2);
}

#[tokio::test]
async fn test_disabled_guard_always_allows() {
    let locations = Arc::new(StaticAirportLocations::new(Duration::ZERO));
    let state = build_state(test_config(false), locations.clone());
    let body = json!({"airIATAPortCodes": ["LAX", "JFK"]});

    for _ in 0..2 {
        let (status, _, _) = send_request(&state, measure_request(Some(KEY), body.clone())).await;
        assert_eq!(status, StatusCode::OK);
    }
    // both requests recomputed — no record keeping at all
    assert_eq!(locations.lookup_count(), 4);
}

#[tokio::test]
async fn test_concurrent_same_key_executes_downstream_once() {
    let locations = Arc::new(StaticAirportLocations::new(Duration::from_millis(50)));
    let state = build_state(test_config(true), locations.clone());
    let body = json!({"airIATAPortCodes": ["LAX", "JFK"]});

    let mut tasks = Vec::new();
    for _ in 0..2 {
        let state = state.clone();
        let body = body.clone();
        tasks.push(tokio::spawn(async move {
            send_request(&state, measure_request(Some(KEY), body)).await
        }));
    }

    let mut bodies = Vec::new();
    for task in tasks {
        let (status, _, body) = task.await.expect("task");
        assert_eq!(status, StatusCode::OK);
        bodies.push(body);
    }

    // one execution, the racing request got the identical replayed response
    assert_eq!(locations.lookup_count(), 2);
    assert_eq!(bodies[0], bodies[1]);
}

// ---------------------------------------------------------------------------
// Correlation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_correlation_header_round_trip() {
    let locations = Arc::new(StaticAirportLocations::new(Duration::ZERO));
    let state = build_state(test_config(false), locations);

    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .header("x-correlation-id", KEY)
        .body(Body::empty())
        .expect("request");
    let (status, headers, _) = send_request(&state, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-correlation-id"].to_str().expect("header"), KEY);
}

#[tokio::test]
async fn test_invalid_correlation_header_replaced_with_fresh_uuid() {
    let locations = Arc::new(StaticAirportLocations::new(Duration::ZERO));
    let state = build_state(test_config(false), locations);

    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .header("x-correlation-id", "not-a-uuid")
        .body(Body::empty())
        .expect("request");
    let (_, headers, _) = send_request(&state, request).await;

    let echoed = headers["x-correlation-id"].to_str().expect("header");
    assert_ne!(echoed, "not-a-uuid");
    assert!(uuid::Uuid::parse_str(echoed).is_ok());
}

// ---------------------------------------------------------------------------
// Error envelope
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_unclassified_error_maps_to_problem_details() {
    let state = build_state(test_config(false), Arc::new(FailingLocations));

    let (status, headers, body) = send_request(
        &state,
        measure_request(None, json!({"airIATAPortCodes": ["LAX", "JFK"]})),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        headers["content-type"].to_str().expect("content type"),
        "application/problem+json"
    );
    let problem: Value = serde_json::from_slice(&body).expect("problem json");
    assert_eq!(problem["title"], "location backend exploded");
    assert_eq!(problem["instance"], "/airport/measure-distance");
    assert!(problem["correlationId"].is_string());
    assert!(problem["traceId"].is_string());
}

#[tokio::test]
async fn test_domain_error_uses_code_status_table() {
    let locations = Arc::new(StaticAirportLocations::new(Duration::ZERO));
    let state = build_state(test_config(false), locations);

    // SXM is a valid code shape but not in the gazetteer
    let (status, _, body) = send_request(
        &state,
        measure_request(None, json!({"airIATAPortCodes": ["LAX", "SXM"]})),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    let problem: Value = serde_json::from_slice(&body).expect("problem json");
    assert_eq!(problem["errorCode"], "airportNotFound");
    assert_eq!(problem["title"], "Unknown IATA code SXM.");
}

#[tokio::test]
async fn test_validation_failure_lists_field_errors() {
    let locations = Arc::new(StaticAirportLocations::new(Duration::ZERO));
    let state = build_state(test_config(false), locations.clone());

    let (status, headers, body) = send_request(
        &state,
        measure_request(None, json!({"airIATAPortCodes": ["LAX"]})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        headers["content-type"].to_str().expect("content type"),
        "application/problem+json"
    );
    let problem: Value = serde_json::from_slice(&body).expect("problem json");
    assert!(problem["errors"]["airIATAPortCodes"][0].is_string());
    assert_eq!(locations.lookup_count(), 0);
}

// ---------------------------------------------------------------------------
// Logging pipeline side effects
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_client_body_is_never_truncated_by_log_capture() {
    let mut config = test_config(false);
    config.logging.log_request_body = true;
    config.logging.log_response_body = true;
    config.logging.max_body_length = 4;

    let locations = Arc::new(StaticAirportLocations::new(Duration::ZERO));
    let state = build_state(config, locations);

    let (status, _, body) = send_request(
        &state,
        measure_request(None, json!({"airIATAPortCodes": ["LAX", "JFK"]})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.len() > 4);
    // the replayed bytes are still valid JSON with the full payload
    let parsed: Value = serde_json::from_slice(&body).expect("json body");
    assert!(parsed["distance"].as_f64().is_some());
}

#[tokio::test]
async fn test_health_endpoint() {
    let locations = Arc::new(StaticAirportLocations::new(Duration::ZERO));
    let state = build_state(test_config(false), locations);

    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .expect("request");
    let (status, _, body) = send_request(&state, request).await;

    assert_eq!(status, StatusCode::OK);
    let parsed: Value = serde_json::from_slice(&body).expect("json body");
    assert_eq!(parsed["status"], "ok");
}
