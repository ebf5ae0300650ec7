pub mod handler;
pub mod location;
pub mod middleware;

use arc_swap::ArcSwap;
use axum::{middleware as axum_mw, Router};
use causeway_core::config::Config;
use causeway_core::idempotency::IdempotencyStore;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ArcSwap<Config>>,
    pub idempotency: Arc<IdempotencyStore>,
    pub locations: Arc<dyn location::AirportLocations>,
}

pub fn build_router(state: AppState) -> Router {
    let body_limit_bytes = state.config.load().body_limit_mb * 1024 * 1024;

    // Public routes — outside idempotency control
    let public_routes = Router::new().route("/health", axum::routing::get(handler::health::health));

    // API routes — idempotency-guarded, with body size limit. The problem
    // mapper sits inside the guard so handler failures are mapped to their
    // final envelope before the guard snapshots the response; replays are
    // byte-identical to what the first caller received.
    let api_routes = Router::new()
        .route(
            "/airport/measure-distance",
            axum::routing::post(handler::airport::measure_distance),
        )
        .layer(axum_mw::from_fn(
            middleware::problem::problem_details_middleware,
        ))
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            middleware::idempotency::idempotency_middleware,
        ))
        .layer(RequestBodyLimitLayer::new(body_limit_bytes));

    // Compose: public + api, then global middleware layers (outer → inner:
    // trace, cors, correlation, request logging)
    Router::new()
        .merge(public_routes)
        .merge(api_routes)
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            middleware::request_logging::request_logging_middleware,
        ))
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            middleware::correlation::correlation_middleware,
        ))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
