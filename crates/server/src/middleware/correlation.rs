use crate::AppState;
use axum::extract::State;
use axum::http::{HeaderName, HeaderValue};
use axum::{extract::Request, middleware::Next, response::Response};
use causeway_core::context::CorrelationContext;

/// Middleware that resolves the `CorrelationContext` from the inbound
/// correlation header and injects it as an axum Extension. The resolved id
/// is echoed on the response so callers can correlate across services.
pub async fn correlation_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let header = state.config.load().correlation_header.clone();

    let incoming = request
        .headers()
        .get(header.as_str())
        .and_then(|v| v.to_str().ok());
    let ctx = CorrelationContext::resolve(incoming);
    let correlation_id = ctx.correlation_id().to_string();

    request.extensions_mut().insert(ctx);
    let mut response = next.run(request).await;

    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(header.as_bytes()),
        HeaderValue::from_str(&correlation_id),
    ) {
        response.headers_mut().insert(name, value);
    }

    response
}
