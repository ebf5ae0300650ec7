use crate::AppState;
use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use causeway_core::context::CorrelationContext;
use causeway_core::idempotency::{fingerprint, GuardDecision, RejectReason, StoredResponse};
use causeway_core::problem::ProblemDetails;
use uuid::Uuid;

/// Route-layer middleware enforcing at-most-once execution per
/// client-supplied idempotency key. Applied explicitly at route
/// registration; routes without it are never guarded.
///
/// Decisions:
/// - enforcement disabled → pass through;
/// - missing/invalid key → 400 problem, downstream never invoked;
/// - completed record for the same operation → replay stored response
///   verbatim;
/// - in-flight or mismatched record → 409 problem (after a bounded wait for
///   the in-flight case).
pub async fn idempotency_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let cfg = state.config.load();
    if !cfg.idempotency.enabled {
        return next.run(request).await;
    }

    let ctx = request.extensions().get::<CorrelationContext>().cloned();
    let path = request.uri().path().to_string();

    let key = request
        .headers()
        .get(cfg.idempotency.header.as_str())
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v.trim()).ok());

    let Some(key) = key else {
        return ProblemDetails::new(StatusCode::BAD_REQUEST)
            .title(format!(
                "The {} header is required and must be a UUID.",
                cfg.idempotency.header
            ))
            .instance(path)
            .with_context(ctx.as_ref())
            .into_response();
    };

    let operation = fingerprint(request.method().as_str(), &path, request.uri().query());

    match state.idempotency.guard(key, operation).await {
        GuardDecision::Allow(exec) => {
            let response = next.run(request).await;
            complete_and_forward(exec, response).await
        }
        GuardDecision::Replay(stored) => {
            tracing::info!(idempotency_key = %key, "Replaying stored response for retried request");
            replay(stored)
        }
        GuardDecision::Reject(RejectReason::AlreadyExecuting) => {
            tracing::warn!(idempotency_key = %key, "Rejecting concurrent request: key is already executing");
            ProblemDetails::new(StatusCode::CONFLICT)
                .title("A request with the same idempotency key is already executing.")
                .instance(path)
                .with_context(ctx.as_ref())
                .into_response()
        }
        GuardDecision::Reject(RejectReason::FingerprintMismatch) => {
            tracing::warn!(idempotency_key = %key, "Rejecting request: key was issued for different parameters");
            ProblemDetails::new(StatusCode::CONFLICT)
                .title("The idempotency key was already used for a request with different parameters.")
                .instance(path)
                .with_context(ctx.as_ref())
                .into_response()
        }
    }
}

/// Buffers the downstream response so it can be cached for replay, then
/// forwards it byte-for-byte. Client disconnects drop this future before
/// `complete`, which resets the key for retry via the guard's Drop.
async fn complete_and_forward(
    exec: causeway_core::idempotency::ExecutionGuard,
    response: Response,
) -> Response {
    let (parts, body) = response.into_parts();
    match to_bytes(body, usize::MAX).await {
        Ok(bytes) => {
            let headers = parts
                .headers
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();
            exec.complete(StoredResponse {
                status: parts.status.as_u16(),
                headers,
                body: bytes.clone(),
            });
            Response::from_parts(parts, Body::from(bytes))
        }
        Err(e) => {
            // Nothing cacheable was produced; dropping the guard leaves the
            // key retryable.
            tracing::warn!(idempotency_key = %exec.key(), "Response buffering failed: {e}");
            drop(exec);
            Response::from_parts(parts, Body::empty())
        }
    }
}

fn replay(stored: StoredResponse) -> Response {
    let mut builder = Response::builder().status(stored.status);
    for (name, value) in &stored.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    match builder.body(Body::from(stored.body)) {
        Ok(response) => response,
        Err(e) => {
            tracing::error!("Stored response could not be rebuilt: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
