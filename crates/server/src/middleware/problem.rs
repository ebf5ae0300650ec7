use axum::extract::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use causeway_core::context::CorrelationContext;
use causeway_core::error::ApiError;
use std::sync::Arc;

/// Exception-to-problem-details mapper. Handlers return `ApiError`, whose
/// `IntoResponse` stashes the error in the response extensions; this layer
/// owns the `CorrelationContext` and rewrites the response into an enriched
/// `application/problem+json` envelope, logging per the error taxonomy.
///
/// Responses without a stashed error pass through untouched.
pub async fn problem_details_middleware(request: Request, next: Next) -> Response {
    let ctx = request.extensions().get::<CorrelationContext>().cloned();
    let instance = request.uri().path().to_string();

    let response = next.run(request).await;

    let Some(error) = response.extensions().get::<Arc<ApiError>>().cloned() else {
        return response;
    };

    match error.as_ref() {
        ApiError::Domain { code, message } => {
            tracing::warn!(error_code = ?code, "{message}");
        }
        ApiError::Validation(_) => {}
        ApiError::Canceled(message) => {
            // The client is still connected (a disconnect would have dropped
            // this future), so a diagnostic 500 is written.
            tracing::error!("Operation canceled while the client was connected: {message}");
        }
        ApiError::Internal(message) => {
            tracing::error!("Unhandled error: {message}");
        }
    }

    error.to_problem(ctx.as_ref(), Some(&instance)).into_response()
}
