use std::time::Instant;
use uuid::Uuid;

/// Per-request correlation context carrying the identifiers that thread all
/// log lines and error envelopes for one logical request.
/// Injected as an axum `Extension` by the correlation middleware and passed
/// read-only to every pipeline stage — never stored in thread-local state.
#[derive(Debug, Clone)]
pub struct CorrelationContext {
    /// Correlation id: taken from the inbound header when it parses as a
    /// UUID, freshly generated otherwise.
    correlation_id: Uuid,
    /// Fallback trace identifier used when no tracing span is active.
    fallback_trace_id: String,
    /// When the request was received.
    start_time: Instant,
}

impl CorrelationContext {
    /// Resolve the context from the raw inbound correlation header value.
    /// An absent or malformed value never fails the request.
    pub fn resolve(incoming: Option<&str>) -> Self {
        let correlation_id = incoming
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .unwrap_or_else(Uuid::new_v4);

        Self {
            correlation_id,
            fallback_trace_id: Uuid::new_v4().as_simple().to_string(),
            start_time: Instant::now(),
        }
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Trace identifier: prefers the currently active tracing span, falling
    /// back to the per-request identifier when no span (or no subscriber)
    /// exists.
    pub fn trace_id(&self) -> String {
        tracing::Span::current()
            .id()
            .map(|id| format!("{:x}", id.into_u64()))
            .unwrap_or_else(|| self.fallback_trace_id.clone())
    }

    /// Elapsed time since request start.
    pub fn elapsed_ms(&self) -> u128 {
        self.start_time.elapsed().as_millis()
    }
}
