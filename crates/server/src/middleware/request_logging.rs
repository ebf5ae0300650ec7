use crate::AppState;
use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use causeway_core::context::CorrelationContext;
use causeway_core::scope::LogScope;
use serde_json::{Map, Value};
use std::net::SocketAddr;

/// Sentinel used when no client address can be resolved.
const UNKNOWN_CLIENT_IP: &str = "0.0.0.0";

/// Middleware emitting exactly two log events per request — "HTTP request
/// received" and "HTTP request handled" — with attributes accumulated across
/// the pipeline stages into one shared [`LogScope`].
///
/// Stage order: skip-path check, network (client ip), header capture,
/// optional request-body capture, idempotency-key capture, downstream,
/// response capture. A failure in any capture step degrades to an event
/// without that attribute; it never aborts the request.
pub async fn request_logging_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let cfg = state.config.load();
    let path = request.uri().path().to_string();

    // Skip-path stage: noisy endpoints bypass all remaining logging stages.
    if cfg.logging.skip_paths.iter().any(|p| p == &path) {
        return next.run(request).await;
    }

    let ctx = request.extensions().get::<CorrelationContext>().cloned();
    let mut scope = LogScope::new();

    // Network stage
    scope.begin_frame();
    if let Some(ctx) = &ctx {
        scope.push("correlationId", ctx.correlation_id().to_string());
    }
    scope.push(
        "clientIp",
        resolve_client_ip(&request, &cfg.forwarded_ip_header),
    );

    // Header-capture stage
    scope.begin_frame();
    let uri = request.uri();
    scope.push("requestProtocol", format!("{:?}", request.version()));
    scope.push("requestScheme", uri.scheme_str().unwrap_or("http"));
    if let Some(host) = host_of(&request) {
        scope.push("requestHost", host);
    }
    scope.push("requestMethod", request.method().as_str());
    scope.push("requestPath", path.clone());
    scope.push("requestQuery", uri.query().unwrap_or_default());
    scope.push(
        "requestPathAndQuery",
        uri.path_and_query().map(|pq| pq.as_str()).unwrap_or(&path),
    );
    scope.push(
        "requestHeaders",
        headers_to_attributes(request.headers(), &cfg.logging.skip_request_headers),
    );

    // Optional request-body stage: buffer, log truncated, and hand the
    // downstream consumer the full body from the start.
    let request = if cfg.logging.log_request_body {
        let (parts, body) = request.into_parts();
        match to_bytes(body, usize::MAX).await {
            Ok(bytes) => {
                scope.begin_frame();
                scope.push(
                    "requestBody",
                    truncate_chars(&String::from_utf8_lossy(&bytes), cfg.logging.max_body_length),
                );
                Request::from_parts(parts, Body::from(bytes))
            }
            Err(e) => {
                tracing::debug!("Request body capture failed: {e}");
                Request::from_parts(parts, Body::empty())
            }
        }
    } else {
        request
    };

    // Idempotency-scope stage: observability only, no behavioral effect.
    if let Some(key) = request
        .headers()
        .get(cfg.idempotency.header.as_str())
        .and_then(|v| v.to_str().ok())
    {
        scope.begin_frame();
        scope.push("idempotencyKey", key);
    }

    tracing::info!(attributes = %scope, "HTTP request received");

    // If the client disconnects, the request future is dropped mid-await;
    // the guard still emits the handled event, flagged as aborted.
    let mut abort_log = AbortLog {
        scope: scope.clone(),
        ctx: ctx.clone(),
        armed: true,
    };
    let response = next.run(request).await;
    abort_log.armed = false;
    drop(abort_log);

    // Response-capture stage
    scope.begin_frame();
    scope.push(
        "responseHeaders",
        headers_to_attributes(response.headers(), &cfg.logging.skip_response_headers),
    );
    scope.push("statusCode", response.status().as_u16());
    if let Some(ctx) = &ctx {
        scope.push("elapsedMs", ctx.elapsed_ms() as u64);
    }
    scope.push("requestAborted", false);

    let response = if cfg.logging.log_response_body {
        let (parts, body) = response.into_parts();
        match to_bytes(body, usize::MAX).await {
            Ok(bytes) => {
                scope.push(
                    "responseBody",
                    truncate_chars(&String::from_utf8_lossy(&bytes), cfg.logging.max_body_length),
                );
                // replay byte-for-byte, untruncated
                Response::from_parts(parts, Body::from(bytes))
            }
            Err(e) => {
                tracing::debug!("Response body capture failed: {e}");
                Response::from_parts(parts, Body::empty())
            }
        }
    } else {
        response
    };

    tracing::info!(attributes = %scope, "HTTP request handled");

    response
}

struct AbortLog {
    scope: LogScope,
    ctx: Option<CorrelationContext>,
    armed: bool,
}

impl Drop for AbortLog {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.scope.begin_frame();
        self.scope.push("requestAborted", true);
        if let Some(ctx) = &self.ctx {
            self.scope.push("elapsedMs", ctx.elapsed_ms() as u64);
        }
        tracing::info!(attributes = %self.scope, "HTTP request handled");
    }
}

/// Client IP resolution: a configured forwarded-IP header wins (last hop of
/// the comma-separated chain, trailing `:port` stripped); otherwise the
/// transport peer address; otherwise the `0.0.0.0` sentinel.
fn resolve_client_ip(request: &Request, forwarded_header: &str) -> String {
    if let Some(value) = request
        .headers()
        .get(forwarded_header)
        .and_then(|v| v.to_str().ok())
    {
        let ip = ip_from_forwarded(value);
        if !ip.is_empty() {
            return ip;
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT_IP.to_string())
}

fn ip_from_forwarded(value: &str) -> String {
    let last = value.split(',').next_back().unwrap_or_default().trim();
    match last.rsplit_once(':') {
        Some((host, port))
            if !host.is_empty() && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            host.to_string()
        }
        _ => last.to_string(),
    }
}

/// Headers as a log attribute object, minus the redaction list. The list is
/// pre-lowercased at config load; header names are lowercased here, so the
/// match is case-insensitive regardless of what the wire carried.
fn headers_to_attributes(headers: &HeaderMap, skip: &[String]) -> Value {
    let mut map = Map::new();
    for (name, value) in headers {
        let name = name.as_str().to_ascii_lowercase();
        if skip.iter().any(|s| s == &name) {
            continue;
        }
        let value = String::from_utf8_lossy(value.as_bytes()).to_string();
        map.insert(name, Value::String(value));
    }
    Value::Object(map)
}

/// Caps logged body text at `max` characters; `max == 0` disables the cap.
fn truncate_chars(text: &str, max: usize) -> String {
    if max > 0 && text.chars().count() > max {
        text.chars().take(max).collect()
    } else {
        text.to_string()
    }
}

fn host_of(request: &Request) -> Option<String> {
    request
        .uri()
        .host()
        .map(str::to_string)
        .or_else(|| {
            request
                .headers()
                .get(axum::http::header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
}
