use crate::context::CorrelationContext;
use crate::error::{ErrorCode, ValidationErrors};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::collections::BTreeMap;

/// Content type for error envelopes.
pub const PROBLEM_JSON: &str = "application/problem+json";

/// RFC 7807 error envelope. Serialized with camelCase keys, null fields
/// omitted; non-ASCII text passes through unescaped.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemDetails {
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<BTreeMap<String, Vec<String>>>,
}

impl ProblemDetails {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status: status.as_u16(),
            title: None,
            type_url: None,
            detail: None,
            instance: None,
            correlation_id: None,
            trace_id: None,
            error_code: None,
            errors: None,
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn type_url(mut self, type_url: impl Into<String>) -> Self {
        self.type_url = Some(type_url.into());
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    pub fn error_code(mut self, code: ErrorCode) -> Self {
        self.error_code = Some(code);
        self
    }

    pub fn errors(mut self, errors: ValidationErrors) -> Self {
        self.errors = Some(errors.into_map());
        self
    }

    /// Attach correlation/trace extensions when a context is resolvable.
    pub fn with_context(mut self, ctx: Option<&CorrelationContext>) -> Self {
        if let Some(ctx) = ctx {
            self.correlation_id = Some(ctx.correlation_id().to_string());
            self.trace_id = Some(ctx.trace_id());
        }
        self
    }
}

impl IntoResponse for ProblemDetails {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::to_string(&self).unwrap_or_else(|_| "{}".to_string());
        (status, [(header::CONTENT_TYPE, PROBLEM_JSON)], body).into_response()
    }
}
