use crate::context::CorrelationContext;
use crate::problem::ProblemDetails;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Application error codes surfaced to clients through the `errorCode`
/// problem-details extension. Codes are serialized as strings.
///
/// The code→status mapping lives in [`ErrorCode::status`]; extend it by
/// adding a variant and an arm. Unmapped codes fall back to 500.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    Unknown,
    AirportNotFound,
    UpstreamUnavailable,
}

impl ErrorCode {
    pub fn status(self) -> StatusCode {
        match self {
            Self::AirportNotFound => StatusCode::NOT_FOUND,
            Self::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Field-keyed validation failures. Keys are dot-joined property paths
/// (`airIATAPortCodes`, `airIATAPortCodes[1]`), values the messages for that
/// path, in the order they were recorded.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationErrors(BTreeMap<String, Vec<String>>);

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.0.entry(path.into()).or_default().push(message.into());
    }

    /// Dot-joins a parent path and a property name, tolerating either side
    /// being empty.
    pub fn join_path(prefix: &str, name: &str) -> String {
        match (prefix.is_empty(), name.is_empty()) {
            (true, _) => name.to_string(),
            (_, true) => prefix.to_string(),
            _ => format!("{prefix}.{name}"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_map(self) -> BTreeMap<String, Vec<String>> {
        self.0
    }
}

/// Unified error type for everything the pipeline can surface to a client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// Tagged domain failure; status comes from the code→status table.
    #[error("{message}")]
    Domain { code: ErrorCode, message: String },

    #[error("An error occurred while validating input parameters.")]
    Validation(ValidationErrors),

    /// The operation was canceled while the client was still connected.
    #[error("operation canceled: {0}")]
    Canceled(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Domain { code, .. } => code.status(),
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Canceled(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Builds the problem-details envelope for this error, enriched with
    /// correlation/trace extensions when a context is available.
    pub fn to_problem(
        &self,
        ctx: Option<&CorrelationContext>,
        instance: Option<&str>,
    ) -> ProblemDetails {
        let status = self.status_code();

        let mut problem = match self {
            Self::Domain { code, message } => ProblemDetails::new(status)
                .title(message.clone())
                .error_code(*code),
            Self::Validation(errors) => ProblemDetails::new(status)
                .title(self.to_string())
                .type_url("https://tools.ietf.org/html/rfc7231#section-6.5.1")
                .detail("See 'errors' property for more details")
                .errors(errors.clone()),
            Self::Canceled(_) | Self::Internal(_) => ProblemDetails::new(status)
                .title(self.to_string())
                .detail(format!("{self:?}")),
        };

        if let Some(instance) = instance {
            problem = problem.instance(instance);
        }
        problem.with_context(ctx)
    }
}

/// Fallback conversion used when a handler error escapes without passing the
/// problem-details mapper: an un-enriched envelope plus the error itself
/// stashed in the response extensions so the mapper can rebuild it with
/// correlation/trace context.
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = self.to_problem(None, None).into_response();
        response.extensions_mut().insert(Arc::new(self));
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_table_defaults_to_500() {
        assert_eq!(ErrorCode::Unknown.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ErrorCode::AirportNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::UpstreamUnavailable.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_error_code_serializes_as_string() {
        let json = serde_json::to_string(&ErrorCode::AirportNotFound).unwrap();
        assert_eq!(json, "\"airportNotFound\"");
    }

    #[test]
    fn test_validation_path_join() {
        assert_eq!(ValidationErrors::join_path("", "field"), "field");
        assert_eq!(ValidationErrors::join_path("parent", ""), "parent");
        assert_eq!(ValidationErrors::join_path("parent", "child"), "parent.child");
    }

    #[test]
    fn test_domain_error_title_is_message() {
        let err = ApiError::Domain {
            code: ErrorCode::Unknown,
            message: "boom".to_string(),
        };
        let problem = err.to_problem(None, Some("/airport/measure-distance"));
        let json = serde_json::to_value(&problem).unwrap();
        assert_eq!(json["title"], "boom");
        assert_eq!(json["status"], 500);
        assert_eq!(json["errorCode"], "unknown");
        assert_eq!(json["instance"], "/airport/measure-distance");
    }

    #[test]
    fn test_validation_error_carries_field_map() {
        let mut errors = ValidationErrors::new();
        errors.push("airIATAPortCodes", "must not be null");
        let problem = ApiError::Validation(errors).to_problem(None, None);
        let json = serde_json::to_value(&problem).unwrap();
        assert_eq!(json["status"], 400);
        assert_eq!(json["errors"]["airIATAPortCodes"][0], "must not be null");
    }
}
