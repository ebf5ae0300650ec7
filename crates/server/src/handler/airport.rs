use crate::AppState;
use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use causeway_core::error::{ApiError, ValidationErrors};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const CODES_FIELD: &str = "airIATAPortCodes";

#[derive(Debug, Deserialize)]
pub struct AirportDistanceQuery {
    #[serde(rename = "airIATAPortCodes", default)]
    pub air_iata_port_codes: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AirportDistance {
    pub distance: f64,
}

/// `POST /airport/measure-distance`: resolve both airports' coordinates and
/// return the Euclidean distance between them. Lookups run under the
/// configured request timeout; expiry maps to a cancellation error rather
/// than leaving the client hanging.
pub async fn measure_distance(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<AirportDistance>, ApiError> {
    let query: AirportDistanceQuery = serde_json::from_slice(&body).map_err(|e| {
        let mut errors = ValidationErrors::new();
        errors.push(CODES_FIELD, format!("request body is not valid JSON: {e}"));
        ApiError::Validation(errors)
    })?;
    let codes = validate(&query)?;

    let request_timeout = Duration::from_secs(state.config.load().request_timeout);
    let lookups = async {
        tokio::try_join!(
            state.locations.lookup(&codes[0]),
            state.locations.lookup(&codes[1]),
        )
    };
    let (from, to) = tokio::time::timeout(request_timeout, lookups)
        .await
        .map_err(|_| {
            ApiError::Canceled("airport lookups did not complete within the request timeout".to_string())
        })??;

    let distance = ((to.lon - from.lon).powi(2) + (to.lat - from.lat).powi(2)).sqrt();

    Ok(Json(AirportDistance { distance }))
}

fn validate(query: &AirportDistanceQuery) -> Result<&[String], ApiError> {
    let mut errors = ValidationErrors::new();

    let Some(codes) = &query.air_iata_port_codes else {
        errors.push(CODES_FIELD, "must not be null");
        return Err(ApiError::Validation(errors));
    };

    if codes.len() != 2 {
        errors.push(CODES_FIELD, "exactly two IATA codes are required");
    }
    for (i, code) in codes.iter().enumerate() {
        if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_alphabetic()) {
            errors.push(
                format!("{CODES_FIELD}[{i}]"),
                "must be a three-letter IATA code",
            );
        }
    }

    if errors.is_empty() {
        Ok(codes)
    } else {
        Err(ApiError::Validation(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(codes: Option<Vec<&str>>) -> AirportDistanceQuery {
        AirportDistanceQuery {
            air_iata_port_codes: codes.map(|c| c.into_iter().map(str::to_string).collect()),
        }
    }

    #[test]
    fn test_validate_accepts_two_codes() {
        assert!(validate(&query(Some(vec!["LAX", "JFK"]))).is_ok());
    }

    #[test]
    fn test_validate_rejects_null_field() {
        let err = validate(&query(None)).expect_err("null must be rejected");
        let json = serde_json::to_value(err.to_problem(None, None)).expect("problem json");
        assert_eq!(json["errors"]["airIATAPortCodes"][0], "must not be null");
    }

    #[test]
    fn test_validate_rejects_wrong_arity() {
        assert!(validate(&query(Some(vec!["LAX"]))).is_err());
        assert!(validate(&query(Some(vec!["LAX", "JFK", "SFO"]))).is_err());
    }

    #[test]
    fn test_validate_keys_element_errors_by_index() {
        let err = validate(&query(Some(vec!["LAX", "NEW YORK"]))).expect_err("bad code");
        let json = serde_json::to_value(err.to_problem(None, None)).expect("problem json");
        assert_eq!(
            json["errors"]["airIATAPortCodes[1]"][0],
            "must be a three-letter IATA code"
        );
    }
}
