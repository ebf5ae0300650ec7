use async_trait::async_trait;
use causeway_core::config::Config;
use causeway_core::error::{ApiError, ErrorCode};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// Source of airport coordinates. The HTTP implementation is wired in
/// production; tests substitute a static one.
#[async_trait]
pub trait AirportLocations: Send + Sync {
    async fn lookup(&self, iata_code: &str) -> Result<GeoPoint, ApiError>;
}

/// Upstream location API client: `GET {base}/{CODE}` returning
/// `{"location": {"lat": .., "lon": ..}}`.
pub struct HttpAirportLocations {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAirportLocations {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout))
            .timeout(Duration::from_secs(config.request_timeout))
            .build()?;

        Ok(Self {
            client,
            base_url: config.airport_api.clone(),
        })
    }
}

#[derive(Deserialize)]
struct LocationEnvelope {
    location: GeoPoint,
}

#[async_trait]
impl AirportLocations for HttpAirportLocations {
    async fn lookup(&self, iata_code: &str) -> Result<GeoPoint, ApiError> {
        let url = format!("{}/{}", self.base_url, iata_code);

        let response = self.client.get(&url).send().await.map_err(|e| ApiError::Domain {
            code: ErrorCode::UpstreamUnavailable,
            message: format!("Airport lookup for {iata_code} failed: {e}"),
        })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ApiError::Domain {
                code: ErrorCode::AirportNotFound,
                message: format!("Unknown IATA code {iata_code}."),
            });
        }

        let response = response.error_for_status().map_err(|e| ApiError::Domain {
            code: ErrorCode::UpstreamUnavailable,
            message: format!("Airport lookup for {iata_code} failed: {e}"),
        })?;

        let envelope: LocationEnvelope = response.json().await.map_err(|e| ApiError::Domain {
            code: ErrorCode::UpstreamUnavailable,
            message: format!("Airport lookup for {iata_code} returned an invalid payload: {e}"),
        })?;

        Ok(envelope.location)
    }
}
