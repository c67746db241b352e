//! Google Places: text search, place details and nearby search.

use super::{expect_success, http_client};
use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::Review;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

const SERVICE: &str = "places";

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub(crate) struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub(crate) struct Geometry {
    pub location: LatLng,
}

/// One candidate of a text search.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub(crate) struct PlaceCandidate {
    pub place_id: Option<String>,
    pub name: Option<String>,
    pub formatted_address: Option<String>,
    pub business_status: Option<String>,
    pub user_ratings_total: Option<i64>,
    pub geometry: Option<Geometry>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub(crate) struct PlaceDetails {
    pub website: Option<String>,
    pub types: Vec<String>,
    pub reviews: Option<Vec<Review>>,
}

#[async_trait]
pub(crate) trait PlacesApi: Send + Sync {
    /// Candidates for a free-text query, best match first.
    async fn find_place(&self, query: &str) -> Result<Vec<PlaceCandidate>>;

    async fn place_details(&self, place_id: &str) -> Result<Option<PlaceDetails>>;

    /// Raw establishment results around a coordinate.
    async fn nearby(&self, lat: f64, lng: f64, radius_m: u32) -> Result<Vec<serde_json::Value>>;
}

#[derive(Deserialize)]
struct Envelope<T> {
    status: String,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(flatten)]
    body: T,
}

#[derive(Deserialize, Default)]
struct FindPlaceBody {
    #[serde(default)]
    candidates: Vec<PlaceCandidate>,
}

#[derive(Deserialize, Default)]
struct DetailsBody {
    #[serde(default)]
    result: Option<PlaceDetails>,
}

#[derive(Deserialize, Default)]
struct NearbyBody {
    #[serde(default)]
    results: Vec<serde_json::Value>,
}

/// Maps the Places `status` field to a result. `ZERO_RESULTS` is not an error.
fn check_status(status: &str, error_message: Option<&str>) -> Result<()> {
    match status {
        "OK" | "ZERO_RESULTS" => Ok(()),
        other => Err(AppError::ExternalApi {
            service: SERVICE,
            message: format!("{}: {}", other, error_message.unwrap_or("no message")),
        }),
    }
}

pub(crate) struct GooglePlacesClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl GooglePlacesClient {
    pub(crate) fn from_config(config: &Config) -> Result<Self> {
        let api_key = config
            .google_places_api_key
            .clone()
            .ok_or_else(|| AppError::Config("GOOGLE_PLACES_API_KEY is not set".to_string()))?;
        Ok(Self {
            http: http_client(config, config.request_timeout)?,
            base_url: config.places_base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    async fn get<T>(&self, endpoint: &str, params: &[(&str, String)]) -> Result<T>
    where
        T: for<'de> Deserialize<'de> + Default,
    {
        let url = format!("{}/{}/json", self.base_url, endpoint);
        tracing::debug!(target: "places", "GET {} {:?}", url, params.iter().map(|(k, _)| *k).collect::<Vec<_>>());
        let response = self
            .http
            .get(&url)
            .query(params)
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await?;
        let envelope: Envelope<T> = expect_success(SERVICE, response).await?.json().await?;
        check_status(&envelope.status, envelope.error_message.as_deref())?;
        Ok(envelope.body)
    }
}

#[async_trait]
impl PlacesApi for GooglePlacesClient {
    async fn find_place(&self, query: &str) -> Result<Vec<PlaceCandidate>> {
        let body: FindPlaceBody = self
            .get(
                "findplacefromtext",
                &[
                    ("input", query.to_string()),
                    ("inputtype", "textquery".to_string()),
                    (
                        "fields",
                        "business_status,formatted_address,geometry,name,place_id,user_ratings_total"
                            .to_string(),
                    ),
                ],
            )
            .await?;
        Ok(body.candidates)
    }

    async fn place_details(&self, place_id: &str) -> Result<Option<PlaceDetails>> {
        let body: DetailsBody = self
            .get(
                "details",
                &[
                    ("place_id", place_id.to_string()),
                    ("fields", "website,type,review".to_string()),
                    ("reviews_no_translations", "true".to_string()),
                ],
            )
            .await?;
        Ok(body.result)
    }

    async fn nearby(&self, lat: f64, lng: f64, radius_m: u32) -> Result<Vec<serde_json::Value>> {
        let body: NearbyBody = self
            .get(
                "nearbysearch",
                &[
                    ("location", format!("{},{}", lat, lng)),
                    ("radius", radius_m.to_string()),
                    ("type", "establishment".to_string()),
                ],
            )
            .await?;
        Ok(body.results)
    }
}
