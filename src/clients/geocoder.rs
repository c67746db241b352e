//! City boundary lookup through a Nominatim-compatible geocoder.

use super::{expect_success, http_client};
use crate::config::Config;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use geo::{Geometry, MultiPolygon};
use geojson::GeoJson;
use reqwest::Client;

const SERVICE: &str = "geocoder";

#[async_trait]
pub(crate) trait Geocoder: Send + Sync {
    /// Boundary of `city` in WGS84 degrees, if the geocoder knows one.
    async fn city_polygon(&self, city: &str, country: &str) -> Result<Option<MultiPolygon<f64>>>;
}

/// First polygonal geometry of a GeoJSON document.
pub(crate) fn first_polygon(document: GeoJson) -> Result<Option<MultiPolygon<f64>>> {
    let geometries: Vec<geojson::Geometry> = match document {
        GeoJson::FeatureCollection(collection) => collection
            .features
            .into_iter()
            .filter_map(|feature| feature.geometry)
            .collect(),
        GeoJson::Feature(feature) => feature.geometry.into_iter().collect(),
        GeoJson::Geometry(geometry) => vec![geometry],
    };
    for geometry in geometries {
        if let Some(multi) = polygonal(geometry)? {
            return Ok(Some(multi));
        }
    }
    Ok(None)
}

/// The geometry as a multipolygon, `None` for points and lines.
pub(crate) fn polygonal(geometry: geojson::Geometry) -> Result<Option<MultiPolygon<f64>>> {
    let converted = Geometry::<f64>::try_from(geometry)
        .map_err(|e| AppError::Parse(format!("Unusable GeoJSON geometry: {}", e)))?;
    Ok(match converted {
        Geometry::Polygon(polygon) => Some(MultiPolygon::new(vec![polygon])),
        Geometry::MultiPolygon(multi) => Some(multi),
        _ => None,
    })
}

pub(crate) struct NominatimClient {
    http: Client,
    base_url: String,
}

impl NominatimClient {
    pub(crate) fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            http: http_client(config, config.request_timeout)?,
            base_url: config.geocoder_base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Geocoder for NominatimClient {
    async fn city_polygon(&self, city: &str, country: &str) -> Result<Option<MultiPolygon<f64>>> {
        let response = self
            .http
            .get(format!("{}/search", self.base_url))
            .query(&[
                ("city", city),
                ("country", country),
                ("format", "geojson"),
                ("polygon_geojson", "1"),
                ("limit", "1"),
            ])
            .send()
            .await?;
        let body = expect_success(SERVICE, response).await?.text().await?;
        let document: GeoJson = body
            .parse()
            .map_err(|e| AppError::Parse(format!("Geocoder returned invalid GeoJSON: {}", e)))?;
        first_polygon(document)
    }
}
