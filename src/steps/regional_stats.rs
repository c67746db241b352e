//! Joins regional demographic and economic indicators by city location.

use super::places_search::FORMATTED_ADDRESS;
use crate::clients::geocoder::{Geocoder, NominatimClient, polygonal};
use crate::dataset::{Dataset, RowView};
use crate::error::{AppError, Result};
use crate::models::{ColumnKind, ColumnSpec, Value};
use crate::step::{RowEnricher, RowValues, Step, StepContext, StepState, run_row_step};
use async_trait::async_trait;
use geo::{Centroid, Contains, Coord, MapCoords, MultiPolygon, Point};
use geojson::GeoJson;
use std::f64::consts::PI;
use std::sync::Arc;

pub(crate) const COLUMN_PREFIX: &str = "regional_atlas_";

const fn indicator(name: &'static str) -> ColumnSpec {
    ColumnSpec::new(name, ColumnKind::Float)
}

const ADDED: &[ColumnSpec] = &[
    indicator("regional_atlas_pop_density"),
    indicator("regional_atlas_pop_development"),
    indicator("regional_atlas_age_0"),
    indicator("regional_atlas_age_1"),
    indicator("regional_atlas_age_2"),
    indicator("regional_atlas_age_3"),
    indicator("regional_atlas_age_4"),
    indicator("regional_atlas_pop_avg_age"),
    indicator("regional_atlas_per_service_sector"),
    indicator("regional_atlas_per_trade"),
    indicator("regional_atlas_employment_rate"),
    indicator("regional_atlas_unemployment_rate"),
    indicator("regional_atlas_per_long_term_unemployment"),
    indicator("regional_atlas_investments_p_employee"),
    indicator("regional_atlas_gross_salary_p_employee"),
    indicator("regional_atlas_disp_income_p_inhabitant"),
    indicator("regional_atlas_tot_income_p_taxpayer"),
    indicator("regional_atlas_gdp_p_employee"),
    indicator("regional_atlas_gdp_development"),
    indicator("regional_atlas_gdp_p_inhabitant"),
    indicator("regional_atlas_gdp_p_workhours"),
    indicator("regional_atlas_pop_avg_age_zensus"),
];

/// Country names that mean Germany in the languages addresses come in.
const GERMANY: &[&str] = &["deutschland", "germany", "allemagne", "alemania", "germania", "duitsland", "niemcy"];

const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// WGS84 degrees to Web Mercator metres.
fn to_mercator(c: Coord<f64>) -> Coord<f64> {
    let lat = c.y.clamp(-85.051_128_78, 85.051_128_78).to_radians();
    Coord {
        x: EARTH_RADIUS_M * c.x.to_radians(),
        y: EARTH_RADIUS_M * (PI / 4.0 + lat / 2.0).tan().ln(),
    }
}

fn from_mercator(c: Coord<f64>) -> Coord<f64> {
    Coord {
        x: (c.x / EARTH_RADIUS_M).to_degrees(),
        y: (2.0 * (c.y / EARTH_RADIUS_M).exp().atan() - PI / 2.0).to_degrees(),
    }
}

/// Centroid of a WGS84 polygon computed in metric space.
pub(crate) fn metric_centroid(polygon: &MultiPolygon<f64>) -> Option<Point<f64>> {
    let projected = polygon.map_coords(to_mercator);
    projected.centroid().map(|p| Point::from(from_mercator(p.0)))
}

/// City and country from the last two comma-separated address tokens.
/// Returns `None` unless the country is Germany.
pub(crate) fn german_city(address: &str) -> Option<(String, String)> {
    let tokens: Vec<&str> = address.split(',').map(str::trim).collect();
    if tokens.len() < 2 {
        return None;
    }
    let country = tokens[tokens.len() - 1];
    if !GERMANY.contains(&country.to_lowercase().as_str()) {
        return None;
    }
    let city = tokens[tokens.len() - 2]
        .trim_start_matches(|c: char| c.is_ascii_digit() || c.is_whitespace())
        .trim();
    (!city.is_empty()).then(|| (city.to_string(), country.to_string()))
}

/// One administrative region with its indicator values.
pub(crate) struct Region {
    pub boundary: MultiPolygon<f64>,
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl Region {
    fn indicator(&self, column: &str) -> Option<f64> {
        let key = column.strip_prefix(COLUMN_PREFIX).unwrap_or(column);
        match self.properties.get(key)? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().replace(',', ".").parse().ok(),
            _ => None,
        }
    }
}

/// Reads regions from a GeoJSON feature collection. Features without a
/// polygonal geometry are skipped.
pub(crate) fn parse_regions(raw: &str) -> Result<Vec<Region>> {
    let document: GeoJson = raw
        .parse()
        .map_err(|e| AppError::Parse(format!("Invalid regional statistics file: {}", e)))?;
    let GeoJson::FeatureCollection(collection) = document else {
        return Err(AppError::Parse("Regional statistics file is not a FeatureCollection".into()));
    };
    let mut regions = Vec::with_capacity(collection.features.len());
    for feature in collection.features {
        let Some(geometry) = feature.geometry else { continue };
        if let Some(boundary) = polygonal(geometry)? {
            regions.push(Region {
                boundary,
                properties: feature.properties.unwrap_or_default(),
            });
        }
    }
    Ok(regions)
}

/// Joins socio-economic indicators of the administrative region that
/// contains the lead's city.
#[derive(Default)]
pub(crate) struct RegionalStats {
    state: StepState,
    geocoder: Option<Arc<dyn Geocoder>>,
    regions: Option<Arc<Vec<Region>>>,
}

impl RegionalStats {
    #[cfg(test)]
    pub(crate) fn with_parts(geocoder: Arc<dyn Geocoder>, regions: Vec<Region>) -> Self {
        Self {
            geocoder: Some(geocoder),
            regions: Some(Arc::new(regions)),
            ..Self::default()
        }
    }
}

#[async_trait]
impl RowEnricher for RegionalStats {
    fn step_name(&self) -> &'static str {
        "regional_stats"
    }

    fn output_columns(&self) -> &'static [ColumnSpec] {
        ADDED
    }

    fn applies_to(&self, row: RowView<'_>) -> bool {
        row.text(FORMATTED_ADDRESS).is_some()
    }

    async fn enrich_row(&self, row: RowView<'_>, _ctx: &StepContext) -> Result<RowValues> {
        let (Some(geocoder), Some(regions)) = (&self.geocoder, &self.regions) else {
            return Err(AppError::step(self.step_name(), "geocoder or regions not loaded"));
        };
        let Some((city, country)) = german_city(row.text(FORMATTED_ADDRESS).unwrap_or_default()) else {
            return Ok(Vec::new());
        };
        let Some(boundary) = geocoder.city_polygon(&city, &country).await? else {
            tracing::debug!(target: "regional_stats", "No boundary for {}", city);
            return Ok(Vec::new());
        };
        let Some(centroid) = metric_centroid(&boundary) else {
            return Ok(Vec::new());
        };
        let Some(region) = regions.iter().find(|r| r.boundary.contains(&centroid)) else {
            tracing::debug!(target: "regional_stats", "No region contains the centroid of {}", city);
            return Ok(Vec::new());
        };
        Ok(ADDED
            .iter()
            .map(|column| (column.name, Value::from(region.indicator(column.name))))
            .collect())
    }
}

#[async_trait]
impl Step for RegionalStats {
    fn name(&self) -> &'static str {
        "regional_stats"
    }

    fn required_cols(&self) -> &'static [&'static str] {
        &[FORMATTED_ADDRESS]
    }

    fn added_cols(&self) -> &'static [ColumnSpec] {
        ADDED
    }

    fn state(&self) -> &StepState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut StepState {
        &mut self.state
    }

    async fn load_data(&mut self, ctx: &StepContext) -> Result<()> {
        if self.geocoder.is_none() {
            self.geocoder = Some(Arc::new(NominatimClient::from_config(&ctx.config)?));
        }
        if self.regions.is_none() {
            let path = &ctx.config.regional_statistics_path;
            let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
                AppError::step(self.name(), format!("cannot read {}: {}", path.display(), e))
            })?;
            let regions = parse_regions(&raw)?;
            tracing::info!(target: "regional_stats", "Loaded {} regions from {}", regions.len(), path.display());
            self.regions = Some(Arc::new(regions));
        }
        Ok(())
    }

    async fn run(&mut self, ctx: &StepContext) -> Result<Dataset> {
        run_row_step(self, ctx).await
    }
}
