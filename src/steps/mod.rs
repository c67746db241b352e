//! The concrete enrichment steps and the registry that builds them by name.

pub(crate) mod address_scraper;
pub(crate) mod email_analyzer;
pub(crate) mod hash_generator;
pub(crate) mod nearby_places;
pub(crate) mod phone_normalizer;
pub(crate) mod places_details;
pub(crate) mod places_search;
pub(crate) mod regional_stats;
pub(crate) mod registry_lookup;
pub(crate) mod review_insights;
pub(crate) mod review_sentiment;
pub(crate) mod website_summarizer;

use crate::error::{AppError, Result};
use crate::step::Step;

/// Every step in the order a full run applies them. Each step only needs
/// columns produced by steps before it.
pub(crate) const DEFAULT_ORDER: &[&str] = &[
    "hash_generator",
    "email_analyzer",
    "phone_normalizer",
    "address_scraper",
    "places_search",
    "places_details",
    "nearby_places",
    "registry_lookup",
    "review_sentiment",
    "website_summarizer",
    "review_insights",
    "regional_stats",
];

pub(crate) fn build_step(name: &str) -> Option<Box<dyn Step>> {
    let step: Box<dyn Step> = match name {
        "hash_generator" => Box::<hash_generator::HashGenerator>::default(),
        "email_analyzer" => Box::<email_analyzer::EmailAnalyzer>::default(),
        "phone_normalizer" => Box::<phone_normalizer::PhoneNormalizer>::default(),
        "address_scraper" => Box::<address_scraper::AddressScraper>::default(),
        "places_search" => Box::<places_search::PlacesSearch>::default(),
        "places_details" => Box::<places_details::PlacesDetails>::default(),
        "nearby_places" => Box::<nearby_places::NearbyPlaces>::default(),
        "registry_lookup" => Box::<registry_lookup::RegistryLookup>::default(),
        "review_sentiment" => Box::<review_sentiment::ReviewSentiment>::default(),
        "website_summarizer" => Box::<website_summarizer::WebsiteSummarizer>::default(),
        "review_insights" => Box::<review_insights::ReviewInsights>::default(),
        "regional_stats" => Box::<regional_stats::RegionalStats>::default(),
        _ => return None,
    };
    Some(step)
}

/// Builds the named steps in the given order, or the default sequence when
/// `names` is empty. `force_refresh` lists step names, or `all`.
pub(crate) fn build_steps(names: &[String], force_refresh: &[String]) -> Result<Vec<Box<dyn Step>>> {
    let names: Vec<&str> = if names.is_empty() {
        DEFAULT_ORDER.to_vec()
    } else {
        names.iter().map(|n| n.trim()).filter(|n| !n.is_empty()).collect()
    };
    let force_all = force_refresh.iter().any(|n| n.trim().eq_ignore_ascii_case("all"));
    for forced in force_refresh {
        let forced = forced.trim();
        if !forced.eq_ignore_ascii_case("all") && !DEFAULT_ORDER.contains(&forced) {
            return Err(AppError::Config(format!("Unknown step '{}' in --force-refresh", forced)));
        }
    }

    names
        .into_iter()
        .map(|name| {
            let mut step = build_step(name).ok_or_else(|| {
                AppError::Config(format!(
                    "Unknown step '{}'. Available steps: {}",
                    name,
                    DEFAULT_ORDER.join(", ")
                ))
            })?;
            step.set_force_refresh(force_all || force_refresh.iter().any(|f| f.trim() == name));
            Ok(step)
        })
        .collect()
}

/// One line per step: name, required columns and added columns.
pub(crate) fn describe_steps() -> Vec<String> {
    DEFAULT_ORDER
        .iter()
        .filter_map(|name| build_step(name))
        .map(|step| {
            let added: Vec<&str> = step.added_cols().iter().map(|c| c.name).collect();
            format!(
                "{:<20} requires [{}] adds [{}]",
                step.name(),
                step.required_cols().join(", "),
                added.join(", ")
            )
        })
        .collect()
}
