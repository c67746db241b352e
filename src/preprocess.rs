//! Turns the enriched lead table into numeric model features.

use crate::config::Config;
use crate::dataset::{Dataset, RowView};
use crate::error::{AppError, Result};
use crate::models::{ColumnKind, IDENTITY_COLUMNS, Value};
use crate::steps::email_analyzer::{EMAIL_VALID, FIRST_NAME_IN_ACCOUNT, LAST_NAME_IN_ACCOUNT};
use crate::steps::nearby_places::NO_SIMILAR_BUSINESSES;
use crate::steps::phone_normalizer::{NUMBER_AREA, NUMBER_COUNTRY, NUMBER_POSSIBLE, NUMBER_VALID};
use crate::steps::places_details::TYPE;
use crate::steps::places_search::{NO_CANDIDATES, PLACE_ID, USER_RATINGS_TOTAL};
use crate::steps::regional_stats::COLUMN_PREFIX as REGIONAL_PREFIX;
use crate::steps::registry_lookup::COMPANY_CAPITAL;
use crate::steps::review_insights::{
    AVG_GRAMMATICAL_SCORE, HIGHEST_RATING_RATIO, LOWEST_RATING_RATIO, POLARIZATION_SCORE, RATING_TREND,
};
use crate::steps::review_sentiment::REVIEWS_SENTIMENT_SCORE;
use crate::storage::{PreprocessedKind, StorageBackend};
use std::collections::{BTreeMap, BTreeSet};

/// Training label column.
pub(crate) const LABEL: &str = "MerchantSizeByDPV";

/// Label values in encoding order.
pub(crate) const MERCHANT_SIZES: [&str; 5] = ["XS", "S", "M", "L", "XL"];

pub(crate) const RATINGS_PER_SIMILAR_BUSINESS: &str = "ratings_per_similar_business";

const BOOL_FEATURES: &[&str] = &[
    EMAIL_VALID,
    FIRST_NAME_IN_ACCOUNT,
    LAST_NAME_IN_ACCOUNT,
    NUMBER_VALID,
    NUMBER_POSSIBLE,
];

/// Heavy-tailed counts, fed to models as `ln(1 + x)`.
const COUNT_FEATURES: &[&str] = &[USER_RATINGS_TOTAL, NO_CANDIDATES, NO_SIMILAR_BUSINESSES, COMPANY_CAPITAL];

const NUMERIC_FEATURES: &[&str] = &[
    REVIEWS_SENTIMENT_SCORE,
    AVG_GRAMMATICAL_SCORE,
    POLARIZATION_SCORE,
    HIGHEST_RATING_RATIO,
    LOWEST_RATING_RATIO,
    RATING_TREND,
];

const CATEGORICAL_FEATURES: &[&str] = &[NUMBER_COUNTRY, NUMBER_AREA, TYPE];

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum Mode {
    /// Keep the label and record the feature schema.
    Train,
    /// Align features to the recorded training schema.
    Inference,
}

/// Label index of a merchant size, e.g. `M` → 2.
pub(crate) fn encode_label(value: &str) -> Option<i64> {
    let value = value.trim().to_ascii_uppercase();
    MERCHANT_SIZES.iter().position(|s| *s == value).map(|i| i as i64)
}

/// Lowercase alphanumerics with runs of anything else collapsed to `_`.
pub(crate) fn sanitize(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.trim().to_lowercase().chars() {
        if c.is_alphanumeric() {
            out.push(c);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

fn one_hot_column(column: &str, value: &str) -> String {
    format!("{}_{}", column, sanitize(value))
}

fn number(row: RowView<'_>, column: &str) -> f64 {
    row.get(column).as_f64().unwrap_or(0.0)
}

fn flag(row: RowView<'_>, column: &str) -> f64 {
    if row.flag(column).unwrap_or(false) { 1.0 } else { 0.0 }
}

pub(crate) struct Preprocessor {
    mode: Mode,
    drop_rows_without_place_id: bool,
}

impl Preprocessor {
    pub(crate) fn new(mode: Mode, config: &Config) -> Self {
        Self {
            mode,
            drop_rows_without_place_id: config.drop_rows_without_place_id,
        }
    }

    /// Identity columns followed by every derived feature, plus the encoded
    /// label in training mode.
    pub(crate) fn build_features(&self, enriched: &Dataset) -> Result<Dataset> {
        let mut source = enriched.clone();
        if self.mode == Mode::Train {
            if !source.has_column(LABEL) {
                return Err(AppError::InputMissing(format!("Training data lacks the '{}' column", LABEL)));
            }
            let before = source.len();
            let drop_unplaced = self.drop_rows_without_place_id;
            source.retain_rows(|row| {
                row.text(LABEL).and_then(encode_label).is_some()
                    && (!drop_unplaced || row.text(PLACE_ID).is_some())
            });
            tracing::info!(target: "preprocess", "Dropped {} of {} rows", before - source.len(), before);
        }

        let regional: Vec<String> = source
            .columns()
            .filter(|c| c.starts_with(REGIONAL_PREFIX))
            .map(str::to_string)
            .collect();
        let mut categories: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
        for &column in CATEGORICAL_FEATURES {
            let values = categories.entry(column).or_default();
            for index in 0..source.len() {
                if let Some(value) = source.row(index).text(column) {
                    let name = one_hot_column(column, value);
                    if name.len() > column.len() + 1 {
                        values.insert(name);
                    }
                }
            }
        }

        let mut features: Vec<String> = Vec::new();
        features.extend(BOOL_FEATURES.iter().map(|c| c.to_string()));
        features.extend(COUNT_FEATURES.iter().map(|c| c.to_string()));
        features.push(RATINGS_PER_SIMILAR_BUSINESS.to_string());
        features.extend(NUMERIC_FEATURES.iter().map(|c| c.to_string()));
        features.extend(regional.iter().cloned());
        for values in categories.values() {
            features.extend(values.iter().cloned());
        }

        let mut out = Dataset::with_columns(&IDENTITY_COLUMNS);
        for feature in &features {
            out.declare_column(feature, ColumnKind::Float)?;
        }
        if self.mode == Mode::Train {
            out.declare_column(LABEL, ColumnKind::Int)?;
        }

        for index in 0..source.len() {
            let row = source.row(index);
            let mut cells: Vec<(&str, Value)> = Vec::with_capacity(features.len() + IDENTITY_COLUMNS.len() + 1);
            for column in IDENTITY_COLUMNS {
                cells.push((column, row.get(column).clone()));
            }
            for &column in BOOL_FEATURES {
                cells.push((column, Value::Float(flag(row, column))));
            }
            for &column in COUNT_FEATURES {
                cells.push((column, Value::Float(number(row, column).max(0.0).ln_1p())));
            }
            let ratings = number(row, USER_RATINGS_TOTAL).max(0.0);
            let similar = number(row, NO_SIMILAR_BUSINESSES).max(0.0);
            cells.push((RATINGS_PER_SIMILAR_BUSINESS, Value::Float(ratings / (1.0 + similar))));
            for &column in NUMERIC_FEATURES {
                cells.push((column, Value::Float(number(row, column))));
            }
            for column in &regional {
                cells.push((column.as_str(), Value::Float(number(row, column))));
            }
            let hot: BTreeSet<String> = CATEGORICAL_FEATURES
                .iter()
                .filter_map(|c| row.text(c).map(|v| one_hot_column(c, v)))
                .collect();
            for values in categories.values() {
                for name in values {
                    let on = if hot.contains(name) { 1.0 } else { 0.0 };
                    cells.push((name.as_str(), Value::Float(on)));
                }
            }
            if self.mode == Mode::Train {
                cells.push((LABEL, Value::from(row.text(LABEL).and_then(encode_label))));
            }
            out.push_row(cells)?;
        }
        Ok(out)
    }

    /// Reads the enriched dataset, derives features and persists them. In
    /// training mode the feature header becomes the historical schema; in
    /// inference mode the features are aligned to it.
    pub(crate) async fn run(&self, storage: &dyn StorageBackend) -> Result<Dataset> {
        let enriched = storage.load_enriched().await?.ok_or_else(|| {
            AppError::InputMissing(format!("Enriched dataset '{}' not found", storage.output_key()))
        })?;
        let features = self.build_features(&enriched)?;

        let result = match self.mode {
            Mode::Train => {
                let header: Vec<&str> = features
                    .columns()
                    .filter(|c| !IDENTITY_COLUMNS.contains(c))
                    .collect();
                storage
                    .save_preprocessed(PreprocessedKind::Historical, &Dataset::with_columns(&header))
                    .await?;
                features
            }
            Mode::Inference => {
                let schema = storage
                    .load_preprocessed(PreprocessedKind::Historical)
                    .await?
                    .ok_or_else(|| {
                        AppError::InputMissing(
                            "No historical feature schema; run preprocessing in train mode first".to_string(),
                        )
                    })?;
                align(&features, &schema)?
            }
        };

        storage.save_preprocessed(PreprocessedKind::Current, &result).await?;
        tracing::info!(target: "preprocess",
            "Preprocessed {} rows into {} columns ({:?} mode)",
            result.len(),
            result.columns().count(),
            self.mode
        );
        Ok(result)
    }
}

/// Conforms `features` to the columns of `schema`: missing features are
/// zero, extra ones are dropped, order follows the schema. The label is not
/// carried over.
pub(crate) fn align(features: &Dataset, schema: &Dataset) -> Result<Dataset> {
    let wanted: Vec<&str> = schema
        .columns()
        .filter(|c| *c != LABEL && !IDENTITY_COLUMNS.contains(c))
        .collect();
    let mut out = Dataset::with_columns(&IDENTITY_COLUMNS);
    for column in &wanted {
        out.declare_column(column, ColumnKind::Float)?;
    }
    let missing = wanted.iter().filter(|c| !features.has_column(c)).count();
    if missing > 0 {
        tracing::info!(target: "preprocess", "Filled {} features unseen at inference time with 0", missing);
    }
    for index in 0..features.len() {
        let mut cells: Vec<(&str, Value)> = IDENTITY_COLUMNS
            .iter()
            .map(|c| (*c, features.get(index, c).clone()))
            .collect();
        for &column in &wanted {
            let value = features.get(index, column).as_f64().unwrap_or(0.0);
            cells.push((column, Value::Float(value)));
        }
        out.push_row(cells)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory_backend;

    const ENRICHED: &str = "Last Name,First Name,Company / Account,Phone,Email,email_valid,\
number_country,number_area,type,user_ratings_total,no_similar_businesses,place_id,\
regional_atlas_pop_density,MerchantSizeByDPV\n\
Doe,John,Acme,+49 30 1,john@acme.example,True,Germany,Berlin,bakery,99,2,pid-a,4090.5,m\n\
Roe,Jane,Beta,+43 1 2,jane@beta.example,False,Austria,,cafe,,,,,XL\n\
Poe,Edgar,,,edgar@x.example,,,,,,,,,unknown\n";

    fn enriched() -> Dataset {
        Dataset::from_csv_bytes(ENRICHED.as_bytes()).unwrap()
    }

    #[test]
    fn test_label_encoding_and_sanitize() {
        assert_eq!(encode_label("XS"), Some(0));
        assert_eq!(encode_label(" xl "), Some(4));
        assert_eq!(encode_label("XXL"), None);
        assert_eq!(sanitize("Bäckerei & Café"), "bäckerei_café");
        assert_eq!(sanitize("  New-York  "), "new_york");
    }

    #[test]
    fn test_training_features() {
        let pre = Preprocessor::new(Mode::Train, &Config::default());
        let out = pre.build_features(&enriched()).unwrap();
        // The row with an unknown label is dropped.
        assert_eq!(out.len(), 2);
        assert_eq!(out.get(0, LABEL), &Value::Int(2));
        assert_eq!(out.get(1, LABEL), &Value::Int(4));
        assert_eq!(out.get(0, EMAIL_VALID), &Value::Float(1.0));
        assert_eq!(out.get(1, EMAIL_VALID), &Value::Float(0.0));
        assert_eq!(out.get(0, USER_RATINGS_TOTAL), &Value::Float(99f64.ln_1p()));
        assert_eq!(out.get(1, USER_RATINGS_TOTAL), &Value::Float(0.0));
        assert_eq!(out.get(0, RATINGS_PER_SIMILAR_BUSINESS), &Value::Float(33.0));
        assert_eq!(out.get(0, "regional_atlas_pop_density"), &Value::Float(4090.5));
        assert_eq!(out.get(0, "number_country_germany"), &Value::Float(1.0));
        assert_eq!(out.get(1, "number_country_germany"), &Value::Float(0.0));
        assert_eq!(out.get(1, "number_country_austria"), &Value::Float(1.0));
        assert_eq!(out.get(0, "type_bakery"), &Value::Float(1.0));
        assert!(out.has_column("number_area_berlin"));
        assert_eq!(out.get(1, "Email"), &Value::from("jane@beta.example"));
    }

    #[test]
    fn test_drop_rows_without_place_id() {
        let config = Config {
            drop_rows_without_place_id: true,
            ..Config::default()
        };
        let out = Preprocessor::new(Mode::Train, &config).build_features(&enriched()).unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_align_adds_drops_and_reorders() {
        let schema = Dataset::with_columns(&["type_cafe", "number_country_france", EMAIL_VALID, LABEL]);
        let pre = Preprocessor::new(Mode::Inference, &Config::default());
        let features = pre.build_features(&enriched()).unwrap();
        assert_eq!(features.len(), 3);
        let aligned = align(&features, &schema).unwrap();
        let columns: Vec<&str> = aligned.columns().collect();
        assert_eq!(
            &columns[IDENTITY_COLUMNS.len()..],
            &["type_cafe", "number_country_france", EMAIL_VALID]
        );
        assert_eq!(aligned.get(1, "type_cafe"), &Value::Float(1.0));
        assert_eq!(aligned.get(0, "number_country_france"), &Value::Float(0.0));
        assert_eq!(aligned.len(), 3);
    }

    #[tokio::test]
    async fn test_train_then_inference_round() {
        let storage = memory_backend();
        let output = storage.output_key().to_string();
        storage.put_bytes(&output, ENRICHED.as_bytes().to_vec()).await.unwrap();

        let config = Config::default();
        assert!(matches!(
            Preprocessor::new(Mode::Inference, &config).run(storage.as_ref()).await,
            Err(AppError::InputMissing(_))
        ));

        let trained = Preprocessor::new(Mode::Train, &config).run(storage.as_ref()).await.unwrap();
        let schema = storage
            .load_preprocessed(PreprocessedKind::Historical)
            .await
            .unwrap()
            .unwrap();
        assert!(schema.is_empty());
        assert!(schema.has_column(LABEL));
        assert!(!schema.has_column("Email"));

        let inferred = Preprocessor::new(Mode::Inference, &config).run(storage.as_ref()).await.unwrap();
        assert_eq!(inferred.len(), 3);
        assert_eq!(inferred.columns().count(), trained.columns().count() - 1);
        assert!(!inferred.has_column(LABEL));
    }
}
