//! Applies a stored merchant-size model to preprocessed leads.

use crate::config::Config;
use crate::dataset::Dataset;
use crate::error::{AppError, Result};
use crate::models::{ColumnKind, IDENTITY_COLUMNS, Value};
use crate::preprocess::{MERCHANT_SIZES, Mode, Preprocessor};
use crate::storage::StorageBackend;
use serde::Deserialize;

pub(crate) const PREDICTED_COLUMN: &str = "PredictedMerchantSize";

/// Label set a model was trained on, chosen from its filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LabelMapping {
    ThreeClasses,
    FiveClasses,
}

impl LabelMapping {
    pub(crate) fn for_model(name: &str) -> Self {
        if name.contains("3_classes") {
            LabelMapping::ThreeClasses
        } else {
            LabelMapping::FiveClasses
        }
    }

    pub(crate) fn decode(self, class: usize) -> Option<&'static str> {
        match self {
            LabelMapping::ThreeClasses => ["XS", "{S, M, L}", "XL"].get(class).copied(),
            LabelMapping::FiveClasses => MERCHANT_SIZES.get(class).copied(),
        }
    }
}

/// Numerically stable softmax.
pub(crate) fn softmax(scores: &[f64]) -> Vec<f64> {
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

fn argmax(values: &[f64]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
}

#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub(crate) enum TreeNode {
    Leaf {
        leaf: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Deserialize, Debug, Clone)]
pub(crate) struct Tree {
    /// Class whose score this tree contributes to.
    pub class: usize,
    /// Node 0 is the root.
    pub nodes: Vec<TreeNode>,
}

impl Tree {
    fn evaluate(&self, features: &[f64]) -> Result<f64> {
        let mut index = 0;
        // A well-formed tree reaches a leaf in fewer hops than it has nodes.
        for _ in 0..=self.nodes.len() {
            match self.nodes.get(index) {
                Some(TreeNode::Leaf { leaf }) => return Ok(*leaf),
                Some(TreeNode::Split { feature, threshold, left, right }) => {
                    let value = features.get(*feature).copied().ok_or_else(|| {
                        AppError::Parse(format!("Tree references feature {} out of range", feature))
                    })?;
                    index = if value < *threshold { *left } else { *right };
                }
                None => return Err(AppError::Parse(format!("Tree node {} does not exist", index))),
            }
        }
        Err(AppError::Parse("Tree contains a cycle".to_string()))
    }
}

/// Gradient-boosted trees with one tree list per class.
#[derive(Deserialize, Debug, Clone)]
pub(crate) struct BoostedTrees {
    pub feature_names: Vec<String>,
    pub num_class: usize,
    #[serde(default)]
    pub base_score: f64,
    pub trees: Vec<Tree>,
}

/// Multinomial logistic regression.
#[derive(Deserialize, Debug, Clone)]
pub(crate) struct LinearSoftmax {
    pub feature_names: Vec<String>,
    /// One weight row per class.
    pub weights: Vec<Vec<f64>>,
    pub intercepts: Vec<f64>,
}

#[derive(Debug, Clone)]
pub(crate) enum Model {
    Boosted(BoostedTrees),
    Linear(LinearSoftmax),
}

impl Model {
    /// Parses a model artifact; `xgb*` files hold boosted trees, everything
    /// else a linear classifier.
    pub(crate) fn from_artifact(name: &str, bytes: &[u8]) -> Result<Self> {
        let file_name = name.rsplit('/').next().unwrap_or(name);
        let model = if file_name.starts_with("xgb") {
            let trees: BoostedTrees = serde_json::from_slice(bytes)?;
            if let Some(tree) = trees.trees.iter().find(|t| t.class >= trees.num_class) {
                return Err(AppError::Parse(format!(
                    "Tree for class {} but model has {} classes",
                    tree.class, trees.num_class
                )));
            }
            Model::Boosted(trees)
        } else {
            let linear: LinearSoftmax = serde_json::from_slice(bytes)?;
            let width = linear.feature_names.len();
            if linear.weights.len() != linear.intercepts.len() || linear.weights.iter().any(|w| w.len() != width) {
                return Err(AppError::Parse(format!("Linear model '{}' has inconsistent shapes", name)));
            }
            Model::Linear(linear)
        };
        Ok(model)
    }

    pub(crate) fn feature_names(&self) -> &[String] {
        match self {
            Model::Boosted(m) => &m.feature_names,
            Model::Linear(m) => &m.feature_names,
        }
    }

    /// Class probabilities for one feature vector in `feature_names` order.
    pub(crate) fn predict_proba(&self, features: &[f64]) -> Result<Vec<f64>> {
        let scores = match self {
            Model::Boosted(m) => {
                let mut scores = vec![m.base_score; m.num_class];
                for tree in &m.trees {
                    scores[tree.class] += tree.evaluate(features)?;
                }
                scores
            }
            Model::Linear(m) => m
                .weights
                .iter()
                .zip(&m.intercepts)
                .map(|(w, b)| b + w.iter().zip(features).map(|(w, x)| w * x).sum::<f64>())
                .collect(),
        };
        Ok(softmax(&scores))
    }

    pub(crate) fn predict(&self, features: &[f64]) -> Result<Option<usize>> {
        Ok(argmax(&self.predict_proba(features)?))
    }
}

/// Predicts a merchant size for every preprocessed row and returns the
/// identity columns plus the prediction.
pub(crate) fn apply_model(model: &Model, mapping: LabelMapping, preprocessed: &Dataset) -> Result<Dataset> {
    let missing: Vec<&str> = model
        .feature_names()
        .iter()
        .map(String::as_str)
        .filter(|f| !preprocessed.has_column(f))
        .collect();
    if !missing.is_empty() {
        return Err(AppError::Config(format!(
            "Model expects features missing from the preprocessed data: {}",
            missing.join(", ")
        )));
    }

    let mut out = preprocessed.select(&IDENTITY_COLUMNS)?;
    out.declare_column(PREDICTED_COLUMN, ColumnKind::Text)?;
    for index in 0..preprocessed.len() {
        let features: Vec<f64> = model
            .feature_names()
            .iter()
            .map(|f| preprocessed.get(index, f).as_f64().unwrap_or(0.0))
            .collect();
        let label = model.predict(&features)?.and_then(|class| mapping.decode(class));
        out.set(index, PREDICTED_COLUMN, Value::from(label))?;
    }
    Ok(out)
}

/// Preprocesses the enriched leads for inference, applies `model_name` and
/// stores the predictions.
pub(crate) async fn run_prediction(storage: &dyn StorageBackend, config: &Config, model_name: &str) -> Result<Dataset> {
    let preprocessed = Preprocessor::new(Mode::Inference, config).run(storage).await?;
    let bytes = storage.load_model(model_name).await?;
    let model = Model::from_artifact(model_name, &bytes)?;
    let mapping = LabelMapping::for_model(model_name);
    tracing::info!(target: "predict",
        "Applying {} ({} features, {:?})", model_name, model.feature_names().len(), mapping
    );
    let predictions = apply_model(&model, mapping, &preprocessed)?;
    storage.save_prediction(&predictions).await?;
    Ok(predictions)
}
