//! Model artifact and offline training.
//!
//! Per-horizon linear regression over the standardized model input: the
//! newest window vector's schema features plus two window summaries (mean
//! congestion and congestion trend). Training is fully deterministic:
//! fixed-iteration full-batch gradient descent, no randomness anywhere, and
//! an every-fifth-sample validation split. The artifact is a JSON file so it
//! can be inspected and diffed.

use crate::error::EngineError;
use crate::features::{FEATURE_FIELDS, FEATURE_SCHEMA_VERSION, FeatureVector};
use crate::types::metric;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

pub const MODEL_VERSION: u32 = 1;

/// Schema features + window mean congestion + window congestion trend.
pub const MODEL_INPUT_LEN: usize = FEATURE_FIELDS.len() + 2;

const MIN_TRAINING_EXAMPLES: usize = 10;
const GD_ITERATIONS: usize = 400;
const GD_LEARNING_RATE: f64 = 0.05;
const VALIDATION_STRIDE: usize = 5;

/// Per-feature centering/scaling parameters fit on the training split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standardizer {
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
}

impl Standardizer {
    fn fit(rows: &[Vec<f64>]) -> Self {
        let n = rows.len() as f64;
        let dim = rows.first().map_or(0, Vec::len);
        let mut means = vec![0.0; dim];
        for row in rows {
            for (m, x) in means.iter_mut().zip(row) {
                *m += x / n;
            }
        }
        let mut stds = vec![0.0; dim];
        for row in rows {
            for ((s, m), x) in stds.iter_mut().zip(&means).zip(row) {
                *s += (x - m) * (x - m) / n;
            }
        }
        for s in stds.iter_mut() {
            *s = s.sqrt();
            // Constant columns center to zero instead of dividing by zero.
            if *s == 0.0 {
                *s = 1.0;
            }
        }
        Self { means, stds }
    }

    pub fn apply(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .zip(&self.means)
            .zip(&self.stds)
            .map(|((x, m), s)| (x - m) / s)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorizonModel {
    pub weights: Vec<f64>,
    pub bias: f64,
    /// Root-mean-square validation residual; the 95% interval is
    /// `prediction ± 1.96 * residual_std`.
    pub residual_std: f64,
    pub mae: f64,
}

impl HorizonModel {
    pub fn predict(&self, standardized: &[f64]) -> f64 {
        self.bias + dot(&self.weights, standardized)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub schema_version: u32,
    pub model_version: u32,
    pub trained_at: DateTime<Utc>,
    pub bucket_width_s: i64,
    pub history_window: usize,
    pub standardizer: Standardizer,
    pub horizons: Vec<HorizonModel>,
    pub training_samples: usize,
    pub validation_samples: usize,
}

impl ModelArtifact {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), EngineError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let content = fs::read_to_string(path.as_ref())?;
        let artifact: ModelArtifact = serde_json::from_str(&content)?;
        artifact.validate()?;
        Ok(artifact)
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.horizons.is_empty() {
            return Err(EngineError::Config(
                "model artifact has no horizon models".to_string(),
            ));
        }
        let dim = self.standardizer.means.len();
        if self.standardizer.stds.len() != dim {
            return Err(EngineError::Config(
                "model artifact standardizer means/stds length mismatch".to_string(),
            ));
        }
        for (i, horizon) in self.horizons.iter().enumerate() {
            if horizon.weights.len() != dim {
                return Err(EngineError::Config(format!(
                    "model artifact horizon {} has {} weights, expected {dim}",
                    i + 1,
                    horizon.weights.len()
                )));
            }
        }
        Ok(())
    }
}

/// Builds the model input for one history window: the newest vector's
/// feature values followed by the window's mean congestion and its
/// congestion trend (last minus first). `None` when the window is empty or
/// malformed.
pub fn model_input(window: &[FeatureVector]) -> Option<Vec<f64>> {
    let last = window.last()?;
    if last.values.len() != FEATURE_FIELDS.len() {
        return None;
    }
    let congestion: Vec<f64> = window
        .iter()
        .filter_map(|fv| fv.value(metric::CONGESTION))
        .collect();
    if congestion.len() != window.len() {
        return None;
    }
    let mean = congestion.iter().sum::<f64>() / congestion.len() as f64;
    let trend = congestion[congestion.len() - 1] - congestion[0];

    let mut input = last.values.clone();
    input.push(mean);
    input.push(trend);
    Some(input)
}

/// One supervised example: a model input and the observed congestion index
/// at each of the next K buckets.
#[derive(Debug, Clone)]
pub struct TrainingExample {
    pub input: Vec<f64>,
    pub targets: Vec<f64>,
}

/// Fits one linear model per horizon. Examples are split
/// deterministically: every fifth example is held out for validation.
pub fn fit_model(
    examples: &[TrainingExample],
    horizon_buckets: usize,
    history_window: usize,
    bucket_width_s: i64,
) -> Result<ModelArtifact, EngineError> {
    if examples.len() < MIN_TRAINING_EXAMPLES {
        return Err(EngineError::InsufficientData {
            scope: "training set".to_string(),
            missing: format!(
                "at least {MIN_TRAINING_EXAMPLES} examples ({} provided)",
                examples.len()
            ),
        });
    }
    debug_assert!(
        examples
            .iter()
            .all(|e| e.input.len() == MODEL_INPUT_LEN && e.targets.len() == horizon_buckets)
    );

    let mut train: Vec<&TrainingExample> = Vec::new();
    let mut validation: Vec<&TrainingExample> = Vec::new();
    for (i, example) in examples.iter().enumerate() {
        if i % VALIDATION_STRIDE == VALIDATION_STRIDE - 1 {
            validation.push(example);
        } else {
            train.push(example);
        }
    }

    let train_inputs: Vec<Vec<f64>> = train.iter().map(|e| e.input.clone()).collect();
    let standardizer = Standardizer::fit(&train_inputs);
    let ztrain: Vec<Vec<f64>> = train_inputs.iter().map(|r| standardizer.apply(r)).collect();
    let zval: Vec<Vec<f64>> = validation
        .iter()
        .map(|e| standardizer.apply(&e.input))
        .collect();

    let mut horizons = Vec::with_capacity(horizon_buckets);
    for h in 0..horizon_buckets {
        let train_targets: Vec<f64> = train.iter().map(|e| e.targets[h]).collect();
        let model = fit_linear(&ztrain, &train_targets);

        // Residuals from the held-out split; the training split answers
        // when the set is too small to hold anything out.
        let (eval_inputs, eval_targets): (&[Vec<f64>], Vec<f64>) = if zval.is_empty() {
            (&ztrain, train_targets.clone())
        } else {
            (&zval, validation.iter().map(|e| e.targets[h]).collect())
        };
        let residuals: Vec<f64> = eval_inputs
            .iter()
            .zip(&eval_targets)
            .map(|(z, y)| model.predict(z) - y)
            .collect();
        let n = residuals.len() as f64;
        let residual_std = (residuals.iter().map(|r| r * r).sum::<f64>() / n).sqrt();
        let mae = residuals.iter().map(|r| r.abs()).sum::<f64>() / n;

        info!(horizon = h + 1, mae, residual_std, "Trained horizon model");
        horizons.push(HorizonModel {
            weights: model.weights,
            bias: model.bias,
            residual_std,
            mae,
        });
    }

    Ok(ModelArtifact {
        schema_version: FEATURE_SCHEMA_VERSION,
        model_version: MODEL_VERSION,
        trained_at: Utc::now(),
        bucket_width_s,
        history_window,
        standardizer,
        horizons,
        training_samples: train.len(),
        validation_samples: validation.len(),
    })
}

fn fit_linear(inputs: &[Vec<f64>], targets: &[f64]) -> HorizonModel {
    let n = inputs.len() as f64;
    let dim = inputs.first().map_or(0, Vec::len);
    let mut weights = vec![0.0; dim];
    let mut bias = 0.0;

    for _ in 0..GD_ITERATIONS {
        let mut grad_w = vec![0.0; dim];
        let mut grad_b = 0.0;
        for (x, y) in inputs.iter().zip(targets) {
            let err = bias + dot(&weights, x) - y;
            for (g, xi) in grad_w.iter_mut().zip(x) {
                *g += err * xi;
            }
            grad_b += err;
        }
        let step = 2.0 * GD_LEARNING_RATE / n;
        for (w, g) in weights.iter_mut().zip(&grad_w) {
            *w -= step * g;
        }
        bias -= step * grad_b;
    }

    HorizonModel {
        weights,
        bias,
        residual_std: 0.0,
        mae: 0.0,
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
