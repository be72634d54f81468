//! Multi-variable linear regression

use super::features::split_features;
use super::{ModelWeights, Predictor, PredictorFamily};
use crate::error::Result;

/// `power = base + w₀ + Σ wᵢ·xᵢ` over every declared numerical feature
#[derive(Debug, Clone)]
pub struct LinearPredictor {
    weights: ModelWeights,
}

impl LinearPredictor {
    pub fn new(weights: ModelWeights) -> Result<Self> {
        PredictorFamily::Linear.check(&weights)?;
        Ok(Self { weights })
    }

    fn intercept(&self) -> f64 {
        self.weights.curve_fit_weights.first().copied().unwrap_or(0.0)
    }

    fn slopes(&self) -> &[f64] {
        self.weights.curve_fit_weights.get(1..).unwrap_or(&[])
    }
}

impl Predictor for LinearPredictor {
    fn name(&self) -> &str {
        PredictorFamily::Linear.as_str()
    }

    fn weights(&self) -> &ModelWeights {
        &self.weights
    }

    fn predict(
        &self,
        usage_metric_names: &[&str],
        usage_metric_values: &[Vec<f64>],
        system_metadata_names: &[&str],
        system_metadata_values: &[&str],
    ) -> Vec<f64> {
        let split = split_features(
            &self.weights,
            usage_metric_names,
            usage_metric_values,
            system_metadata_names,
            system_metadata_values,
        );
        let base_power = split.base_power() + self.intercept();

        split
            .numerical
            .iter()
            .map(|x| {
                base_power
                    + self
                        .slopes()
                        .iter()
                        .zip(x)
                        .map(|(w, v)| w * v)
                        .sum::<f64>()
            })
            .collect()
    }
}
