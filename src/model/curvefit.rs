//! Single-variable curve-fit predictors
//!
//! Every family here uses only the first numerical feature `x₀` of a
//! sample; the categorical base power is added on top.

use super::features::split_features;
use super::{ModelWeights, Predictor, PredictorFamily};
use crate::error::{Error, Result};

/// Curve-fit predictor for the exponential, logarithmic, logistic and
/// polynomial families
#[derive(Debug, Clone)]
pub struct CurveFitPredictor {
    family: PredictorFamily,
    weights: ModelWeights,
}

impl CurveFitPredictor {
    pub fn new(family: PredictorFamily, weights: ModelWeights) -> Result<Self> {
        if family == PredictorFamily::Linear {
            return Err(Error::InvalidModelWeights {
                family: family.to_string(),
                reason: "not a curve-fit family".to_string(),
            });
        }
        family.check(&weights)?;
        Ok(Self { family, weights })
    }

    pub fn family(&self) -> PredictorFamily {
        self.family
    }

    fn curve(&self, x: f64) -> f64 {
        let w = &self.weights.curve_fit_weights;
        match self.family {
            PredictorFamily::Exponential => w[0] * (w[1] * x).exp() + w[2],
            PredictorFamily::Logarithmic => w[0] * (w[1] * x + 1.0).ln() + w[2],
            PredictorFamily::Logistic => w[0] / (1.0 + (-w[1] * (x - w[2])).exp()) + w[3],
            // Horner, highest degree first
            PredictorFamily::Polynomial => w.iter().rev().fold(0.0, |acc, c| acc * x + c),
            PredictorFamily::Linear => 0.0,
        }
    }
}

impl Predictor for CurveFitPredictor {
    fn name(&self) -> &str {
        self.family.as_str()
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
        let base_power = split.base_power();

        split
            .numerical
            .iter()
            .map(|x| base_power + self.curve(x.first().copied().unwrap_or(0.0)))
            .collect()
    }
}
