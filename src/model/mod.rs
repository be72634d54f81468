//! Power estimation models
//!
//! A [`Predictor`] maps usage metrics (and static system metadata) to an
//! estimated power figure. It is built from pre-trained [`ModelWeights`];
//! construction checks the coefficient count against the predictor family
//! and fails fast on a mismatch.
//!
//! # Examples
//!
//! ```
//! use powerlens::model::{new_predictor, ModelWeights, PredictorFamily};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let weights = ModelWeights::curve_fit(vec![2.0, 1.0, 0.0]);
//! let predictor = new_predictor(PredictorFamily::Exponential, weights)?;
//!
//! let power = predictor.predict(&["compute_util"], &[vec![0.0]], &[], &[]);
//! assert_eq!(power, vec![2.0]);
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{Error, Result};

mod curvefit;
mod estimator;
pub mod features;
mod linear;

pub use curvefit::CurveFitPredictor;
pub use estimator::{UtilizationEstimator, USAGE_METRICS};
pub use linear::LinearPredictor;

/// Pre-trained model parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelWeights {
    /// Family-specific coefficients
    #[serde(default)]
    pub curve_fit_weights: Vec<f64>,
    /// Usage metric names the model was trained on, in coefficient order
    #[serde(default)]
    pub numerical_features: Vec<String>,
    /// Metadata names whose values feed the base power
    #[serde(default)]
    pub categorical_features: Vec<String>,
    /// System metadata names the model consults
    #[serde(default)]
    pub metadata_features: Vec<String>,
}

impl ModelWeights {
    /// Weights with coefficients only
    pub fn curve_fit(coefficients: Vec<f64>) -> Self {
        Self {
            curve_fit_weights: coefficients,
            ..Default::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::InvalidModelWeights {
            family: "model".to_string(),
            reason: e.to_string(),
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }
}

/// Supported predictor families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictorFamily {
    /// `a·e^(b·x₀) + c`
    Exponential,
    /// `a·ln(b·x₀ + 1) + c`
    Logarithmic,
    /// `a / (1 + e^(-b·(x₀ - c))) + d`
    Logistic,
    /// `Σ cₖ·x₀ᵏ`
    Polynomial,
    /// `w₀ + Σ wᵢ·xᵢ`
    Linear,
}

/// Coefficient count a family accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exactly(usize),
    AtLeast(usize),
}

impl Arity {
    pub fn accepts(&self, count: usize) -> bool {
        match *self {
            Arity::Exactly(n) => count == n,
            Arity::AtLeast(n) => count >= n,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exactly(n) => write!(f, "exactly {}", n),
            Arity::AtLeast(n) => write!(f, "at least {}", n),
        }
    }
}

impl PredictorFamily {
    pub const ALL: [PredictorFamily; 5] = [
        PredictorFamily::Exponential,
        PredictorFamily::Logarithmic,
        PredictorFamily::Logistic,
        PredictorFamily::Polynomial,
        PredictorFamily::Linear,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PredictorFamily::Exponential => "exponential",
            PredictorFamily::Logarithmic => "logarithmic",
            PredictorFamily::Logistic => "logistic",
            PredictorFamily::Polynomial => "polynomial",
            PredictorFamily::Linear => "linear",
        }
    }

    /// Required coefficient count for `weights`
    pub fn arity(&self, weights: &ModelWeights) -> Arity {
        match self {
            PredictorFamily::Exponential | PredictorFamily::Logarithmic => Arity::Exactly(3),
            PredictorFamily::Logistic => Arity::Exactly(4),
            PredictorFamily::Polynomial => Arity::AtLeast(2),
            PredictorFamily::Linear => Arity::Exactly(1 + weights.numerical_features.len()),
        }
    }

    /// Fail with `InvalidModelWeights` unless `weights` fits this family
    pub fn check(&self, weights: &ModelWeights) -> Result<()> {
        let arity = self.arity(weights);
        let count = weights.curve_fit_weights.len();
        if !arity.accepts(count) {
            return Err(Error::InvalidModelWeights {
                family: self.to_string(),
                reason: format!("expected {} coefficients, got {}", arity, count),
            });
        }
        if let Some(bad) = weights.curve_fit_weights.iter().find(|w| !w.is_finite()) {
            return Err(Error::InvalidModelWeights {
                family: self.to_string(),
                reason: format!("non-finite coefficient {}", bad),
            });
        }
        Ok(())
    }
}

impl fmt::Display for PredictorFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PredictorFamily {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|f| f.as_str() == lower)
            .ok_or_else(|| Error::UnknownPredictor(s.to_string()))
    }
}

/// Regression model turning usage vectors into power
pub trait Predictor: Send + Sync {
    fn name(&self) -> &str;

    fn weights(&self) -> &ModelWeights;

    /// One power value per row of `usage_metric_values`, in input order.
    ///
    /// `usage_metric_names` labels the columns of every row;
    /// `system_metadata_names`/`system_metadata_values` are parallel slices.
    fn predict(
        &self,
        usage_metric_names: &[&str],
        usage_metric_values: &[Vec<f64>],
        system_metadata_names: &[&str],
        system_metadata_values: &[&str],
    ) -> Vec<f64>;
}

/// Build a predictor of `family` from `weights`
pub fn new_predictor(family: PredictorFamily, weights: ModelWeights) -> Result<Box<dyn Predictor>> {
    match family {
        PredictorFamily::Linear => Ok(Box::new(LinearPredictor::new(weights)?)),
        _ => Ok(Box::new(CurveFitPredictor::new(family, weights)?)),
    }
}

/// Build a predictor from a family name, as found in configuration
pub fn predictor_by_name(name: &str, weights: ModelWeights) -> Result<Box<dyn Predictor>> {
    new_predictor(name.parse()?, weights)
}
