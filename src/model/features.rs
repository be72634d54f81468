//! Categorical/numerical feature split shared by all predictors

use log::debug;

use super::ModelWeights;

/// Inputs of one `predict` call after the split
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureSplit {
    /// One value per categorical feature found in the metadata
    pub categorical: Vec<f64>,
    /// One row per sample, columns in `numerical_features` order
    pub numerical: Vec<Vec<f64>>,
}

impl FeatureSplit {
    /// Categorical values contribute their raw value to the base power.
    /// No transform is trained for them yet.
    pub fn base_power(&self) -> f64 {
        self.categorical.iter().sum()
    }
}

/// Split raw inputs per `weights`.
///
/// Numerical columns are picked by name in the order of
/// `weights.numerical_features`; a name missing from the input reads as 0.
/// With no numerical features declared the rows pass through unchanged.
pub fn split_features(
    weights: &ModelWeights,
    usage_metric_names: &[&str],
    usage_metric_values: &[Vec<f64>],
    system_metadata_names: &[&str],
    system_metadata_values: &[&str],
) -> FeatureSplit {
    let categorical = weights
        .categorical_features
        .iter()
        .filter_map(|feature| {
            let pos = system_metadata_names.iter().position(|n| *n == feature.as_str())?;
            let raw = system_metadata_values.get(pos)?;
            match raw.trim().parse::<f64>() {
                Ok(v) => Some(v),
                Err(_) => {
                    debug!("categorical feature {}={:?} is not numeric", feature, raw);
                    Some(0.0)
                }
            }
        })
        .collect();

    if weights.numerical_features.is_empty() {
        return FeatureSplit {
            categorical,
            numerical: usage_metric_values.to_vec(),
        };
    }

    let columns: Vec<Option<usize>> = weights
        .numerical_features
        .iter()
        .map(|feature| {
            let col = usage_metric_names.iter().position(|n| *n == feature.as_str());
            if col.is_none() {
                debug!("usage metric {} not provided", feature);
            }
            col
        })
        .collect();

    let numerical = usage_metric_values
        .iter()
        .map(|row| {
            columns
                .iter()
                .map(|&col| col.and_then(|c| row.get(c).copied()).unwrap_or(0.0))
                .collect()
        })
        .collect();

    FeatureSplit {
        categorical,
        numerical,
    }
}
