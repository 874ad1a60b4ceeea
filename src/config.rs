//! Run configuration for the two-pass renormalization.

use crate::error::{RenormError, Result};
use std::fmt;
use std::str::FromStr;

/// Order of the per-sample intensity regression.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegressionModel {
    /// `{1, X, Y}`
    Linear,
    /// `{1, X, X^2, Y, Y^2}`
    Quadratic,
}

impl RegressionModel {
    /// Number of intensity-derived columns following the intercept.
    pub fn extra_terms(self) -> usize {
        match self {
            RegressionModel::Linear => 2,
            RegressionModel::Quadratic => 4,
        }
    }
}

impl FromStr for RegressionModel {
    type Err = RenormError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" => Ok(RegressionModel::Linear),
            "quadratic" => Ok(RegressionModel::Quadratic),
            other => Err(RenormError::config(format!(
                "Invalid intensity correction model '{}' (expected 'linear' or 'quadratic')",
                other
            ))),
        }
    }
}

impl fmt::Display for RegressionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegressionModel::Linear => write!(f, "linear"),
            RegressionModel::Quadratic => write!(f, "quadratic"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RenormConfig {
    pub rmodel: RegressionModel,
    /// Samples with a higher missing-genotype rate do not contribute to cluster centers.
    pub max_missing: f64,
    /// Per-sample quality-score quantile below which SNPs are left out of pass 1.
    pub min_qual: f64,
    pub quantile_normalize: bool,
    pub qnorm_max_threshold: Option<f64>,
    pub qnorm_min_threshold: Option<f64>,
    /// Minimum usable SNPs for fitting the intensity regression.
    pub min_points: usize,
    /// Fit on every `thin`-th usable SNP.
    pub thin: Option<usize>,
    /// Samples resident at once; also the prefetch channel capacity.
    pub batch_size: usize,
    pub progress: bool,
}

impl Default for RenormConfig {
    fn default() -> Self {
        Self {
            rmodel: RegressionModel::Quadratic,
            max_missing: 0.02,
            min_qual: 0.10,
            quantile_normalize: true,
            qnorm_max_threshold: Some(1.5),
            qnorm_min_threshold: None,
            min_points: 10_000,
            thin: Some(11),
            batch_size: num_cpus::get().max(1),
            progress: false,
        }
    }
}

impl RenormConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.max_missing) {
            return Err(RenormError::config(format!(
                "Maximum missing rate must be within [0, 1], got {}",
                self.max_missing
            )));
        }
        if !(0.0..=1.0).contains(&self.min_qual) {
            return Err(RenormError::config(format!(
                "Minimum quality quantile must be within [0, 1], got {}",
                self.min_qual
            )));
        }
        if self.batch_size == 0 {
            return Err(RenormError::config("Batch size must be > 0."));
        }
        if self.min_points == 0 {
            return Err(RenormError::config("Minimum regression points must be > 0."));
        }
        if self.thin == Some(0) {
            return Err(RenormError::config("Thinning interval must be > 0."));
        }
        Ok(())
    }
}
