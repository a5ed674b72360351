use clap::Args;
use serde::Serialize;

use crate::error::{EngineError, EngineResult};
use crate::models::ModelKind;
use crate::regression::Estimator;

pub const DEFAULT_LIVE_LOOKBACK: usize = 25;

#[derive(Debug, Clone, Args)]
pub struct ScoringConfig {
    /// Quarters of recent history fed to a live score
    #[arg(long, default_value_t = DEFAULT_LIVE_LOOKBACK)]
    pub lookback: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            lookback: DEFAULT_LIVE_LOOKBACK,
        }
    }
}

#[derive(Debug, Clone, Args, Serialize)]
pub struct WalkForwardConfig {
    /// Share of the feature rows used as the sliding training window
    #[arg(long, default_value_t = 0.8)]
    pub train_fraction: f64,
    /// L2 penalty strength for ridge regression
    #[arg(long, default_value_t = 1.0)]
    pub ridge_alpha: f64,
    /// L1 penalty strength for lasso regression
    #[arg(long, default_value_t = 0.1)]
    pub lasso_alpha: f64,
    #[arg(long, default_value_t = 1000)]
    pub lasso_max_iter: usize,
    #[arg(long, default_value_t = 1e-4)]
    pub lasso_tol: f64,
}

impl Default for WalkForwardConfig {
    fn default() -> Self {
        Self {
            train_fraction: 0.8,
            ridge_alpha: 1.0,
            lasso_alpha: 0.1,
            lasso_max_iter: 1000,
            lasso_tol: 1e-4,
        }
    }
}

impl WalkForwardConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if !(self.train_fraction > 0.0 && self.train_fraction < 1.0) {
            return Err(EngineError::FitFailed(format!(
                "train fraction must be in (0, 1), got {}",
                self.train_fraction
            )));
        }
        if self.ridge_alpha < 0.0 || self.lasso_alpha < 0.0 {
            return Err(EngineError::FitFailed("penalty strengths must be non-negative".to_string()));
        }
        Ok(())
    }

    pub fn estimator(&self, kind: ModelKind) -> Estimator {
        match kind {
            ModelKind::Linear => Estimator::Ols,
            ModelKind::Ridge => Estimator::Ridge {
                alpha: self.ridge_alpha,
            },
            ModelKind::Lasso => Estimator::Lasso {
                alpha: self.lasso_alpha,
                max_iter: self.lasso_max_iter,
                tol: self.lasso_tol,
            },
        }
    }

    pub fn window_size(&self, rows: usize) -> usize {
        (rows as f64 * self.train_fraction).floor() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_size_floors() {
        let config = WalkForwardConfig::default();
        assert_eq!(config.window_size(10), 8);
        assert_eq!(config.window_size(37), 29);
        assert_eq!(config.window_size(1), 0);
    }

    #[test]
    fn rejects_degenerate_fraction() {
        let config = WalkForwardConfig {
            train_fraction: 1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(WalkForwardConfig::default().validate().is_ok());
    }
}
