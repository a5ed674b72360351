use std::collections::BTreeMap;
use std::ops::Range;

use chrono::{DateTime, NaiveDate, Utc};
use nalgebra::DVector;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::WalkForwardConfig;
use crate::error::{EngineError, EngineResult};
use crate::features::FeatureMatrix;
use crate::models::{ModelKind, ModelMetrics, PredictionRecord};
use crate::regression::StandardScaler;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub train: Range<usize>,
    pub test: usize,
}

#[derive(Debug, Clone)]
pub struct WalkForwardSplits {
    window_size: usize,
    rows: usize,
    start: usize,
}

impl WalkForwardSplits {
    pub fn new(rows: usize, window_size: usize) -> Self {
        Self {
            window_size,
            rows,
            start: 0,
        }
    }
}

impl Iterator for WalkForwardSplits {
    type Item = Split;

    fn next(&mut self) -> Option<Split> {
        if self.window_size == 0 {
            return None;
        }
        let end = self.start + self.window_size;
        if end >= self.rows {
            return None;
        }
        let split = Split {
            train: self.start..end,
            test: end,
        };
        self.start += 1;
        Some(split)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = if self.window_size == 0 {
            0
        } else {
            self.rows.saturating_sub(self.start + self.window_size)
        };
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for WalkForwardSplits {}

pub fn fit_scaler(matrix: &FeatureMatrix, split: &Split) -> StandardScaler {
    StandardScaler::fit(&matrix.rows[split.train.clone()])
}

#[derive(Debug, Clone, Serialize)]
pub struct WalkForwardOutcome {
    pub metrics: BTreeMap<ModelKind, ModelMetrics>,
    #[serde(skip)]
    pub predictions: Vec<PredictionRecord>,
    pub window_size: usize,
    pub feature_count: usize,
}

/// `evaluate --json` output: the effective tunables next to the metrics.
#[derive(Debug, Serialize)]
pub struct EvaluationSummary<'a> {
    pub config: &'a WalkForwardConfig,
    #[serde(flatten)]
    pub outcome: &'a WalkForwardOutcome,
}

pub fn evaluate(
    matrix: &FeatureMatrix,
    config: &WalkForwardConfig,
    now: DateTime<Utc>,
) -> EngineResult<WalkForwardOutcome> {
    config.validate()?;

    let rows = matrix.n_rows();
    let window_size = config.window_size(rows);
    if window_size == 0 || window_size >= rows {
        return Err(EngineError::InsufficientHistory {
            required: 2,
            available: rows,
        });
    }

    let mut results: BTreeMap<ModelKind, Vec<(NaiveDate, f64, f64)>> = BTreeMap::new();
    let splits = WalkForwardSplits::new(rows, window_size);
    info!(rows, window_size, windows = splits.len(), "starting walk-forward evaluation");

    for split in splits {
        let scaler = fit_scaler(matrix, &split);
        let x_train = scaler.transform(&matrix.rows[split.train.clone()]);
        let x_test = scaler.transform_row(&matrix.rows[split.test]);
        let y_train = DVector::from_column_slice(&matrix.target[split.train.clone()]);

        let predictions = ModelKind::ALL
            .par_iter()
            .map(|kind| {
                let model = config.estimator(*kind).fit(&x_train, &y_train)?;
                Ok((*kind, model.predict(&x_test)))
            })
            .collect::<EngineResult<Vec<_>>>()?;

        let date = matrix.dates[split.test];
        let actual = matrix.target[split.test];
        debug!(%date, train_start = split.train.start, "window evaluated");

        for (kind, predicted) in predictions {
            results.entry(kind).or_default().push((date, actual, predicted));
        }
    }

    let feature_count = matrix.n_features();
    let mut metrics = BTreeMap::new();
    let mut records = Vec::new();

    for (kind, held_out) in results {
        let actuals: Vec<f64> = held_out.iter().map(|(_, a, _)| *a).collect();
        let predicted: Vec<f64> = held_out.iter().map(|(_, _, p)| *p).collect();
        let model_metrics = compute_metrics(&actuals, &predicted, feature_count);
        info!(
            model = %kind,
            rmse = model_metrics.rmse,
            r2 = model_metrics.r2,
            smape = model_metrics.smape,
            "model evaluated"
        );
        metrics.insert(kind, model_metrics);

        records.extend(held_out.into_iter().map(|(date_key, actual, predicted)| {
            PredictionRecord {
                date_key,
                model_name: kind,
                predicted_price: predicted,
                actual_price: actual,
                prediction_timestamp: now,
            }
        }));
    }

    Ok(WalkForwardOutcome {
        metrics,
        predictions: records,
        window_size,
        feature_count,
    })
}

pub fn compute_metrics(actuals: &[f64], predicted: &[f64], feature_count: usize) -> ModelMetrics {
    let n = actuals.len();
    let mse = mean_squared_error(actuals, predicted);
    let r2 = r2_score(actuals, predicted);
    let adjusted_r2 = match adjusted_r2(r2, n, feature_count) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(%err, "adjusted R² left undefined");
            None
        }
    };

    ModelMetrics {
        mse,
        rmse: mse.sqrt(),
        r2,
        adjusted_r2,
        smape: smape(actuals, predicted),
        held_out: n,
    }
}

pub fn mean_squared_error(actuals: &[f64], predicted: &[f64]) -> f64 {
    if actuals.is_empty() {
        return 0.0;
    }
    actuals
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p).powi(2))
        .sum::<f64>()
        / actuals.len() as f64
}

/// Coefficient of determination. A constant target scores 1 when matched
/// exactly and 0 otherwise.
pub fn r2_score(actuals: &[f64], predicted: &[f64]) -> f64 {
    if actuals.is_empty() {
        return 0.0;
    }
    let mean = actuals.iter().sum::<f64>() / actuals.len() as f64;
    let ss_res: f64 = actuals.iter().zip(predicted).map(|(a, p)| (a - p).powi(2)).sum();
    let ss_tot: f64 = actuals.iter().map(|a| (a - mean).powi(2)).sum();

    if ss_tot == 0.0 {
        return if ss_res == 0.0 { 1.0 } else { 0.0 };
    }
    1.0 - ss_res / ss_tot
}

/// `1 - (1 - r²)(n - 1)/(n - p - 1)`, undefined unless `n > p + 1`.
pub fn adjusted_r2(r2: f64, n: usize, p: usize) -> EngineResult<f64> {
    if n <= p + 1 {
        return Err(EngineError::InsufficientHistory {
            required: p + 2,
            available: n,
        });
    }
    Ok(1.0 - (1.0 - r2) * (n - 1) as f64 / (n - p - 1) as f64)
}

/// Symmetric MAPE in percent. Points where both values are zero add nothing.
pub fn smape(actuals: &[f64], predicted: &[f64]) -> f64 {
    if actuals.is_empty() {
        return 0.0;
    }
    let total: f64 = actuals
        .iter()
        .zip(predicted)
        .map(|(a, p)| {
            let denom = a.abs() + p.abs();
            if denom == 0.0 {
                0.0
            } else {
                2.0 * (p - a).abs() / denom
            }
        })
        .sum();
    100.0 * total / actuals.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::build_features;
    use crate::series::tests::series_from;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_790_000_000, 0).unwrap()
    }

    fn trending_matrix(quarters: usize) -> FeatureMatrix {
        let prices: Vec<f64> = (0..quarters).map(|t| 100.0 + t as f64).collect();
        let rates: Vec<f64> = (0..quarters).map(|t| 5.0 + ((t * 7) % 5) as f64 * 0.25).collect();
        build_features(&series_from(&prices, &rates))
    }

    #[test]
    fn splits_slide_one_row_at_a_time() {
        let splits: Vec<Split> = WalkForwardSplits::new(10, 8).collect();
        assert_eq!(
            splits,
            vec![
                Split { train: 0..8, test: 8 },
                Split { train: 1..9, test: 9 },
            ]
        );
        assert_eq!(WalkForwardSplits::new(10, 8).len(), 2);
        assert_eq!(WalkForwardSplits::new(5, 0).count(), 0);
        assert_eq!(WalkForwardSplits::new(5, 5).count(), 0);
    }

    #[test]
    fn test_row_is_always_after_training_rows() {
        for split in WalkForwardSplits::new(40, 32) {
            assert_eq!(split.train.len(), 32);
            assert_eq!(split.test, split.train.end);
        }
    }

    #[test]
    fn scaler_ignores_held_out_row() {
        let original = trending_matrix(30);
        let window_size = WalkForwardConfig::default().window_size(original.n_rows());

        for split in WalkForwardSplits::new(original.n_rows(), window_size) {
            let mut perturbed = original.clone();
            for value in perturbed.rows[split.test].iter_mut() {
                *value *= 1_000.0;
            }
            assert_eq!(fit_scaler(&original, &split), fit_scaler(&perturbed, &split));
        }

        let last = original.n_rows() - 1;
        let mut perturbed = original.clone();
        perturbed.rows[last][0] = -42.0;
        for split in WalkForwardSplits::new(original.n_rows(), window_size) {
            assert_eq!(fit_scaler(&original, &split), fit_scaler(&perturbed, &split));
        }
    }

    #[test]
    fn evaluation_produces_one_prediction_per_held_out_row() {
        let matrix = trending_matrix(50);
        let outcome = evaluate(&matrix, &WalkForwardConfig::default(), now()).unwrap();

        assert_eq!(matrix.n_rows(), 47);
        assert_eq!(outcome.window_size, 37);
        assert_eq!(outcome.metrics.len(), 3);
        assert_eq!(outcome.predictions.len(), 3 * 10);

        for kind in ModelKind::ALL {
            let dates: Vec<NaiveDate> = outcome
                .predictions
                .iter()
                .filter(|p| p.model_name == kind)
                .map(|p| p.date_key)
                .collect();
            assert_eq!(dates, matrix.dates[37..].to_vec());
            assert_eq!(outcome.metrics[&kind].held_out, 10);
        }
    }

    #[test]
    fn ols_tracks_a_linear_trend_exactly() {
        let matrix = trending_matrix(50);
        let outcome = evaluate(&matrix, &WalkForwardConfig::default(), now()).unwrap();
        let linear = &outcome.metrics[&ModelKind::Linear];

        assert!(linear.rmse < 1e-6, "rmse {}", linear.rmse);
        assert!(linear.smape < 1e-6);
        assert!(linear.adjusted_r2.is_some());
    }

    #[test]
    fn json_summary_echoes_effective_config() {
        let config = WalkForwardConfig {
            ridge_alpha: 2.5,
            ..WalkForwardConfig::default()
        };
        let outcome = evaluate(&trending_matrix(50), &config, now()).unwrap();
        let value = serde_json::to_value(EvaluationSummary {
            config: &config,
            outcome: &outcome,
        })
        .unwrap();

        assert_eq!(value["config"]["ridge_alpha"], 2.5);
        assert_eq!(value["config"]["lasso_max_iter"], 1000);
        assert_eq!(value["window_size"], 37);
        assert!(value["metrics"]["lasso"]["rmse"].is_number());
        assert!(value.get("predictions").is_none());
    }

    #[test]
    fn too_few_rows_is_insufficient_history() {
        let matrix = trending_matrix(4);
        let err = evaluate(&matrix, &WalkForwardConfig::default(), now()).unwrap_err();
        assert!(matches!(err, EngineError::InsufficientHistory { .. }));
    }

    #[test]
    fn perfect_predictions_have_perfect_metrics() {
        let actuals = [200.0, 210.0, 205.0, 220.0, 230.0, 240.0];
        let metrics = compute_metrics(&actuals, &actuals, 2);
        assert_eq!(metrics.mse, 0.0);
        assert_eq!(metrics.rmse, 0.0);
        assert_eq!(metrics.r2, 1.0);
        assert_eq!(metrics.adjusted_r2, Some(1.0));
        assert_eq!(metrics.smape, 0.0);
    }

    #[test]
    fn metrics_match_hand_computation() {
        let actuals = [1.0, 2.0, 3.0, 4.0];
        let predicted = [1.5, 2.0, 2.5, 4.0];
        assert!((mean_squared_error(&actuals, &predicted) - 0.125).abs() < 1e-12);
        assert!((r2_score(&actuals, &predicted) - 0.9).abs() < 1e-12);
        assert!((adjusted_r2(0.9, 4, 1).unwrap() - 0.85).abs() < 1e-12);
        let expected = 100.0 * (2.0 * 0.5 / 2.5 + 2.0 * 0.5 / 5.5) / 4.0;
        assert!((smape(&actuals, &predicted) - expected).abs() < 1e-12);
    }

    #[test]
    fn adjusted_r2_needs_more_points_than_features() {
        let err = adjusted_r2(0.5, 4, 3).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientHistory {
                required: 5,
                available: 4
            }
        ));
        assert!(adjusted_r2(0.5, 5, 3).is_ok());
    }

    #[test]
    fn smape_skips_double_zero_points() {
        assert_eq!(smape(&[0.0, 10.0], &[0.0, 10.0]), 0.0);
        assert_eq!(smape(&[0.0], &[5.0]), 200.0);
    }
}
