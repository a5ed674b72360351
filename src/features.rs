use chrono::{Datelike, NaiveDate};
use tracing::debug;

use crate::models::{Covariates, QuarterlyObservation};
use crate::series::QuarterlySeries;

const LAGS: [usize; 2] = [1, 3];
const MAX_LAG: usize = 3;

type CovariateGetter = fn(&Covariates) -> Option<f64>;

/// Covariates in column order. The last flag marks columns whose missing
/// values read as zero instead of dropping the row.
const COVARIATES: [(&str, CovariateGetter, bool); 5] = [
    ("unemployment", |c| c.unemployment, false),
    ("cpi", |c| c.cpi, false),
    ("one_family_starts", |c| c.one_family_starts, false),
    ("multi_unit_starts", |c| c.multi_unit_starts, false),
    ("for_sale_starts", |c| c.for_sale_starts, true),
];

#[derive(Debug, Clone, Default)]
pub struct FeatureMatrix {
    pub columns: Vec<String>,
    pub dates: Vec<NaiveDate>,
    pub rows: Vec<Vec<f64>>,
    pub target: Vec<f64>,
}

impl FeatureMatrix {
    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn n_features(&self) -> usize {
        self.columns.len()
    }
}

pub fn build_features(series: &QuarterlySeries) -> FeatureMatrix {
    let observations = series.observations();

    // Covariates nobody reported stay out of the feature set.
    let covariates: Vec<_> = COVARIATES
        .iter()
        .filter(|(_, get, _)| observations.iter().any(|o| get(&o.covariates).is_some()))
        .collect();

    let mut columns = vec!["mortgage_rate".to_string()];
    columns.extend(covariates.iter().map(|(name, _, _)| name.to_string()));
    columns.extend(["year".to_string(), "quarter".to_string()]);
    for lag in LAGS {
        columns.push(format!("price_lag_{lag}"));
        columns.push(format!("mortgage_lag_{lag}"));
    }

    let mut matrix = FeatureMatrix {
        columns,
        ..Default::default()
    };
    let mut dropped = 0usize;

    for (i, obs) in observations.iter().enumerate().skip(MAX_LAG) {
        let Some(row) = feature_row(observations, i, obs, &covariates) else {
            dropped += 1;
            continue;
        };
        matrix.dates.push(obs.date_key);
        matrix.rows.push(row);
        matrix.target.push(obs.price_index);
    }

    debug!(
        rows = matrix.n_rows(),
        features = matrix.n_features(),
        dropped_for_missing_covariates = dropped,
        "feature matrix built"
    );
    matrix
}

fn feature_row(
    observations: &[QuarterlyObservation],
    i: usize,
    obs: &QuarterlyObservation,
    covariates: &[&(&str, CovariateGetter, bool)],
) -> Option<Vec<f64>> {
    let mut row = vec![obs.mortgage_rate];

    for (_, get, zero_fill) in covariates.iter().copied() {
        match get(&obs.covariates) {
            Some(value) if value.is_finite() => row.push(value),
            _ if *zero_fill => row.push(0.0),
            _ => return None,
        }
    }

    row.push(obs.date_key.year() as f64);
    row.push((obs.date_key.month0() / 3 + 1) as f64);

    for lag in LAGS {
        let lagged = &observations[i - lag];
        row.push(lagged.price_index);
        row.push(lagged.mortgage_rate);
    }

    Some(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::tests::{quarter, series_from};
    use crate::series::next_quarter;

    #[test]
    fn drops_lag_warm_up_rows() {
        let series = series_from(&[10.0, 11.0, 12.0, 13.0, 14.0], &[5.0, 5.1, 5.2, 5.3, 5.4]);
        let matrix = build_features(&series);

        assert_eq!(matrix.n_rows(), 2);
        assert_eq!(matrix.dates[0], quarter(2000, 4));
        assert_eq!(matrix.target, vec![13.0, 14.0]);
        assert_eq!(
            matrix.columns,
            vec![
                "mortgage_rate",
                "year",
                "quarter",
                "price_lag_1",
                "mortgage_lag_1",
                "price_lag_3",
                "mortgage_lag_3"
            ]
        );
        assert_eq!(matrix.rows[0], vec![5.3, 2000.0, 4.0, 12.0, 5.2, 10.0, 5.0]);
        assert_eq!(matrix.rows[1], vec![5.4, 2001.0, 1.0, 13.0, 5.3, 11.0, 5.1]);
    }

    #[test]
    fn target_is_not_a_feature() {
        let series = series_from(&[10.0; 6], &[5.0; 6]);
        let matrix = build_features(&series);
        assert!(!matrix.columns.iter().any(|c| c == "price_index" || c == "date_key"));
    }

    #[test]
    fn covariate_gaps_drop_rows_except_for_sale_starts() {
        let mut date = quarter(2010, 1);
        let mut observations = Vec::new();
        for i in 0..6 {
            observations.push(QuarterlyObservation {
                date_key: date,
                price_index: 200.0 + i as f64,
                mortgage_rate: 4.0,
                covariates: Covariates {
                    unemployment: if i == 4 { None } else { Some(5.0) },
                    for_sale_starts: if i == 5 { None } else { Some(20.0) },
                    ..Default::default()
                },
            });
            date = next_quarter(date).unwrap();
        }
        let series = QuarterlySeries::new(observations).unwrap();
        let matrix = build_features(&series);

        assert_eq!(matrix.columns[..3], ["mortgage_rate", "unemployment", "for_sale_starts"]);
        assert_eq!(matrix.n_rows(), 2);
        assert_eq!(matrix.target, vec![203.0, 205.0]);
        assert_eq!(matrix.rows[1][2], 0.0);
    }
}
