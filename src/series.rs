use std::path::Path;

use chrono::{Datelike, Months, NaiveDate};
use serde::Deserialize;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::models::{Covariates, QuarterlyObservation};

/// Gap-free and strictly ascending by quarter.
#[derive(Debug, Clone, Default)]
pub struct QuarterlySeries {
    observations: Vec<QuarterlyObservation>,
}

impl QuarterlySeries {
    pub fn new(observations: Vec<QuarterlyObservation>) -> EngineResult<Self> {
        for obs in &observations {
            if !is_quarter_start(obs.date_key) {
                return Err(EngineError::MalformedSeries(format!(
                    "{} is not the first day of a quarter",
                    obs.date_key
                )));
            }
            if !obs.price_index.is_finite() {
                return Err(EngineError::MalformedSeries(format!(
                    "price_index is not a finite number at {}",
                    obs.date_key
                )));
            }
            if !obs.mortgage_rate.is_finite() {
                return Err(EngineError::MalformedSeries(format!(
                    "mortgage_rate is not a finite number at {}",
                    obs.date_key
                )));
            }
        }

        for pair in observations.windows(2) {
            let (prev, next) = (pair[0].date_key, pair[1].date_key);
            if next == prev {
                return Err(EngineError::MalformedSeries(format!("duplicate quarter {next}")));
            }
            if next < prev {
                return Err(EngineError::MalformedSeries(format!(
                    "quarters out of order: {next} follows {prev}"
                )));
            }
            let expected = next_quarter(prev)?;
            if next != expected {
                return Err(EngineError::MalformedSeries(format!(
                    "gap in series: expected {expected} after {prev}, found {next}"
                )));
            }
        }

        Ok(Self { observations })
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn observations(&self) -> &[QuarterlyObservation] {
        &self.observations
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        self.observations.iter().map(|o| o.date_key).collect()
    }

    pub fn prices(&self) -> Vec<f64> {
        self.observations.iter().map(|o| o.price_index).collect()
    }

    pub fn mortgage_rates(&self) -> Vec<f64> {
        self.observations.iter().map(|o| o.mortgage_rate).collect()
    }

    pub fn tail(&self, n: usize) -> QuarterlySeries {
        let start = self.observations.len().saturating_sub(n);
        QuarterlySeries {
            observations: self.observations[start..].to_vec(),
        }
    }
}

pub fn is_quarter_start(date: NaiveDate) -> bool {
    date.day() == 1 && matches!(date.month(), 1 | 4 | 7 | 10)
}

pub fn next_quarter(date: NaiveDate) -> EngineResult<NaiveDate> {
    date.checked_add_months(Months::new(3))
        .ok_or_else(|| EngineError::MalformedSeries(format!("no quarter follows {date}")))
}

/// `1990Q1`, `1990-Q1`, `1990 Q1`, or an ISO date on a quarter start.
pub fn parse_quarter(raw: &str) -> EngineResult<NaiveDate> {
    let value = raw.trim().to_ascii_uppercase();
    let malformed = || EngineError::MalformedSeries(format!("unrecognised quarter {raw:?}"));

    if let Some((year, quarter)) = value.split_once('Q') {
        let year: i32 = year
            .trim_end_matches(['-', ' '])
            .parse()
            .map_err(|_| malformed())?;
        let quarter: u32 = quarter.trim().parse().map_err(|_| malformed())?;
        if !(1..=4).contains(&quarter) {
            return Err(malformed());
        }
        return NaiveDate::from_ymd_opt(year, (quarter - 1) * 3 + 1, 1).ok_or_else(malformed);
    }

    let date = NaiveDate::parse_from_str(&value, "%Y-%m-%d").map_err(|_| malformed())?;
    if !is_quarter_start(date) {
        return Err(EngineError::MalformedSeries(format!(
            "{date} is not the first day of a quarter"
        )));
    }
    Ok(date)
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    date_key: String,
    price_index: Option<f64>,
    mortgage_rate: Option<f64>,
    #[serde(default)]
    unemployment: Option<f64>,
    #[serde(default)]
    cpi: Option<f64>,
    #[serde(default)]
    one_family_starts: Option<f64>,
    #[serde(default)]
    multi_unit_starts: Option<f64>,
    #[serde(default)]
    for_sale_starts: Option<f64>,
}

fn read_csv_observations(csv_path: &Path) -> EngineResult<Vec<QuarterlyObservation>> {
    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut observations = Vec::new();

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        let date_key = parse_quarter(&row.date_key)?;
        let price_index = row.price_index.ok_or_else(|| {
            EngineError::MalformedSeries(format!("price_index missing at {date_key}"))
        })?;
        let mortgage_rate = row.mortgage_rate.ok_or_else(|| {
            EngineError::MalformedSeries(format!("mortgage_rate missing at {date_key}"))
        })?;

        observations.push(QuarterlyObservation {
            date_key,
            price_index,
            mortgage_rate,
            covariates: Covariates {
                unemployment: row.unemployment,
                cpi: row.cpi,
                one_family_starts: row.one_family_starts,
                multi_unit_starts: row.multi_unit_starts,
                for_sale_starts: row.for_sale_starts,
            },
        });
    }

    debug!(rows = observations.len(), path = %csv_path.display(), "read observations from csv");
    Ok(observations)
}

pub fn load_csv(csv_path: &Path) -> EngineResult<QuarterlySeries> {
    QuarterlySeries::new(read_csv_observations(csv_path)?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) fn quarter(year: i32, q: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, (q - 1) * 3 + 1, 1).unwrap()
    }

    // Starts at 2000Q1.
    pub(crate) fn series_from(prices: &[f64], rates: &[f64]) -> QuarterlySeries {
        let mut date = quarter(2000, 1);
        let mut observations = Vec::new();
        for (price, rate) in prices.iter().zip(rates) {
            observations.push(QuarterlyObservation {
                date_key: date,
                price_index: *price,
                mortgage_rate: *rate,
                covariates: Covariates::default(),
            });
            date = next_quarter(date).unwrap();
        }
        QuarterlySeries::new(observations).unwrap()
    }

    fn observation(date_key: NaiveDate) -> QuarterlyObservation {
        QuarterlyObservation {
            date_key,
            price_index: 100.0,
            mortgage_rate: 5.0,
            covariates: Covariates::default(),
        }
    }

    #[test]
    fn parses_quarter_labels() {
        assert_eq!(parse_quarter("1990Q1").unwrap(), quarter(1990, 1));
        assert_eq!(parse_quarter("1990-Q2").unwrap(), quarter(1990, 2));
        assert_eq!(parse_quarter(" 1990 q3 ").unwrap(), quarter(1990, 3));
        assert_eq!(parse_quarter("1990-10-01").unwrap(), quarter(1990, 4));
    }

    #[test]
    fn rejects_bad_quarter_labels() {
        assert!(parse_quarter("1990Q5").is_err());
        assert!(parse_quarter("1990-02-01").is_err());
        assert!(parse_quarter("not a date").is_err());
    }

    #[test]
    fn rejects_duplicate_quarters() {
        let err = QuarterlySeries::new(vec![
            observation(quarter(2000, 1)),
            observation(quarter(2000, 1)),
        ])
        .unwrap_err();
        assert!(matches!(err, EngineError::MalformedSeries(msg) if msg.contains("duplicate")));
    }

    #[test]
    fn rejects_out_of_order_and_gapped_quarters() {
        let out_of_order = QuarterlySeries::new(vec![
            observation(quarter(2000, 2)),
            observation(quarter(2000, 1)),
        ]);
        assert!(matches!(out_of_order, Err(EngineError::MalformedSeries(_))));

        let gapped = QuarterlySeries::new(vec![
            observation(quarter(2000, 1)),
            observation(quarter(2000, 3)),
        ]);
        assert!(matches!(gapped, Err(EngineError::MalformedSeries(msg)) if msg.contains("gap")));
    }

    #[test]
    fn rejects_non_finite_prices() {
        let mut obs = observation(quarter(2000, 1));
        obs.price_index = f64::NAN;
        assert!(QuarterlySeries::new(vec![obs]).is_err());
    }

    #[test]
    fn tail_keeps_most_recent_quarters() {
        let series = series_from(&[1.0, 2.0, 3.0, 4.0], &[5.0; 4]);
        let tail = series.tail(2);
        assert_eq!(tail.prices(), vec![3.0, 4.0]);
        assert_eq!(tail.dates()[0], quarter(2000, 3));
        assert_eq!(series.tail(10).len(), 4);
    }

    #[test]
    fn reads_csv_with_blank_covariates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "date_key,price_index,mortgage_rate,unemployment,cpi,one_family_starts,multi_unit_starts,for_sale_starts"
        )
        .unwrap();
        writeln!(file, "2001Q1,100.5,6.9,4.2,175.1,300,80,").unwrap();
        writeln!(file, "2001Q2,101.0,7.1,,176.0,310,82,12").unwrap();

        let series = load_csv(file.path()).unwrap();
        assert_eq!(series.len(), 2);
        let second = &series.observations()[1];
        assert_eq!(second.date_key, quarter(2001, 2));
        assert_eq!(second.covariates.unemployment, None);
        assert_eq!(second.covariates.for_sale_starts, Some(12.0));
        assert_eq!(series.observations()[0].covariates.for_sale_starts, None);
    }

    #[test]
    fn csv_with_repeated_quarter_is_rejected_before_import() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "date_key,price_index,mortgage_rate").unwrap();
        writeln!(file, "2001Q1,100,6.9").unwrap();
        writeln!(file, "2001Q1,999,6.9").unwrap();
        let err = load_csv(file.path()).unwrap_err();
        assert!(matches!(err, EngineError::MalformedSeries(msg) if msg.contains("duplicate quarter 2001-01-01")));
    }

    #[test]
    fn header_only_csv_is_empty() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "date_key,price_index,mortgage_rate").unwrap();
        let series = load_csv(file.path()).unwrap();
        assert!(series.is_empty());
    }

    #[test]
    fn csv_out_of_order_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "date_key,price_index,mortgage_rate").unwrap();
        writeln!(file, "2001Q2,100,6.9").unwrap();
        writeln!(file, "2001Q1,101,6.8").unwrap();
        assert!(matches!(load_csv(file.path()), Err(EngineError::MalformedSeries(_))));
    }

    #[test]
    fn csv_without_price_is_malformed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "date_key,price_index,mortgage_rate").unwrap();
        writeln!(file, "2001Q1,,6.9").unwrap();
        assert!(matches!(load_csv(file.path()), Err(EngineError::MalformedSeries(_))));
    }
}
