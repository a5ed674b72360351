use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::models::{
    Covariates, ModelKind, PredictionRecord, QuarterlyObservation, RiskScoreRecord,
};
use crate::series::{self, QuarterlySeries};
use crate::sink::ResultSink;

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Replaces any stored values for the same quarter. The whole file is
/// validated before the first row is written.
pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> EngineResult<usize> {
    let incoming = series::load_csv(csv_path)?;
    let mut upserted = 0usize;

    for obs in incoming.observations() {
        let result = sqlx::query(
            r#"
            INSERT INTO housing_risk.quarterly_observations
            (date_key, price_index, mortgage_rate, unemployment, cpi,
             one_family_starts, multi_unit_starts, for_sale_starts)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (date_key) DO UPDATE
            SET price_index = EXCLUDED.price_index,
                mortgage_rate = EXCLUDED.mortgage_rate,
                unemployment = EXCLUDED.unemployment,
                cpi = EXCLUDED.cpi,
                one_family_starts = EXCLUDED.one_family_starts,
                multi_unit_starts = EXCLUDED.multi_unit_starts,
                for_sale_starts = EXCLUDED.for_sale_starts,
                loaded_at = now()
            "#,
        )
        .bind(obs.date_key)
        .bind(obs.price_index)
        .bind(obs.mortgage_rate)
        .bind(obs.covariates.unemployment)
        .bind(obs.covariates.cpi)
        .bind(obs.covariates.one_family_starts)
        .bind(obs.covariates.multi_unit_starts)
        .bind(obs.covariates.for_sale_starts)
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            upserted += 1;
        }
    }

    info!(rows = upserted, path = %csv_path.display(), "observations imported");
    Ok(upserted)
}

pub async fn fetch_observations(pool: &PgPool) -> EngineResult<QuarterlySeries> {
    let rows = sqlx::query(
        "SELECT date_key, price_index, mortgage_rate, unemployment, cpi, \
         one_family_starts, multi_unit_starts, for_sale_starts \
         FROM housing_risk.quarterly_observations \
         ORDER BY date_key",
    )
    .fetch_all(pool)
    .await?;

    let mut observations = Vec::with_capacity(rows.len());
    for row in rows {
        observations.push(QuarterlyObservation {
            date_key: row.get("date_key"),
            price_index: row.get("price_index"),
            mortgage_rate: row.get("mortgage_rate"),
            covariates: Covariates {
                unemployment: row.get("unemployment"),
                cpi: row.get("cpi"),
                one_family_starts: row.get("one_family_starts"),
                multi_unit_starts: row.get("multi_unit_starts"),
                for_sale_starts: row.get("for_sale_starts"),
            },
        });
    }

    debug!(rows = observations.len(), "observations fetched");
    QuarterlySeries::new(observations)
}

pub async fn fetch_predictions(
    pool: &PgPool,
    model: ModelKind,
) -> EngineResult<Vec<PredictionRecord>> {
    let rows = sqlx::query(
        "SELECT date_key, predicted_price, actual_price, prediction_timestamp \
         FROM housing_risk.model_predictions \
         WHERE model_name = $1 \
         ORDER BY date_key, prediction_timestamp",
    )
    .bind(model.as_str())
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| PredictionRecord {
            date_key: row.get("date_key"),
            model_name: model,
            predicted_price: row.get("predicted_price"),
            actual_price: row.get("actual_price"),
            prediction_timestamp: row.get("prediction_timestamp"),
        })
        .collect())
}

/// Every stored score, bulk and live, oldest quarter first.
pub async fn fetch_scores(pool: &PgPool) -> EngineResult<Vec<RiskScoreRecord>> {
    let rows = sqlx::query(
        "SELECT date_key, risk_score, risk_level, notes, run_type, calculation_timestamp \
         FROM housing_risk.bubble_risk_scores \
         ORDER BY date_key, calculation_timestamp",
    )
    .fetch_all(pool)
    .await?;

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let date_key: NaiveDate = row.get("date_key");
        let score: i32 = row.get("risk_score");
        let level: String = row.get("risk_level");
        let notes: String = row.get("notes");
        let run_type: String = row.get("run_type");
        let calculation_timestamp: DateTime<Utc> = row.get("calculation_timestamp");
        let unreadable = |e: String| {
            EngineError::SinkUnavailable(format!("unreadable score for {date_key}: {e}"))
        };

        records.push(RiskScoreRecord {
            date_key,
            risk_score: u32::try_from(score).map_err(|e| unreadable(e.to_string()))?,
            risk_level: level.parse().map_err(unreadable)?,
            notes: split_notes(&notes),
            run_type: run_type.parse().map_err(unreadable)?,
            calculation_timestamp,
        });
    }

    Ok(records)
}

fn split_notes(notes: &str) -> Vec<String> {
    notes
        .split("; ")
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone)]
pub struct PgSink {
    pool: PgPool,
}

impl PgSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn partial_write(appended: usize, total: usize, err: impl std::fmt::Display) -> EngineError {
    EngineError::SinkUnavailable(format!(
        "{appended} of {total} records appended before failure: {err}"
    ))
}

impl ResultSink for PgSink {
    async fn append_scores(&self, records: &[RiskScoreRecord]) -> EngineResult<usize> {
        for (appended, record) in records.iter().enumerate() {
            let score = i32::try_from(record.risk_score)
                .map_err(|e| partial_write(appended, records.len(), e))?;
            sqlx::query(
                r#"
                INSERT INTO housing_risk.bubble_risk_scores
                (id, date_key, risk_score, risk_level, notes, run_type, calculation_timestamp)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(record.date_key)
            .bind(score)
            .bind(record.risk_level.as_str())
            .bind(record.notes_display())
            .bind(record.run_type.as_str())
            .bind(record.calculation_timestamp)
            .execute(&self.pool)
            .await
            .map_err(|e| partial_write(appended, records.len(), e))?;
        }

        debug!(records = records.len(), "risk scores appended");
        Ok(records.len())
    }

    async fn append_predictions(&self, records: &[PredictionRecord]) -> EngineResult<usize> {
        for (appended, record) in records.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO housing_risk.model_predictions
                (id, date_key, model_name, predicted_price, actual_price, prediction_timestamp)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(record.date_key)
            .bind(record.model_name.as_str())
            .bind(record.predicted_price)
            .bind(record.actual_price)
            .bind(record.prediction_timestamp)
            .execute(&self.pool)
            .await
            .map_err(|e| partial_write(appended, records.len(), e))?;
        }

        debug!(records = records.len(), "predictions appended");
        Ok(records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_write_reports_rows_already_committed() {
        let err = partial_write(7, 12, "connection reset");
        assert!(matches!(
            err,
            EngineError::SinkUnavailable(msg)
                if msg == "7 of 12 records appended before failure: connection reset"
        ));
    }

    #[test]
    fn notes_round_trip_through_display_form() {
        assert_eq!(
            split_notes("Growth > 25%; Z > 3; Momentum Positive"),
            vec!["Growth > 25%", "Z > 3", "Momentum Positive"]
        );
        assert!(split_notes("").is_empty());
    }
}
