use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::{ScoringConfig, WalkForwardConfig};
use crate::error::EngineResult;
use crate::features;
use crate::models::RiskScoreRecord;
use crate::risk;
use crate::series::QuarterlySeries;
use crate::sink::ResultSink;
use crate::walkforward::{self, WalkForwardOutcome};

#[derive(Debug)]
pub struct Outcome<T> {
    pub value: T,
    // Computed results survive a failed write.
    pub persisted: EngineResult<usize>,
}

fn log_persisted(persisted: &EngineResult<usize>, what: &str) {
    match persisted {
        Ok(count) => info!(count, "{what} persisted"),
        Err(err) => warn!(%err, "{what} computed but not persisted"),
    }
}

pub async fn bulk_score<S: ResultSink>(
    series: &QuarterlySeries,
    sink: &S,
    now: DateTime<Utc>,
) -> Outcome<Vec<RiskScoreRecord>> {
    let records = risk::bulk_score(series, now);
    let persisted = sink.append_scores(&records).await;
    log_persisted(&persisted, "bulk scores");
    Outcome {
        value: records,
        persisted,
    }
}

pub async fn live_score<S: ResultSink>(
    series: &QuarterlySeries,
    config: &ScoringConfig,
    sink: &S,
    now: DateTime<Utc>,
) -> EngineResult<Outcome<RiskScoreRecord>> {
    let record = risk::live_score(series, config.lookback, now)?;
    let persisted = sink.append_scores(std::slice::from_ref(&record)).await;
    log_persisted(&persisted, "live score");
    Ok(Outcome {
        value: record,
        persisted,
    })
}

pub async fn train_and_evaluate<S: ResultSink>(
    series: &QuarterlySeries,
    config: &WalkForwardConfig,
    sink: &S,
    now: DateTime<Utc>,
) -> EngineResult<Outcome<WalkForwardOutcome>> {
    let matrix = features::build_features(series);
    let outcome = walkforward::evaluate(&matrix, config, now)?;
    let persisted = sink.append_predictions(&outcome.predictions).await;
    log_persisted(&persisted, "predictions");
    Ok(Outcome {
        value: outcome,
        persisted,
    })
}
