use std::sync::Mutex;

use crate::error::{EngineError, EngineResult};
use crate::models::{PredictionRecord, RiskScoreRecord};

/// Writers only ever append. Each record is written on its own so a failure
/// part-way through keeps everything appended before it.
#[allow(async_fn_in_trait)]
pub trait ResultSink {
    async fn append_scores(&self, records: &[RiskScoreRecord]) -> EngineResult<usize>;

    async fn append_predictions(&self, records: &[PredictionRecord]) -> EngineResult<usize>;
}

#[derive(Debug, Default)]
pub struct MemorySink {
    scores: Mutex<Vec<RiskScoreRecord>>,
    predictions: Mutex<Vec<PredictionRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl MemorySink {
    pub fn scores(&self) -> Vec<RiskScoreRecord> {
        self.scores.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn predictions(&self) -> Vec<PredictionRecord> {
        self.predictions.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl ResultSink for MemorySink {
    async fn append_scores(&self, records: &[RiskScoreRecord]) -> EngineResult<usize> {
        let mut scores = self
            .scores
            .lock()
            .map_err(|_| EngineError::SinkUnavailable("score buffer poisoned".to_string()))?;
        scores.extend_from_slice(records);
        Ok(records.len())
    }

    async fn append_predictions(&self, records: &[PredictionRecord]) -> EngineResult<usize> {
        let mut predictions = self
            .predictions
            .lock()
            .map_err(|_| EngineError::SinkUnavailable("prediction buffer poisoned".to_string()))?;
        predictions.extend_from_slice(records);
        Ok(records.len())
    }
}
