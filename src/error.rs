use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("insufficient history: {required} quarters required, {available} available")]
    InsufficientHistory { required: usize, available: usize },

    #[error("malformed series: {0}")]
    MalformedSeries(String),

    #[error("model fit failed: {0}")]
    FitFailed(String),

    #[error("result sink unavailable: {0}")]
    SinkUnavailable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
