use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VqError {
    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid model config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported checkpoint format: {0:?}")]
    UnsupportedCheckpoint(PathBuf),

    #[error("{0} has no gradient with respect to the last layer weight")]
    MissingGradient(&'static str),

    #[error("variable map lock was poisoned")]
    PoisonedVarMap,
}

pub type Result<T> = std::result::Result<T, VqError>;
