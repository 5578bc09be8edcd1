use thiserror::Error;

/// Errors surfaced at the crate boundary.
///
/// Everything below the model entry points speaks `candle_core::Result`; this type only
/// wraps it together with configuration and assignment failures.
#[derive(Debug, Error)]
pub enum VisError {
    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("linear assignment failed: {0}")]
    Assignment(String),

    #[error("window size must be at least 1")]
    InvalidWindow,

    #[error("invalid config: {0}")]
    Config(String),
}

impl VisError {
    /// True when the failure looks like device memory exhaustion.
    pub fn is_out_of_memory(&self) -> bool {
        match self {
            VisError::Candle(e) => e.to_string().to_lowercase().contains("out of memory"),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, VisError>;
