use thiserror::Error;

/// Errors raised by the training pipeline.
///
/// Every variant is fatal for the current run; no component retries locally.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("resource `{key}` not found in bucket `{bucket}`")]
    ResourceNotFound { bucket: String, key: String },

    #[error("storage unavailable while fetching `{key}`: {reason}")]
    StorageUnavailable { key: String, reason: String },

    #[error("failed to decode tensor `{key}`: {reason}")]
    TensorDecode { key: String, reason: String },

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("optimization diverged at epoch {epoch}, batch {batch} (loss = {loss})")]
    OptimizationDivergence { epoch: usize, batch: usize, loss: f64 },

    #[error("export failed: {0}")]
    ExportError(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("operation not allowed: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
