//! 错误类型
//! Error types for the detection pipeline.

use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Frame source failures, classified by how the grabber reacts to them.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SourceError {
    /// Connection to the source is gone; the grabber reconnects after a cooldown.
    #[error("source disconnected")]
    Disconnected,

    /// A single grab/retrieve failed; retried after a short delay.
    #[error("transient source error: {0}")]
    Transient(String),

    /// The frame could not be decoded.
    #[error("decode failed: {0}")]
    Decode(String),

    /// A finite source has no more frames.
    #[error("source exhausted")]
    Exhausted,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Model load failed: {0}")]
    ModelLoad(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Malformed detector output: {0}")]
    MalformedOutput(String),

    #[error("Resource probe failed: {0}")]
    Probe(String),

    #[error("No inference worker could be started")]
    NoWorkers,

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl PipelineError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn model_load(msg: impl Into<String>) -> Self {
        Self::ModelLoad(msg.into())
    }

    pub fn inference(msg: impl Into<String>) -> Self {
        Self::Inference(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedOutput(msg.into())
    }

    pub fn probe(msg: impl Into<String>) -> Self {
        Self::Probe(msg.into())
    }

    /// Errors confined to a single batch; the worker keeps running.
    pub fn is_batch_local(&self) -> bool {
        matches!(
            self,
            PipelineError::Inference(_)
                | PipelineError::MalformedOutput(_)
                | PipelineError::Image(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_local_classification() {
        assert!(PipelineError::inference("boom").is_batch_local());
        assert!(PipelineError::malformed("2 lists for 3 frames").is_batch_local());
        assert!(!PipelineError::model_load("missing file").is_batch_local());
        assert!(!PipelineError::NoWorkers.is_batch_local());
    }

    #[test]
    fn test_source_error_converts() {
        let err: PipelineError = SourceError::Disconnected.into();
        assert_eq!(err.to_string(), "Source error: source disconnected");
    }
}
