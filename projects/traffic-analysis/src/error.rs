// Error taxonomy for pipeline stages
//
// Item-scoped failures (fetch, decode, upload, publish) are dropped or degraded
// by the worker that hit them. Inference failures drop the whole batch.
// Config and broker errors are only fatal during startup.

use thiserror::Error;

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("annotation render failed: {0}")]
    Render(String),

    #[error("upload failed for {key}: {reason}")]
    Upload { key: String, reason: String },

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("malformed event: {0}")]
    Malformed(String),

    #[error("invalid event payload: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg_attr(not(feature = "kafka"), allow(dead_code))]
    #[error("broker error: {0}")]
    Broker(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("shutdown in progress")]
    Shutdown,
}

impl PipelineError {
    pub fn fetch(url: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        PipelineError::Fetch {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    pub fn upload(key: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        PipelineError::Upload {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}
