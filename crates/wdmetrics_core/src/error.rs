use std::path::PathBuf;

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("request failed with HTTP {status}: {detail}")]
    Transport { status: StatusCode, detail: String },
    #[error("unexpected API response: {0}")]
    Protocol(String),
    #[error("invalid argument: {0}")]
    Validation(String),
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to decode JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, MetricsError>;

impl MetricsError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Errors a later attempt of the same request could plausibly get past.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Protocol(_) | Self::Http(_) | Self::Json(_)
        )
    }
}
