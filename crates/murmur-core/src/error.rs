use thiserror::Error;

/// Errors surfaced to callers of the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The sender's daily quota is used up. Callers map this to a throttling
    /// response.
    #[error("daily message quota exceeded")]
    QuotaExceeded,

    /// Room missing or owned by someone else.
    #[error("room not found")]
    NotFound,

    #[error("user not found")]
    UserNotFound,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Failures talking to the completion provider. Always absorbed by the
/// worker and turned into a bot reply.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request timed out")]
    Timeout,

    #[error("provider unreachable: {0}")]
    Transport(String),

    #[error("provider returned status {0}")]
    Status(u16),

    #[error("malformed provider response: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Timeouts, connection failures, throttling and server errors may
    /// succeed on a later attempt; anything else will not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::Transport(_) => true,
            Self::Status(code) => *code == 429 || *code >= 500,
            Self::Malformed(_) => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::Malformed(err.to_string())
        } else if let Some(status) = err.status() {
            Self::Status(status.as_u16())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}
