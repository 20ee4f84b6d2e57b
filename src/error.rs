use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Feed error: {0}")]
    Feed(String),

    #[error("Sink `{sink}` failed: {reason}")]
    Sink { sink: String, reason: String },

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    pub fn sink(sink: impl Into<String>, reason: impl Into<String>) -> Self {
        AppError::Sink { sink: sink.into(), reason: reason.into() }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
