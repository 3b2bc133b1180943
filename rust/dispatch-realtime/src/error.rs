use thiserror::Error;

#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("Realtime service is not initialized")]
    NotInitialized,

    #[error("Realtime service has been torn down")]
    ServiceStopped,

    #[error("Invalid row filter: {0}")]
    InvalidFilter(String),

    #[error("Channel {topic} rejected: {reason}")]
    ChannelRejected { topic: String, reason: String },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Enabling change feed for table {table} failed: {reason}")]
    PublicationFailed { table: String, reason: String },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T, E = RealtimeError> = std::result::Result<T, E>;
