use thiserror::Error;

/// Errors produced by the hx-sockets core and its transports.
#[derive(Debug, Error)]
pub enum HxError {
    #[error("upgrade failed: {0}")]
    Upgrade(String),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("transport closed")]
    TransportClosed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("read failed: {0}")]
    Read(String),

    #[error("identifier generation failed: {0}")]
    IdGeneration(String),

    #[error("text frame payload is not valid UTF-8")]
    InvalidText,

    #[error("timeout")]
    Timeout,

    #[error("handler error: {0}")]
    Handler(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HxError {
    /// Whether this error means the peer is gone (as opposed to a local or
    /// per-frame failure).
    pub fn is_closed(&self) -> bool {
        matches!(self, HxError::TransportClosed)
    }
}

pub type HxResult<T> = Result<T, HxError>;
