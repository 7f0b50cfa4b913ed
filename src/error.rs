use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Upstream {target} unreachable: {source}")]
    UpstreamUnreachable {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn malformed_request<T: fmt::Display>(msg: T) -> Self {
        Error::MalformedRequest(msg.to_string())
    }

    pub fn malformed_response<T: fmt::Display>(msg: T) -> Self {
        Error::MalformedResponse(msg.to_string())
    }

    pub fn unreachable<T: fmt::Display>(target: T, source: std::io::Error) -> Self {
        Error::UpstreamUnreachable {
            target: target.to_string(),
            source,
        }
    }

    pub fn invalid_config<T: fmt::Display>(msg: T) -> Self {
        Error::InvalidConfig(msg.to_string())
    }

    pub fn internal<T: fmt::Display>(msg: T) -> Self {
        Error::Internal(msg.to_string())
    }

    /// True for failures of the transport itself, as opposed to protocol violations.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::ConnectionClosed | Error::UpstreamUnreachable { .. }
        )
    }
}
