use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApmError {
    #[error("Agent protocol error: {0}")]
    Protocol(String),

    #[error("Decode error: {message}")]
    Decode { message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid routing pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("Identity collision on key {key:#018x}: expected [{expected}], found [{found}]")]
    IdentityCollision {
        key: u64,
        expected: String,
        found: String,
    },

    #[error("Token {token} is already assigned to [{fqn}]")]
    TokenConflict { token: i64, fqn: String },

    #[error("Conflation error: {0}")]
    Conflation(String),

    #[error("Destination not found: {0}")]
    DestinationNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Async task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Network error: {0}")]
    Network(String),
}

/// Result type alias for APMRouter operations
pub type Result<T> = std::result::Result<T, ApmError>;

impl ApmError {
    /// Creates a new protocol error
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::Protocol(msg.into())
    }

    /// Creates a new decode error
    pub fn decode<S: Into<String>>(msg: S) -> Self {
        Self::Decode {
            message: msg.into(),
        }
    }

    /// Creates a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a new conflation error
    pub fn conflation<S: Into<String>>(msg: S) -> Self {
        Self::Conflation(msg.into())
    }

    /// Creates a new network error
    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }

    /// Returns true if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Returns the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Protocol(_) | Self::Decode { .. } => "protocol",
            Self::Config(_) | Self::InvalidPattern(_) | Self::Yaml(_) => "config",
            Self::IdentityCollision { .. } | Self::TokenConflict { .. } => "catalog",
            Self::Conflation(_) => "conflation",
            Self::DestinationNotFound(_) => "not_found",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::Join(_) => "async",
            Self::ChannelClosed(_) => "channel",
            Self::Network(_) => "network",
        }
    }
}
