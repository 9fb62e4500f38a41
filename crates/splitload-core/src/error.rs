//! Error types for splitload

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, LoadError>;

/// Errors that can stop a run before or after it executes.
///
/// Failures observed *during* a run (timeouts, bad statuses, lag) are never
/// errors of this type: they are recorded as metric samples instead.
#[derive(Error, Debug)]
pub enum LoadError {
    // === Configuration ===
    /// Configuration failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Threshold expression could not be parsed
    #[error("Invalid threshold `{expression}` for `{metric}`: {reason}")]
    InvalidThreshold {
        metric: String,
        expression: String,
        reason: String,
    },

    /// Unknown preset name
    #[error("Unknown preset: {0}")]
    UnknownPreset(String),

    /// Configuration file could not be decoded
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // === Startup ===
    /// HTTP client could not be built
    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(String),

    /// Base URL is not a valid absolute URL
    #[error("Invalid base URL `{0}`")]
    InvalidBaseUrl(String),

    // === Reporting ===
    /// Report sink failed
    #[error("Report sink `{sink}` failed: {reason}")]
    Sink { sink: &'static str, reason: String },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LoadError {
    /// Process exit code for the CLI
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidConfig(_)
            | Self::InvalidThreshold { .. }
            | Self::UnknownPreset(_)
            | Self::ConfigParse(_)
            | Self::InvalidBaseUrl(_) => 2,
            Self::ClientBuild(_) => 3,
            Self::Sink { .. } | Self::Serialization(_) | Self::Io(_) => 4,
        }
    }

    /// Whether the error was raised before any traffic was generated
    pub fn is_startup(&self) -> bool {
        !matches!(self, Self::Sink { .. } | Self::Serialization(_) | Self::Io(_))
    }
}

/// Failure of the HTTP collaborator itself, as opposed to an unexpected response
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Request did not complete within its timeout
    #[error("request timed out")]
    Timeout,

    /// Connection could not be established
    #[error("connection failed: {0}")]
    Connect(String),

    /// Any other transport-level failure
    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Short label used as the `kind` tag on `transport_errors`
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connect(_) => "connect",
            Self::Other(_) => "other",
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Connect(err.to_string())
        } else {
            Self::Other(err.to_string())
        }
    }
}
