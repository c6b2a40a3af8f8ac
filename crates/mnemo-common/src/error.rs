use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // Storage layer
    #[error("database connection error: {0}")]
    Connection(String),

    #[error("query failed: {message} (statement: {statement})")]
    Query { statement: String, message: String },

    #[error("integrity violation: {0}")]
    Integrity(String),

    // Remote API layer
    #[error("rate limit reached for {provider}: {message}")]
    RateLimit { provider: String, message: String },

    #[error("authentication error for {provider}: {message}")]
    Auth { provider: String, message: String },

    #[error("provider error from {provider}: {message}")]
    Provider { provider: String, message: String },

    // User input layer
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    // Startup configuration
    #[error("missing required configuration: {0}")]
    MissingConfig(String),

    #[error("invalid configuration value for {0}")]
    InvalidConfig(String),

    // Feature gating
    #[error("feature is disabled: {0}")]
    FeatureDisabled(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    // Policy
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("rate limited, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse error families used for user-facing reply selection and for the
/// router's retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Storage,
    RemoteApi,
    UserInput,
    Config,
    Feature,
    Policy,
    Other,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connection(_) | Error::Query { .. } | Error::Integrity(_) => ErrorKind::Storage,
            Error::RateLimit { .. } | Error::Auth { .. } | Error::Provider { .. } => {
                ErrorKind::RemoteApi
            }
            Error::Validation(_) | Error::InvalidCommand(_) => ErrorKind::UserInput,
            Error::MissingConfig(_) | Error::InvalidConfig(_) => ErrorKind::Config,
            Error::FeatureDisabled(_) | Error::NotImplemented(_) => ErrorKind::Feature,
            Error::Unauthorized(_) | Error::RateLimited { .. } => ErrorKind::Policy,
            Error::Io(_) | Error::Serialization(_) => ErrorKind::Other,
        }
    }

    /// True for the provider error classes that the model router is allowed
    /// to fall through on. Everything else aborts the chain immediately.
    pub fn is_provider_fallback(&self) -> bool {
        matches!(
            self,
            Error::RateLimit { .. } | Error::Auth { .. } | Error::Provider { .. }
        )
    }

    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn rate_limit(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Error::RateLimit {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn auth(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Auth {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn query(statement: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Query {
            statement: statement.into(),
            message: message.into(),
        }
    }
}
