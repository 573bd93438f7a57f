//! Common error type for EnviroDAS services

use thiserror::Error;

/// Top-level error type shared by the services.
///
/// Library crates carry their own narrow error enums (frame errors,
/// config errors); this type classifies failures at the service boundary
/// where exit codes and recovery policy are decided.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or conflicting configuration, detected at load time
    #[error("Configuration error: {0}")]
    Config(String),

    /// A storage backend could not be reached at startup
    #[error("Backend unreachable: {0}")]
    BackendUnreachable(String),

    /// Cache tier failure at runtime
    #[error("Cache error: {0}")]
    Cache(String),

    /// Document tier failure at runtime
    #[error("Store error: {0}")]
    Store(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation exceeded its deadline
    #[error("Operation timeout: {0}")]
    Timeout(String),

    /// Anything else
    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Error::BackendUnreachable(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Process exit code for fatal errors (0 is reserved for clean exit).
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => 1,
            Error::BackendUnreachable(_) => 2,
            _ => 3,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(Error::config("bad").exit_code(), 1);
        assert_eq!(Error::backend("redis down").exit_code(), 2);
        assert_eq!(Error::internal("boom").exit_code(), 3);
        assert_eq!(Error::Timeout("shutdown".into()).exit_code(), 3);
    }
}
