use thiserror::Error;

/// Errors surfaced by the federation broker and its components.
///
/// Every broker operation either returns a result and no error, or no result
/// and exactly one of these variants. The enum is `Clone` so fetch results
/// can be shared between coalesced in-flight operations.
#[derive(Error, Debug, Clone)]
pub enum FederationError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("RPC error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Pool exhausted: {active} active, {max} max")]
    PoolExhausted { active: usize, max: usize },

    #[error("Unresolved federated reference: {0}")]
    ReferenceUnresolved(String),

    #[error("Fetch failed for mcp://{alias}/{uri}: {reason}")]
    FetchFailed {
        alias: String,
        uri: String,
        reason: String,
    },

    #[error("Unsupported media type: {0}")]
    UnsupportedMedia(String),

    #[error("Materialization failed for {name}: {reason}")]
    MaterializeFailed { name: String, reason: String },

    #[error("Engine execution failed: {0}")]
    ExecuteFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Invariant violation: {0}")]
    Invariant(String),
}

impl FederationError {
    /// Wrap an error as the cause of a failed fetch for one federated
    /// reference.
    pub fn fetch_failed(alias: &str, uri: &str, cause: impl std::fmt::Display) -> Self {
        FederationError::FetchFailed {
            alias: alias.to_string(),
            uri: uri.to_string(),
            reason: cause.to_string(),
        }
    }

    /// True for errors that indicate the underlying connection is unusable.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            FederationError::Transport(_) | FederationError::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FederationError>;

impl From<std::io::Error> for FederationError {
    fn from(e: std::io::Error) -> Self {
        FederationError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for FederationError {
    fn from(e: serde_json::Error) -> Self {
        FederationError::Protocol(format!("JSON error: {}", e))
    }
}

impl From<url::ParseError> for FederationError {
    fn from(e: url::ParseError) -> Self {
        FederationError::Config(format!("URL parse error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_failed_display() {
        let err = FederationError::fetch_failed("github", "issues.json", "connection refused");
        assert_eq!(
            err.to_string(),
            "Fetch failed for mcp://github/issues.json: connection refused"
        );
    }

    #[test]
    fn test_error_is_clone() {
        let err = FederationError::PoolExhausted { active: 10, max: 10 };
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
    }

    #[test]
    fn test_connection_fatal() {
        assert!(FederationError::Transport("closed".into()).is_connection_fatal());
        assert!(!FederationError::NotFound("t".into()).is_connection_fatal());
    }
}
