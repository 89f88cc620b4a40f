use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for CoreError {
    fn from(err: config::ConfigError) -> Self {
        CoreError::Config(err.to_string())
    }
}

/// Failure reported by an external collaborator (renderer, transport,
/// contact store, engagement source, webhook client).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("{service} timed out after {millis}ms")]
    Timeout { service: &'static str, millis: u64 },

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Permanent failure: {0}")]
    Permanent(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
}

impl CollaboratorError {
    /// Timeouts and transient failures may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CollaboratorError::Timeout { .. } | CollaboratorError::Transient(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(CollaboratorError::Timeout {
            service: "transport",
            millis: 100
        }
        .is_retryable());
        assert!(CollaboratorError::Transient("502".into()).is_retryable());
        assert!(!CollaboratorError::Permanent("hard bounce".into()).is_retryable());
        assert!(!CollaboratorError::NotFound {
            kind: "contact",
            id: "c-1".into()
        }
        .is_retryable());
    }
}
