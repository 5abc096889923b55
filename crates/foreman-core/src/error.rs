//! Error taxonomy for operations exposed over the HTTP API.
//!
//! Store and process plumbing use `anyhow`; anything a caller can act on
//! is classified here so the API layer can pick a status code.

use thiserror::Error;

use crate::guard::GuardFinding;

/// Classified harness error.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Bad input; nothing was written.
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    /// Credentials are missing or unusable. `hint` tells the operator what
    /// to do about it.
    #[error("{message}")]
    Auth {
        message: String,
        hint: Option<String>,
    },

    /// Prompt-injection guard rejected the write.
    #[error("prompt injection patterns detected: {}", patterns.join(", "))]
    Security {
        patterns: Vec<String>,
        findings: Vec<GuardFinding>,
    },

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Shorthand result type for classified operations.
pub type HarnessResult<T> = Result<T, HarnessError>;

impl HarnessError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn auth(message: impl Into<String>, hint: Option<String>) -> Self {
        Self::Auth {
            message: message.into(),
            hint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_message_lists_patterns() {
        let err = HarnessError::Security {
            patterns: vec!["role-tag".into(), "do-anything-now".into()],
            findings: vec![],
        };
        assert_eq!(
            err.to_string(),
            "prompt injection patterns detected: role-tag, do-anything-now"
        );
    }

    #[test]
    fn anyhow_errors_become_internal() {
        let err: HarnessError = anyhow::anyhow!("disk on fire").into();
        assert!(matches!(err, HarnessError::Internal(_)));
        assert_eq!(err.to_string(), "disk on fire");
    }
}
