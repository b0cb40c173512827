//! # Session Model Errors
//!
//! ```text
//! ValidationError ──► CoreError ──► SyncError::Session ──► ClientApp caller
//!  (field rules)      (model rules)
//! ```

use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// `complete_setup` or a reassignment carried a printer id other than
    /// the one already stored.
    #[error("Identity is immutable: already {current}, refused {attempted}")]
    IdentityImmutable { current: u64, attempted: u64 },

    #[error("Unknown event kind: {0}")]
    UnknownEventKind(String),

    #[error("Tool index {index} out of range (max {max})")]
    ToolOutOfRange { index: usize, max: usize },

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// A config field broke one of the rules in [`crate::validation`].
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{field} is required")]
    Required { field: &'static str },

    #[error("{field} must be at least {min} characters")]
    TooShort { field: &'static str, min: usize },

    #[error("{field} must be at most {max} characters")]
    TooLong { field: &'static str, max: usize },

    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: &'static str, reason: &'static str },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_message() {
        let err = CoreError::IdentityImmutable {
            current: 10,
            attempted: 11,
        };
        assert_eq!(
            err.to_string(),
            "Identity is immutable: already 10, refused 11"
        );
    }

    #[test]
    fn test_validation_wraps_into_core_error() {
        let err: CoreError = ValidationError::Required { field: "token" }.into();
        assert!(matches!(err, CoreError::Validation(_)));
        assert_eq!(err.to_string(), "Validation error: token is required");
    }
}
