//! Session Error Taxonomy
//!
//! Failures that surface to the user are collected in a dismissible
//! [`UserErrors`] list instead of interrupting the session. Server warnings,
//! tool failures and corrupt local history never become errors at all: they
//! are logged, or normalized into result values, where they happen.

use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Missing endpoint or configuration. Fatal to connecting, not to the process.
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),
    /// Connect or send failure. The connection is torn down.
    #[error("Connection failed: {0}")]
    Transport(String),
    /// The server reported an error. The connection stays up unless the server closes it.
    #[error("Server error ({kind}): {message}")]
    Protocol { kind: String, message: String },
    /// The requested transition does not apply to the current connection state.
    #[error("Cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: &'static str,
    },
}

/// One user-visible failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserError {
    pub id: u64,
    pub message: String,
}

/// Accumulated user-visible failures, each dismissible by id.
#[derive(Debug, Default)]
pub struct UserErrors {
    next_id: u64,
    entries: Vec<UserError>,
}

impl UserErrors {
    pub fn push(&mut self, error: &SessionError) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(UserError {
            id,
            message: error.to_string(),
        });
        id
    }

    /// Removes the entry with `id`. Returns whether it was present.
    pub fn dismiss(&mut self, id: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    pub fn entries(&self) -> &[UserError] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = SessionError::Configuration(ConfigError::MissingVar(
            "PARLEY_BACKEND_URL".to_string(),
        ));
        assert_eq!(
            err.to_string(),
            "Configuration error: Missing environment variable: PARLEY_BACKEND_URL"
        );

        let err = SessionError::Protocol {
            kind: "invalid_request_error".to_string(),
            message: "bad voice".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Server error (invalid_request_error): bad voice"
        );
    }

    #[test]
    fn test_user_errors_push_and_dismiss() {
        let mut errors = UserErrors::default();
        let first = errors.push(&SessionError::Transport("refused".into()));
        let second = errors.push(&SessionError::Transport("reset".into()));
        assert_ne!(first, second);
        assert_eq!(errors.entries().len(), 2);

        assert!(errors.dismiss(first));
        assert!(!errors.dismiss(first));
        assert_eq!(errors.entries()[0].id, second);
        assert!(errors.dismiss(second));
        assert!(errors.is_empty());
    }
}
