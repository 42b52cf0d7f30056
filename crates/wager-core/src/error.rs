use thiserror::Error;

/// Wager engine errors.
#[derive(Debug, Error)]
pub enum WagerError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Insufficient funds for user '{user_id}': balance {balance}, required {required}")]
    InsufficientFunds {
        user_id: String,
        balance: i64,
        required: i64,
    },

    #[error("State conflict: {0}")]
    StateConflict(String),

    #[error("Ledger sequence conflict for user '{user_id}': expected head {expected}, found {found}")]
    SequenceConflict {
        user_id: String,
        expected: u64,
        found: u64,
    },

    #[error("Caller '{caller}' is not authorized to {action}")]
    Unauthorized { caller: String, action: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Ledger integrity violation for user '{user_id}': {detail}")]
    Integrity { user_id: String, detail: String },

    #[error("Writes halted for user '{0}' pending manual reconciliation")]
    IntegrityHalt(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("External dependency '{dependency}' failed: {message}")]
    External { dependency: String, message: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl WagerError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(kind: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{kind} '{id}'"))
    }

    pub fn unexpected_status(subject: &str, expected: &str, actual: &str) -> Self {
        Self::StateConflict(format!(
            "{subject}: expected status '{expected}', got '{actual}'"
        ))
    }

    /// Optimistic conflicts are resolved by re-reading and retrying the unit of work.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SequenceConflict { .. })
    }

    /// Stable machine-readable label used by API error bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::StateConflict(_) => "state_conflict",
            Self::SequenceConflict { .. } => "sequence_conflict",
            Self::Unauthorized { .. } => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::Integrity { .. } => "integrity",
            Self::IntegrityHalt(_) => "integrity_halt",
            Self::Timeout(_) => "timeout",
            Self::External { .. } => "external",
            Self::Storage(_) => "storage",
            Self::Serialization(_) => "serialization",
        }
    }
}

impl From<serde_json::Error> for WagerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_sequence_conflicts_are_retryable() {
        let conflict = WagerError::SequenceConflict {
            user_id: "u1".to_string(),
            expected: 3,
            found: 4,
        };
        assert!(conflict.is_retryable());
        assert!(!WagerError::StateConflict("x".to_string()).is_retryable());
        assert!(!WagerError::IntegrityHalt("u1".to_string()).is_retryable());
    }

    #[test]
    fn status_conflict_message_names_both_states() {
        let err = WagerError::unexpected_status("slip s1", "pending", "won");
        assert!(err
            .to_string()
            .contains("expected status 'pending', got 'won'"));
        assert_eq!(err.kind(), "state_conflict");
    }
}
