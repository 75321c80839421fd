use thiserror::Error;

/// Failures raised by the core engine itself.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Reconciliation produced an impossible classification. This points at a bug in
    /// key derivation or store contents and must not be retried.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("cannot derive natural key: field `{field}` is {problem}")]
    KeyDerivation { field: String, problem: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CoreError {
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, CoreError::InvariantViolation(_))
    }
}

/// Failures reported by a known-state store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store i/o failed: {0}")]
    Io(String),
    #[error("state store backend failed: {0}")]
    Backend(String),
    #[error("state store contents are corrupt: {0}")]
    Corrupt(String),
}
