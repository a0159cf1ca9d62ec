use thiserror::Error;

/// Bad user input caught before anything reaches the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationIssue {
    #[error("Give your task a title")]
    EmptyTitle,
    #[error("Title must be at most {max} characters")]
    TitleTooLong { max: usize },
    #[error("Points must be a number, got '{0}'")]
    InvalidPoints(String),
    #[error("Points must be zero or positive, got {0}")]
    NegativePoints(i64),
    #[error("{0}")]
    InvalidDueDate(String),
    #[error("Fill in every field")]
    EmptyCredentials,
    #[error("Invalid email")]
    InvalidEmail,
    #[error("Passwords do not match")]
    PasswordMismatch,
    #[error("Password must be at least {min} characters")]
    WeakPassword { min: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error(transparent)]
    Validation(#[from] ValidationIssue),
    #[error("Sign in to continue")]
    Unauthenticated,
    #[error("Task '{id}' not found")]
    NotFound { id: String },
    #[error("Task '{id}' belongs to another user")]
    Forbidden { id: String },
    #[error("Task store unavailable: {0}")]
    Unavailable(String),
    #[error("Malformed record '{key}': {reason}")]
    MalformedRecord { key: String, reason: String },
}

impl TaskError {
    pub fn malformed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        TaskError::MalformedRecord {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// True for failures reported by the store rather than detected locally.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            TaskError::NotFound { .. } | TaskError::Forbidden { .. } | TaskError::Unavailable(_)
        )
    }
}

/// Failures reported by a [`crate::store::TaskStore`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("record '{key}' does not exist")]
    NotFound { key: String },
    #[error("permission denied for record '{key}'")]
    Forbidden { key: String },
    #[error("{0}")]
    Unavailable(String),
}

impl From<StoreError> for TaskError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { key } => TaskError::NotFound { id: key },
            StoreError::Forbidden { key } => TaskError::Forbidden { id: key },
            StoreError::Unavailable(message) => TaskError::Unavailable(message),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Unavailable(format!("corrupt record payload: {err}"))
    }
}
