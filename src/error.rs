//! Error types for the Koney operator

use thiserror::Error;

/// Main error type for Koney operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for trap specifications
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error (ledger annotations, trap JSON)
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A command executed inside a container failed or misbehaved
    #[error("exec error: {0}")]
    Exec(String),

    /// A trap kind or deployment strategy that is reserved but not built yet
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Internal/operational error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an exec error with the given message
    pub fn exec(msg: impl Into<String>) -> Self {
        Self::Exec(msg.into())
    }

    /// Create a not-implemented error with the given message
    pub fn not_implemented(msg: impl Into<String>) -> Self {
        Self::NotImplemented(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True if this is a version conflict (HTTP 409) from the API server.
    ///
    /// Conflicts are resolved locally by the optimistic-concurrency retry
    /// wrapper and never surface to callers.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(ae)) if ae.code == 409)
    }

    /// True if the API server answered 404 for the request.
    ///
    /// On get/delete this means the object is gone. On list/create of a
    /// custom resource it means the kind itself is not registered, i.e.,
    /// the operator owning that CRD is not installed.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(ae)) if ae.code == 404)
    }
}

/// Join a list of errors into a single summary error.
///
/// Returns `None` for an empty list, so callers can keep the happy path
/// error-free.
pub fn join_errors(errors: Vec<Error>) -> Option<Error> {
    if errors.is_empty() {
        return None;
    }
    if errors.len() == 1 {
        return errors.into_iter().next();
    }
    let joined = errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ");
    Some(Error::Internal(format!(
        "{} errors occurred: {joined}",
        errors.len()
    )))
}
