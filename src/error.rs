//! Error types for the hypertune operator

use thiserror::Error;

/// Main error type for hypertune operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for CRD specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Trial manifest names a job kind with no registered provider
    #[error("unsupported job kind: {0}")]
    UnsupportedJobKind(String),

    /// Search algorithm endpoint failed or was unreachable
    #[error("algorithm error: {0}")]
    Algorithm(String),

    /// Search algorithm rejected the experiment's settings
    #[error("algorithm rejected settings: {0}")]
    AlgorithmRejected(String),

    /// Observation store failed or was unreachable
    #[error("observation store error: {0}")]
    ObservationStore(String),

    /// Trial template rendering failed
    #[error("template error: {0}")]
    Template(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Operator configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an unsupported job kind error
    pub fn unsupported_job_kind(kind: impl Into<String>) -> Self {
        Self::UnsupportedJobKind(kind.into())
    }

    /// Create an algorithm endpoint error with the given message
    pub fn algorithm(msg: impl Into<String>) -> Self {
        Self::Algorithm(msg.into())
    }

    /// Create an algorithm rejection error with the given message
    pub fn algorithm_rejected(msg: impl Into<String>) -> Self {
        Self::AlgorithmRejected(msg.into())
    }

    /// Create an observation store error with the given message
    pub fn observation_store(msg: impl Into<String>) -> Self {
        Self::ObservationStore(msg.into())
    }

    /// Create a template error with the given message
    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Returns true if this is an optimistic-concurrency conflict (HTTP 409)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(resp)) if resp.code == 409)
    }

    /// Returns true if this is a not-found response (HTTP 404)
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(resp)) if resp.code == 404)
    }

    /// Returns true if this is an already-exists response (HTTP 409, reason AlreadyExists)
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(resp)) if resp.reason == "AlreadyExists")
    }

    /// Terminal domain errors are mapped to a Failed condition and never retried
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::UnsupportedJobKind(_) | Self::AlgorithmRejected(_)
        )
    }

    /// Returns true if the next scheduled reconcile may succeed
    pub fn is_retryable(&self) -> bool {
        !self.is_terminal() && !matches!(self, Self::Config(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
