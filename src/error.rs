//! Error types for the mesh decision core.

use std::time::Duration;
use thiserror::Error;

/// Errors and blocked outcomes produced by mesh components.
///
/// Lookups and admission checks return these as values; nothing in the core
/// panics on unknown names or rejected requests.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MeshError {
    /// No service with this name is known.
    #[error("service not found: {service}")]
    ServiceNotFound { service: String },

    /// The service exists but has no instance with this key.
    #[error("instance {instance} not found for service {service}")]
    InstanceNotFound { service: String, instance: String },

    /// No in-flight request with this id.
    #[error("request not found: {request_id}")]
    RequestNotFound { request_id: String },

    /// No policy or rule registered under this name.
    #[error("policy not found: {name}")]
    PolicyNotFound { name: String },

    /// Configuration call rejected before any state was changed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Circuit breaker is open.
    #[error("circuit breaker is open for service: {service}")]
    CircuitOpen { service: String },

    /// Rate limit exceeded.
    #[error("rate limit exceeded for service {service}, retry after {retry_after:?}")]
    RateLimited {
        service: String,
        retry_after: Duration,
    },

    /// Registry has no healthy instance to dispatch to.
    #[error("no healthy instances for service: {service}")]
    NoHealthyInstances { service: String },

    /// Access policy rejected the caller.
    #[error("source {source_name} is not allowed to call {service}")]
    AccessDenied {
        service: String,
        source_name: String,
    },

    /// Retry or time budget used up.
    #[error("budget exhausted for service: {service}")]
    BudgetExhausted { service: String },

    /// Request overran its deadline.
    #[error("request {request_id} timed out after overrunning by {overrun:?}")]
    TimedOut {
        request_id: String,
        overrun: Duration,
    },

    /// Retry attempt limit reached.
    #[error("all {attempts} attempts exhausted")]
    MaxAttemptsReached { attempts: u32 },
}

impl MeshError {
    /// Returns true for the lookup-miss variants callers treat as "nothing to do".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            MeshError::ServiceNotFound { .. }
                | MeshError::InstanceNotFound { .. }
                | MeshError::RequestNotFound { .. }
                | MeshError::PolicyNotFound { .. }
        )
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        MeshError::InvalidConfig(message.into())
    }
}

/// Result type alias for mesh operations.
pub type Result<T> = std::result::Result<T, MeshError>;
