use crate::path::SecretPath;
use std::time::Duration;
use thiserror::Error;

/// Result alias for engine operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Result alias for driver operations.
pub type DriverResult<T> = core::result::Result<T, DriverError>;

/// Coarse classification of a driver failure.
///
/// Transient failures are retried at the driver layer; the engine only ever
/// sees the final outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    Auth,
    NotFound,
    Transient,
    Permanent,
}

impl DriverErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverErrorKind::Auth => "driver_auth",
            DriverErrorKind::NotFound => "driver_not_found",
            DriverErrorKind::Transient => "driver_transient",
            DriverErrorKind::Permanent => "driver_permanent",
        }
    }
}

/// A failed driver call, carrying the operation name plus whatever request
/// metadata the driver could supply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation}: {message}")]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub operation: String,
    pub message: String,
    pub path: Option<SecretPath>,
    pub request_id: Option<String>,
    pub elapsed: Option<Duration>,
}

impl DriverError {
    pub fn new(
        kind: DriverErrorKind,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            operation: operation.into(),
            message: message.into(),
            path: None,
            request_id: None,
            elapsed: None,
        }
    }

    pub fn auth(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Auth, operation, message)
    }

    pub fn not_found(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::NotFound, operation, message)
    }

    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Transient, operation, message)
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Permanent, operation, message)
    }

    pub fn with_path(mut self, path: SecretPath) -> Self {
        self.path = Some(path);
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = Some(elapsed);
        self
    }
}

/// Canonical error surface for the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("invalid secret path `{path}`: {reason}")]
    PathInvalid { path: String, reason: String },
    #[error("circular dependency detected in target inheritance: {chain}")]
    CycleDetected { chain: String },
    #[error("unknown import `{0}`")]
    UnknownImport(String),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("merge store write failed for `{key}`")]
    MergeStoreWrite {
        key: String,
        #[source]
        source: DriverError,
    },
    #[error("destination list failed for target `{target}`")]
    DestinationList {
        target: String,
        #[source]
        source: DriverError,
    },
    #[error("destination write failed at `{path}`")]
    DestinationWrite {
        path: SecretPath,
        #[source]
        source: DriverError,
    },
    #[error("run cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable tag for structured output.
    pub fn code(&self) -> &'static str {
        match self {
            Error::ConfigInvalid(_) => "config_invalid",
            Error::PathInvalid { .. } => "path_invalid",
            Error::CycleDetected { .. } => "cycle_detected",
            Error::UnknownImport(_) => "unknown_import",
            Error::Driver(err) => err.kind.as_str(),
            Error::MergeStoreWrite { .. } => "merge_store_write",
            Error::DestinationList { .. } => "destination_list",
            Error::DestinationWrite { .. } => "destination_write",
            Error::Cancelled => "cancelled",
            Error::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_error_carries_request_metadata() {
        let err = DriverError::transient("list_secrets", "throttled")
            .with_request_id("req-123")
            .with_elapsed(Duration::from_millis(250));
        assert_eq!(err.kind, DriverErrorKind::Transient);
        assert_eq!(err.request_id.as_deref(), Some("req-123"));
        assert_eq!(err.elapsed, Some(Duration::from_millis(250)));
        assert_eq!(err.to_string(), "list_secrets: throttled");
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::Cancelled.code(), "cancelled");
        assert_eq!(
            Error::Driver(DriverError::not_found("get", "missing")).code(),
            "driver_not_found"
        );
    }
}
