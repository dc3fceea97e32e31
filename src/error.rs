//! Error types for the storage gateway
//!
//! Provides one structured error type for identity parsing, promoter
//! configuration handling, storage backend calls and lifecycle orchestration.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the gateway
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Validation Errors
    // =========================================================================
    #[error("invalid config: {0}")]
    Validation(String),

    #[error("'{0}' is not a valid IQN. expected format: iqn.YYYY-MM.DOTTED.DOMAIN.NAME:UNIQUE_RESOURCE_NAME")]
    InvalidIqn(String),

    #[error("NQN '{0}' malformed, expected <vendor>:nvme:<subsystem>")]
    InvalidNqn(String),

    #[error("'{0}' is not a valid resource name")]
    InvalidName(String),

    #[error("failed to parse service ip '{input}': {reason}")]
    InvalidServiceIp { input: String, reason: String },

    // =========================================================================
    // Conflict Errors
    // =========================================================================
    #[error("resource {id} already exists with incompatible config")]
    IncompatibleResource { id: String },

    #[error("IP address {ip} already in use by config {config}")]
    IpCollision { ip: String, config: String },

    #[error("cannot modify volumes of {id} while the service is running")]
    ServiceRunning { id: String },

    #[error("existing volume {number} has differing size {existing} != {requested}")]
    VolumeSizeMismatch {
        number: u32,
        existing: u64,
        requested: u64,
    },

    // =========================================================================
    // Storage Backend Errors
    // =========================================================================
    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("Backend operation failed: {operation}: {reason}")]
    BackendOperationFailed { operation: String, reason: String },

    #[error("LINSTOR connection error: {0}")]
    Http(#[from] reqwest::Error),

    // =========================================================================
    // Promoter Configuration Errors
    // =========================================================================
    #[error("invalid start entry '{entry}': {reason}")]
    InvalidStartEntry { entry: String, reason: String },

    #[error("malformed promoter config {id}: {reason}")]
    MalformedPromoterConfig { id: String, reason: String },

    #[error("inconsistent volumes, expected volume number {expected}, got {actual}")]
    InconsistentVolumes { expected: u32, actual: u32 },

    #[error("inconsistent volumes, {declared} declared but {deployed} deployed")]
    VolumeCountMismatch { declared: usize, deployed: usize },

    #[error("resource config is missing deployment information")]
    MissingDeployment,

    #[error("error decoding promoter config: {0}")]
    TomlDecode(#[from] toml::de::Error),

    #[error("error encoding promoter config: {0}")]
    TomlEncode(#[from] toml::ser::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    // =========================================================================
    // Wait Errors
    // =========================================================================
    #[error("timeout after {duration:?} waiting for resource {name} to become {condition}")]
    Timeout {
        name: String,
        condition: String,
        duration: Duration,
    },

    #[error("resource {name} did not stay in use on node {node}")]
    Unstable { name: String, node: String },

    #[error("operation cancelled")]
    Cancelled,
}

/// Coarse classification of an error, as seen by callers of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input; never retried, surfaced verbatim
    Validation,
    /// Another deployment occupies the identity, IP or state required
    Conflict,
    /// The requested object does not exist
    NotFound,
    /// Talking to the storage backend failed
    Backend,
    /// A wait-for-condition loop exceeded its deadline or was cancelled
    Timeout,
    /// Persisted configuration could not be understood
    Corruption,
    /// Bug or misconfiguration of the engine itself
    Internal,
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_)
            | Error::InvalidIqn(_)
            | Error::InvalidNqn(_)
            | Error::InvalidName(_)
            | Error::InvalidServiceIp { .. } => ErrorKind::Validation,

            Error::IncompatibleResource { .. }
            | Error::IpCollision { .. }
            | Error::ServiceRunning { .. }
            | Error::VolumeSizeMismatch { .. }
            | Error::ResourceExists { .. } => ErrorKind::Conflict,

            Error::ResourceNotFound { .. } => ErrorKind::NotFound,

            Error::BackendOperationFailed { .. } | Error::Http(_) | Error::JsonParse(_) => {
                ErrorKind::Backend
            }

            Error::Timeout { .. } | Error::Unstable { .. } | Error::Cancelled => ErrorKind::Timeout,

            Error::InvalidStartEntry { .. }
            | Error::MalformedPromoterConfig { .. }
            | Error::InconsistentVolumes { .. }
            | Error::VolumeCountMismatch { .. }
            | Error::MissingDeployment
            | Error::TomlDecode(_) => ErrorKind::Corruption,

            Error::Configuration(_) | Error::TomlEncode(_) => ErrorKind::Internal,
        }
    }

    /// Check if this error is a "does not exist" answer from the backend
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::ResourceNotFound { .. })
    }

    /// Check if this error is an "already exists" answer from the backend
    pub fn is_exists(&self) -> bool {
        matches!(self, Error::ResourceExists { .. })
    }

    /// Check if this error is transient.
    ///
    /// Polling loops keep going on transient errors and give up on all others.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Http(_) | Error::BackendOperationFailed { .. } | Error::Timeout { .. }
        )
    }

    /// Helper for wrapping a backend failure with the operation that failed
    pub fn backend(operation: impl Into<String>, reason: impl ToString) -> Self {
        Error::BackendOperationFailed {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn malformed(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::MalformedPromoterConfig {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = Error::Validation("volume size must be positive".into());
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.to_string(), "invalid config: volume size must be positive");

        let err = Error::IncompatibleResource {
            id: "iscsi-target1".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let err = Error::Timeout {
            name: "target1".into(),
            condition: "used".into(),
            duration: Duration::from_secs(30),
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.is_transient());

        let err = Error::malformed("iscsi-target1", "too few agents");
        assert_eq!(err.kind(), ErrorKind::Corruption);
    }

    #[test]
    fn test_not_found_and_exists() {
        let not_found = Error::ResourceNotFound {
            kind: "ResourceDefinition".into(),
            name: "target1".into(),
        };
        assert!(not_found.is_not_found());
        assert!(!not_found.is_exists());
        assert_eq!(not_found.kind(), ErrorKind::NotFound);

        let exists = Error::ResourceExists {
            kind: "ResourceGroup".into(),
            name: "DfltRscGrp".into(),
        };
        assert!(exists.is_exists());
        assert!(!exists.is_transient());
    }

    #[test]
    fn test_transient_errors() {
        assert!(Error::backend("GET /v1/view/resources", "503 Service Unavailable").is_transient());
        assert!(!Error::malformed("nfs-share1", "no nfsserver agent").is_transient());
        assert!(!Error::Cancelled.is_transient());
        assert!(!Error::ResourceNotFound {
            kind: "Resource".into(),
            name: "target1".into(),
        }
        .is_transient());
    }
}
