//! Chain-of-trust error types
//!
//! Every failure that can stop a chain is a variant here. The pipeline driver
//! reports `kind()` and `task_id()` and aborts; nothing is downgraded to a
//! best-effort acceptance.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Chain-of-trust errors
#[derive(Error, Debug)]
pub enum CotError {
    /// A fetch from the task queue failed in a way worth retrying
    #[error("Transient fetch failure for task {task_id}: {message}")]
    TransientFetch { task_id: String, message: String },

    /// The task (or its last run) has not completed
    #[error("Task {task_id} is not completed (state: {state}, last run: {last_run_state})")]
    TaskNotCompleted {
        task_id: String,
        state: String,
        last_run_state: String,
    },

    /// A listed artifact disappeared before it could be read
    #[error("Artifact '{name}' is missing: {}", path.display())]
    MissingArtifact { name: String, path: PathBuf },

    /// The same artifact name was listed twice
    #[error("Artifact '{name}' is listed more than once")]
    DuplicateArtifact { name: String },

    /// An artifact on disk does not match the digest in its statement
    #[error("Artifact integrity violation detected!\n\nTask: {task_id}\nArtifact: {name}\nExpected digest: {expected}\nActual digest:   {actual}")]
    HashMismatch {
        task_id: String,
        name: String,
        expected: String,
        actual: String,
    },

    /// The input carries no signature block at all
    #[error("No signature block found in {source_name}")]
    MissingSignature { source_name: String },

    /// The engine reported the signature as invalid
    #[error("Invalid signature on {source_name}: {message}")]
    InvalidSignature {
        source_name: String,
        message: String,
    },

    /// The signature is valid but the signer is not trusted for the claimed role
    #[error("Key {fingerprint} is not trusted to sign for worker type '{worker_type}': {message}")]
    UntrustedKey {
        fingerprint: String,
        worker_type: String,
        message: String,
    },

    /// No docker image digest could be recovered from the task log
    #[error("Can't find docker image digest for task {task_id} in {}", log_path.display())]
    ImageDigestNotFound { task_id: String, log_path: PathBuf },

    /// The worker type has no entry in the worker-type to key table
    #[error("Unknown worker type '{worker_type}': no signing key is configured for it")]
    UnknownWorkerType { worker_type: String },

    /// The configured signing key is not available
    #[error("Signing key '{key}' is unavailable: {message}")]
    SigningKeyUnavailable { key: String, message: String },

    /// The signed payload is not a well-formed statement
    #[error("Malformed chain-of-trust statement: {message}")]
    MalformedStatement { message: String },

    /// The trust store violates one of its invariants
    #[error("Invalid trust store: {message}")]
    TrustStoreInvalid { message: String },

    /// The task graph is missing data the walk needs
    #[error("Task graph error for task {task_id}: {message}")]
    TaskGraph { task_id: String, message: String },

    /// The signature engine failed for a reason other than a bad signature
    #[error("Signature engine failure: {message}")]
    Engine { message: String },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    /// Filesystem error
    #[error("I/O error on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON (de)serialization error
    #[error("Failed to (de)serialize {what}")]
    Json {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    /// A failure raised while handling one task of a chain
    #[error("{inner}")]
    InTask {
        task_id: String,
        inner: Box<CotError>,
    },
}

/// Stable, serializable name of an error variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    TransientFetch,
    TaskNotCompleted,
    MissingArtifact,
    DuplicateArtifact,
    HashMismatch,
    MissingSignature,
    InvalidSignature,
    UntrustedKey,
    ImageDigestNotFound,
    UnknownWorkerType,
    SigningKeyUnavailable,
    MalformedStatement,
    TrustStoreInvalid,
    TaskGraph,
    Engine,
    Config,
    Io,
    Json,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransientFetch => "transient-fetch",
            ErrorKind::TaskNotCompleted => "task-not-completed",
            ErrorKind::MissingArtifact => "missing-artifact",
            ErrorKind::DuplicateArtifact => "duplicate-artifact",
            ErrorKind::HashMismatch => "hash-mismatch",
            ErrorKind::MissingSignature => "missing-signature",
            ErrorKind::InvalidSignature => "invalid-signature",
            ErrorKind::UntrustedKey => "untrusted-key",
            ErrorKind::ImageDigestNotFound => "image-digest-not-found",
            ErrorKind::UnknownWorkerType => "unknown-worker-type",
            ErrorKind::SigningKeyUnavailable => "signing-key-unavailable",
            ErrorKind::MalformedStatement => "malformed-statement",
            ErrorKind::TrustStoreInvalid => "trust-store-invalid",
            ErrorKind::TaskGraph => "task-graph",
            ErrorKind::Engine => "engine",
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
            ErrorKind::Json => "json",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type CotResult<T> = Result<T, CotError>;

impl CotError {
    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            CotError::TransientFetch { .. } => ErrorKind::TransientFetch,
            CotError::TaskNotCompleted { .. } => ErrorKind::TaskNotCompleted,
            CotError::MissingArtifact { .. } => ErrorKind::MissingArtifact,
            CotError::DuplicateArtifact { .. } => ErrorKind::DuplicateArtifact,
            CotError::HashMismatch { .. } => ErrorKind::HashMismatch,
            CotError::MissingSignature { .. } => ErrorKind::MissingSignature,
            CotError::InvalidSignature { .. } => ErrorKind::InvalidSignature,
            CotError::UntrustedKey { .. } => ErrorKind::UntrustedKey,
            CotError::ImageDigestNotFound { .. } => ErrorKind::ImageDigestNotFound,
            CotError::UnknownWorkerType { .. } => ErrorKind::UnknownWorkerType,
            CotError::SigningKeyUnavailable { .. } => ErrorKind::SigningKeyUnavailable,
            CotError::MalformedStatement { .. } => ErrorKind::MalformedStatement,
            CotError::TrustStoreInvalid { .. } => ErrorKind::TrustStoreInvalid,
            CotError::TaskGraph { .. } => ErrorKind::TaskGraph,
            CotError::Engine { .. } => ErrorKind::Engine,
            CotError::Config { .. } => ErrorKind::Config,
            CotError::Io { .. } => ErrorKind::Io,
            CotError::Json { .. } => ErrorKind::Json,
            CotError::InTask { inner, .. } => inner.kind(),
        }
    }

    /// The error with any task attribution peeled off
    pub fn root(&self) -> &CotError {
        match self {
            CotError::InTask { inner, .. } => inner.root(),
            other => other,
        }
    }

    /// Attribute this error to `task_id` unless it already names a task
    pub fn in_task(self, task_id: &str) -> Self {
        if self.task_id().is_some() {
            return self;
        }
        CotError::InTask {
            task_id: task_id.to_string(),
            inner: Box::new(self),
        }
    }

    /// Task the error is attributed to, when the variant carries one
    pub fn task_id(&self) -> Option<&str> {
        match self {
            CotError::TransientFetch { task_id, .. }
            | CotError::TaskNotCompleted { task_id, .. }
            | CotError::HashMismatch { task_id, .. }
            | CotError::ImageDigestNotFound { task_id, .. }
            | CotError::TaskGraph { task_id, .. }
            | CotError::InTask { task_id, .. } => Some(task_id),
            _ => None,
        }
    }

    /// Only fetch failures are retried; everything else is terminal
    pub fn is_transient(&self) -> bool {
        matches!(self.root(), CotError::TransientFetch { .. })
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CotError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(what: impl Into<String>, source: serde_json::Error) -> Self {
        CotError::Json {
            what: what.into(),
            source,
        }
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        CotError::MalformedStatement {
            message: message.into(),
        }
    }

    /// Log security-critical chain errors
    pub fn log_if_security_critical(&self) {
        match self.root() {
            CotError::HashMismatch { .. }
            | CotError::InvalidSignature { .. }
            | CotError::UntrustedKey { .. } => {
                tracing::error!(target: "security", "CHAIN OF TRUST VIOLATION: {}", self);
            }
            _ => {}
        }
    }
}
