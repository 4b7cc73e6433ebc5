//! Crate-wide error type.
//!
//! Every fallible operation in the core returns a [`MoatError`] (or
//! `anyhow::Result` at CLI boundaries that wrap one). Each variant carries
//! enough context to produce a useful message without ever including secret
//! material, and maps to exactly one of the machine-readable [`ErrorKind`]s
//! so front ends can choose an exit code without string matching.

use std::fmt;

/// The exhaustive, non-overlapping error kinds from the error handling design.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The named resource does not exist.
    NotFound,
    /// A caller-supplied argument was malformed.
    InvalidArgument,
    /// The operation is illegal in the run's current state.
    InvalidState,
    /// No valid credential or token was presented.
    Unauthenticated,
    /// The caller is not permitted to perform the operation.
    Forbidden,
    /// A grant or rule named a provider with no registered descriptor.
    UnknownProvider,
    /// A credential failed its validation probe.
    InvalidCredential,
    /// The store's encryption key could not be derived or located.
    KeyUnavailable,
    /// On-disk data failed an integrity check.
    Corrupt,
    /// A filesystem operation failed.
    Io,
    /// An operation exceeded its deadline.
    Timeout,
    /// An operation was cancelled by its caller.
    Cancelled,
    /// The upstream host could not be reached.
    UpstreamUnavailable,
    /// The container runtime could not be reached or returned an error.
    RuntimeUnavailable,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotFound => "not_found",
            Self::InvalidArgument => "invalid_argument",
            Self::InvalidState => "invalid_state",
            Self::Unauthenticated => "unauthenticated",
            Self::Forbidden => "forbidden",
            Self::UnknownProvider => "unknown_provider",
            Self::InvalidCredential => "invalid_credential",
            Self::KeyUnavailable => "key_unavailable",
            Self::Corrupt => "corrupt",
            Self::Io => "io",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::RuntimeUnavailable => "runtime_unavailable",
        };
        f.write_str(s)
    }
}

/// The crate-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum MoatError {
    /// `{what}` with identifier `{id}` does not exist.
    #[error("{what} '{id}' not found")]
    NotFound {
        /// Kind of resource (e.g. "run", "provider").
        what: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// A caller-supplied argument failed validation.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Human-readable explanation.
        message: String,
    },

    /// An operation was attempted from an illegal state.
    #[error("invalid state: run '{run_id}' is {current}, cannot {attempted}")]
    InvalidState {
        /// The run the operation targeted.
        run_id: String,
        /// The run's current state.
        current: String,
        /// The operation that was rejected.
        attempted: String,
    },

    /// No valid token or credential was presented.
    #[error("unauthenticated: {reason}")]
    Unauthenticated {
        /// Why authentication failed.
        reason: String,
    },

    /// The caller is not permitted to perform this action.
    #[error("forbidden: host '{host}' is not in this run's allow list")]
    Forbidden {
        /// The host that was denied.
        host: String,
    },

    /// A grant named a provider with no registered descriptor.
    #[error("unknown provider '{provider}'")]
    UnknownProvider {
        /// The unrecognized provider name.
        provider: String,
    },

    /// A credential failed its provider-specific validation probe.
    #[error("invalid credential for provider '{provider}'")]
    InvalidCredential {
        /// The provider the credential was for.
        provider: String,
    },

    /// The store's encryption key could not be derived or located.
    #[error("encryption key unavailable: {reason}")]
    KeyUnavailable {
        /// Why the key could not be obtained.
        reason: String,
    },

    /// A record on disk failed an integrity check.
    #[error("corrupt data at '{location}': {reason}")]
    Corrupt {
        /// Where the corruption was detected (file path, audit seq, ...).
        location: String,
        /// What check failed.
        reason: String,
    },

    /// A filesystem operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An operation exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// An operation was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// The upstream host could not be reached.
    #[error("upstream '{host}' unavailable: {reason}")]
    UpstreamUnavailable {
        /// The host that could not be reached.
        host: String,
        /// Underlying cause.
        reason: String,
    },

    /// The container runtime could not be reached or returned an error.
    #[error("runtime unavailable: {reason}")]
    RuntimeUnavailable {
        /// Underlying cause.
        reason: String,
    },

    /// JSON (de)serialization failed.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl MoatError {
    /// The machine-readable kind for this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::Unauthenticated { .. } => ErrorKind::Unauthenticated,
            Self::Forbidden { .. } => ErrorKind::Forbidden,
            Self::UnknownProvider { .. } => ErrorKind::UnknownProvider,
            Self::InvalidCredential { .. } => ErrorKind::InvalidCredential,
            Self::KeyUnavailable { .. } => ErrorKind::KeyUnavailable,
            Self::Corrupt { .. } => ErrorKind::Corrupt,
            Self::Io(_) => ErrorKind::Io,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::UpstreamUnavailable { .. } => ErrorKind::UpstreamUnavailable,
            Self::RuntimeUnavailable { .. } => ErrorKind::RuntimeUnavailable,
            Self::Serde(_) => ErrorKind::Corrupt,
        }
    }

    /// The process exit code a front end should use for this error, per the
    /// external-interfaces exit code contract (0 success, 1 general error, 2
    /// authentication validation failure).
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Unauthenticated | ErrorKind::InvalidCredential => 2,
            _ => 1,
        }
    }
}

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, MoatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_maps_auth_failures_to_two() {
        let err = MoatError::Unauthenticated {
            reason: "no token".into(),
        };
        assert_eq!(err.exit_code(), 2);

        let err = MoatError::InvalidCredential {
            provider: "github".into(),
        };
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn exit_code_defaults_to_one() {
        let err = MoatError::NotFound {
            what: "run",
            id: "abc".into(),
        };
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn kind_display_is_stable_machine_readable_string() {
        assert_eq!(ErrorKind::UpstreamUnavailable.to_string(), "upstream_unavailable");
    }
}
