//! Controller error types.
//!
//! Errors surfaced to RPC callers are represented by the [`ControllerError`]
//! enum, which derives [`thiserror::Error`] for ergonomic error handling and
//! also implements [`Serialize`]/[`Deserialize`] so errors can travel across
//! the QUIC transport layer.
//!
//! Failures reported by a storage backend are represented by
//! [`BackendError`], which keeps the backend's numeric error code when the
//! protocol supplies one.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for controller operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone)]
pub enum ControllerError {
    /// The caller supplied an empty identifier or an unusable parameter set.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No backend handle, vhost controller or PCI address is configured.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// An expected entity does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// An entity of the same name exists but does not match the request.
    #[error("{name} already exists with size {actual_size}")]
    AlreadyExists {
        /// Name of the conflicting entity.
        name: String,
        /// Size in bytes of the existing entity.
        actual_size: u64,
    },

    /// The storage backend rejected or failed a call.
    #[error("{context}: {reason}")]
    BackendError {
        /// Which call failed and on which resource.
        context: String,
        /// Backend failure as reported.
        reason: String,
    },

    /// A QUIC / transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControllerError {
    /// Create a [`ControllerError::BackendError`] wrapping `e` with `context`.
    pub fn backend<E: std::fmt::Display>(context: impl Into<String>, e: E) -> Self {
        Self::BackendError {
            context: context.into(),
            reason: e.to_string(),
        }
    }

    /// Create a [`ControllerError::TransportError`] from anything that
    /// implements [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    /// Create a [`ControllerError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }
}

/// `-ENODEV`, returned by SPDK for unknown BDev and controller names.
pub const ENODEV: i64 = -19;
/// `-ENOENT`.
pub const ENOENT: i64 = -2;
/// JSON-RPC "invalid params"; older SPDK releases answer lookups of unknown
/// names with this code instead of `-ENODEV`.
pub const JSONRPC_INVALID_PARAMS: i64 = -32602;

/// Error reported by a [`BlockBackend`](crate::backend::BlockBackend).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}{}", .code.map(|c| format!(" (code {c})")).unwrap_or_default())]
pub struct BackendError {
    /// Protocol-level error code, `None` for I/O and decode failures.
    pub code: Option<i64>,
    pub message: String,
}

impl BackendError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }

    /// Error without a protocol code: connection, I/O or decode failures.
    pub fn io<E: std::fmt::Display>(e: E) -> Self {
        Self {
            code: None,
            message: e.to_string(),
        }
    }

    /// Whether this error means "the named entity does not exist".
    ///
    /// Heuristic: `-ENODEV`/`-ENOENT` are unambiguous, but
    /// [`JSONRPC_INVALID_PARAMS`] is also accepted because older backends use
    /// it for unknown names.  That code is also returned for genuinely
    /// malformed requests, so only use this on lookups whose sole parameter is
    /// a name.  Errors without a code are never "not found".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.code,
            Some(ENODEV) | Some(ENOENT) | Some(JSONRPC_INVALID_PARAMS)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ControllerError::NotFound("bdev vol-123".into());
        assert_eq!(err.to_string(), "bdev vol-123 not found");

        let err = ControllerError::backend("get_bdevs vol-1", BackendError::new(-19, "No such device"));
        assert_eq!(err.to_string(), "get_bdevs vol-1: No such device (code -19)");
    }

    #[test]
    fn error_serde_roundtrip() {
        let err = ControllerError::AlreadyExists {
            name: "malloc-0".into(),
            actual_size: 4096,
        };
        let json = serde_json::to_string(&err).expect("serialize");
        let de: ControllerError = serde_json::from_str(&json).expect("deserialize");
        assert!(matches!(
            de,
            ControllerError::AlreadyExists { actual_size: 4096, .. }
        ));
    }

    #[test]
    fn not_found_classification() {
        assert!(BackendError::new(ENODEV, "No such device").is_not_found());
        assert!(BackendError::new(JSONRPC_INVALID_PARAMS, "Invalid parameters").is_not_found());
        assert!(!BackendError::new(-17, "File exists").is_not_found());
        assert!(!BackendError::io("connection reset").is_not_found());
        assert_eq!(BackendError::io("boom").to_string(), "boom");
    }
}
