//! Error types for the transit key store.

use snafu::Snafu;

use crate::key_type::KeyKind;

/// Error classes surfaced to callers.
///
/// Every [`TransitError`] maps onto exactly one class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request was malformed or is forbidden by policy.
    InvalidRequest,
    /// Storage, codec or cryptographic library failure.
    Internal,
    /// The caller's cancellation token fired.
    Cancelled,
}

/// Errors from transit key operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransitError {
    /// Generic malformed request.
    #[snafu(display("{reason}"))]
    InvalidRequest {
        /// Description of what is wrong with the request.
        reason: String,
    },

    /// The named key does not exist.
    #[snafu(display("key '{name}' not found"))]
    KeyNotFound {
        /// Key name.
        name: String,
    },

    /// A key with this name already exists.
    #[snafu(display("key '{name}' already exists"))]
    KeyExists {
        /// Key name.
        name: String,
    },

    /// The key type cannot perform the requested operation.
    #[snafu(display("{operation} not supported for key type {key_type}"))]
    Unsupported {
        /// Operation name.
        operation: String,
        /// Key type of the policy.
        key_type: KeyKind,
    },

    /// The ciphertext or signature was produced by a version below the minimum.
    #[snafu(display("ciphertext or signature version is disallowed by policy (too old)"))]
    VersionTooOld,

    /// A version argument is outside the range the policy allows.
    #[snafu(display("invalid key version {version}: {reason}"))]
    InvalidVersion {
        /// Offending version.
        version: u32,
        /// Why it was rejected.
        reason: String,
    },

    /// A ciphertext, signature or MAC token could not be decoded.
    #[snafu(display("invalid token: {reason}"))]
    InvalidToken {
        /// Parse failure detail.
        reason: String,
    },

    /// Private material is not exportable.
    #[snafu(display("key '{name}' is not exportable"))]
    NotExportable {
        /// Key name.
        name: String,
    },

    /// Deletion is disabled for the key.
    #[snafu(display("deletion is not allowed for key '{name}'"))]
    DeletionNotAllowed {
        /// Key name.
        name: String,
    },

    /// Plaintext backup is disabled for the key.
    #[snafu(display("plaintext backup is disallowed on key '{name}'"))]
    BackupNotAllowed {
        /// Key name.
        name: String,
    },

    /// The import wrapping key has not been generated yet.
    #[snafu(display("wrapping key is not set; read the wrapping key before importing"))]
    WrappingKeyMissing,

    /// Decryption failed for caller-supplied symmetric ciphertext.
    #[snafu(display("cipher: message authentication failed"))]
    AuthenticationFailed,

    /// Storage backend failure.
    #[snafu(display("storage error: {reason}"))]
    Storage {
        /// Backend failure detail.
        reason: String,
    },

    /// JSON or encoding failure of persisted state.
    #[snafu(display("serialization error: {reason}"))]
    Serialization {
        /// Codec failure detail.
        reason: String,
    },

    /// A cryptographic primitive failed.
    #[snafu(display("crypto error: {reason}"))]
    Crypto {
        /// Library failure detail.
        reason: String,
    },

    /// The operation was cancelled.
    #[snafu(display("operation cancelled"))]
    Cancelled,

    /// Internal invariant violation.
    #[snafu(display("internal error: {reason}"))]
    Internal {
        /// Invariant detail.
        reason: String,
    },
}

impl TransitError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransitError::Storage { .. }
            | TransitError::Serialization { .. }
            | TransitError::Crypto { .. }
            | TransitError::Internal { .. } => ErrorKind::Internal,
            TransitError::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::InvalidRequest,
        }
    }

    /// True when the caller is at fault.
    pub fn is_user_error(&self) -> bool {
        self.kind() == ErrorKind::InvalidRequest
    }

    /// Shorthand for [`TransitError::InvalidRequest`].
    pub fn invalid(reason: impl Into<String>) -> Self {
        TransitError::InvalidRequest { reason: reason.into() }
    }
}

/// Result type for transit key operations.
pub type Result<T, E = TransitError> = std::result::Result<T, E>;
