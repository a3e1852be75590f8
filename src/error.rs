//! Error types for the vault.
//!
//! Errors are layered: [`CryptoError`] comes out of key derivation and the
//! envelope codec, [`StoreError`](crate::store::StoreError) out of the
//! persistence adapters, and [`VaultError`] is the only kind a caller of
//! [`SecretLifecycleManager`](crate::vault::SecretLifecycleManager) ever sees.

use thiserror::Error;

use crate::store::StoreError;

pub type CryptoResult<T> = Result<T, CryptoError>;

pub type VaultResult<T> = Result<T, VaultError>;

/// Failures from [`crate::crypt`] and [`crate::envelope`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The AEAD tag did not verify. Wrong password and tampered ciphertext
    /// both end up here.
    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("malformed envelope ({len} bytes)")]
    MalformedEnvelope { len: usize },

    #[error("plaintext rejected by cipher")]
    Encryption,
}

impl CryptoError {
    /// Short label for audit diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            CryptoError::InvalidInput(_) => "invalid_input",
            CryptoError::AuthenticationFailed => "authentication_failed",
            CryptoError::MalformedEnvelope { .. } => "malformed_envelope",
            CryptoError::Encryption => "encryption",
        }
    }
}

/// Caller-facing errors.
///
/// `AccessDenied` and `StorageUnavailable` deliberately carry nothing, so
/// formatting them can never leak the reason a decryption or a storage call
/// failed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VaultError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("access denied")]
    AccessDenied,

    #[error("secret already exists: {0}")]
    DuplicateName(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("concurrent modification, retry the operation")]
    ConcurrentModification,

    #[error("storage unavailable")]
    StorageUnavailable,
}

impl VaultError {
    /// Stable label recorded in audit entries.
    pub fn kind(&self) -> &'static str {
        match self {
            VaultError::InvalidInput(_) => "invalid_input",
            VaultError::AccessDenied => "access_denied",
            VaultError::DuplicateName(_) => "duplicate_name",
            VaultError::NotFound(_) => "not_found",
            VaultError::ConcurrentModification => "concurrent_modification",
            VaultError::StorageUnavailable => "storage_unavailable",
        }
    }

    /// Whether the caller may simply try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VaultError::ConcurrentModification | VaultError::StorageUnavailable
        )
    }
}

impl From<CryptoError> for VaultError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InvalidInput(msg) => VaultError::InvalidInput(msg),
            CryptoError::Encryption => {
                VaultError::InvalidInput("plaintext cannot be encrypted".into())
            }
            CryptoError::AuthenticationFailed | CryptoError::MalformedEnvelope { .. } => {
                VaultError::AccessDenied
            }
        }
    }
}

impl From<StoreError> for VaultError {
    fn from(_: StoreError) -> Self {
        // Conflicts are mapped per operation by the lifecycle manager before
        // reaching this conversion.
        VaultError::StorageUnavailable
    }
}
