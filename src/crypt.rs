//! Password-based key derivation.
//!
//! Every secret version gets its own random [`Salt`], and the password is
//! stretched with PBKDF2-HMAC-SHA256 into a 256-bit [`DerivedKey`]. The
//! iteration count travels with the version in [`KdfParams`], so raising the
//! default only affects versions written afterwards.

use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use secrecy::SecretSlice;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, CryptoResult};

/// Salt length in bytes.
pub const SALT_SIZE: usize = 16;

/// Derived key length in bytes (AES-256).
pub const KEY_SIZE: usize = 32;

/// PBKDF2 rounds for newly written versions (OWASP guidance for HMAC-SHA256).
pub const DEFAULT_ITERATIONS: u32 = 600_000;

/// A random per-version salt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Salt([u8; SALT_SIZE]);

impl Salt {
    pub fn from_bytes(bytes: [u8; SALT_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parses a salt from an arbitrary slice, rejecting anything that is not
    /// exactly [`SALT_SIZE`] bytes.
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let arr: [u8; SALT_SIZE] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidInput(format!(
                "salt must be {SALT_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; SALT_SIZE] {
        &self.0
    }
}

/// Generates a fresh salt from the thread-local CSPRNG.
///
/// Called once per secret version; salts are never reused across versions.
pub fn generate_salt() -> Salt {
    let mut salt = [0u8; SALT_SIZE];
    rand::rng().fill_bytes(&mut salt);
    Salt(salt)
}

/// Key derivation functions understood by the vault.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KdfAlgorithm {
    #[default]
    Pbkdf2HmacSha256,
}

/// The parameters a version was sealed with.
///
/// The salt is also the first 16 bytes of the envelope; it is recorded here
/// as well so parameters can evolve without reparsing envelopes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: KdfAlgorithm,
    pub iterations: u32,
    pub salt: Salt,
}

impl KdfParams {
    pub fn new(iterations: u32, salt: Salt) -> Self {
        Self {
            algorithm: KdfAlgorithm::default(),
            iterations,
            salt,
        }
    }
}

/// A symmetric key derived from a password.
///
/// The key bytes live in a [`SecretSlice`] and are wiped on drop. The
/// parameters that produced the key stay attached to it so the envelope
/// codec can embed the salt.
pub struct DerivedKey {
    key: SecretSlice<u8>,
    params: KdfParams,
}

impl DerivedKey {
    pub fn key(&self) -> &SecretSlice<u8> {
        &self.key
    }

    pub fn params(&self) -> &KdfParams {
        &self.params
    }

    pub fn salt(&self) -> &Salt {
        &self.params.salt
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKey")
            .field("key", &"[REDACTED]")
            .field("params", &self.params)
            .finish()
    }
}

impl Zeroize for DerivedKey {
    fn zeroize(&mut self) {
        self.key.zeroize();
    }
}

impl ZeroizeOnDrop for DerivedKey {}

impl Drop for DerivedKey {
    fn drop(&mut self) {
        self.zeroize();
    }
}

/// Derives a 32-byte key from `password` and `salt`.
///
/// Deterministic for the same `(password, salt, iterations)`, which is what
/// lets an old version be reopened.
pub fn derive(password: &[u8], salt: &[u8], iterations: u32) -> CryptoResult<DerivedKey> {
    if password.is_empty() {
        return Err(CryptoError::InvalidInput("password must not be empty".into()));
    }
    if iterations == 0 {
        return Err(CryptoError::InvalidInput(
            "iteration count must be positive".into(),
        ));
    }
    let salt = Salt::from_slice(salt)?;

    let mut key = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(password, salt.as_bytes(), iterations, &mut key);

    let derived = DerivedKey {
        key: SecretSlice::new(key.to_vec().into_boxed_slice()),
        params: KdfParams::new(iterations, salt),
    };

    // Wipe the stack copy
    key.zeroize();

    Ok(derived)
}

/// Re-derives the key for previously recorded parameters.
pub fn derive_with(password: &[u8], params: &KdfParams) -> CryptoResult<DerivedKey> {
    match params.algorithm {
        KdfAlgorithm::Pbkdf2HmacSha256 => {
            derive(password, params.salt.as_bytes(), params.iterations)
        }
    }
}
