//! Login password hashing.
//!
//! Argon2id with a random per-call salt, encoded as a PHC string. This is for
//! authenticating humans and shares nothing with the secret envelope path.

use argon2::Argon2;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{
    PasswordHash, PasswordHasher as _, PasswordVerifier as _, SaltString,
};
#[cfg(test)]
use argon2::{Algorithm, Params, Version};
use secrecy::{ExposeSecret, SecretString};
use tracing::warn;

use crate::error::{VaultError, VaultResult};

/// Hashes and verifies login passwords.
#[derive(Clone)]
pub struct PasswordHasher {
    argon2: Argon2<'static>,
}

impl PasswordHasher {
    pub fn new() -> Self {
        Self {
            argon2: argon2_instance(),
        }
    }

    /// Produces a self-describing PHC string (`$argon2id$v=19$...`).
    pub fn hash(&self, password: &SecretString) -> VaultResult<String> {
        let password = password.expose_secret();
        if password.is_empty() {
            return Err(VaultError::InvalidInput("password must not be empty".into()));
        }
        let salt = SaltString::generate(&mut OsRng);
        self.argon2
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| VaultError::InvalidInput(format!("password hashing failed: {e}")))
    }

    /// Checks `password` against a stored hash.
    ///
    /// Parameters are read from the hash itself, so hashes produced with older
    /// cost settings keep verifying. An unparsable hash verifies as `false`.
    pub fn verify(&self, password: &SecretString, hash: &str) -> bool {
        let parsed = match PasswordHash::new(hash) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "stored password hash is not a valid PHC string");
                return false;
            }
        };
        self.argon2
            .verify_password(password.expose_secret().as_bytes(), &parsed)
            .is_ok()
    }
}

impl Default for PasswordHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Production builds use the Argon2id defaults (19 MiB, t=2, p=1); tests use
/// minimal parameters.
fn argon2_instance() -> Argon2<'static> {
    #[cfg(test)]
    {
        let params = Params::new(1024, 1, 1, None).expect("valid Argon2 params for tests");
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
    }

    #[cfg(not(test))]
    {
        Argon2::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    #[test]
    fn test_hash_and_verify() {
        let hasher = PasswordHasher::new();
        let hash = hasher.hash(&secret("correct horse")).unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(hasher.verify(&secret("correct horse"), &hash));
        assert!(!hasher.verify(&secret("battery staple"), &hash));
    }

    #[test]
    fn test_hashes_are_salted() {
        let hasher = PasswordHasher::new();
        let a = hasher.hash(&secret("pw")).unwrap();
        let b = hasher.hash(&secret("pw")).unwrap();
        assert_ne!(a, b);
        assert!(hasher.verify(&secret("pw"), &a));
        assert!(hasher.verify(&secret("pw"), &b));
    }

    #[test]
    fn test_garbage_hash_does_not_verify() {
        let hasher = PasswordHasher::new();
        assert!(!hasher.verify(&secret("pw"), "not-a-hash"));
        assert!(!hasher.verify(&secret("pw"), ""));
    }

    #[test]
    fn test_empty_password_rejected() {
        let hasher = PasswordHasher::new();
        assert!(matches!(
            hasher.hash(&secret("")),
            Err(VaultError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_verifies_hash_from_other_params() {
        let strong = PasswordHasher {
            argon2: Argon2::new(
                Algorithm::Argon2id,
                Version::V0x13,
                Params::new(2048, 2, 1, None).unwrap(),
            ),
        };
        let hash = strong.hash(&secret("pw")).unwrap();
        assert!(PasswordHasher::new().verify(&secret("pw"), &hash));
    }
}
