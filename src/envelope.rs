//! Authenticated encryption of secret payloads.
//!
//! An envelope is self-describing:
//!
//! ```text
//! [0..16)   salt
//! [16..28)  nonce
//! [28..N)   AES-256-GCM ciphertext || 16-byte tag
//! ```
//!
//! Opening one needs only the envelope, the password and the iteration count
//! the version was written with.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretSlice};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::trace;

use crate::crypt::{self, DerivedKey, SALT_SIZE, Salt};
use crate::error::{CryptoError, CryptoResult};

/// AES-GCM nonce length in bytes (96-bit).
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag length in bytes.
pub const TAG_SIZE: usize = 16;

/// Salt plus nonce. Anything shorter cannot be an envelope.
pub const HEADER_SIZE: usize = SALT_SIZE + NONCE_SIZE;

/// Sealed bytes of one secret version.
///
/// Always at least [`HEADER_SIZE`] bytes long, whether built by [`seal`],
/// [`Envelope::from_bytes`] or deserialization.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct Envelope(Vec<u8>);

impl Envelope {
    /// Wraps raw bytes read back from storage.
    pub fn from_bytes(bytes: Vec<u8>) -> CryptoResult<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(CryptoError::MalformedEnvelope { len: bytes.len() });
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The first 16 bytes. Like [`Envelope::nonce`] and
    /// [`Envelope::ciphertext`], this cannot panic since every `Envelope`
    /// holds at least a full header.
    pub fn salt(&self) -> Salt {
        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&self.0[..SALT_SIZE]);
        Salt::from_bytes(salt)
    }

    pub fn nonce(&self) -> &[u8] {
        &self.0[SALT_SIZE..HEADER_SIZE]
    }

    /// Ciphertext with the trailing tag.
    pub fn ciphertext(&self) -> &[u8] {
        &self.0[HEADER_SIZE..]
    }
}

impl TryFrom<Vec<u8>> for Envelope {
    type Error = CryptoError;

    fn try_from(bytes: Vec<u8>) -> CryptoResult<Self> {
        Self::from_bytes(bytes)
    }
}

impl From<Envelope> for Vec<u8> {
    fn from(envelope: Envelope) -> Self {
        envelope.0
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Envelope({} bytes)", self.0.len())
    }
}

fn cipher_for(key: &DerivedKey) -> CryptoResult<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key.key().expose_secret())
        .map_err(|_| CryptoError::InvalidInput("key must be 32 bytes".into()))
}

/// Encrypts `plaintext` under `key`.
///
/// A fresh random nonce is drawn on every call; the key's salt is written in
/// front of it.
pub fn seal(plaintext: &[u8], key: &DerivedKey) -> CryptoResult<Envelope> {
    let cipher = cipher_for(key)?;

    let mut nonce = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Encryption)?;

    let mut out = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
    out.extend_from_slice(key.salt().as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);

    trace!(len = out.len(), "sealed envelope");
    Ok(Envelope(out))
}

/// Decrypts an envelope with an already derived key.
///
/// The key must have been derived from the envelope's salt.
pub fn open_with_key(envelope: &Envelope, key: &DerivedKey) -> CryptoResult<SecretSlice<u8>> {
    let cipher = cipher_for(key)?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(envelope.nonce()), envelope.ciphertext())
        .map_err(|_| CryptoError::AuthenticationFailed)?;
    Ok(SecretSlice::new(plaintext.into_boxed_slice()))
}

/// Re-derives the key from the embedded salt and decrypts.
///
/// A wrong password and a tampered envelope both yield
/// [`CryptoError::AuthenticationFailed`].
pub fn open(envelope: &[u8], password: &[u8], iterations: u32) -> CryptoResult<SecretSlice<u8>> {
    if envelope.len() < HEADER_SIZE {
        return Err(CryptoError::MalformedEnvelope {
            len: envelope.len(),
        });
    }
    let envelope = Envelope(envelope.to_vec());
    let key = crypt::derive(password, envelope.salt().as_bytes(), iterations)?;
    open_with_key(&envelope, &key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt::{derive, generate_salt};
    use proptest::prelude::*;

    const ITERS: u32 = 1_000;

    fn key_for(password: &[u8]) -> DerivedKey {
        derive(password, generate_salt().as_bytes(), ITERS).unwrap()
    }

    #[test]
    fn test_layout() {
        let key = key_for(b"hunter2");
        let envelope = seal(b"s3cr3t", &key).unwrap();

        assert_eq!(envelope.len(), HEADER_SIZE + 6 + TAG_SIZE);
        assert_eq!(&envelope.as_bytes()[..SALT_SIZE], key.salt().as_bytes());
        assert_eq!(envelope.salt(), *key.salt());
        assert_eq!(envelope.nonce().len(), NONCE_SIZE);
    }

    #[test]
    fn test_roundtrip() {
        let key = key_for(b"hunter2");
        let envelope = seal(b"s3cr3t", &key).unwrap();
        let plaintext = open(envelope.as_bytes(), b"hunter2", ITERS).unwrap();
        assert_eq!(plaintext.expose_secret(), b"s3cr3t");
    }

    #[test]
    fn test_empty_plaintext() {
        let key = key_for(b"pw");
        let envelope = seal(b"", &key).unwrap();
        assert_eq!(envelope.len(), HEADER_SIZE + TAG_SIZE);
        let plaintext = open(envelope.as_bytes(), b"pw", ITERS).unwrap();
        assert!(plaintext.expose_secret().is_empty());
    }

    #[test]
    fn test_wrong_password() {
        let key = key_for(b"hunter2");
        let envelope = seal(b"s3cr3t", &key).unwrap();
        let err = open(envelope.as_bytes(), b"hunter3", ITERS).unwrap_err();
        assert_eq!(err, CryptoError::AuthenticationFailed);
    }

    #[test]
    fn test_wrong_iterations() {
        let key = key_for(b"hunter2");
        let envelope = seal(b"s3cr3t", &key).unwrap();
        let err = open(envelope.as_bytes(), b"hunter2", ITERS + 1).unwrap_err();
        assert_eq!(err, CryptoError::AuthenticationFailed);
    }

    #[test]
    fn test_every_bit_flip_in_body_is_detected() {
        let key = key_for(b"pw");
        let envelope = seal(b"tamper me", &key).unwrap();
        let bytes = envelope.as_bytes();

        for idx in HEADER_SIZE..bytes.len() {
            for bit in [0u8, 3, 7] {
                let mut tampered = bytes.to_vec();
                tampered[idx] ^= 1 << bit;
                let err = open(&tampered, b"pw", ITERS).unwrap_err();
                assert_eq!(err, CryptoError::AuthenticationFailed, "byte {idx} bit {bit}");
            }
        }
    }

    #[test]
    fn test_header_tampering_is_detected() {
        let key = key_for(b"pw");
        let envelope = seal(b"tamper me", &key).unwrap();

        // salt byte: wrong key derived
        let mut tampered = envelope.as_bytes().to_vec();
        tampered[0] ^= 0x01;
        assert!(open(&tampered, b"pw", ITERS).is_err());

        // nonce byte
        let mut tampered = envelope.as_bytes().to_vec();
        tampered[SALT_SIZE] ^= 0x80;
        assert_eq!(
            open(&tampered, b"pw", ITERS).unwrap_err(),
            CryptoError::AuthenticationFailed
        );
    }

    #[test]
    fn test_short_envelope_is_malformed() {
        for len in [0usize, 1, SALT_SIZE, HEADER_SIZE - 1] {
            let err = open(&vec![0u8; len], b"pw", ITERS).unwrap_err();
            assert_eq!(err, CryptoError::MalformedEnvelope { len });
            assert!(Envelope::from_bytes(vec![0u8; len]).is_err());
        }
    }

    #[test]
    fn test_header_only_envelope_fails_authentication() {
        let err = open(&[0u8; HEADER_SIZE], b"pw", ITERS).unwrap_err();
        assert_eq!(err, CryptoError::AuthenticationFailed);
    }

    #[test]
    fn test_nonce_is_fresh_per_seal() {
        let key = key_for(b"pw");
        let a = seal(b"same", &key).unwrap();
        let b = seal(b"same", &key).unwrap();
        assert_ne!(a.nonce(), b.nonce());
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_debug_hides_bytes() {
        let key = key_for(b"pw");
        let envelope = seal(b"abc", &key).unwrap();
        assert_eq!(format!("{envelope:?}"), format!("Envelope({} bytes)", envelope.len()));
    }

    #[test]
    fn test_deserialize_enforces_header() {
        let config = bincode::config::standard();

        let short = bincode::serde::encode_to_vec(vec![0u8; 20], config).unwrap();
        let decoded: Result<(Envelope, usize), _> =
            bincode::serde::decode_from_slice(&short, config);
        assert!(decoded.is_err());

        let key = key_for(b"pw");
        let envelope = seal(b"abc", &key).unwrap();
        let bytes = bincode::serde::encode_to_vec(&envelope, config).unwrap();
        let (back, _): (Envelope, usize) =
            bincode::serde::decode_from_slice(&bytes, config).unwrap();
        assert_eq!(back, envelope);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn roundtrip_any_plaintext(
            plaintext in proptest::collection::vec(any::<u8>(), 0..512),
            password in proptest::collection::vec(any::<u8>(), 1..32),
        ) {
            let key = derive(&password, generate_salt().as_bytes(), 1).unwrap();
            let envelope = seal(&plaintext, &key).unwrap();
            prop_assert_eq!(envelope.len(), HEADER_SIZE + plaintext.len() + TAG_SIZE);
            let opened = open(envelope.as_bytes(), &password, 1).unwrap();
            prop_assert_eq!(opened.expose_secret(), &plaintext[..]);
        }

        #[test]
        fn other_password_never_opens(
            plaintext in proptest::collection::vec(any::<u8>(), 0..64),
            pw1 in proptest::collection::vec(any::<u8>(), 1..16),
            pw2 in proptest::collection::vec(any::<u8>(), 1..16),
        ) {
            prop_assume!(pw1 != pw2);
            let key = derive(&pw1, generate_salt().as_bytes(), 1).unwrap();
            let envelope = seal(&plaintext, &key).unwrap();
            prop_assert_eq!(
                open(envelope.as_bytes(), &pw2, 1).unwrap_err(),
                CryptoError::AuthenticationFailed
            );
        }
    }
}
