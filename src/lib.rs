//! Zero-knowledge secret vault core.
//!
//! Secrets are sealed client-side under a key derived from a user password
//! (PBKDF2-HMAC-SHA256, AES-256-GCM) and only ever stored as envelopes. The
//! [`SecretLifecycleManager`] handles create/read/rotate/delete on top of an
//! injected [`SecretStore`] and records every call in an [`AccessAuditLog`].

pub mod audit;
pub mod config;
pub mod crypt;
pub mod envelope;
pub mod error;
pub mod kv;
pub mod password;
pub mod secret;
pub mod store;
pub mod vault;

pub use audit::{AccessAuditLog, AccessLogEntry, AuditAction, AuditOutcome, RequestContext, TimeRange};
pub use config::VaultConfig;
pub use error::{CryptoError, VaultError, VaultResult};
pub use kv::KvStore;
pub use password::PasswordHasher;
pub use secret::{ActorId, OwnerId, Secret, SecretId, SecretVersion, VersionSummary};
pub use store::{MemoryStore, SecretStore, StoreError};
pub use vault::SecretLifecycleManager;
