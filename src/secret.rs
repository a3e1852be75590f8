use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, time::SystemTime};
use uuid::Uuid;

use crate::crypt::KdfParams;
use crate::envelope::Envelope;
use crate::error::{VaultError, VaultResult};

/// Longest accepted secret name, in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Stable identifier of a [`Secret`], assigned at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretId(Uuid);

impl SecretId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Generate a new random ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for SecretId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! define_principal_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

define_principal_id!(OwnerId, "The user or organization a secret belongs to.");
define_principal_id!(ActorId, "The authenticated caller performing an operation.");

/// A named secret. Holds no key material and no plaintext, only the pointer
/// to the active [`SecretVersion`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub id: SecretId,
    /// Unique among the owner's active secrets.
    pub name: String,
    pub owner_id: OwnerId,
    /// Free-form classification ("api-key", "database", ...). Never affects
    /// encryption.
    pub secret_type: String,
    pub current_version: u32,
    pub is_active: bool,
    /// Opaque caller metadata.
    pub labels: BTreeMap<String, String>,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
    /// Set while soft-deleted.
    pub deleted_at: Option<SystemTime>,
}

impl Secret {
    /// A new active secret pointing at version 1.
    pub fn new(name: String, owner_id: OwnerId, secret_type: String) -> Self {
        let now = SystemTime::now();
        Self {
            id: SecretId::generate(),
            name,
            owner_id,
            secret_type,
            current_version: 1,
            is_active: true,
            labels: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Bumps `updated_at`, never moving it backwards even if the wall clock
    /// does.
    pub fn touch(&mut self) -> SystemTime {
        let now = SystemTime::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
        self.updated_at
    }

    pub fn mark_deleted(&mut self) {
        let now = self.touch();
        self.is_active = false;
        self.deleted_at = Some(now);
    }

    pub fn mark_restored(&mut self) {
        self.touch();
        self.is_active = true;
        self.deleted_at = None;
    }
}

/// One immutable encrypted payload of a secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretVersion {
    pub secret_id: SecretId,
    /// Starts at 1, strictly increasing, never reused.
    pub version_number: u32,
    envelope: Envelope,
    pub kdf: KdfParams,
    pub created_at: SystemTime,
    pub created_by: ActorId,
}

impl SecretVersion {
    pub fn new(
        secret_id: SecretId,
        version_number: u32,
        envelope: Envelope,
        kdf: KdfParams,
        created_by: ActorId,
    ) -> Self {
        Self {
            secret_id,
            version_number,
            envelope,
            kdf,
            created_at: SystemTime::now(),
            created_by,
        }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn summary(&self) -> VersionSummary {
        VersionSummary {
            secret_id: self.secret_id,
            version_number: self.version_number,
            kdf_iterations: self.kdf.iterations,
            created_at: self.created_at,
            created_by: self.created_by.clone(),
        }
    }
}

/// Version metadata safe to hand out without the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSummary {
    pub secret_id: SecretId,
    pub version_number: u32,
    pub kdf_iterations: u32,
    pub created_at: SystemTime,
    pub created_by: ActorId,
}

/// Rejects names that are empty, too long or contain control characters.
pub fn validate_secret_name(name: &str) -> VaultResult<()> {
    if name.is_empty() {
        return Err(VaultError::InvalidInput("secret name must not be empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(VaultError::InvalidInput(format!(
            "secret name exceeds {MAX_NAME_LEN} bytes"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(VaultError::InvalidInput(
            "secret name must not contain control characters".into(),
        ));
    }
    Ok(())
}
