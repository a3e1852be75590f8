//! Storage collaborator contract and an in-memory implementation.
//!
//! The lifecycle manager never touches a database directly; it is handed
//! something implementing [`SecretStore`] (and [`AccessAuditLog`]). Stores only
//! ever see envelopes, never plaintext or keys.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use thiserror::Error;
use tracing::debug;

use crate::audit::{AccessAuditLog, AccessLogEntry, TimeRange};
use crate::secret::{ActorId, OwnerId, Secret, SecretId, SecretVersion};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness constraint was hit (active name, version slot).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("secret {0} does not exist")]
    Missing(SecretId),

    /// The caller's copy was read before a delete or restore committed.
    #[error("secret {0} changed state since it was read")]
    Stale(SecretId),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("corrupted record: {0}")]
    Corrupted(String),
}

/// Persistence for secrets and their versions.
pub trait SecretStore: Send + Sync {
    /// Persists a new secret together with its first version, all or nothing.
    ///
    /// Fails with [`StoreError::Conflict`] if the owner already has an active
    /// secret with the same name.
    fn insert_secret(&self, secret: &Secret, first_version: &SecretVersion) -> StoreResult<()>;

    /// Updates metadata (name, type, labels, `updated_at`).
    ///
    /// The version pointer belongs to [`SecretStore::cas_current_version`] and
    /// the active flag to [`SecretStore::set_active`]; both are left as
    /// stored. Fails with [`StoreError::Stale`] if `secret.is_active` no
    /// longer matches the stored flag.
    fn save_secret(&self, secret: &Secret) -> StoreResult<Secret>;

    /// Soft-deletes (`active == false`) or restores a secret and maintains
    /// the name index. Returns `None` if it was already in that state.
    ///
    /// Restoring fails with [`StoreError::Conflict`] if another active secret
    /// holds the name.
    fn set_active(&self, id: &SecretId, active: bool) -> StoreResult<Option<Secret>>;

    fn find_secret(&self, id: &SecretId) -> StoreResult<Option<Secret>>;

    /// Looks up the owner's *active* secret with this name.
    fn find_secret_by_name(&self, owner: &OwnerId, name: &str) -> StoreResult<Option<Secret>>;

    /// All of the owner's secrets, active or not.
    fn list_secrets(&self, owner: &OwnerId) -> StoreResult<Vec<Secret>>;

    fn find_version(&self, id: &SecretId, version: u32) -> StoreResult<Option<SecretVersion>>;

    /// Versions in ascending order.
    fn list_versions(&self, id: &SecretId) -> StoreResult<Vec<SecretVersion>>;

    /// Writes `version` and advances the secret's pointer to it, atomically,
    /// iff the secret is active, its pointer still equals `expected` and the
    /// version slot is free. Returns `false` if any of that does not hold.
    fn cas_current_version(&self, version: &SecretVersion, expected: u32) -> StoreResult<bool>;
}

/// Applies a metadata update to `stored`, keeping the fields metadata updates
/// may not change.
pub(crate) fn merge_metadata(stored: &Secret, update: &Secret) -> StoreResult<Secret> {
    if stored.is_active != update.is_active {
        return Err(StoreError::Stale(stored.id));
    }
    Ok(Secret {
        id: stored.id,
        owner_id: stored.owner_id.clone(),
        current_version: stored.current_version,
        is_active: stored.is_active,
        created_at: stored.created_at,
        deleted_at: stored.deleted_at,
        ..update.clone()
    })
}

#[derive(Default)]
struct Inner {
    secrets: HashMap<SecretId, Secret>,
    /// (owner, name) of active secrets only.
    names: HashMap<(OwnerId, String), SecretId>,
    versions: BTreeMap<(SecretId, u32), SecretVersion>,
    audit: Vec<AccessLogEntry>,
}

/// A process-local store for tests and embedding.
///
/// One lock covers everything, which makes every operation trivially atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StoreResult<std::sync::RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    fn write(&self) -> StoreResult<std::sync::RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }
}

fn name_key(owner: &OwnerId, name: &str) -> (OwnerId, String) {
    (owner.clone(), name.to_string())
}

impl SecretStore for MemoryStore {
    fn insert_secret(&self, secret: &Secret, first_version: &SecretVersion) -> StoreResult<()> {
        let mut inner = self.write()?;
        let key = name_key(&secret.owner_id, &secret.name);
        if inner.names.contains_key(&key) {
            return Err(StoreError::Conflict(format!("name {:?} in use", secret.name)));
        }
        if inner.secrets.contains_key(&secret.id) {
            return Err(StoreError::Conflict(format!("secret {} exists", secret.id)));
        }
        inner.names.insert(key, secret.id);
        inner.secrets.insert(secret.id, secret.clone());
        inner.versions.insert(
            (secret.id, first_version.version_number),
            first_version.clone(),
        );
        debug!(secret_id = %secret.id, "inserted secret");
        Ok(())
    }

    fn save_secret(&self, secret: &Secret) -> StoreResult<Secret> {
        let mut inner = self.write()?;
        let stored = inner
            .secrets
            .get(&secret.id)
            .cloned()
            .ok_or(StoreError::Missing(secret.id))?;
        let merged = merge_metadata(&stored, secret)?;

        if merged.is_active {
            let new_key = name_key(&merged.owner_id, &merged.name);
            if let Some(holder) = inner.names.get(&new_key) {
                if *holder != merged.id {
                    return Err(StoreError::Conflict(format!("name {:?} in use", merged.name)));
                }
            }
            inner.names.remove(&name_key(&stored.owner_id, &stored.name));
            inner.names.insert(new_key, merged.id);
        }
        inner.secrets.insert(merged.id, merged.clone());
        Ok(merged)
    }

    fn set_active(&self, id: &SecretId, active: bool) -> StoreResult<Option<Secret>> {
        let mut inner = self.write()?;
        let mut secret = inner
            .secrets
            .get(id)
            .cloned()
            .ok_or(StoreError::Missing(*id))?;
        if secret.is_active == active {
            return Ok(None);
        }

        let key = name_key(&secret.owner_id, &secret.name);
        if active {
            if inner.names.contains_key(&key) {
                return Err(StoreError::Conflict(format!("name {:?} in use", secret.name)));
            }
            secret.mark_restored();
            inner.names.insert(key, secret.id);
        } else {
            secret.mark_deleted();
            inner.names.remove(&key);
        }
        inner.secrets.insert(secret.id, secret.clone());
        Ok(Some(secret))
    }

    fn find_secret(&self, id: &SecretId) -> StoreResult<Option<Secret>> {
        Ok(self.read()?.secrets.get(id).cloned())
    }

    fn find_secret_by_name(&self, owner: &OwnerId, name: &str) -> StoreResult<Option<Secret>> {
        let inner = self.read()?;
        Ok(inner
            .names
            .get(&name_key(owner, name))
            .and_then(|id| inner.secrets.get(id))
            .cloned())
    }

    fn list_secrets(&self, owner: &OwnerId) -> StoreResult<Vec<Secret>> {
        let inner = self.read()?;
        let mut secrets: Vec<Secret> = inner
            .secrets
            .values()
            .filter(|s| &s.owner_id == owner)
            .cloned()
            .collect();
        secrets.sort_by(|a, b| a.name.cmp(&b.name).then(a.created_at.cmp(&b.created_at)));
        Ok(secrets)
    }

    fn find_version(&self, id: &SecretId, version: u32) -> StoreResult<Option<SecretVersion>> {
        Ok(self.read()?.versions.get(&(*id, version)).cloned())
    }

    fn list_versions(&self, id: &SecretId) -> StoreResult<Vec<SecretVersion>> {
        let inner = self.read()?;
        Ok(inner
            .versions
            .range((*id, 0)..=(*id, u32::MAX))
            .map(|(_, v)| v.clone())
            .collect())
    }

    fn cas_current_version(&self, version: &SecretVersion, expected: u32) -> StoreResult<bool> {
        let mut inner = self.write()?;
        let slot = (version.secret_id, version.version_number);
        if inner.versions.contains_key(&slot) {
            return Ok(false);
        }
        let Some(secret) = inner.secrets.get_mut(&version.secret_id) else {
            return Err(StoreError::Missing(version.secret_id));
        };
        if !secret.is_active || secret.current_version != expected {
            return Ok(false);
        }
        secret.current_version = version.version_number;
        secret.touch();
        inner.versions.insert(slot, version.clone());
        Ok(true)
    }
}

impl AccessAuditLog for MemoryStore {
    fn append(&self, entry: &AccessLogEntry) -> StoreResult<()> {
        self.write()?.audit.push(entry.clone());
        Ok(())
    }

    fn find_by_secret(
        &self,
        secret_id: &SecretId,
        range: &TimeRange,
    ) -> StoreResult<Vec<AccessLogEntry>> {
        let inner = self.read()?;
        Ok(inner
            .audit
            .iter()
            .filter(|e| e.secret_id.as_ref() == Some(secret_id) && range.contains(e.timestamp))
            .cloned()
            .collect())
    }

    fn find_by_actor(
        &self,
        actor_id: &ActorId,
        range: &TimeRange,
    ) -> StoreResult<Vec<AccessLogEntry>> {
        let inner = self.read()?;
        Ok(inner
            .audit
            .iter()
            .filter(|e| &e.actor_id == actor_id && range.contains(e.timestamp))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audit::{AuditAction, AuditOutcome, RequestContext};
    use crate::crypt::{derive, generate_salt};
    use crate::envelope::seal;

    pub(crate) fn version_for(secret: &Secret, number: u32) -> SecretVersion {
        let key = derive(b"pw", generate_salt().as_bytes(), 1).unwrap();
        SecretVersion::new(
            secret.id,
            number,
            seal(b"payload", &key).unwrap(),
            *key.params(),
            ActorId::from("tester"),
        )
    }

    pub(crate) fn new_secret(owner: &str, name: &str) -> Secret {
        Secret::new(name.into(), OwnerId::from(owner), "api-key".into())
    }

    /// Contract checks shared by every [`SecretStore`] implementation.
    pub(crate) fn exercise_store<S: SecretStore + AccessAuditLog>(store: &S) {
        let owner = OwnerId::from("u1");
        let secret = new_secret("u1", "db-pass");
        store.insert_secret(&secret, &version_for(&secret, 1)).unwrap();

        // active name is unique per owner
        let dup = new_secret("u1", "db-pass");
        assert!(matches!(
            store.insert_secret(&dup, &version_for(&dup, 1)),
            Err(StoreError::Conflict(_))
        ));
        // but not across owners
        let other_owner = new_secret("u2", "db-pass");
        store
            .insert_secret(&other_owner, &version_for(&other_owner, 1))
            .unwrap();

        let found = store.find_secret_by_name(&owner, "db-pass").unwrap().unwrap();
        assert_eq!(found.id, secret.id);
        assert_eq!(store.find_secret(&secret.id).unwrap().unwrap(), found);

        // CAS advances exactly once
        let v2 = version_for(&secret, 2);
        assert!(store.cas_current_version(&v2, 1).unwrap());
        assert!(!store.cas_current_version(&v2, 1).unwrap());
        let v3_stale = version_for(&secret, 3);
        assert!(!store.cas_current_version(&v3_stale, 1).unwrap());
        assert_eq!(store.find_secret(&secret.id).unwrap().unwrap().current_version, 2);
        assert!(store.find_version(&secret.id, 3).unwrap().is_none());

        let versions = store.list_versions(&secret.id).unwrap();
        assert_eq!(
            versions.iter().map(|v| v.version_number).collect::<Vec<_>>(),
            vec![1, 2]
        );

        // metadata saves never roll back the pointer
        let mut stale = found.clone();
        stale.secret_type = "database".into();
        let saved = store.save_secret(&stale).unwrap();
        assert_eq!(saved.current_version, 2);
        assert_eq!(saved.secret_type, "database");

        // soft delete frees the name, once
        let deleted = store.set_active(&secret.id, false).unwrap().unwrap();
        assert!(!deleted.is_active);
        assert!(deleted.deleted_at.is_some());
        assert!(store.set_active(&secret.id, false).unwrap().is_none());
        assert!(store.find_secret_by_name(&owner, "db-pass").unwrap().is_none());
        assert!(!store.cas_current_version(&version_for(&secret, 3), 2).unwrap());

        // a copy read before the delete cannot bring it back
        let mut stale_rename = saved.clone();
        stale_rename.name = "db-pass-renamed".into();
        assert!(matches!(
            store.save_secret(&stale_rename),
            Err(StoreError::Stale(_))
        ));
        let current = store.find_secret(&secret.id).unwrap().unwrap();
        assert!(!current.is_active);
        assert_eq!(current.name, "db-pass");
        assert!(store.find_secret_by_name(&owner, "db-pass-renamed").unwrap().is_none());

        let replacement = new_secret("u1", "db-pass");
        store
            .insert_secret(&replacement, &version_for(&replacement, 1))
            .unwrap();

        // restoring the old one now clashes
        assert!(matches!(
            store.set_active(&secret.id, true),
            Err(StoreError::Conflict(_))
        ));

        // rename moves the index entry
        let mut renamed = replacement.clone();
        renamed.name = "db-pass-2".into();
        store.save_secret(&renamed).unwrap();
        assert!(store.find_secret_by_name(&owner, "db-pass").unwrap().is_none());
        assert!(store.find_secret_by_name(&owner, "db-pass-2").unwrap().is_some());
        let restored = store.set_active(&secret.id, true).unwrap().unwrap();
        assert!(restored.is_active);
        assert!(restored.deleted_at.is_none());
        assert!(store.set_active(&secret.id, true).unwrap().is_none());
        assert_eq!(
            store.find_secret_by_name(&owner, "db-pass").unwrap().unwrap().id,
            secret.id
        );

        assert_eq!(store.list_secrets(&owner).unwrap().len(), 2);

        let ghost = new_secret("u1", "ghost");
        assert!(matches!(
            store.save_secret(&ghost),
            Err(StoreError::Missing(_))
        ));
        assert!(matches!(
            store.set_active(&ghost.id, false),
            Err(StoreError::Missing(_))
        ));

        // audit
        let ctx = RequestContext::new("alice");
        let e1 = AccessLogEntry::new(&ctx, AuditAction::Create, AuditOutcome::Success, Some(secret.id));
        let e2 = AccessLogEntry::new(&ctx, AuditAction::Read, AuditOutcome::Failure, None);
        let e3 = AccessLogEntry::new(
            &RequestContext::new("bob"),
            AuditAction::Read,
            AuditOutcome::Success,
            Some(secret.id),
        );
        for e in [&e1, &e2, &e3] {
            store.append(e).unwrap();
        }
        assert_eq!(
            store.find_by_secret(&secret.id, &TimeRange::all()).unwrap(),
            vec![e1.clone(), e3.clone()]
        );
        assert_eq!(
            store.find_by_actor(&ActorId::from("alice"), &TimeRange::all()).unwrap(),
            vec![e1.clone(), e2.clone()]
        );
        let after = TimeRange::since(e3.timestamp + std::time::Duration::from_secs(1));
        assert!(store.find_by_secret(&secret.id, &after).unwrap().is_empty());
    }

    #[test]
    fn test_memory_store_contract() {
        exercise_store(&MemoryStore::new());
    }
}
