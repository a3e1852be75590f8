//! Module for the on-disk store.
//!
//! This module persists secrets, versions and the audit log in sled. Records
//! are bincode-encoded (serde mode); multi-tree sled transactions give the
//! all-or-nothing commit on create and the compare-and-swap on rotation.

use serde::{Serialize, de::DeserializeOwned};
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionResult, Transactional,
};
use sled::{Db, Tree};
use std::path::Path;
use tracing::{debug, error, instrument};

use crate::audit::{AccessAuditLog, AccessLogEntry, TimeRange};
use crate::config::VaultConfig;
use crate::secret::{ActorId, OwnerId, Secret, SecretId, SecretVersion};
use crate::store::{SecretStore, StoreError, StoreResult, merge_metadata};

// Tree layout. `lp(x)` is x prefixed with its u32 big-endian length, so that
// principal ids of any content cannot run into the field after them.
//
//   secrets          <secret_id>                  -> Secret
//   names            lp(owner) <name>             -> secret_id   (active only)
//   owners           lp(owner) <secret_id>        -> ()
//   versions         <secret_id> <version u32 BE> -> SecretVersion
//   audit            <audit_id>                   -> AccessLogEntry
//   audit_by_secret  <secret_id> <audit_id>       -> ()
//   audit_by_actor   lp(actor) <audit_id>         -> ()

const SECRETS: &str = "secrets";
const NAMES: &str = "names";
const OWNERS: &str = "owners";
const VERSIONS: &str = "versions";
const AUDIT: &str = "audit";
const AUDIT_BY_SECRET: &str = "audit_by_secret";
const AUDIT_BY_ACTOR: &str = "audit_by_actor";

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Corrupted(format!("encode failed: {e}")))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    let (value, _): (T, usize) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Corrupted(format!("decode failed: {e}")))?;
    Ok(value)
}

fn length_prefixed(part: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + part.len());
    key.extend_from_slice(&(part.len() as u32).to_be_bytes());
    key.extend_from_slice(part.as_bytes());
    key
}

fn name_key(owner: &OwnerId, name: &str) -> Vec<u8> {
    let mut key = length_prefixed(owner.as_str());
    key.extend_from_slice(name.as_bytes());
    key
}

fn owner_key(owner: &OwnerId, id: &SecretId) -> Vec<u8> {
    let mut key = length_prefixed(owner.as_str());
    key.extend_from_slice(id.as_bytes());
    key
}

fn version_key(id: &SecretId, version: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(20);
    key.extend_from_slice(id.as_bytes());
    key.extend_from_slice(&version.to_be_bytes());
    key
}

fn abort<T>(err: StoreError) -> ConflictableTransactionResult<T, StoreError> {
    Err(ConflictableTransactionError::Abort(err))
}

fn finish<T>(result: TransactionResult<T, StoreError>) -> StoreResult<T> {
    result.map_err(|e| match e {
        TransactionError::Abort(err) => err,
        TransactionError::Storage(err) => {
            error!("sled transaction failed: {}", err);
            StoreError::Unavailable(err.to_string())
        }
    })
}

/// The persistent store. A thin wrapper around a sled [`Db`] and its trees.
#[derive(Clone)]
pub struct KvStore {
    db: Db,
    secrets: Tree,
    names: Tree,
    owners: Tree,
    versions: Tree,
    audit: Tree,
    audit_by_secret: Tree,
    audit_by_actor: Tree,
}

impl KvStore {
    /// Opens (or creates) a store at `path`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let db = sled::open(path).map_err(|e| {
            error!("Failed to open sled database at {:?}: {}", path, e);
            StoreError::from(e)
        })?;
        Self::from_db(db)
    }

    /// Opens the store under the configured data directory.
    pub fn from_config(config: &VaultConfig) -> StoreResult<Self> {
        let Some(dir) = config.data_dir() else {
            return Err(StoreError::Unavailable("no data directory configured".into()));
        };
        Self::open(dir)
    }

    /// A store that lives in a temporary directory and is removed on drop.
    pub fn temporary() -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> StoreResult<Self> {
        Ok(Self {
            secrets: db.open_tree(SECRETS)?,
            names: db.open_tree(NAMES)?,
            owners: db.open_tree(OWNERS)?,
            versions: db.open_tree(VERSIONS)?,
            audit: db.open_tree(AUDIT)?,
            audit_by_secret: db.open_tree(AUDIT_BY_SECRET)?,
            audit_by_actor: db.open_tree(AUDIT_BY_ACTOR)?,
            db,
        })
    }

    /// Returns a reference to the underlying sled database.
    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Blocks until everything written so far is durable.
    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }

    fn audit_entries<I>(&self, keys: I, range: &TimeRange) -> StoreResult<Vec<AccessLogEntry>>
    where
        I: Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>,
    {
        let mut entries = Vec::new();
        for item in keys {
            let (key, _) = item?;
            // index keys end with the 16-byte audit id
            let audit_id = &key[key.len() - 16..];
            let bytes = self.audit.get(audit_id)?.ok_or_else(|| {
                StoreError::Corrupted("audit index points at missing entry".into())
            })?;
            let entry: AccessLogEntry = decode(&bytes)?;
            if range.contains(entry.timestamp) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

impl SecretStore for KvStore {
    #[instrument(skip_all, fields(secret_id = %secret.id))]
    fn insert_secret(&self, secret: &Secret, first_version: &SecretVersion) -> StoreResult<()> {
        let secret_bytes = encode(secret)?;
        let version_bytes = encode(first_version)?;
        let id = secret.id.as_bytes();
        let names_key = name_key(&secret.owner_id, &secret.name);
        let owners_key = owner_key(&secret.owner_id, &secret.id);
        let versions_key = version_key(&secret.id, first_version.version_number);

        let result = (&self.secrets, &self.names, &self.owners, &self.versions).transaction(
            |(secrets, names, owners, versions)| -> ConflictableTransactionResult<(), StoreError> {
                if names.get(names_key.as_slice())?.is_some() {
                    return abort(StoreError::Conflict(format!(
                        "name {:?} in use",
                        secret.name
                    )));
                }
                if secrets.get(&id[..])?.is_some() {
                    return abort(StoreError::Conflict(format!("secret {} exists", secret.id)));
                }
                secrets.insert(&id[..], secret_bytes.as_slice())?;
                names.insert(names_key.as_slice(), &id[..])?;
                owners.insert(owners_key.as_slice(), Vec::<u8>::new())?;
                versions.insert(versions_key.as_slice(), version_bytes.as_slice())?;
                Ok(())
            },
        );
        finish(result)?;
        debug!("inserted secret");
        Ok(())
    }

    #[instrument(skip_all, fields(secret_id = %secret.id))]
    fn save_secret(&self, secret: &Secret) -> StoreResult<Secret> {
        let id = secret.id.as_bytes();

        let result = (&self.secrets, &self.names).transaction(
            |(secrets, names)| -> ConflictableTransactionResult<Secret, StoreError> {
                let Some(bytes) = secrets.get(&id[..])? else {
                    return abort(StoreError::Missing(secret.id));
                };
                let stored: Secret = decode(&bytes).map_err(ConflictableTransactionError::Abort)?;
                let merged =
                    merge_metadata(&stored, secret).map_err(ConflictableTransactionError::Abort)?;

                if merged.is_active {
                    let new_key = name_key(&merged.owner_id, &merged.name);
                    if let Some(holder) = names.get(new_key.as_slice())? {
                        if holder[..] != id[..] {
                            return abort(StoreError::Conflict(format!(
                                "name {:?} in use",
                                merged.name
                            )));
                        }
                    }
                    names.remove(name_key(&stored.owner_id, &stored.name).as_slice())?;
                    names.insert(new_key.as_slice(), &id[..])?;
                }
                let merged_bytes = encode(&merged).map_err(ConflictableTransactionError::Abort)?;
                secrets.insert(&id[..], merged_bytes)?;
                Ok(merged)
            },
        );
        finish(result)
    }

    #[instrument(skip_all, fields(secret_id = %id, active = active))]
    fn set_active(&self, id: &SecretId, active: bool) -> StoreResult<Option<Secret>> {
        let key = id.as_bytes();

        let result = (&self.secrets, &self.names).transaction(
            |(secrets, names)| -> ConflictableTransactionResult<Option<Secret>, StoreError> {
                let Some(bytes) = secrets.get(&key[..])? else {
                    return abort(StoreError::Missing(*id));
                };
                let mut secret: Secret =
                    decode(&bytes).map_err(ConflictableTransactionError::Abort)?;
                if secret.is_active == active {
                    return Ok(None);
                }

                let index_key = name_key(&secret.owner_id, &secret.name);
                if active {
                    if names.get(index_key.as_slice())?.is_some() {
                        return abort(StoreError::Conflict(format!(
                            "name {:?} in use",
                            secret.name
                        )));
                    }
                    secret.mark_restored();
                    names.insert(index_key.as_slice(), &key[..])?;
                } else {
                    secret.mark_deleted();
                    names.remove(index_key.as_slice())?;
                }
                let secret_bytes = encode(&secret).map_err(ConflictableTransactionError::Abort)?;
                secrets.insert(&key[..], secret_bytes)?;
                Ok(Some(secret))
            },
        );
        let changed = finish(result)?;
        debug!(changed = changed.is_some(), "set active flag");
        Ok(changed)
    }

    fn find_secret(&self, id: &SecretId) -> StoreResult<Option<Secret>> {
        match self.secrets.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn find_secret_by_name(&self, owner: &OwnerId, name: &str) -> StoreResult<Option<Secret>> {
        let Some(id) = self.names.get(name_key(owner, name))? else {
            return Ok(None);
        };
        match self.secrets.get(&id)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Err(StoreError::Corrupted(format!(
                "name index for {name:?} points at a missing secret"
            ))),
        }
    }

    fn list_secrets(&self, owner: &OwnerId) -> StoreResult<Vec<Secret>> {
        let prefix = length_prefixed(owner.as_str());
        let mut secrets = Vec::new();
        for item in self.owners.scan_prefix(&prefix) {
            let (key, _) = item?;
            let id = &key[prefix.len()..];
            if let Some(bytes) = self.secrets.get(id)? {
                secrets.push(decode::<Secret>(&bytes)?);
            }
        }
        secrets.sort_by(|a, b| a.name.cmp(&b.name).then(a.created_at.cmp(&b.created_at)));
        Ok(secrets)
    }

    fn find_version(&self, id: &SecretId, version: u32) -> StoreResult<Option<SecretVersion>> {
        match self.versions.get(version_key(id, version))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn list_versions(&self, id: &SecretId) -> StoreResult<Vec<SecretVersion>> {
        self.versions
            .scan_prefix(id.as_bytes())
            .map(|item| {
                let (_, bytes) = item?;
                decode(&bytes)
            })
            .collect()
    }

    #[instrument(skip_all, fields(secret_id = %version.secret_id, version = version.version_number))]
    fn cas_current_version(&self, version: &SecretVersion, expected: u32) -> StoreResult<bool> {
        let id = version.secret_id.as_bytes();
        let slot = version_key(&version.secret_id, version.version_number);
        let version_bytes = encode(version)?;

        let result = (&self.secrets, &self.versions).transaction(
            |(secrets, versions)| -> ConflictableTransactionResult<bool, StoreError> {
                if versions.get(slot.as_slice())?.is_some() {
                    return Ok(false);
                }
                let Some(bytes) = secrets.get(&id[..])? else {
                    return abort(StoreError::Missing(version.secret_id));
                };
                let mut secret: Secret =
                    decode(&bytes).map_err(ConflictableTransactionError::Abort)?;
                if !secret.is_active || secret.current_version != expected {
                    return Ok(false);
                }
                secret.current_version = version.version_number;
                secret.touch();
                let secret_bytes = encode(&secret).map_err(ConflictableTransactionError::Abort)?;
                versions.insert(slot.as_slice(), version_bytes.as_slice())?;
                secrets.insert(&id[..], secret_bytes)?;
                Ok(true)
            },
        );
        let swapped = finish(result)?;
        debug!(swapped, "compare-and-swap on current version");
        Ok(swapped)
    }
}

impl AccessAuditLog for KvStore {
    fn append(&self, entry: &AccessLogEntry) -> StoreResult<()> {
        let bytes = encode(entry)?;
        let audit_id = entry.id.as_bytes();
        let secret_key = entry.secret_id.map(|id| {
            let mut key = id.as_bytes().to_vec();
            key.extend_from_slice(audit_id);
            key
        });
        let mut actor_key = length_prefixed(entry.actor_id.as_str());
        actor_key.extend_from_slice(audit_id);

        let result = (&self.audit, &self.audit_by_secret, &self.audit_by_actor).transaction(
            |(audit, by_secret, by_actor)| -> ConflictableTransactionResult<(), StoreError> {
                audit.insert(&audit_id[..], bytes.as_slice())?;
                if let Some(key) = &secret_key {
                    by_secret.insert(key.as_slice(), Vec::<u8>::new())?;
                }
                by_actor.insert(actor_key.as_slice(), Vec::<u8>::new())?;
                Ok(())
            },
        );
        finish(result)
    }

    fn find_by_secret(
        &self,
        secret_id: &SecretId,
        range: &TimeRange,
    ) -> StoreResult<Vec<AccessLogEntry>> {
        self.audit_entries(self.audit_by_secret.scan_prefix(secret_id.as_bytes()), range)
    }

    fn find_by_actor(
        &self,
        actor_id: &ActorId,
        range: &TimeRange,
    ) -> StoreResult<Vec<AccessLogEntry>> {
        let prefix = length_prefixed(actor_id.as_str());
        self.audit_entries(self.audit_by_actor.scan_prefix(prefix), range)
    }
}
