//! Secret lifecycle.
//!
//! [`SecretLifecycleManager`] ties key derivation, the envelope codec, the
//! store and the audit log together. Per secret:
//!
//! ```text
//! NONEXISTENT --create--> ACTIVE --rotate--> ACTIVE
//!                         ACTIVE --delete--> SOFT_DELETED --restore--> ACTIVE
//! ```
//!
//! Every public operation writes exactly one audit entry, whatever its
//! outcome. Writing that entry happens after the result is known and can never
//! change it; a failed append is reported on the `zkvault::audit` tracing
//! target instead.

use secrecy::{ExposeSecret, SecretSlice, SecretString};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::audit::{
    AccessAuditLog, AccessLogEntry, AuditAction, AuditOutcome, RequestContext, TimeRange,
};
use crate::config::VaultConfig;
use crate::crypt;
use crate::envelope::{self, HEADER_SIZE};
use crate::error::{CryptoError, VaultError, VaultResult};
use crate::secret::{
    ActorId, OwnerId, Secret, SecretId, SecretVersion, VersionSummary, validate_secret_name,
};
use crate::store::{SecretStore, StoreError};

/// What ends up in the audit entry besides the outcome. Operations fill it in
/// as they learn more.
struct AuditScope {
    action: AuditAction,
    secret_id: Option<SecretId>,
    detail: Option<String>,
}

impl AuditScope {
    fn new(action: AuditAction) -> Self {
        Self {
            action,
            secret_id: None,
            detail: None,
        }
    }

    fn resolved(&mut self, secret: &Secret) {
        self.secret_id = Some(secret.id);
    }

    /// Marks a read whose envelope did not open. The specific cause is kept
    /// for operators only.
    fn verify_failed(&mut self, cause: &str) {
        self.action = AuditAction::VerifyFailed;
        self.detail = Some(cause.to_string());
    }
}

/// Orchestrates create/read/rotate/delete over an injected store.
///
/// Authorization is the caller's job: every call is assumed to be allowed.
/// The manager keeps no state besides its collaborators and config, so it can
/// be shared across threads freely.
pub struct SecretLifecycleManager<S: SecretStore, A: AccessAuditLog> {
    store: Arc<S>,
    audit: Arc<A>,
    config: VaultConfig,
}

impl<S: SecretStore, A: AccessAuditLog> SecretLifecycleManager<S, A> {
    pub fn new(store: Arc<S>, audit: Arc<A>, config: VaultConfig) -> Self {
        Self {
            store,
            audit,
            config,
        }
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    /// Runs `op` and records its outcome.
    fn audited<T>(
        &self,
        ctx: &RequestContext,
        action: AuditAction,
        op: impl FnOnce(&mut AuditScope) -> VaultResult<T>,
    ) -> VaultResult<T> {
        let mut scope = AuditScope::new(action);
        let result = op(&mut scope);

        let (outcome, detail) = match &result {
            Ok(_) => (AuditOutcome::Success, scope.detail),
            Err(err) => {
                let detail = match scope.detail {
                    Some(d) => format!("{}: {}", err.kind(), d),
                    None => err.kind().to_string(),
                };
                (AuditOutcome::Failure, Some(detail))
            }
        };
        let mut entry = AccessLogEntry::new(ctx, scope.action, outcome, scope.secret_id);
        entry.detail = detail;
        self.record(&entry);

        result
    }

    fn record(&self, entry: &AccessLogEntry) {
        if let Err(err) = self.audit.append(entry) {
            error!(
                target: "zkvault::audit",
                audit_id = %entry.id,
                action = %entry.action,
                outcome = %entry.outcome,
                actor = %entry.actor_id,
                error = %err,
                "failed to append audit entry"
            );
        }
    }

    fn resolve_active(&self, owner: &OwnerId, name: &str) -> VaultResult<Secret> {
        self.store
            .find_secret_by_name(owner, name)
            .map_err(storage_failure)?
            .ok_or_else(|| VaultError::NotFound(name.to_string()))
    }

    fn check_plaintext(&self, plaintext: &[u8]) -> VaultResult<()> {
        if plaintext.len() > self.config.max_secret_size() {
            return Err(VaultError::InvalidInput(format!(
                "secret exceeds {} bytes",
                self.config.max_secret_size()
            )));
        }
        Ok(())
    }

    /// Derives a key under a fresh salt and seals `plaintext` as version
    /// `number` of `secret_id`.
    fn seal_version(
        &self,
        secret_id: SecretId,
        number: u32,
        plaintext: &[u8],
        password: &SecretString,
        created_by: &ActorId,
    ) -> VaultResult<SecretVersion> {
        let salt = crypt::generate_salt();
        let key = crypt::derive(
            password.expose_secret().as_bytes(),
            salt.as_bytes(),
            self.config.kdf_iterations(),
        )?;
        let sealed = envelope::seal(plaintext, &key)?;
        Ok(SecretVersion::new(
            secret_id,
            number,
            sealed,
            *key.params(),
            created_by.clone(),
        ))
    }

    fn open_version(
        &self,
        scope: &mut AuditScope,
        version: &SecretVersion,
        password: &SecretString,
    ) -> VaultResult<SecretSlice<u8>> {
        let sealed = version.envelope();
        if sealed.len() < HEADER_SIZE || sealed.salt() != version.kdf.salt {
            let err = CryptoError::MalformedEnvelope { len: sealed.len() };
            scope.verify_failed(err.kind());
            return Err(err.into());
        }
        crypt::derive_with(password.expose_secret().as_bytes(), &version.kdf)
            .and_then(|key| envelope::open_with_key(sealed, &key))
            .map_err(|err| {
                scope.verify_failed(err.kind());
                VaultError::from(err)
            })
    }

    /// Fetches a version for decryption. A record that no longer decodes is
    /// a damaged envelope as far as the caller is concerned.
    fn load_version(
        &self,
        scope: &mut AuditScope,
        id: &SecretId,
        number: u32,
    ) -> VaultResult<Option<SecretVersion>> {
        match self.store.find_version(id, number) {
            Ok(version) => Ok(version),
            Err(StoreError::Corrupted(reason)) => {
                warn!(secret_id = %id, version = number, %reason, "stored version is unreadable");
                scope.verify_failed("malformed_envelope");
                Err(VaultError::AccessDenied)
            }
            Err(other) => Err(storage_failure(other)),
        }
    }

    /// Creates a secret whose first version holds `plaintext`.
    #[instrument(skip_all, fields(actor = %ctx.actor_id, owner = %owner, name = %name))]
    pub fn create(
        &self,
        ctx: &RequestContext,
        owner: &OwnerId,
        name: &str,
        plaintext: &[u8],
        password: &SecretString,
        secret_type: &str,
    ) -> VaultResult<Secret> {
        self.audited(ctx, AuditAction::Create, |scope| {
            validate_secret_name(name)?;
            require_password(password)?;
            self.check_plaintext(plaintext)?;

            if self
                .store
                .find_secret_by_name(owner, name)
                .map_err(storage_failure)?
                .is_some()
            {
                return Err(VaultError::DuplicateName(name.to_string()));
            }

            let secret = Secret::new(name.to_string(), owner.clone(), secret_type.to_string());
            let first = self.seal_version(secret.id, 1, plaintext, password, &ctx.actor_id)?;

            self.store
                .insert_secret(&secret, &first)
                .map_err(|err| match err {
                    StoreError::Conflict(_) => VaultError::DuplicateName(name.to_string()),
                    other => storage_failure(other),
                })?;
            scope.resolved(&secret);

            info!(secret_id = %secret.id, "created secret");
            Ok(secret)
        })
    }

    /// Decrypts the current version.
    ///
    /// A wrong password and a damaged envelope both return
    /// [`VaultError::AccessDenied`].
    #[instrument(skip_all, fields(actor = %ctx.actor_id, owner = %owner, name = %name))]
    pub fn read(
        &self,
        ctx: &RequestContext,
        owner: &OwnerId,
        name: &str,
        password: &SecretString,
    ) -> VaultResult<SecretSlice<u8>> {
        self.audited(ctx, AuditAction::Read, |scope| {
            require_password(password)?;
            let secret = self.resolve_active(owner, name)?;
            scope.resolved(&secret);

            let version = self
                .load_version(scope, &secret.id, secret.current_version)?
                .ok_or_else(|| {
                    error!(
                        secret_id = %secret.id,
                        version = secret.current_version,
                        "current version is missing from the store"
                    );
                    VaultError::StorageUnavailable
                })?;

            let plaintext = self.open_version(scope, &version, password)?;
            debug!(secret_id = %secret.id, version = version.version_number, "read secret");
            Ok(plaintext)
        })
    }

    /// Decrypts an explicit historical version.
    #[instrument(skip_all, fields(actor = %ctx.actor_id, owner = %owner, name = %name, version = version))]
    pub fn read_version(
        &self,
        ctx: &RequestContext,
        owner: &OwnerId,
        name: &str,
        version: u32,
        password: &SecretString,
    ) -> VaultResult<SecretSlice<u8>> {
        self.audited(ctx, AuditAction::Read, |scope| {
            scope.detail = Some(format!("version={version}"));
            require_password(password)?;
            let secret = self.resolve_active(owner, name)?;
            scope.resolved(&secret);

            let stored = self
                .load_version(scope, &secret.id, version)?
                .ok_or_else(|| VaultError::NotFound(format!("{name} version {version}")))?;

            self.open_version(scope, &stored, password)
        })
    }

    /// Seals `new_plaintext` as the next version and makes it current.
    ///
    /// Salt and nonce are always fresh, even when the password is unchanged.
    /// If another rotation got there first this fails with
    /// [`VaultError::ConcurrentModification`] and nothing is written; retrying
    /// is up to the caller.
    #[instrument(skip_all, fields(actor = %ctx.actor_id, owner = %owner, name = %name))]
    pub fn rotate(
        &self,
        ctx: &RequestContext,
        owner: &OwnerId,
        name: &str,
        new_plaintext: &[u8],
        password: &SecretString,
    ) -> VaultResult<SecretVersion> {
        self.audited(ctx, AuditAction::Rotate, |scope| {
            require_password(password)?;
            self.check_plaintext(new_plaintext)?;
            let secret = self.resolve_active(owner, name)?;
            scope.resolved(&secret);

            let expected = secret.current_version;
            let next = expected.checked_add(1).ok_or_else(|| {
                VaultError::InvalidInput("version number space exhausted".into())
            })?;
            let version =
                self.seal_version(secret.id, next, new_plaintext, password, &ctx.actor_id)?;

            let swapped = self
                .store
                .cas_current_version(&version, expected)
                .map_err(|err| match err {
                    StoreError::Missing(_) => VaultError::NotFound(name.to_string()),
                    other => storage_failure(other),
                })?;
            if !swapped {
                warn!(secret_id = %secret.id, expected, "lost rotation race");
                return Err(VaultError::ConcurrentModification);
            }

            scope.detail = Some(format!("version={next}"));
            info!(secret_id = %secret.id, version = next, "rotated secret");
            Ok(version)
        })
    }

    /// Soft-deletes the active secret. Versions are kept.
    #[instrument(skip_all, fields(actor = %ctx.actor_id, owner = %owner, name = %name))]
    pub fn delete(&self, ctx: &RequestContext, owner: &OwnerId, name: &str) -> VaultResult<()> {
        self.audited(ctx, AuditAction::Delete, |scope| {
            let secret = self.resolve_active(owner, name)?;
            scope.resolved(&secret);

            // None: a concurrent delete got there first
            self.store
                .set_active(&secret.id, false)
                .map_err(|err| match err {
                    StoreError::Missing(_) => VaultError::NotFound(name.to_string()),
                    other => storage_failure(other),
                })?
                .ok_or_else(|| VaultError::NotFound(name.to_string()))?;

            info!(secret_id = %secret.id, "deleted secret");
            Ok(())
        })
    }

    /// Reactivates the most recently deleted secret called `name`.
    #[instrument(skip_all, fields(actor = %ctx.actor_id, owner = %owner, name = %name))]
    pub fn restore(&self, ctx: &RequestContext, owner: &OwnerId, name: &str) -> VaultResult<Secret> {
        self.audited(ctx, AuditAction::Restore, |scope| {
            let secret = self
                .store
                .list_secrets(owner)
                .map_err(storage_failure)?
                .into_iter()
                .filter(|s| !s.is_active && s.name == name)
                .max_by_key(|s| s.deleted_at)
                .ok_or_else(|| VaultError::NotFound(name.to_string()))?;
            scope.resolved(&secret);

            let saved = self
                .store
                .set_active(&secret.id, true)
                .map_err(|err| match err {
                    StoreError::Conflict(_) => VaultError::DuplicateName(name.to_string()),
                    StoreError::Missing(_) => VaultError::NotFound(name.to_string()),
                    other => storage_failure(other),
                })?
                .ok_or_else(|| VaultError::NotFound(name.to_string()))?;

            info!(secret_id = %saved.id, "restored secret");
            Ok(saved)
        })
    }

    /// Renames an active secret. The id and all versions stay as they are.
    #[instrument(skip_all, fields(actor = %ctx.actor_id, owner = %owner, name = %name, new_name = %new_name))]
    pub fn rename(
        &self,
        ctx: &RequestContext,
        owner: &OwnerId,
        name: &str,
        new_name: &str,
    ) -> VaultResult<Secret> {
        self.audited(ctx, AuditAction::Rename, |scope| {
            validate_secret_name(new_name)?;
            let mut secret = self.resolve_active(owner, name)?;
            scope.resolved(&secret);
            scope.detail = Some(format!("to={new_name}"));

            secret.name = new_name.to_string();
            secret.touch();
            self.store.save_secret(&secret).map_err(|err| match err {
                StoreError::Conflict(_) => VaultError::DuplicateName(new_name.to_string()),
                StoreError::Missing(_) => VaultError::NotFound(name.to_string()),
                StoreError::Stale(_) => VaultError::ConcurrentModification,
                other => storage_failure(other),
            })
        })
    }

    /// Replaces the type tag and/or the labels. Versions are untouched.
    #[instrument(skip_all, fields(actor = %ctx.actor_id, owner = %owner, name = %name))]
    pub fn update_metadata(
        &self,
        ctx: &RequestContext,
        owner: &OwnerId,
        name: &str,
        secret_type: Option<&str>,
        labels: Option<BTreeMap<String, String>>,
    ) -> VaultResult<Secret> {
        self.audited(ctx, AuditAction::UpdateMetadata, |scope| {
            let mut secret = self.resolve_active(owner, name)?;
            scope.resolved(&secret);

            if let Some(secret_type) = secret_type {
                secret.secret_type = secret_type.to_string();
            }
            if let Some(labels) = labels {
                secret.labels = labels;
            }
            secret.touch();
            self.store.save_secret(&secret).map_err(|err| match err {
                StoreError::Missing(_) => VaultError::NotFound(name.to_string()),
                StoreError::Stale(_) => VaultError::ConcurrentModification,
                other => storage_failure(other),
            })
        })
    }

    /// The owner's active secrets.
    #[instrument(skip_all, fields(actor = %ctx.actor_id, owner = %owner))]
    pub fn list_secrets(&self, ctx: &RequestContext, owner: &OwnerId) -> VaultResult<Vec<Secret>> {
        self.audited(ctx, AuditAction::List, |scope| {
            let secrets: Vec<Secret> = self
                .store
                .list_secrets(owner)
                .map_err(storage_failure)?
                .into_iter()
                .filter(|s| s.is_active)
                .collect();
            scope.detail = Some(format!("count={}", secrets.len()));
            Ok(secrets)
        })
    }

    /// Version history of an active secret, without envelopes.
    #[instrument(skip_all, fields(actor = %ctx.actor_id, owner = %owner, name = %name))]
    pub fn list_versions(
        &self,
        ctx: &RequestContext,
        owner: &OwnerId,
        name: &str,
    ) -> VaultResult<Vec<VersionSummary>> {
        self.audited(ctx, AuditAction::ListVersions, |scope| {
            let secret = self.resolve_active(owner, name)?;
            scope.resolved(&secret);
            Ok(self
                .store
                .list_versions(&secret.id)
                .map_err(storage_failure)?
                .iter()
                .map(SecretVersion::summary)
                .collect())
        })
    }

    pub fn audit_for_secret(
        &self,
        secret_id: &SecretId,
        range: &TimeRange,
    ) -> VaultResult<Vec<AccessLogEntry>> {
        self.audit
            .find_by_secret(secret_id, range)
            .map_err(storage_failure)
    }

    pub fn audit_for_actor(
        &self,
        actor_id: &ActorId,
        range: &TimeRange,
    ) -> VaultResult<Vec<AccessLogEntry>> {
        self.audit
            .find_by_actor(actor_id, range)
            .map_err(storage_failure)
    }
}

fn require_password(password: &SecretString) -> VaultResult<()> {
    if password.expose_secret().is_empty() {
        return Err(VaultError::InvalidInput("password must not be empty".into()));
    }
    Ok(())
}

/// Logs the backend's own error and hands the caller the opaque kind.
fn storage_failure(err: StoreError) -> VaultError {
    error!(error = %err, "storage call failed");
    VaultError::from(err)
}
