//! Append-only access log.
//!
//! Every lifecycle call produces exactly one [`AccessLogEntry`]. This module
//! only defines the record and the [`AccessAuditLog`] contract; there is
//! intentionally no way to update or remove an entry through it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::SystemTime;
use uuid::Uuid;

use crate::secret::{ActorId, SecretId};
use crate::store::StoreResult;

/// Unique, time-ordered identifier for an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditLogId(Uuid);

impl AuditLogId {
    /// UUID v7, so byte order follows creation order.
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for AuditLogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditAction {
    Create,
    Read,
    Rotate,
    Delete,
    Restore,
    Rename,
    UpdateMetadata,
    List,
    ListVersions,
    /// A read whose envelope did not open.
    VerifyFailed,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuditAction::Create => "CREATE",
            AuditAction::Read => "READ",
            AuditAction::Rotate => "ROTATE",
            AuditAction::Delete => "DELETE",
            AuditAction::Restore => "RESTORE",
            AuditAction::Rename => "RENAME",
            AuditAction::UpdateMetadata => "UPDATE_METADATA",
            AuditAction::List => "LIST",
            AuditAction::ListVersions => "LIST_VERSIONS",
            AuditAction::VerifyFailed => "VERIFY_FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditOutcome {
    Success,
    Failure,
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditOutcome::Success => f.write_str("SUCCESS"),
            AuditOutcome::Failure => f.write_str("FAILURE"),
        }
    }
}

/// Who is calling and from where. Supplied by the API layer, which has
/// already authenticated and authorized the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub actor_id: ActorId,
    pub source_address: Option<IpAddr>,
    pub user_agent: Option<String>,
}

impl RequestContext {
    pub fn new(actor_id: impl Into<ActorId>) -> Self {
        Self {
            actor_id: actor_id.into(),
            source_address: None,
            user_agent: None,
        }
    }

    pub fn with_source_address(mut self, addr: IpAddr) -> Self {
        self.source_address = Some(addr);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub id: AuditLogId,
    /// `None` when the call failed before a secret was resolved.
    pub secret_id: Option<SecretId>,
    pub actor_id: ActorId,
    pub action: AuditAction,
    pub outcome: AuditOutcome,
    pub source_address: Option<IpAddr>,
    pub user_agent: Option<String>,
    /// Operator-facing diagnostics (error kind, version number). Never
    /// returned to callers and never contains secret material.
    pub detail: Option<String>,
    pub timestamp: SystemTime,
}

impl AccessLogEntry {
    pub fn new(
        ctx: &RequestContext,
        action: AuditAction,
        outcome: AuditOutcome,
        secret_id: Option<SecretId>,
    ) -> Self {
        Self {
            id: AuditLogId::generate(),
            secret_id,
            actor_id: ctx.actor_id.clone(),
            action,
            outcome,
            source_address: ctx.source_address,
            user_agent: ctx.user_agent.clone(),
            detail: None,
            timestamp: SystemTime::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Half-open time window `[start, end)`; a missing bound is unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Option<SystemTime>,
    pub end: Option<SystemTime>,
}

impl TimeRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(start: SystemTime, end: SystemTime) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn since(start: SystemTime) -> Self {
        Self {
            start: Some(start),
            end: None,
        }
    }

    pub fn contains(&self, at: SystemTime) -> bool {
        self.start.is_none_or(|start| at >= start) && self.end.is_none_or(|end| at < end)
    }
}

/// Write-once audit sink.
///
/// Query results are ordered oldest first.
pub trait AccessAuditLog: Send + Sync {
    fn append(&self, entry: &AccessLogEntry) -> StoreResult<()>;

    fn find_by_secret(
        &self,
        secret_id: &SecretId,
        range: &TimeRange,
    ) -> StoreResult<Vec<AccessLogEntry>>;

    fn find_by_actor(&self, actor_id: &ActorId, range: &TimeRange)
    -> StoreResult<Vec<AccessLogEntry>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_entry_copies_request_context() {
        let ctx = RequestContext::new("alice")
            .with_source_address("10.0.0.7".parse().unwrap())
            .with_user_agent("cli/1.0");
        let id = SecretId::generate();
        let entry = AccessLogEntry::new(&ctx, AuditAction::Read, AuditOutcome::Success, Some(id))
            .with_detail("version=2");

        assert_eq!(entry.actor_id.as_str(), "alice");
        assert_eq!(entry.secret_id, Some(id));
        assert_eq!(entry.source_address, Some("10.0.0.7".parse().unwrap()));
        assert_eq!(entry.user_agent.as_deref(), Some("cli/1.0"));
        assert_eq!(entry.detail.as_deref(), Some("version=2"));
    }

    #[test]
    fn test_ids_are_time_ordered() {
        let a = AuditLogId::generate();
        let b = AuditLogId::generate();
        assert!(a < b);
    }

    #[test]
    fn test_time_range() {
        let now = SystemTime::now();
        let later = now + Duration::from_secs(10);

        assert!(TimeRange::all().contains(now));
        assert!(TimeRange::since(now).contains(now));
        assert!(!TimeRange::since(later).contains(now));

        let window = TimeRange::between(now, later);
        assert!(window.contains(now));
        assert!(!window.contains(later));
    }

    #[test]
    fn test_display_labels() {
        assert_eq!(AuditAction::VerifyFailed.to_string(), "VERIFY_FAILED");
        assert_eq!(AuditAction::UpdateMetadata.to_string(), "UPDATE_METADATA");
        assert_eq!(AuditOutcome::Failure.to_string(), "FAILURE");
    }
}
