//! Instance registry
//!
//! The registry is the single source of truth for which preview apps exist,
//! what state they are in and which backend port they own. All writes go
//! through one `RwLock` write guard, so every check-then-write sequence
//! (existence check + insert, capacity check + insert, status check + update)
//! is atomic. Readers get a cloned record and never block each other.

use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info};

/// Maximum length of an app id
const MAX_APP_ID_LEN: usize = 128;

/// Lifecycle status of a preview app
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InstanceStatus {
    /// Reserved, backend not listening yet
    Creating,
    /// Backend is listening and receives traffic
    Live,
    /// Lease ran out, backend is being torn down
    Expired,
    /// Creation failed, no backend is running
    Failed,
}

impl InstanceStatus {
    /// Whether a record may move from `self` to `next`
    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        matches!(
            (self, next),
            (InstanceStatus::Creating, InstanceStatus::Live)
                | (InstanceStatus::Creating, InstanceStatus::Failed)
                | (InstanceStatus::Live, InstanceStatus::Failed)
                | (InstanceStatus::Live, InstanceStatus::Expired)
        )
    }

    /// Creating and Live instances count against the concurrency limit
    pub fn is_active(self) -> bool {
        matches!(self, InstanceStatus::Creating | InstanceStatus::Live)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceStatus::Creating => write!(f, "creating"),
            InstanceStatus::Live => write!(f, "live"),
            InstanceStatus::Expired => write!(f, "expired"),
            InstanceStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Registry record for one preview app
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub id: String,
    pub status: InstanceStatus,
    /// Backend port, assigned when the instance goes live
    pub port: Option<u16>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl InstanceRecord {
    /// A fresh record in the `Creating` state
    pub fn creating(id: &str, created_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            status: InstanceStatus::Creating,
            port: None,
            created_at,
            expires_at,
        }
    }

    /// Whether the lease has run out at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Check that an app id is safe to use in paths, topics and logs
pub fn validate_app_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_APP_ID_LEN
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(OrchestratorError::InvalidId(id.chars().take(MAX_APP_ID_LEN).collect()))
    }
}

/// Authoritative map from app id to instance record
#[derive(Default)]
pub struct Registry {
    instances: RwLock<HashMap<String, InstanceRecord>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, failing if the id is already present
    pub fn insert(&self, record: InstanceRecord) -> Result<()> {
        let mut instances = self.instances.write();
        if instances.contains_key(&record.id) {
            return Err(OrchestratorError::AlreadyExists(record.id));
        }
        debug!(app_id = %record.id, status = %record.status, "Instance registered");
        instances.insert(record.id.clone(), record);
        Ok(())
    }

    /// Atomically reserve `id` in the `Creating` state.
    ///
    /// Fails with `AlreadyExists` if any record exists for `id`, and with
    /// `CapacityExceeded` if `max_active` instances are already creating or live.
    pub fn reserve(
        &self,
        id: &str,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        max_active: usize,
    ) -> Result<InstanceRecord> {
        if expires_at <= created_at {
            return Err(OrchestratorError::ContentError(
                "lease must end after it starts".to_string(),
            ));
        }

        let mut instances = self.instances.write();
        if instances.contains_key(id) {
            return Err(OrchestratorError::AlreadyExists(id.to_string()));
        }
        let active = instances.values().filter(|r| r.status.is_active()).count();
        if active >= max_active {
            return Err(OrchestratorError::CapacityExceeded { limit: max_active });
        }

        let record = InstanceRecord::creating(id, created_at, expires_at);
        instances.insert(id.to_string(), record.clone());
        debug!(app_id = id, active = active + 1, %expires_at, "Instance reserved");
        Ok(record)
    }

    /// Snapshot of the record for `id`
    pub fn get(&self, id: &str) -> Option<InstanceRecord> {
        self.instances.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.instances.read().contains_key(id)
    }

    /// Move `id` to `status`, enforcing the allowed transitions
    pub fn update_status(&self, id: &str, status: InstanceStatus) -> Result<InstanceRecord> {
        let mut instances = self.instances.write();
        let record = instances
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;

        if !record.status.can_transition_to(status) {
            return Err(OrchestratorError::InvalidTransition {
                id: id.to_string(),
                from: record.status,
                to: status,
            });
        }

        debug!(app_id = id, from = %record.status, to = %status, "Instance status changed");
        record.status = status;
        Ok(record.clone())
    }

    /// Transition `Creating -> Live` and record the backend port
    pub fn mark_live(&self, id: &str, port: u16) -> Result<InstanceRecord> {
        let mut instances = self.instances.write();
        let record = instances
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;

        if record.status != InstanceStatus::Creating {
            return Err(OrchestratorError::InvalidTransition {
                id: id.to_string(),
                from: record.status,
                to: InstanceStatus::Live,
            });
        }

        record.status = InstanceStatus::Live;
        record.port = Some(port);
        info!(app_id = id, port, expires_at = %record.expires_at, "Instance is live");
        Ok(record.clone())
    }

    /// Push the lease of a live instance out to `until`
    pub fn extend_lease(&self, id: &str, until: DateTime<Utc>) -> Result<InstanceRecord> {
        let mut instances = self.instances.write();
        let record = instances
            .get_mut(id)
            .filter(|r| r.status == InstanceStatus::Live)
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;

        if until <= record.created_at {
            return Err(OrchestratorError::ContentError(
                "lease must end after it starts".to_string(),
            ));
        }

        record.expires_at = until;
        info!(app_id = id, expires_at = %until, "Lease extended");
        Ok(record.clone())
    }

    /// Transition `Live -> Expired` if the lease has ended at `now`.
    ///
    /// The lease check and the transition share one write guard, so a lease
    /// extended after the last scan keeps the instance alive. Returns whether
    /// the record was expired.
    pub fn expire_if_due(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut instances = self.instances.write();
        let record = instances
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;

        if record.status != InstanceStatus::Live || !record.is_expired_at(now) {
            return Ok(false);
        }

        record.status = InstanceStatus::Expired;
        debug!(app_id = id, expires_at = %record.expires_at, "Instance lease ended");
        Ok(true)
    }

    /// Remove the record for `id`
    pub fn remove(&self, id: &str) -> Option<InstanceRecord> {
        let removed = self.instances.write().remove(id);
        if removed.is_some() {
            debug!(app_id = id, "Instance unregistered");
        }
        removed
    }

    /// Ids whose lease ended at or before `now`.
    ///
    /// Records still in `Creating` are skipped: creation is bounded by the bind
    /// attempt and will settle on `Live` or `Failed` without help.
    pub fn scan_expired(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut ids: Vec<String> = self
            .instances
            .read()
            .values()
            .filter(|r| r.status != InstanceStatus::Creating && r.is_expired_at(now))
            .map(|r| r.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Ids of all live instances, sorted
    pub fn live_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .instances
            .read()
            .values()
            .filter(|r| r.status == InstanceStatus::Live)
            .map(|r| r.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Snapshot of every record, sorted by id
    pub fn list(&self) -> Vec<InstanceRecord> {
        let mut records: Vec<InstanceRecord> = self.instances.read().values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Number of instances that are creating or live
    pub fn active_count(&self) -> usize {
        self.instances
            .read()
            .values()
            .filter(|r| r.status.is_active())
            .count()
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }
}
