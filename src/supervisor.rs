//! Instance supervisor
//!
//! Creates preview instances (reserve, build the site, lease and bind a port,
//! start the backend, go live) and tears them down again (expire, drain,
//! release the port, unregister). Each running backend sits in its own slot
//! behind an async mutex, so two stops racing on the same id serialize and the
//! second one finds nothing left to do.

use crate::config::InstanceConfig;
use crate::error::{OrchestratorError, Result};
use crate::ports::PortAllocator;
use crate::registry::{validate_app_id, InstanceRecord, InstanceStatus, Registry};
use crate::site::{AppContent, BackendServer, BackendSite};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

type BackendSlot = Arc<Mutex<Option<BackendServer>>>;

/// Owns the lifecycle of every preview instance.
///
/// Like the other shared services, the supervisor is handed out behind an
/// `Arc`; [`new`](Supervisor::new) returns one directly.
pub struct Supervisor {
    registry: Arc<Registry>,
    ports: Arc<PortAllocator>,
    /// Running backends keyed by app id
    backends: DashMap<String, BackendSlot>,
    config: InstanceConfig,
    bind_attempts: u32,
}

impl Supervisor {
    pub fn new(
        registry: Arc<Registry>,
        ports: Arc<PortAllocator>,
        config: InstanceConfig,
        bind_attempts: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            ports,
            backends: DashMap::new(),
            config,
            bind_attempts,
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    /// Number of backends currently running
    pub fn running_backends(&self) -> usize {
        self.backends.len()
    }

    /// Create an instance with the default lease. Returns its backend port.
    pub async fn create(&self, id: &str, content: &AppContent) -> Result<u16> {
        self.create_with_expiry(id, content, None).await
    }

    /// Create an instance whose lease ends at `expires_at`.
    ///
    /// An expiry that is missing or not in the future falls back to the
    /// default lease.
    pub async fn create_with_expiry(
        &self,
        id: &str,
        content: &AppContent,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<u16> {
        validate_app_id(id)?;

        let now = Utc::now();
        let expires_at = match expires_at.filter(|t| *t > now) {
            Some(t) => t,
            None => self.default_expiry(now)?,
        };

        self.registry
            .reserve(id, now, expires_at, self.config.max_concurrent)?;

        match self.launch(id, content).await {
            Ok(port) => Ok(port),
            Err(e) => {
                warn!(app_id = id, error = %e, code = e.code(), "Instance creation failed");
                if let Err(status_err) = self.registry.update_status(id, InstanceStatus::Failed) {
                    debug!(app_id = id, error = %status_err, "Could not mark instance failed");
                }
                Err(e)
            }
        }
    }

    /// Default lease end for an instance created at `now`
    pub fn default_expiry(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        chrono::Duration::from_std(self.config.lease())
            .ok()
            .and_then(|lease| now.checked_add_signed(lease))
            .ok_or_else(|| OrchestratorError::ContentError("lease is out of range".to_string()))
    }

    /// Extend the lease of a live instance to `until`, or by the default
    /// lease from now when `until` is missing or already past
    pub fn extend(&self, id: &str, until: Option<DateTime<Utc>>) -> Result<InstanceRecord> {
        let now = Utc::now();
        let until = match until.filter(|t| *t > now) {
            Some(t) => t,
            None => self.default_expiry(now)?,
        };
        self.registry.extend_lease(id, until)
    }

    async fn launch(&self, id: &str, content: &AppContent) -> Result<u16> {
        let site = Arc::new(BackendSite::build(id, content, self.config.site_limits())?);
        let (port, listener) = self.bind_backend(id).await?;

        let server = BackendServer::start(id, port, listener, site, self.config.drain_grace());
        let slot: BackendSlot = Arc::new(Mutex::new(Some(server)));
        self.backends.insert(id.to_string(), Arc::clone(&slot));

        if let Err(e) = self.registry.mark_live(id, port) {
            self.backends.remove_if(id, |_, s| Arc::ptr_eq(s, &slot));
            if let Some(server) = slot.lock().await.take() {
                if let Err(join_err) = server.shutdown().await {
                    warn!(app_id = id, port, error = %join_err, "Backend task ended abnormally");
                }
            }
            self.ports.release(port);
            return Err(e);
        }

        Ok(port)
    }

    /// Lease a port and bind it, moving on to the next port when the bind
    /// fails. Running out of ports ends the attempt immediately.
    async fn bind_backend(&self, id: &str) -> Result<(u16, TcpListener)> {
        let mut last_error = String::from("no bind attempted");

        for attempt in 1..=self.bind_attempts {
            let port = self.ports.allocate(id)?;
            match TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => {
                    debug!(app_id = id, port, attempt, "Backend listener bound");
                    return Ok((port, listener));
                }
                Err(e) => {
                    warn!(app_id = id, port, attempt, error = %e, "Backend port unavailable");
                    self.ports.release(port);
                    last_error = e.to_string();
                }
            }
        }

        Err(OrchestratorError::ContentError(format!(
            "could not bind after {} attempts: {}",
            self.bind_attempts, last_error
        )))
    }

    /// Stop an instance and reclaim its port and record.
    ///
    /// Stopping an unknown id succeeds. Stopping an instance that is still
    /// being created does nothing.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let slot = self.backends.get(id).map(|entry| Arc::clone(entry.value()));
        let Some(slot) = slot else {
            self.reclaim_without_backend(id);
            return Ok(());
        };

        let mut guard = slot.lock().await;
        if guard.is_none() {
            // A concurrent stop got here first
            return Ok(());
        }

        match self.registry.get(id).map(|r| r.status) {
            Some(InstanceStatus::Creating) => {
                debug!(app_id = id, "Stop requested while creating, ignored");
                return Ok(());
            }
            Some(InstanceStatus::Live) => {
                // Stop routing before the backend goes away
                if let Err(e) = self.registry.update_status(id, InstanceStatus::Expired) {
                    debug!(app_id = id, error = %e, "Could not mark instance expired");
                }
            }
            _ => {}
        }

        let Some(server) = guard.take() else {
            return Ok(());
        };

        let port = server.port();
        let result = server.shutdown().await;
        self.ports.release(port);
        self.registry.remove(id);
        drop(guard);
        self.backends.remove_if(id, |_, s| Arc::ptr_eq(s, &slot));

        match result {
            Ok(()) => {
                info!(app_id = id, port, "Instance stopped");
                Ok(())
            }
            Err(e) => {
                error!(app_id = id, port, error = %e, "Backend task ended abnormally, resources reclaimed");
                Err(OrchestratorError::BackendStop {
                    id: id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Clean up a record that has no running backend behind it
    fn reclaim_without_backend(&self, id: &str) {
        let Some(record) = self.registry.get(id) else {
            return;
        };

        match record.status {
            InstanceStatus::Creating => {
                debug!(app_id = id, "Stop requested while creating, ignored");
            }
            InstanceStatus::Live | InstanceStatus::Expired | InstanceStatus::Failed => {
                if record.status == InstanceStatus::Live {
                    if let Err(e) = self.registry.update_status(id, InstanceStatus::Expired) {
                        debug!(app_id = id, error = %e, "Could not mark instance expired");
                    }
                }
                if let Some(port) = record.port {
                    if self.ports.lessee(port).as_deref() == Some(id) {
                        self.ports.release(port);
                    }
                }
                self.registry.remove(id);
                info!(app_id = id, status = %record.status, "Instance record reclaimed");
            }
        }
    }

    /// Stop every instance
    pub async fn stop_all(&self) {
        let mut ids: Vec<String> = self.registry.list().into_iter().map(|r| r.id).collect();
        ids.extend(self.backends.iter().map(|e| e.key().clone()));
        ids.sort();
        ids.dedup();

        for id in ids {
            if let Err(e) = self.stop(&id).await {
                warn!(app_id = %id, error = %e, "Error stopping instance");
            }
        }
    }
}
