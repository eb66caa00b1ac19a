//! Event bridge between the message bus and the supervisor
//!
//! Creation requests arrive on the create topic, lease extensions on the
//! extend topic. Every creation ends with a readiness notice on
//! `<ready prefix><app id>`, whether the instance went live or failed.

use crate::bus::SharedBus;
use crate::config::{BusConfig, ServerConfig};
use crate::error::{OrchestratorError, Result};
use crate::registry::{validate_app_id, InstanceRecord};
use crate::site::AppContent;
use crate::supervisor::Supervisor;
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Pause before resubscribing after a subscription ends
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Message on the create topic
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    #[serde(alias = "appId")]
    pub id: String,
    #[serde(default, alias = "appData")]
    pub content: AppContent,
    /// Requested lease end in epoch milliseconds
    #[serde(default)]
    pub expires_at: Option<i64>,
}

/// Message on the extend topic
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendRequest {
    #[serde(alias = "appId")]
    pub id: String,
    /// New lease end in epoch milliseconds
    #[serde(default)]
    pub expires_at: Option<i64>,
}

/// Readiness notice published after a creation attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessNotice {
    pub id: String,
    #[serde(flatten)]
    pub outcome: Readiness,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum Readiness {
    Live { url: String },
    Failed { reason: String },
}

impl ReadinessNotice {
    pub fn live(id: &str, url: String) -> Self {
        Self {
            id: id.to_string(),
            outcome: Readiness::Live { url },
        }
    }

    pub fn failed(id: &str, reason: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            outcome: Readiness::Failed {
                reason: reason.into(),
            },
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self.outcome, Readiness::Live { .. })
    }
}

fn from_epoch_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

#[derive(Debug, Clone, Copy)]
enum Topic {
    Create,
    Extend,
}

pub struct EventBridge {
    supervisor: Arc<Supervisor>,
    bus: SharedBus,
    bus_config: BusConfig,
    server_config: ServerConfig,
}

impl EventBridge {
    pub fn new(
        supervisor: Arc<Supervisor>,
        bus: SharedBus,
        bus_config: BusConfig,
        server_config: ServerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            supervisor,
            bus,
            bus_config,
            server_config,
        })
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Create the requested instance and publish its readiness notice.
    ///
    /// The notice is published for failures too; the error is still returned
    /// to the caller.
    pub async fn handle_create(&self, request: CreateRequest) -> Result<ReadinessNotice> {
        let expires_at = from_epoch_millis(request.expires_at);
        let result = self
            .supervisor
            .create_with_expiry(&request.id, &request.content, expires_at)
            .await;

        let notice = match &result {
            Ok(port) => {
                let url = self.server_config.preview_url(&request.id);
                info!(app_id = %request.id, port, url = %url, "Preview app ready");
                ReadinessNotice::live(&request.id, url)
            }
            Err(e) => ReadinessNotice::failed(&request.id, e.to_string()),
        };

        // No notice for ids that cannot name a topic
        if validate_app_id(&request.id).is_ok() {
            self.publish_notice(&notice).await;
        }

        result.map(|_| notice)
    }

    /// Handle a raw payload from the create topic
    pub async fn handle_create_message(&self, payload: &str) {
        match serde_json::from_str::<CreateRequest>(payload) {
            Ok(request) => {
                debug!(app_id = %request.id, "Creation request received");
                let _ = self.handle_create(request).await;
            }
            Err(e) => match recover_id(payload) {
                Some(id) => {
                    warn!(app_id = %id, error = %e, "Malformed creation request");
                    let notice = ReadinessNotice::failed(&id, format!("invalid request: {}", e));
                    self.publish_notice(&notice).await;
                }
                None => {
                    warn!(error = %e, "Dropping creation request without a usable id");
                }
            },
        }
    }

    /// Handle a raw payload from the extend topic
    pub async fn handle_extend_message(&self, payload: &str) -> Result<InstanceRecord> {
        let request: ExtendRequest = serde_json::from_str(payload).map_err(|e| {
            warn!(error = %e, "Malformed lease extension request");
            OrchestratorError::ContentError(format!("invalid request: {}", e))
        })?;

        match self
            .supervisor
            .extend(&request.id, from_epoch_millis(request.expires_at))
        {
            Ok(record) => Ok(record),
            Err(e) => {
                warn!(app_id = %request.id, error = %e, "Lease extension rejected");
                Err(e)
            }
        }
    }

    async fn publish_notice(&self, notice: &ReadinessNotice) {
        let topic = self.bus_config.ready_topic(&notice.id);
        let payload = match serde_json::to_string(notice) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(app_id = %notice.id, error = %e, "Failed to encode readiness notice");
                return;
            }
        };

        if let Err(e) = self.bus.publish(&topic, payload).await {
            warn!(app_id = %notice.id, topic = %topic, error = %e, "Failed to publish readiness notice");
        }
    }

    /// Consume the create and extend topics until shutdown
    pub async fn run(self: Arc<Self>, shutdown_rx: watch::Receiver<bool>) {
        let create = tokio::spawn(Arc::clone(&self).consume(Topic::Create, shutdown_rx.clone()));
        let extend = tokio::spawn(Arc::clone(&self).consume(Topic::Extend, shutdown_rx));

        let (create, extend) = tokio::join!(create, extend);
        for result in [create, extend] {
            if let Err(e) = result {
                warn!(error = %e, "Bridge consumer ended abnormally");
            }
        }
        debug!("Event bridge stopped");
    }

    async fn consume(self: Arc<Self>, kind: Topic, mut shutdown_rx: watch::Receiver<bool>) {
        let topic = match kind {
            Topic::Create => self.bus_config.create_topic.clone(),
            Topic::Extend => self.bus_config.extend_topic.clone(),
        };

        loop {
            if *shutdown_rx.borrow() {
                return;
            }

            match self.bus.subscribe(&topic).await {
                Ok(mut subscription) => {
                    info!(topic = %topic, "Listening for messages");
                    loop {
                        tokio::select! {
                            message = subscription.next() => {
                                let Some(payload) = message else {
                                    warn!(topic = %topic, "Subscription ended, resubscribing");
                                    break;
                                };
                                let bridge = Arc::clone(&self);
                                tokio::spawn(async move {
                                    match kind {
                                        Topic::Create => bridge.handle_create_message(&payload).await,
                                        Topic::Extend => {
                                            let _ = bridge.handle_extend_message(&payload).await;
                                        }
                                    }
                                });
                            }
                            changed = shutdown_rx.changed() => {
                                if changed.is_err() || *shutdown_rx.borrow() {
                                    return;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(topic = %topic, error = %e, "Subscribe failed, retrying");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

/// Best-effort id extraction from a payload that did not parse as a request
fn recover_id(payload: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    let id = value
        .get("id")
        .or_else(|| value.get("appId"))?
        .as_str()?
        .to_string();
    validate_app_id(&id).ok().map(|_| id)
}
