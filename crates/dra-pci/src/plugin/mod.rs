//! The node-side device agent.
//!
//! One [`DeviceAgent`] runs per node. At startup it discovers the node's
//! passthrough devices, publishes them in the node's state record, and flips
//! the record to `Ready`; afterwards it serves prepare and unprepare batches
//! from the local container runtime. All agent work funnels through a single
//! async mutex, so at most one record write is in flight per node and local
//! state never races the record.

pub mod cdi;
pub mod inventory;
pub mod state;

use crate::client::{retry_on_conflict, StateApi, StateClient, StateError};
use crate::config::DeviceClassConfig;
use crate::resource::NodeDeviceStateStatus;
use cdi::CdiWriter;
use inventory::DeviceInventory;
use serde::{Deserialize, Serialize};
use state::DeviceState;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Identity of a claim in a prepare or unprepare batch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClaimHandle {
    /// Cluster-unique claim UID, the key into the node's record.
    pub uid: String,
    /// Human-readable claim name, used only in log output.
    pub name: String,
}

/// Outcome of one claim in a prepare batch.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareResourceResponse {
    /// Qualified CDI device handles for the container runtime.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cdi_devices: Vec<String>,
    /// The claim's failure, if preparation failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-claim outcomes of a prepare batch, keyed by claim UID.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PrepareResourcesResponse {
    /// One entry per claim in the request.
    pub claims: HashMap<String, PrepareResourceResponse>,
}

/// Outcome of one claim in an unprepare batch.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UnprepareResourceResponse {
    /// The claim's failure, if withdrawal failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-claim outcomes of an unprepare batch, keyed by claim UID.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UnprepareResourcesResponse {
    /// One entry per claim in the request.
    pub claims: HashMap<String, UnprepareResourceResponse>,
}

struct AgentInner {
    client: StateClient,
    state: DeviceState,
}

/// The per-node device agent.
pub struct DeviceAgent {
    inner: Mutex<AgentInner>,
}

impl DeviceAgent {
    /// Brings the node online: runs one discovery pass, adopts any claims
    /// prepared by a previous process, publishes the inventory in the node's
    /// record, and flips it to `Ready`.
    pub async fn bootstrap(
        node_name: &str,
        classes: &DeviceClassConfig,
        inventory: &dyn DeviceInventory,
        cdi: Box<dyn CdiWriter>,
        api: Arc<dyn StateApi>,
    ) -> Result<Self, StateError> {
        // Discovery runs once, outside the retry loop, so the generated
        // device ids stay stable across write conflicts.
        let devices = inventory.discover(&classes.discovery_filter())?;
        info!(node = %node_name, devices = devices.len(), "discovered passthrough devices");

        let mut state = DeviceState::new(cdi, devices)?;
        let mut client = StateClient::new(node_name, api);
        retry_on_conflict!(async {
            client.get_or_create().await?;
            client.update_status(NodeDeviceStateStatus::NotReady).await?;
            state.sync_prepared_from_spec(client.spec())?;
            let spec = state.get_updated_spec(client.spec());
            client.update(spec).await?;
            client.update_status(NodeDeviceStateStatus::Ready).await
        }
        .await)?;

        info!(node = %node_name, "device agent ready");
        Ok(DeviceAgent {
            inner: Mutex::new(AgentInner { client, state }),
        })
    }

    /// Prepares a batch of claims. Claims fail individually; the response
    /// always carries one entry per requested claim.
    pub async fn prepare_claims(&self, claims: &[ClaimHandle]) -> PrepareResourcesResponse {
        let mut response = PrepareResourcesResponse::default();
        for claim in claims {
            let entry = match self.prepare_claim(&claim.uid).await {
                Ok(cdi_devices) => {
                    debug!(claim = %claim.name, "prepared claim devices");
                    PrepareResourceResponse {
                        cdi_devices,
                        error: None,
                    }
                }
                Err(e) => {
                    warn!(claim = %claim.name, error = %e, "unable to prepare claim devices");
                    PrepareResourceResponse {
                        cdi_devices: Vec::new(),
                        error: Some(format!(
                            "error preparing devices for claim '{}': {}",
                            claim.uid, e
                        )),
                    }
                }
            };
            response.claims.insert(claim.uid.clone(), entry);
        }
        response
    }

    /// Withdraws a batch of claims. Claims fail individually; the response
    /// always carries one entry per requested claim.
    pub async fn unprepare_claims(&self, claims: &[ClaimHandle]) -> UnprepareResourcesResponse {
        let mut response = UnprepareResourcesResponse::default();
        for claim in claims {
            let entry = match self.unprepare_claim(&claim.uid).await {
                Ok(()) => {
                    debug!(claim = %claim.name, "withdrew claim devices");
                    UnprepareResourceResponse { error: None }
                }
                Err(e) => {
                    warn!(claim = %claim.name, error = %e, "unable to withdraw claim devices");
                    UnprepareResourceResponse {
                        error: Some(format!(
                            "error unpreparing devices for claim '{}': {}",
                            claim.uid, e
                        )),
                    }
                }
            };
            response.claims.insert(claim.uid.clone(), entry);
        }
        response
    }

    /// Flips the node's record back to `NotReady` ahead of process exit, so
    /// the controller stops selecting this node.
    pub async fn shutdown(&self) -> Result<(), StateError> {
        let mut inner = self.inner.lock().await;
        retry_on_conflict!(async {
            inner.client.get().await?;
            inner
                .client
                .update_status(NodeDeviceStateStatus::NotReady)
                .await
        }
        .await)
    }

    async fn prepare_claim(&self, claim_uid: &str) -> Result<Vec<String>, StateError> {
        let mut inner = self.inner.lock().await;
        retry_on_conflict!(inner.try_prepare(claim_uid).await)
    }

    async fn unprepare_claim(&self, claim_uid: &str) -> Result<(), StateError> {
        let mut inner = self.inner.lock().await;
        retry_on_conflict!(inner.try_unprepare(claim_uid).await)
    }
}

impl AgentInner {
    async fn try_prepare(&mut self, claim_uid: &str) -> Result<Vec<String>, StateError> {
        self.client.get().await?;
        if !self.client.is_ready() {
            return Err(StateError::NotReady(self.client.status().cloned()));
        }

        let newly_prepared = !self.state.is_prepared(claim_uid);
        let allocation = self.client.spec().allocated_claims.get(claim_uid).cloned();
        let handles = self.state.prepare(claim_uid, allocation.as_ref())?;

        let spec = self.state.get_updated_spec(self.client.spec());
        if let Err(write_err) = self.client.update(spec).await {
            // The record still shows the claim unprepared, so withdraw the
            // local exposure too. A claim prepared by an earlier call is
            // left alone.
            if newly_prepared {
                if let Err(rollback_err) = self.state.unprepare(claim_uid) {
                    error!(
                        claim = %claim_uid,
                        error = %rollback_err,
                        "unable to roll back device preparation after failed record write"
                    );
                }
            }
            return Err(write_err);
        }
        Ok(handles)
    }

    async fn try_unprepare(&mut self, claim_uid: &str) -> Result<(), StateError> {
        self.client.get().await?;

        // Done only once neither the local state nor the record still lists
        // the claim; a retried attempt may have withdrawn locally while the
        // record write conflicted.
        if !self.state.is_prepared(claim_uid)
            && !self.client.spec().prepared_claims.contains_key(claim_uid)
        {
            return Ok(());
        }

        self.state.unprepare(claim_uid)?;
        let spec = self.state.get_updated_spec(self.client.spec());
        self.client.update(spec).await
    }
}
