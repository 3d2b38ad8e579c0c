//! Client for the per-node `NodeDeviceState` record.
//!
//! All reads and writes go through the [`StateApi`] trait so the storage
//! transport stays injectable: production wires in a [`KubeStateApi`] backed
//! by a namespaced `kube::Api`, tests wire in an in-memory store. Every write
//! is a full replacement of the spec (or status) against the last-fetched
//! `resourceVersion`; a stale version surfaces as [`StateError::Conflict`]
//! and callers retry the whole read-modify-write with
//! [`retry_on_conflict!`](crate::client::retry_on_conflict).

use crate::resource::{NodeDeviceState, NodeDeviceStateSpec, NodeDeviceStateStatus};
use async_trait::async_trait;
use kube::api::{Api, PostParams};
use kube::error::ErrorResponse;
use std::sync::Arc;
use thiserror::Error;

/// How many times a read-modify-write is retried on a stale version token
/// before the conflict is surfaced to the caller.
pub const DEFAULT_RETRY_BUDGET: u8 = 5;

/// Errors produced while operating on a node's state record.
#[derive(Error, Debug)]
pub enum StateError {
    /// The record does not exist yet. Recoverable by create-then-retry.
    #[error("node state record not found")]
    NotFound,
    /// The write used a stale version token. Recoverable by re-fetching and
    /// recomputing the intended change.
    #[error("conflicting write to node state record")]
    Conflict,
    /// The node's agent has not completed its startup handshake.
    #[error("node state is {0:?}, expected Ready")]
    NotReady(Option<NodeDeviceStateStatus>),
    /// A claim references a device id absent from the node's allocatable
    /// set. This is a consistency violation between the controller's and the
    /// agent's views and is never retried.
    #[error("requested PCI device does not exist on this node: {0}")]
    UnknownDevice(String),
    /// A binding was requested for a claim/node pair that was never run
    /// through node filtering.
    #[error("no device selection staged for claim '{claim}' on node '{node}'")]
    NotStaged {
        /// UID of the claim being bound.
        claim: String,
        /// Name of the node the binding targeted.
        node: String,
    },
    /// Any other API server error, surfaced as-is.
    #[error(transparent)]
    Api(kube::Error),
    /// Any non-transport failure from a collaborator.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<kube::Error> for StateError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ErrorResponse { code: 404, .. }) => StateError::NotFound,
            kube::Error::Api(ErrorResponse { code: 409, .. }) => StateError::Conflict,
            other => StateError::Api(other),
        }
    }
}

/// Raw storage operations on `NodeDeviceState` records. Implemented for the
/// Kubernetes API server in production and for an in-memory store in tests.
#[async_trait]
pub trait StateApi: Send + Sync {
    /// Fetches the named record.
    async fn get(&self, name: &str) -> Result<NodeDeviceState, StateError>;
    /// Creates the record, failing with [`StateError::Conflict`] if it
    /// already exists.
    async fn create(&self, state: &NodeDeviceState) -> Result<NodeDeviceState, StateError>;
    /// Replaces the whole record spec using the version token carried in
    /// `state.metadata.resource_version`.
    async fn replace(&self, state: &NodeDeviceState) -> Result<NodeDeviceState, StateError>;
    /// Replaces only the record's status subresource.
    async fn replace_status(&self, state: &NodeDeviceState)
        -> Result<NodeDeviceState, StateError>;
}

/// [`StateApi`] backed by a namespaced `kube::Api`.
pub struct KubeStateApi {
    api: Api<NodeDeviceState>,
}

impl KubeStateApi {
    /// Returns a state API scoped to the driver's namespace.
    pub fn new(client: kube::Client, namespace: &str) -> Self {
        KubeStateApi {
            api: Api::namespaced(client, namespace),
        }
    }
}

fn record_name(state: &NodeDeviceState) -> Result<&str, StateError> {
    state
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| StateError::Other(anyhow::anyhow!("node state record has no name")))
}

#[async_trait]
impl StateApi for KubeStateApi {
    async fn get(&self, name: &str) -> Result<NodeDeviceState, StateError> {
        Ok(self.api.get(name).await?)
    }

    async fn create(&self, state: &NodeDeviceState) -> Result<NodeDeviceState, StateError> {
        Ok(self.api.create(&PostParams::default(), state).await?)
    }

    async fn replace(&self, state: &NodeDeviceState) -> Result<NodeDeviceState, StateError> {
        let name = record_name(state)?;
        Ok(self.api.replace(name, &PostParams::default(), state).await?)
    }

    async fn replace_status(
        &self,
        state: &NodeDeviceState,
    ) -> Result<NodeDeviceState, StateError> {
        let name = record_name(state)?;
        let data = serde_json::to_vec(state)
            .map_err(|e| StateError::Other(anyhow::Error::from(e)))?;
        Ok(self
            .api
            .replace_status(name, &PostParams::default(), data)
            .await?)
    }
}

/// A read-modify-write handle on one node's state record. Holds the
/// last-fetched copy of the record so every update carries its version token.
pub struct StateClient {
    api: Arc<dyn StateApi>,
    node_name: String,
    state: NodeDeviceState,
}

impl StateClient {
    /// Returns a client for the named node's record. Nothing is fetched until
    /// [`get`](StateClient::get) or [`get_or_create`](StateClient::get_or_create)
    /// is called.
    pub fn new(node_name: &str, api: Arc<dyn StateApi>) -> Self {
        let state = NodeDeviceState::new(node_name, NodeDeviceStateSpec::default());
        StateClient {
            api,
            node_name: node_name.to_string(),
            state,
        }
    }

    /// The node this client operates on.
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// The last-fetched record spec.
    pub fn spec(&self) -> &NodeDeviceStateSpec {
        &self.state.spec
    }

    /// The last-fetched readiness status.
    pub fn status(&self) -> Option<&NodeDeviceStateStatus> {
        self.state.status.as_ref()
    }

    /// Whether the node's agent has flipped the record to `Ready`.
    pub fn is_ready(&self) -> bool {
        matches!(self.state.status, Some(NodeDeviceStateStatus::Ready))
    }

    /// Fetches the current record, failing with [`StateError::NotFound`] if
    /// it has not been created yet.
    pub async fn get(&mut self) -> Result<(), StateError> {
        self.state = self.api.get(&self.node_name).await?;
        Ok(())
    }

    /// Fetches the current record, creating an empty one if absent.
    pub async fn get_or_create(&mut self) -> Result<(), StateError> {
        match self.api.get(&self.node_name).await {
            Ok(state) => {
                self.state = state;
                Ok(())
            }
            Err(StateError::NotFound) => {
                let fresh = NodeDeviceState::new(&self.node_name, NodeDeviceStateSpec::default());
                self.state = self.api.create(&fresh).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Writes a full replacement spec using the last-fetched version token.
    pub async fn update(&mut self, spec: NodeDeviceStateSpec) -> Result<(), StateError> {
        let mut next = self.state.clone();
        next.spec = spec;
        self.state = self.api.replace(&next).await?;
        Ok(())
    }

    /// Writes only the readiness status using the last-fetched version token.
    pub async fn update_status(
        &mut self,
        status: NodeDeviceStateStatus,
    ) -> Result<(), StateError> {
        let mut next = self.state.clone();
        next.status = Some(status);
        self.state = self.api.replace_status(&next).await?;
        Ok(())
    }
}

/// Re-runs a fallible read-modify-write expression while it fails with
/// [`StateError::Conflict`], sleeping with exponential backoff between
/// attempts. The expression must re-fetch the record itself so each attempt
/// starts from a fresh version token. Exhausting the budget breaks with the
/// last error; any non-conflict result breaks immediately.
macro_rules! retry_on_conflict {
    ($action:expr) => {
        $crate::client::retry_on_conflict!($action, times: $crate::client::DEFAULT_RETRY_BUDGET)
    };
    ($action:expr, times: $times:expr) => {{
        let mut n = 0u8;
        let mut delay = std::time::Duration::from_millis(10);
        loop {
            n += 1;
            match $action {
                Err($crate::client::StateError::Conflict) if n < $times => {
                    tracing::debug!(attempt = n, "stale node state record, retrying from a fresh read");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                result => break result,
            }
        }
    }};
}
pub(crate) use retry_on_conflict;


#[cfg(test)]
mod tests {
    use super::test_utils::*;
    use super::*;

    #[tokio::test]
    async fn get_surfaces_not_found() {
        let api = Arc::new(FakeStateApi::new());
        let mut client = StateClient::new("node-1", api);
        assert!(matches!(client.get().await, Err(StateError::NotFound)));
    }

    #[tokio::test]
    async fn get_or_create_creates_once() {
        let api = Arc::new(FakeStateApi::new());
        let mut client = StateClient::new("node-1", api.clone());
        client.get_or_create().await.unwrap();
        assert!(api.stored("node-1").is_some());
        // A second call fetches the existing record instead of recreating it.
        client.get_or_create().await.unwrap();
        assert_eq!(
            api.stored("node-1").unwrap().metadata.resource_version,
            Some("1".to_string())
        );
    }

    #[tokio::test]
    async fn stale_token_conflicts() {
        let api = Arc::new(FakeStateApi::new());
        let mut stale = StateClient::new("node-1", api.clone());
        stale.get_or_create().await.unwrap();

        // Another writer bumps the version behind our back.
        let mut other = StateClient::new("node-1", api.clone());
        other.get().await.unwrap();
        other.update(NodeDeviceStateSpec::default()).await.unwrap();

        let result = stale.update(NodeDeviceStateSpec::default()).await;
        assert!(matches!(result, Err(StateError::Conflict)));

        // A fresh read converges.
        stale.get().await.unwrap();
        stale.update(NodeDeviceStateSpec::default()).await.unwrap();
    }

    #[tokio::test]
    async fn update_status_only_touches_status() {
        let api = Arc::new(FakeStateApi::new());
        api.seed(ready_state(
            "node-1",
            vec![nvme_device("dev-a", "0000:00:1d.0")],
        ));
        let mut client = StateClient::new("node-1", api.clone());
        client.get().await.unwrap();
        client
            .update_status(NodeDeviceStateStatus::NotReady)
            .await
            .unwrap();
        let stored = client.spec().allocatable_devices.len();
        assert_eq!(stored, 1);
        assert_eq!(
            api.stored("node-1").unwrap().status,
            Some(NodeDeviceStateStatus::NotReady)
        );
        assert_eq!(
            api.stored("node-1")
                .unwrap()
                .spec
                .allocatable_devices
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn retry_converges_after_conflicts() {
        let api = Arc::new(FakeStateApi::new());
        api.seed(ready_state("node-1", vec![]));
        api.fail_next_replace(StateError::Conflict);
        api.fail_next_replace(StateError::Conflict);

        let mut client = StateClient::new("node-1", api.clone());
        let result: Result<(), StateError> = retry_on_conflict!(async {
            client.get().await?;
            client.update(NodeDeviceStateSpec::default()).await
        }
        .await);
        result.unwrap();
    }

    #[tokio::test]
    async fn retry_budget_surfaces_last_conflict() {
        let api = Arc::new(FakeStateApi::new());
        api.seed(ready_state("node-1", vec![]));
        for _ in 0..DEFAULT_RETRY_BUDGET {
            api.fail_next_replace(StateError::Conflict);
        }

        let mut client = StateClient::new("node-1", api.clone());
        let result: Result<(), StateError> = retry_on_conflict!(async {
            client.get().await?;
            client.update(NodeDeviceStateSpec::default()).await
        }
        .await);
        assert!(matches!(result, Err(StateError::Conflict)));
    }

    #[tokio::test]
    async fn retry_passes_other_errors_through() {
        let api = Arc::new(FakeStateApi::new());
        api.seed(ready_state("node-1", vec![]));
        api.fail_next_replace(StateError::NotFound);

        let mut client = StateClient::new("node-1", api.clone());
        let result: Result<(), StateError> = retry_on_conflict!(async {
            client.get().await?;
            client.update(NodeDeviceStateSpec::default()).await
        }
        .await);
        assert!(matches!(result, Err(StateError::NotFound)));
    }
}
