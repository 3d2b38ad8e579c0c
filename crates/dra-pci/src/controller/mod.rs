//! The cluster-side allocation engine.
//!
//! Implements the scheduling hooks consumed by the cluster scheduler:
//! [`Controller::compute_unsuitable_nodes`] filters candidate nodes for a
//! batch of claims and stages tentative device selections,
//! [`Controller::allocate`] commits a binding on the finally-selected node,
//! and [`Controller::deallocate`] releases it. All three are read-modify-write
//! operations on the node's shared state record, serialized per node by
//! [`NodeLocks`] on this side and by the record's version token across the
//! process boundary.

mod locks;
mod pending;

use crate::client::{retry_on_conflict, StateApi, StateClient, StateError};
use crate::config::DeviceClassConfig;
use crate::resource::AllocatedDevices;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

pub use locks::NodeLocks;
pub use pending::{Disposition, PendingAllocations};

/// A workload's request for exactly one device of a named resource.
#[derive(Clone, Debug)]
pub struct Claim {
    /// Cluster-unique claim UID.
    pub uid: String,
    /// The requested resource name.
    pub resource_name: String,
    /// The node this claim is bound to, once allocated. A claim binds to
    /// exactly one node for its lifetime.
    pub selected_node: Option<String>,
}

/// A claim being driven through scheduling, carrying the per-claim outputs of
/// the scheduling hooks.
#[derive(Clone, Debug)]
pub struct ClaimAllocation {
    /// The claim under scheduling.
    pub claim: Claim,
    /// Nodes found unsuitable for this claim, accumulated across the
    /// candidate set and deduplicated.
    pub unsuitable_nodes: Vec<String>,
    /// The committed binding, set by a successful allocate.
    pub allocation: Option<NodeBinding>,
    /// The per-claim failure, set instead of aborting sibling claims in the
    /// same batch.
    pub error: Option<String>,
}

impl ClaimAllocation {
    /// Wraps a claim for scheduling.
    pub fn new(claim: Claim) -> Self {
        ClaimAllocation {
            claim,
            unsuitable_nodes: Vec::new(),
            allocation: None,
            error: None,
        }
    }
}

/// A committed claim-to-node binding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeBinding {
    /// The node the claim's devices were allocated on.
    pub node: String,
}

/// The allocation controller. One instance serves the whole cluster; all of
/// its collaborators are injected so tests can run it against an in-memory
/// record store.
pub struct Controller {
    api: Arc<dyn StateApi>,
    supported_resources: HashSet<String>,
    locks: NodeLocks,
    pending: PendingAllocations,
}

impl Controller {
    /// Returns a controller serving the device classes in `classes`, reading
    /// and writing node records through `api`.
    pub fn new(api: Arc<dyn StateApi>, classes: &DeviceClassConfig) -> Self {
        Controller {
            api,
            supported_resources: classes.resource_names(),
            locks: NodeLocks::default(),
            pending: PendingAllocations::default(),
        }
    }

    /// Checks that the claim requests a resource this driver serves.
    pub fn validate_claim(&self, claim: &Claim) -> anyhow::Result<()> {
        if !self.supported_resources.contains(&claim.resource_name) {
            anyhow::bail!(
                "unsupported pci resource '{}' requested by claim '{}'",
                claim.resource_name,
                claim.uid
            );
        }
        Ok(())
    }

    /// Evaluates every candidate node for the batch of claims, extending each
    /// claim's `unsuitable_nodes` and staging a tentative device selection
    /// for every (claim, node) pair that fits.
    pub async fn compute_unsuitable_nodes(
        &self,
        claims: &mut [ClaimAllocation],
        potential_nodes: &[String],
    ) {
        for node in potential_nodes {
            self.filter_node(claims, node).await;
        }
        for ca in claims.iter_mut() {
            dedupe(&mut ca.unsuitable_nodes);
        }
    }

    /// Commits a binding on the selected node for each claim in the batch.
    /// Claims fail individually; one claim's error never aborts its siblings.
    pub async fn allocate(&self, claims: &mut [ClaimAllocation], selected_node: &str) {
        for ca in claims.iter_mut() {
            let result = retry_on_conflict!(self.allocate_claim(&ca.claim, selected_node).await);
            match result {
                Ok(binding) => {
                    debug!(claim = %ca.claim.uid, node = %selected_node, "committed device binding");
                    ca.allocation = Some(binding);
                }
                Err(e) => {
                    warn!(claim = %ca.claim.uid, node = %selected_node, error = %e, "allocation failed");
                    ca.error = Some(format!(
                        "unable to allocate devices on node '{}': {}",
                        selected_node, e
                    ));
                }
            }
        }
    }

    /// Releases the claim's binding. A claim that never reached a node, or is
    /// absent from the node's record, deallocates as a no-op success.
    pub async fn deallocate(&self, claim: &Claim) -> Result<(), StateError> {
        self.pending.remove(&claim.uid);
        let node = match &claim.selected_node {
            Some(node) => node.clone(),
            None => return Ok(()),
        };
        retry_on_conflict!(self.deallocate_on_node(claim, &node).await)
    }

    async fn filter_node(&self, claims: &mut [ClaimAllocation], node: &str) {
        let _guard = self.locks.lock(node).await;

        let mut client = StateClient::new(node, self.api.clone());
        match client.get().await {
            Ok(()) => {}
            Err(StateError::NotFound) => {
                debug!(node = %node, "no state record published, node unsuitable");
                mark_all_unsuitable(claims, node);
                return;
            }
            Err(e) => {
                warn!(node = %node, error = %e, "unable to fetch state record, node unsuitable");
                mark_all_unsuitable(claims, node);
                return;
            }
        }
        if !client.is_ready() {
            debug!(node = %node, status = ?client.status(), "agent not ready, node unsuitable");
            mark_all_unsuitable(claims, node);
            return;
        }

        // Working view of the node's bindings: the durable allocated claims
        // plus every still-pending selection staged for this node. Entries
        // that made it into the record are no longer pending and are dropped.
        let mut view = client.spec().clone();
        self.pending.visit_node(node, |claim_uid, allocation| {
            if view.allocated_claims.contains_key(claim_uid) {
                Disposition::Discard
            } else {
                view.allocated_claims
                    .insert(claim_uid.to_string(), allocation.clone());
                Disposition::Retain
            }
        });

        let taken: HashSet<String> = view
            .allocated_claims
            .values()
            .flat_map(|allocation| allocation.device_ids())
            .map(str::to_string)
            .collect();
        // BTreeMap keyed by device id keeps selection deterministic across
        // runs instead of following map iteration order.
        let mut available: BTreeMap<String, String> = view
            .allocatable_devices
            .iter()
            .filter(|device| !taken.contains(device.id()))
            .map(|device| (device.id().to_string(), device.resource_name().to_string()))
            .collect();

        for ca in claims.iter_mut() {
            if view.allocated_claims.contains_key(&ca.claim.uid) {
                // Already bound (or already staged) on this node.
                continue;
            }
            if let Err(e) = self.validate_claim(&ca.claim) {
                warn!(claim = %ca.claim.uid, error = %e, "claim failed validation");
                ca.unsuitable_nodes.push(node.to_string());
                continue;
            }
            let pick = available
                .iter()
                .find(|(_, resource_name)| **resource_name == ca.claim.resource_name)
                .map(|(id, _)| id.clone());
            match pick {
                Some(id) => {
                    available.remove(&id);
                    self.pending.insert(
                        &ca.claim.uid,
                        node,
                        AllocatedDevices::pci(vec![id]),
                    );
                }
                None => ca.unsuitable_nodes.push(node.to_string()),
            }
        }
    }

    async fn allocate_claim(&self, claim: &Claim, node: &str) -> Result<NodeBinding, StateError> {
        let _guard = self.locks.lock(node).await;

        let mut client = StateClient::new(node, self.api.clone());
        client.get().await?;
        if !client.is_ready() {
            return Err(StateError::NotReady(client.status().cloned()));
        }

        if client.spec().allocated_claims.contains_key(&claim.uid) {
            // A previous attempt committed and its response was lost;
            // re-binding is a no-op success.
            return Ok(NodeBinding {
                node: node.to_string(),
            });
        }

        let staged = self
            .pending
            .get(&claim.uid, node)
            .ok_or_else(|| StateError::NotStaged {
                claim: claim.uid.clone(),
                node: node.to_string(),
            })?;

        let mut spec = client.spec().clone();
        spec.allocated_claims.insert(claim.uid.clone(), staged);
        client.update(spec).await?;

        // Only a durable write consumes the staged selection; a failed write
        // leaves it in place for the retry.
        self.pending.remove(&claim.uid);
        Ok(NodeBinding {
            node: node.to_string(),
        })
    }

    async fn deallocate_on_node(&self, claim: &Claim, node: &str) -> Result<(), StateError> {
        let _guard = self.locks.lock(node).await;

        let mut client = StateClient::new(node, self.api.clone());
        client.get().await?;
        if !client.spec().allocated_claims.contains_key(&claim.uid) {
            return Ok(());
        }

        let mut spec = client.spec().clone();
        spec.allocated_claims.remove(&claim.uid);
        client.update(spec).await
    }
}

fn mark_all_unsuitable(claims: &mut [ClaimAllocation], node: &str) {
    for ca in claims.iter_mut() {
        ca.unsuitable_nodes.push(node.to_string());
    }
}

fn dedupe(nodes: &mut Vec<String>) {
    let mut seen = HashSet::new();
    nodes.retain(|node| seen.insert(node.clone()));
}
