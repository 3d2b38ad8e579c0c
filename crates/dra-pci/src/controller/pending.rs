//! Tentative allocation decisions staged during node filtering.

use crate::resource::AllocatedDevices;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// What to do with a staged entry after a reconciliation visit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// The entry is still pending; keep it.
    Retain,
    /// The entry has been durably committed (or is otherwise obsolete);
    /// drop it for every node.
    Discard,
}

/// Controller-local table of device selections made during node filtering,
/// keyed by (claim UID, node name). Filtering evaluates several candidate
/// nodes for the same claim before one is selected, and a selection must not
/// be recomputed at bind time nor claimed twice by different nodes, so it is
/// staged here until the binding commits or the claim goes away.
///
/// Internally synchronized; callers additionally hold the relevant per-node
/// lock, so no ordering beyond atomicity is required here.
#[derive(Clone, Default)]
pub struct PendingAllocations {
    claims: Arc<Mutex<HashMap<String, HashMap<String, AllocatedDevices>>>>,
}

impl PendingAllocations {
    /// Whether a selection is staged for the claim on the node.
    pub fn exists(&self, claim_uid: &str, node: &str) -> bool {
        self.claims
            .lock()
            .unwrap()
            .get(claim_uid)
            .map(|nodes| nodes.contains_key(node))
            .unwrap_or(false)
    }

    /// The staged selection for the claim on the node, if any.
    pub fn get(&self, claim_uid: &str, node: &str) -> Option<AllocatedDevices> {
        self.claims
            .lock()
            .unwrap()
            .get(claim_uid)
            .and_then(|nodes| nodes.get(node))
            .cloned()
    }

    /// Stages a selection for the claim on the node, replacing any previous
    /// one for the same pair.
    pub fn insert(&self, claim_uid: &str, node: &str, devices: AllocatedDevices) {
        self.claims
            .lock()
            .unwrap()
            .entry(claim_uid.to_string())
            .or_default()
            .insert(node.to_string(), devices);
    }

    /// Drops the claim's staged selections on every node.
    pub fn remove(&self, claim_uid: &str) {
        self.claims.lock().unwrap().remove(claim_uid);
    }

    /// Visits every claim staged for the node. Entries for which the visitor
    /// returns [`Disposition::Discard`] are removed (for every node, since a
    /// committed claim can no longer be pending anywhere).
    pub fn visit_node<F>(&self, node: &str, mut visit: F)
    where
        F: FnMut(&str, &AllocatedDevices) -> Disposition,
    {
        let mut claims = self.claims.lock().unwrap();
        let mut discard = Vec::new();
        for (claim_uid, nodes) in claims.iter() {
            if let Some(devices) = nodes.get(node) {
                if visit(claim_uid, devices) == Disposition::Discard {
                    discard.push(claim_uid.clone());
                }
            }
        }
        for claim_uid in discard {
            claims.remove(&claim_uid);
        }
    }
}
