//! Per-node mutexes serializing the controller's read-modify-write spans.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

/// One async mutex per node name, created on first use and kept for the life
/// of the controller process (the node count is assumed bounded). Two
/// scheduling attempts for different claims on the same node must not race on
/// the same free-device pool, so every operation that reads then writes a
/// node's state record holds that node's lock for the whole span.
#[derive(Clone, Default)]
pub struct NodeLocks {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl NodeLocks {
    /// Acquires the named node's lock, returning an owned guard that releases
    /// on every exit path.
    pub async fn lock(&self, node: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap();
            locks.entry(node.to_string()).or_default().clone()
        };
        mutex.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_node_is_serialized() {
        let locks = NodeLocks::default();
        let guard = locks.lock("node-1").await;
        let blocked = tokio::time::timeout(Duration::from_millis(20), locks.lock("node-1")).await;
        assert!(blocked.is_err());
        drop(guard);
        tokio::time::timeout(Duration::from_millis(20), locks.lock("node-1"))
            .await
            .expect("lock should be free after guard drop");
    }

    #[tokio::test]
    async fn different_nodes_are_independent(){
        let locks = NodeLocks::default();
        let _guard = locks.lock("node-1").await;
        tokio::time::timeout(Duration::from_millis(20), locks.lock("node-2"))
            .await
            .expect("other node's lock should be free");
    }
}
