//! End-to-end exercise of the controller/agent protocol over a shared
//! in-memory record store: bootstrap, filter, allocate, prepare, unprepare,
//! deallocate.

use crate::client::test_utils::*;
use crate::config::{DeviceClassConfig, DeviceSelector};
use crate::controller::{Claim, ClaimAllocation, Controller};
use crate::plugin::cdi::CdiDir;
use crate::plugin::inventory::{DeviceInventory, PciDevice};
use crate::plugin::{ClaimHandle, DeviceAgent};
use std::collections::HashMap;
use std::sync::Arc;

struct FixedInventory {
    devices: Vec<PciDevice>,
}

impl DeviceInventory for FixedInventory {
    fn discover(
        &self,
        _resource_filter: &HashMap<String, String>,
    ) -> anyhow::Result<Vec<PciDevice>> {
        Ok(self.devices.clone())
    }
}

fn pci_device(uuid: &str, address: &str, iommu_group: &str) -> PciDevice {
    PciDevice {
        uuid: uuid.to_string(),
        pci_id: "8086:0953".to_string(),
        resource_name: nvme_resource(),
        pci_address: address.to_string(),
        driver: "vfio-pci".to_string(),
        iommu_group: iommu_group.to_string(),
        numa_node: 0,
    }
}

fn classes() -> DeviceClassConfig {
    DeviceClassConfig {
        device_selectors: vec![DeviceSelector {
            pci_vendor_selector: "8086:0953".to_string(),
            resource_name: nvme_resource(),
        }],
    }
}

fn claim(uid: &str, node: Option<&str>) -> Claim {
    Claim {
        uid: uid.to_string(),
        resource_name: nvme_resource(),
        selected_node: node.map(str::to_string),
    }
}

fn handle(uid: &str) -> ClaimHandle {
    ClaimHandle {
        uid: uid.to_string(),
        name: format!("workload-{}", uid),
    }
}

#[tokio::test]
async fn full_claim_lifecycle() {
    let api = Arc::new(FakeStateApi::new());
    let cdi_root = tempfile::tempdir().unwrap();

    // The node comes up and publishes two NVMe devices.
    let agent = DeviceAgent::bootstrap(
        "node-1",
        &classes(),
        &FixedInventory {
            devices: vec![
                pci_device("dev-a", "0000:65:00.0", "7"),
                pci_device("dev-b", "0000:66:00.0", "8"),
            ],
        },
        Box::new(CdiDir::new(cdi_root.path())),
        api.clone(),
    )
    .await
    .unwrap();

    // Scheduling: two claims pass the filter and get disjoint devices.
    let controller = Controller::new(api.clone(), &classes());
    let mut allocations = vec![
        ClaimAllocation::new(claim("claim-1", None)),
        ClaimAllocation::new(claim("claim-2", None)),
    ];
    controller
        .compute_unsuitable_nodes(&mut allocations, &["node-1".to_string()])
        .await;
    assert!(allocations.iter().all(|a| a.unsuitable_nodes.is_empty()));

    controller.allocate(&mut allocations, "node-1").await;
    assert!(allocations.iter().all(|a| a.error.is_none()));
    assert!(allocations.iter().all(|a| a.allocation.is_some()));

    let stored = api.stored("node-1").unwrap();
    let first = stored.spec.allocated_claims.get("claim-1").unwrap();
    let second = stored.spec.allocated_claims.get("claim-2").unwrap();
    assert_ne!(first.device_ids(), second.device_ids());

    // A third claim finds the pool exhausted.
    let mut spill = vec![ClaimAllocation::new(claim("claim-3", None))];
    controller
        .compute_unsuitable_nodes(&mut spill, &["node-1".to_string()])
        .await;
    assert_eq!(spill[0].unsuitable_nodes, vec!["node-1".to_string()]);

    // The node prepares both claims and hands back CDI devices.
    let response = agent
        .prepare_claims(&[handle("claim-1"), handle("claim-2")])
        .await;
    for uid in ["claim-1", "claim-2"] {
        let entry = response.claims.get(uid).unwrap();
        assert!(entry.error.is_none(), "{:?}", entry.error);
        assert_eq!(entry.cdi_devices.len(), 2);
        assert_eq!(entry.cdi_devices[0], "k8s.dra-pci.passthru.io/pci=common");
    }
    // A repeated prepare is served from the existing exposure.
    let repeat = agent.prepare_claims(&[handle("claim-1")]).await;
    assert_eq!(
        repeat.claims.get("claim-1").unwrap().cdi_devices,
        response.claims.get("claim-1").unwrap().cdi_devices
    );

    // Teardown in the reverse order: unprepare, then deallocate.
    let response = agent.unprepare_claims(&[handle("claim-1")]).await;
    assert!(response.claims.get("claim-1").unwrap().error.is_none());
    controller
        .deallocate(&claim("claim-1", Some("node-1")))
        .await
        .unwrap();

    let stored = api.stored("node-1").unwrap();
    assert!(!stored.spec.allocated_claims.contains_key("claim-1"));
    assert!(!stored.spec.prepared_claims.contains_key("claim-1"));
    assert!(stored.spec.allocated_claims.contains_key("claim-2"));

    // The freed device is immediately allocatable again.
    let mut retry = vec![ClaimAllocation::new(claim("claim-3", None))];
    controller
        .compute_unsuitable_nodes(&mut retry, &["node-1".to_string()])
        .await;
    assert!(retry[0].unsuitable_nodes.is_empty());
}
