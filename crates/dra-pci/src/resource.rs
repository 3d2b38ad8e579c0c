//! The `NodeDeviceState` custom resource: the per-node record shared between
//! the allocation controller and the device agent.
//!
//! Each of the three spec sections has exactly one authoritative writer. The
//! agent owns `allocatableDevices` and `preparedClaims`; the controller owns
//! `allocatedClaims`. Reads cross that boundary freely, and consistency is
//! kept through the record's `resourceVersion` token rather than any
//! cross-process lock.

use kube::CustomResource;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Name of this resource driver, as reported to the container runtime.
pub const DRIVER_NAME: &str = "dra-pci.passthru.io";

/// Spec of the per-node allocation state record.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default)]
#[kube(
    group = "resource.passthru.io",
    version = "v1alpha1",
    kind = "NodeDeviceState",
    namespaced,
    status = "NodeDeviceStateStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct NodeDeviceStateSpec {
    /// Devices present on the node and available for allocation. Written only
    /// by the node's device agent.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allocatable_devices: Vec<AllocatableDevice>,
    /// Devices bound to claims, keyed by claim UID. Written only by the
    /// controller.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub allocated_claims: HashMap<String, AllocatedDevices>,
    /// Devices exposed to the container runtime, keyed by claim UID. Written
    /// only by the node's device agent. Never contains a claim absent from
    /// `allocated_claims`.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub prepared_claims: HashMap<String, PreparedDevices>,
}

/// Readiness of a node's device agent. The controller never selects a node
/// whose record is not `Ready`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum NodeDeviceStateStatus {
    /// The agent has not yet published its device inventory.
    NotReady,
    /// The inventory is published and prepare calls will be served.
    Ready,
}

/// An allocatable device advertised by a node, reduced to its public fields.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum AllocatableDevice {
    /// A PCI device isolated behind the VFIO passthrough driver.
    Pci(AllocatablePci),
}

impl AllocatableDevice {
    /// The device's generated unique id.
    pub fn id(&self) -> &str {
        match self {
            AllocatableDevice::Pci(pci) => &pci.uuid,
        }
    }

    /// The logical resource name this device satisfies.
    pub fn resource_name(&self) -> &str {
        match self {
            AllocatableDevice::Pci(pci) => &pci.resource_name,
        }
    }
}

/// Public fields of an allocatable PCI device.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AllocatablePci {
    /// Generated unique id, stable for the agent's process lifetime.
    pub uuid: String,
    /// Logical resource name, e.g. `devices.passthru.io/nvme`.
    pub resource_name: String,
    /// PCI bus address, e.g. `0000:65:00.0`.
    pub pci_address: String,
}

/// The set of devices bound to one claim.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum AllocatedDevices {
    /// PCI devices, referenced by id.
    Pci(AllocatedPcis),
}

impl AllocatedDevices {
    /// Builds a PCI allocation from device ids.
    pub fn pci<I>(ids: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        AllocatedDevices::Pci(AllocatedPcis {
            devices: ids
                .into_iter()
                .map(|uuid| AllocatedPci { uuid })
                .collect(),
        })
    }

    /// Ids of every device in the allocation.
    pub fn device_ids(&self) -> Vec<&str> {
        match self {
            AllocatedDevices::Pci(pcis) => {
                pcis.devices.iter().map(|d| d.uuid.as_str()).collect()
            }
        }
    }
}

/// A set of allocated PCI devices.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AllocatedPcis {
    /// The allocated devices.
    pub devices: Vec<AllocatedPci>,
}

/// One allocated PCI device.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AllocatedPci {
    /// Id of the allocatable device this allocation refers to.
    pub uuid: String,
}

/// The set of devices a node has exposed for one claim.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum PreparedDevices {
    /// PCI devices, referenced by id.
    Pci(PreparedPcis),
}

impl PreparedDevices {
    /// Builds a PCI prepared set from device ids.
    pub fn pci<I>(ids: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        PreparedDevices::Pci(PreparedPcis {
            devices: ids.into_iter().map(|uuid| PreparedPci { uuid }).collect(),
        })
    }

    /// Ids of every prepared device.
    pub fn device_ids(&self) -> Vec<&str> {
        match self {
            PreparedDevices::Pci(pcis) => {
                pcis.devices.iter().map(|d| d.uuid.as_str()).collect()
            }
        }
    }
}

/// A set of prepared PCI devices.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PreparedPcis {
    /// The prepared devices.
    pub devices: Vec<PreparedPci>,
}

/// One prepared PCI device.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PreparedPci {
    /// Id of the allocatable device this entry refers to.
    pub uuid: String,
}
