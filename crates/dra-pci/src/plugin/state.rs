//! The agent's in-memory view of local devices and prepared claims.

use super::cdi::{self, CdiWriter};
use super::inventory::PciDevice;
use crate::client::StateError;
use crate::resource::{
    AllocatableDevice, AllocatablePci, AllocatedDevices, NodeDeviceStateSpec, PreparedDevices,
};
use std::collections::HashMap;

/// Tracks which local devices exist and which are exposed to containers,
/// keeping the CDI spec directory in step with every change. The record
/// sections the agent owns are rendered from this state on every write.
pub struct DeviceState {
    cdi: Box<dyn CdiWriter>,
    allocatable: HashMap<String, PciDevice>,
    prepared: HashMap<String, Vec<PciDevice>>,
}

impl DeviceState {
    /// Builds the state from one discovery pass and writes the common CDI
    /// spec.
    pub fn new(cdi: Box<dyn CdiWriter>, devices: Vec<PciDevice>) -> anyhow::Result<Self> {
        cdi.write_common_spec()?;
        Ok(DeviceState {
            cdi,
            allocatable: devices
                .into_iter()
                .map(|device| (device.uuid.clone(), device))
                .collect(),
            prepared: HashMap::new(),
        })
    }

    /// Whether the claim's devices are currently exposed.
    pub fn is_prepared(&self, claim_uid: &str) -> bool {
        self.prepared.contains_key(claim_uid)
    }

    /// Rebuilds the prepared-claims table from a record spec. Called once at
    /// startup so claims prepared by a previous agent process stay prepared.
    pub fn sync_prepared_from_spec(
        &mut self,
        spec: &NodeDeviceStateSpec,
    ) -> Result<(), StateError> {
        let mut prepared = HashMap::new();
        for (claim_uid, devices) in &spec.prepared_claims {
            prepared.insert(claim_uid.clone(), self.resolve(devices.device_ids())?);
        }
        self.prepared = prepared;
        Ok(())
    }

    /// Exposes the claim's allocated devices, writing their CDI spec, and
    /// returns the qualified device handles. Preparing an already-prepared
    /// claim returns the existing handles without touching anything.
    pub fn prepare(
        &mut self,
        claim_uid: &str,
        allocation: Option<&AllocatedDevices>,
    ) -> Result<Vec<String>, StateError> {
        if let Some(devices) = self.prepared.get(claim_uid) {
            return Ok(cdi::claim_handles(devices));
        }

        let allocation = allocation.ok_or_else(|| {
            StateError::Other(anyhow::anyhow!(
                "no devices allocated for claim '{}' on this node",
                claim_uid
            ))
        })?;
        let devices = self.resolve(allocation.device_ids())?;
        self.cdi.write_claim_spec(claim_uid, &devices)?;
        let handles = cdi::claim_handles(&devices);
        self.prepared.insert(claim_uid.to_string(), devices);
        Ok(handles)
    }

    /// Withdraws the claim's devices, removing their CDI spec. Unpreparing an
    /// unprepared claim is a no-op.
    pub fn unprepare(&mut self, claim_uid: &str) -> Result<(), StateError> {
        if !self.prepared.contains_key(claim_uid) {
            return Ok(());
        }
        self.cdi.remove_claim_spec(claim_uid)?;
        self.prepared.remove(claim_uid);
        Ok(())
    }

    /// Renders a record spec with the agent-owned sections replaced by this
    /// state. The controller-owned `allocatedClaims` section passes through
    /// from `base` untouched.
    pub fn get_updated_spec(&self, base: &NodeDeviceStateSpec) -> NodeDeviceStateSpec {
        let mut devices: Vec<&PciDevice> = self.allocatable.values().collect();
        devices.sort_by(|a, b| a.uuid.cmp(&b.uuid));

        let mut spec = base.clone();
        spec.allocatable_devices = devices
            .into_iter()
            .map(|device| {
                AllocatableDevice::Pci(AllocatablePci {
                    uuid: device.uuid.clone(),
                    resource_name: device.resource_name.clone(),
                    pci_address: device.pci_address.clone(),
                })
            })
            .collect();
        spec.prepared_claims = self
            .prepared
            .iter()
            .map(|(claim_uid, devices)| {
                (
                    claim_uid.clone(),
                    PreparedDevices::pci(devices.iter().map(|d| d.uuid.clone())),
                )
            })
            .collect();
        spec
    }

    fn resolve(&self, ids: Vec<&str>) -> Result<Vec<PciDevice>, StateError> {
        ids.into_iter()
            .map(|id| {
                self.allocatable
                    .get(id)
                    .cloned()
                    .ok_or_else(|| StateError::UnknownDevice(id.to_string()))
            })
            .collect()
    }
}
