//! PCI device discovery over sysfs.

use anyhow::Context;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Driver a device must be bound to before it can be passed through.
pub const VFIO_DRIVER: &str = "vfio-pci";

const SYSFS_PCI_DEVICES: &str = "/sys/bus/pci/devices";

/// A passthrough-capable PCI device found on the node.
#[derive(Clone, Debug, PartialEq)]
pub struct PciDevice {
    /// Generated unique id, stable for the agent's process lifetime.
    pub uuid: String,
    /// Lower-case `vendor:device` id pair from the device's uevent.
    pub pci_id: String,
    /// Logical resource name the device satisfies.
    pub resource_name: String,
    /// PCI bus address, e.g. `0000:65:00.0`.
    pub pci_address: String,
    /// Kernel driver the device is bound to. Always [`VFIO_DRIVER`].
    pub driver: String,
    /// IOMMU group number, which names the VFIO device node.
    pub iommu_group: String,
    /// NUMA node of the device, `-1` when unknown.
    pub numa_node: i64,
}

/// Enumerates the node's passthrough-capable devices. The filter maps
/// lower-case `vendor:device` pairs to the resource name they satisfy;
/// devices outside the filter, and devices not bound to the VFIO driver,
/// are skipped.
pub trait DeviceInventory: Send + Sync {
    /// Runs one discovery pass. Every returned device carries a freshly
    /// generated id, so discovery is run once per process and the result
    /// reused for all later lookups.
    fn discover(&self, resource_filter: &HashMap<String, String>)
        -> anyhow::Result<Vec<PciDevice>>;
}

/// [`DeviceInventory`] reading the kernel's PCI device tree.
pub struct SysfsInventory {
    base_path: PathBuf,
}

impl Default for SysfsInventory {
    fn default() -> Self {
        SysfsInventory {
            base_path: PathBuf::from(SYSFS_PCI_DEVICES),
        }
    }
}

impl SysfsInventory {
    /// Returns an inventory rooted at an alternate device tree. Used by tests
    /// and by agents running with the host sysfs mounted elsewhere.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        SysfsInventory {
            base_path: base_path.into(),
        }
    }

    fn read_device(
        &self,
        address: &str,
        resource_filter: &HashMap<String, String>,
    ) -> anyhow::Result<Option<PciDevice>> {
        let device_path = self.base_path.join(address);

        let pci_id = match read_pci_id(&device_path)? {
            Some(id) => id,
            None => return Ok(None),
        };
        let resource_name = match resource_filter.get(&pci_id) {
            Some(name) => name.clone(),
            None => return Ok(None),
        };

        let driver = read_link_basename(&device_path.join("driver"))
            .context("device has no bound driver")?;
        if driver != VFIO_DRIVER {
            debug!(address = %address, driver = %driver, "device not bound to vfio-pci, skipping");
            return Ok(None);
        }

        let iommu_group = read_link_basename(&device_path.join("iommu_group"))
            .context("device has no iommu group")?;
        let numa_node = read_numa_node(&device_path);

        Ok(Some(PciDevice {
            uuid: Uuid::new_v4().to_string(),
            pci_id,
            resource_name,
            pci_address: address.to_string(),
            driver,
            iommu_group,
            numa_node,
        }))
    }
}

impl DeviceInventory for SysfsInventory {
    fn discover(
        &self,
        resource_filter: &HashMap<String, String>,
    ) -> anyhow::Result<Vec<PciDevice>> {
        let entries = std::fs::read_dir(&self.base_path)
            .with_context(|| format!("unable to list pci devices in {:?}", self.base_path))?;

        let mut devices = Vec::new();
        for entry in entries {
            let entry = entry?;
            let address = entry.file_name().to_string_lossy().into_owned();
            match self.read_device(&address, resource_filter) {
                Ok(Some(device)) => {
                    debug!(
                        address = %device.pci_address,
                        resource = %device.resource_name,
                        iommu_group = %device.iommu_group,
                        "discovered passthrough device"
                    );
                    devices.push(device);
                }
                Ok(None) => {}
                // A single unreadable device must not hide the rest of the
                // inventory.
                Err(e) => warn!(address = %address, error = %e, "skipping unreadable pci device"),
            }
        }
        Ok(devices)
    }
}

/// The lower-cased `vendor:device` pair from the device's uevent, or `None`
/// if the uevent carries no `PCI_ID` line.
fn read_pci_id(device_path: &Path) -> anyhow::Result<Option<String>> {
    let uevent = std::fs::read_to_string(device_path.join("uevent"))
        .context("unable to read device uevent")?;
    Ok(uevent.lines().find_map(|line| {
        line.strip_prefix("PCI_ID=")
            .map(|id| id.trim().to_lowercase())
    }))
}

fn read_link_basename(path: &Path) -> anyhow::Result<String> {
    let target = std::fs::read_link(path).with_context(|| format!("unable to resolve {:?}", path))?;
    let name = target
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("link {:?} has no basename", path))?;
    Ok(name.to_string_lossy().into_owned())
}

fn read_numa_node(device_path: &Path) -> i64 {
    std::fs::read_to_string(device_path.join("numa_node"))
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(-1)
}
