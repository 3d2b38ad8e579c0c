//! CDI spec files describing how prepared devices reach a container.
//!
//! The agent maintains one spec file per prepared claim plus a common spec
//! shared by every claim. Container runtimes resolve the qualified device
//! handles returned from a prepare call against these files.

use super::inventory::PciDevice;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// CDI vendor string for this driver's devices.
pub const CDI_VENDOR: &str = "k8s.dra-pci.passthru.io";
/// CDI device class.
pub const CDI_CLASS: &str = "pci";
/// Name of the synthetic device carrying edits common to every claim.
pub const CDI_COMMON_DEVICE: &str = "common";
/// CDI specification version written into every spec file.
pub const CDI_VERSION: &str = "0.5.0";
/// Default directory container runtimes read CDI specs from.
pub const CDI_ROOT: &str = "/var/run/cdi";

/// The VFIO control node every passthrough container needs.
pub const VFIO_CONTROL_NODE: &str = "/dev/vfio/vfio";
/// Directory holding per-IOMMU-group VFIO device nodes.
pub const VFIO_DEVICE_DIR: &str = "/dev/vfio";

/// Prefix of the env vars advertising device addresses to the container.
pub const PCI_RESOURCE_PREFIX: &str = "PCI_RESOURCE";

// The VFIO nodes are chowned to the qemu user so an unprivileged virt
// launcher can open them.
const QEMU_UID: u32 = 107;
const QEMU_GID: u32 = 107;
const VFIO_NODE_PERMISSIONS: &str = "mrw";

/// One CDI spec file.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CdiSpec {
    /// CDI spec format version.
    pub cdi_version: String,
    /// `vendor/class` pair qualifying every device in the file.
    pub kind: String,
    /// Devices described by this spec.
    pub devices: Vec<CdiDevice>,
}

/// A named device inside a CDI spec.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CdiDevice {
    /// Device name, qualified by the spec's kind.
    pub name: String,
    /// Edits applied to containers requesting this device.
    pub container_edits: ContainerEdits,
}

/// Container modifications attached to a CDI device.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerEdits {
    /// Environment variables added to the container.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// Device nodes created in the container.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_nodes: Vec<DeviceNode>,
}

/// A device node created in the container.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceNode {
    /// Path of the node inside the container.
    pub path: String,
    /// Cgroup access permissions granted on the node.
    pub permissions: String,
    /// Owning user id of the node.
    pub uid: u32,
    /// Owning group id of the node.
    pub gid: u32,
}

/// Maintains the driver's CDI spec files. Implemented against a spec
/// directory in production and against a temp directory in tests.
pub trait CdiWriter: Send + Sync {
    /// Writes the spec carrying the common container edits.
    fn write_common_spec(&self) -> anyhow::Result<()>;
    /// Writes the spec for one claim's devices, replacing any previous one.
    fn write_claim_spec(&self, claim_uid: &str, devices: &[PciDevice]) -> anyhow::Result<()>;
    /// Removes the claim's spec file. Removing an absent spec is a no-op.
    fn remove_claim_spec(&self, claim_uid: &str) -> anyhow::Result<()>;
}

/// The qualified handle for a named CDI device.
pub fn qualified_name(device: &str) -> String {
    format!("{}/{}={}", CDI_VENDOR, CDI_CLASS, device)
}

/// The handles a prepared claim reports to the container runtime: the common
/// device plus one handle per passthrough device.
pub fn claim_handles(devices: &[PciDevice]) -> Vec<String> {
    std::iter::once(qualified_name(CDI_COMMON_DEVICE))
        .chain(devices.iter().map(|device| qualified_name(&device.uuid)))
        .collect()
}

/// Env var name advertising a device of `resource_name`, e.g.
/// `PCI_RESOURCE_DEVICES_PASSTHRU_IO_NVME`.
pub fn resource_name_to_env_var(prefix: &str, resource_name: &str) -> String {
    let sanitized = resource_name
        .replace('/', "_")
        .replace('.', "_")
        .replace('-', "_")
        .to_uppercase();
    format!("{}_{}", prefix, sanitized)
}

/// [`CdiWriter`] backed by a spec directory.
pub struct CdiDir {
    root: PathBuf,
}

impl CdiDir {
    /// Returns a writer rooted at `root`, normally [`CDI_ROOT`].
    pub fn new(root: impl Into<PathBuf>) -> Self {
        CdiDir { root: root.into() }
    }

    fn spec_path(&self, name: &str) -> PathBuf {
        self.root
            .join(format!("{}-{}-{}.json", CDI_VENDOR, CDI_CLASS, name))
    }

    fn write_spec(&self, name: &str, devices: Vec<CdiDevice>) -> anyhow::Result<()> {
        let spec = CdiSpec {
            cdi_version: CDI_VERSION.to_string(),
            kind: format!("{}/{}", CDI_VENDOR, CDI_CLASS),
            devices,
        };
        let path = self.spec_path(name);
        let file = std::fs::File::create(&path)
            .with_context(|| format!("unable to create cdi spec {:?}", path))?;
        serde_json::to_writer_pretty(file, &spec)
            .with_context(|| format!("unable to write cdi spec {:?}", path))?;
        Ok(())
    }
}

impl CdiWriter for CdiDir {
    fn write_common_spec(&self) -> anyhow::Result<()> {
        let common = CdiDevice {
            name: CDI_COMMON_DEVICE.to_string(),
            container_edits: ContainerEdits {
                env: vec![format!(
                    "{}_DRIVER={}",
                    PCI_RESOURCE_PREFIX,
                    crate::resource::DRIVER_NAME
                )],
                device_nodes: vec![DeviceNode {
                    path: VFIO_CONTROL_NODE.to_string(),
                    permissions: VFIO_NODE_PERMISSIONS.to_string(),
                    uid: QEMU_UID,
                    gid: QEMU_GID,
                }],
            },
        };
        self.write_spec(CDI_COMMON_DEVICE, vec![common])
    }

    fn write_claim_spec(&self, claim_uid: &str, devices: &[PciDevice]) -> anyhow::Result<()> {
        let devices = devices
            .iter()
            .map(|device| CdiDevice {
                name: device.uuid.clone(),
                container_edits: ContainerEdits {
                    env: vec![format!(
                        "{}={}",
                        resource_name_to_env_var(PCI_RESOURCE_PREFIX, &device.resource_name),
                        device.pci_address
                    )],
                    device_nodes: vec![DeviceNode {
                        path: format!("{}/{}", VFIO_DEVICE_DIR, device.iommu_group),
                        permissions: VFIO_NODE_PERMISSIONS.to_string(),
                        uid: QEMU_UID,
                        gid: QEMU_GID,
                    }],
                },
            })
            .collect();
        self.write_spec(claim_uid, devices)
    }

    fn remove_claim_spec(&self, claim_uid: &str) -> anyhow::Result<()> {
        let path = self.spec_path(claim_uid);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("unable to remove cdi spec {:?}", path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nvme_device(uuid: &str, address: &str, iommu_group: &str) -> PciDevice {
        PciDevice {
            uuid: uuid.to_string(),
            pci_id: "8086:0953".to_string(),
            resource_name: "devices.passthru.io/nvme".to_string(),
            pci_address: address.to_string(),
            driver: "vfio-pci".to_string(),
            iommu_group: iommu_group.to_string(),
            numa_node: 0,
        }
    }

    fn read_spec(dir: &CdiDir, name: &str) -> CdiSpec {
        let raw = std::fs::read_to_string(dir.spec_path(name)).unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    #[test]
    fn common_spec_carries_the_vfio_control_node() {
        let root = tempfile::tempdir().unwrap();
        let dir = CdiDir::new(root.path());
        dir.write_common_spec().unwrap();

        let spec = read_spec(&dir, CDI_COMMON_DEVICE);
        assert_eq!(spec.cdi_version, CDI_VERSION);
        assert_eq!(spec.kind, "k8s.dra-pci.passthru.io/pci");
        assert_eq!(spec.devices.len(), 1);
        let edits = &spec.devices[0].container_edits;
        assert_eq!(edits.device_nodes[0].path, "/dev/vfio/vfio");
        assert_eq!(edits.device_nodes[0].permissions, "mrw");
        assert_eq!(edits.device_nodes[0].uid, 107);
        assert_eq!(edits.device_nodes[0].gid, 107);
    }

    #[test]
    fn claim_spec_names_devices_by_id() {
        let root = tempfile::tempdir().unwrap();
        let dir = CdiDir::new(root.path());
        dir.write_claim_spec("claim-1", &[nvme_device("dev-a", "0000:00:1d.0", "7")])
            .unwrap();

        let spec = read_spec(&dir, "claim-1");
        assert_eq!(spec.devices.len(), 1);
        assert_eq!(spec.devices[0].name, "dev-a");
        let edits = &spec.devices[0].container_edits;
        assert_eq!(
            edits.env,
            vec!["PCI_RESOURCE_DEVICES_PASSTHRU_IO_NVME=0000:00:1d.0".to_string()]
        );
        assert_eq!(edits.device_nodes[0].path, "/dev/vfio/7");
    }

    #[test]
    fn remove_claim_spec_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let dir = CdiDir::new(root.path());
        dir.write_claim_spec("claim-1", &[nvme_device("dev-a", "0000:00:1d.0", "7")])
            .unwrap();
        dir.remove_claim_spec("claim-1").unwrap();
        assert!(!dir.spec_path("claim-1").exists());
        dir.remove_claim_spec("claim-1").unwrap();
    }

    #[test]
    fn handles_qualify_common_and_each_device() {
        let devices = vec![
            nvme_device("dev-a", "0000:00:1d.0", "7"),
            nvme_device("dev-b", "0000:00:1e.0", "8"),
        ];
        assert_eq!(
            claim_handles(&devices),
            vec![
                "k8s.dra-pci.passthru.io/pci=common".to_string(),
                "k8s.dra-pci.passthru.io/pci=dev-a".to_string(),
                "k8s.dra-pci.passthru.io/pci=dev-b".to_string(),
            ]
        );
    }

    #[test]
    fn env_var_names_are_sanitized() {
        assert_eq!(
            resource_name_to_env_var(PCI_RESOURCE_PREFIX, "devices.passthru.io/nvme-fast"),
            "PCI_RESOURCE_DEVICES_PASSTHRU_IO_NVME_FAST"
        );
    }
}
