//! Driver configuration: which PCI devices the driver manages and what
//! resource name each maps to.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// The device classes served by this driver, loaded from a YAML file shared
/// by the controller and every node agent. The controller validates claims
/// against the listed resource names; the agent uses the vendor selectors as
/// its discovery filter.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeviceClassConfig {
    /// One selector per managed device class.
    pub device_selectors: Vec<DeviceSelector>,
}

/// Maps a PCI vendor:device id to the logical resource name it satisfies.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSelector {
    /// Lower-case `vendor:device` id pair, e.g. `8086:0953`.
    pub pci_vendor_selector: String,
    /// The resource name requested by claims, e.g. `devices.passthru.io/nvme`.
    pub resource_name: String,
}

impl DeviceClassConfig {
    /// Loads the config from a YAML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("unable to open device class config {:?}", path))?;
        let config: DeviceClassConfig = serde_yaml::from_reader(file)
            .with_context(|| format!("unable to parse device class config {:?}", path))?;
        Ok(config)
    }

    /// Resource names of every managed device class.
    pub fn resource_names(&self) -> HashSet<String> {
        self.device_selectors
            .iter()
            .map(|s| s.resource_name.clone())
            .collect()
    }

    /// Discovery filter keyed by lower-cased vendor selector.
    pub fn discovery_filter(&self) -> HashMap<String, String> {
        self.device_selectors
            .iter()
            .map(|s| (s.pci_vendor_selector.to_lowercase(), s.resource_name.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_yaml_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "deviceSelectors:\n- pciVendorSelector: \"8086:0953\"\n  resourceName: devices.passthru.io/nvme"
        )
        .unwrap();
        let config = DeviceClassConfig::load(file.path()).unwrap();
        assert_eq!(config.device_selectors.len(), 1);
        assert!(config
            .resource_names()
            .contains("devices.passthru.io/nvme"));
        assert_eq!(
            config.discovery_filter().get("8086:0953").unwrap(),
            "devices.passthru.io/nvme"
        );
    }

    #[test]
    fn filter_lowercases_vendor_selectors() {
        let config = DeviceClassConfig {
            device_selectors: vec![DeviceSelector {
                pci_vendor_selector: "10DE:2204".to_string(),
                resource_name: "devices.passthru.io/gpu".to_string(),
            }],
        };
        assert!(config.discovery_filter().contains_key("10de:2204"));
    }
}
