use dra_pci::client::KubeStateApi;
use dra_pci::config::DeviceClassConfig;
use dra_pci::plugin::cdi::{CdiDir, CDI_ROOT};
use dra_pci::plugin::inventory::SysfsInventory;
use dra_pci::DeviceAgent;
use std::path::PathBuf;
use std::sync::Arc;
use structopt::StructOpt;
use tracing::{error, info};

#[derive(StructOpt, Clone, Debug)]
#[structopt(
    name = "dra-pci-node",
    about = "Node agent exposing VFIO PCI passthrough devices to workloads"
)]
struct Opts {
    #[structopt(
        long = "node-name",
        env = "NODE_NAME",
        help = "The name of the node this agent runs on"
    )]
    node_name: String,

    #[structopt(
        long = "namespace",
        default_value = "dra-pci",
        env = "DRA_PCI_NAMESPACE",
        help = "The namespace holding the per-node state records"
    )]
    namespace: String,

    #[structopt(
        long = "cdi-root",
        default_value = CDI_ROOT,
        env = "CDI_ROOT",
        help = "The directory CDI spec files are written to"
    )]
    cdi_root: PathBuf,

    #[structopt(
        long = "device-classes",
        default_value = "/etc/dra-pci/device-classes.yaml",
        env = "DEVICE_CLASSES_FILE",
        help = "The path to the device class config"
    )]
    device_classes: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let opts = Opts::from_args();

    let classes = DeviceClassConfig::load(&opts.device_classes)?;
    let client = kube::Client::try_default().await?;
    let api = Arc::new(KubeStateApi::new(client, &opts.namespace));

    let agent = DeviceAgent::bootstrap(
        &opts.node_name,
        &classes,
        &SysfsInventory::default(),
        Box::new(CdiDir::new(&opts.cdi_root)),
        api,
    )
    .await?;
    info!(node = %opts.node_name, "device agent running");

    // The container runtime's resource plugin transport hands its prepare and
    // unprepare batches to `agent.prepare_claims` / `agent.unprepare_claims`.
    tokio::signal::ctrl_c().await?;
    info!("shutting down, marking node not ready");
    if let Err(e) = agent.shutdown().await {
        error!(error = %e, "unable to mark node not ready");
    }
    Ok(())
}
