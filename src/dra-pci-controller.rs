use dra_pci::client::KubeStateApi;
use dra_pci::config::DeviceClassConfig;
use dra_pci::Controller;
use std::path::PathBuf;
use std::sync::Arc;
use structopt::StructOpt;
use tracing::info;

#[derive(StructOpt, Clone, Debug)]
#[structopt(
    name = "dra-pci-controller",
    about = "Cluster controller allocating VFIO PCI passthrough devices to claims"
)]
struct Opts {
    #[structopt(
        long = "namespace",
        default_value = "dra-pci",
        env = "DRA_PCI_NAMESPACE",
        help = "The namespace holding the per-node state records"
    )]
    namespace: String,

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

    // The scheduler-facing transport drives `controller.compute_unsuitable_nodes`,
    // `controller.allocate`, and `controller.deallocate` for each claim batch.
    let _controller = Controller::new(api, &classes);
    info!(namespace = %opts.namespace, "allocation controller running");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
