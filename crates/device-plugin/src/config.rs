use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use utils::version;

use crate::device::cambricon::DEFAULT_CNMON_PATH;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve devices to the kubelet until interrupted
    Run(RunArgs),
}

/// Hardware binding serving the devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Cambricon MLU cards, discovered from their device nodes
    Cambricon,
    /// NVIDIA GPUs, discovered through NVML
    Nvml,
}

#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    #[arg(
        long,
        env = "DEVICE_PLUGIN_SOCKET",
        value_hint = clap::ValueHint::FilePath,
        default_value = "/var/lib/kubelet/device-plugins/cambricon.sock",
        help = "Unix socket the device plugin listens on"
    )]
    pub socket: PathBuf,

    #[arg(
        long,
        env = "KUBELET_SOCKET",
        value_hint = clap::ValueHint::FilePath,
        default_value = crate::api::KUBELET_SOCKET,
        help = "Kubelet registration socket"
    )]
    pub kubelet_socket: PathBuf,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_RESOURCE_NAME",
        default_value = "openi.pcl.ac.cn/cambricon",
        help = "Resource name the devices are advertised under"
    )]
    pub resource_name: String,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_BACKEND",
        value_enum,
        default_value_t = Backend::Cambricon,
        help = "Hardware binding used to enumerate and grant devices"
    )]
    pub backend: Backend,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_DEVICE_DIR",
        value_hint = clap::ValueHint::DirPath,
        default_value = "/dev",
        help = "Host directory holding the device nodes"
    )]
    pub device_dir: PathBuf,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_CNMON_PATH",
        value_hint = clap::ValueHint::FilePath,
        default_value = DEFAULT_CNMON_PATH,
        help = "cnmon binary mounted read-only into containers"
    )]
    pub cnmon_path: PathBuf,

    #[arg(
        long,
        default_value = "5",
        help = "Timeout in seconds for the startup self-check and the kubelet dial"
    )]
    pub dial_timeout_secs: u64,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_HEALTH_INTERVAL",
        default_value = "10",
        help = "Seconds between device health probes, 0 disables probing"
    )]
    pub health_interval_secs: u64,
}

impl RunArgs {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    /// `None` when health probing is disabled.
    pub fn health_interval(&self) -> Option<Duration> {
        (self.health_interval_secs > 0).then(|| Duration::from_secs(self.health_interval_secs))
    }
}
