//! Hardware binding seam.
//!
//! The server only sees devices through [`DeviceCapability`]: how many there
//! are, their identifiers, the grant for a set of identifiers, and a final
//! release. Each vendor binding is one implementation, picked at startup from
//! configuration by [`open`].

pub mod cambricon;
pub mod mock;
pub mod nvml;

use std::path::PathBuf;
use std::sync::Arc;

use nvml_wrapper::error::NvmlError;
use thiserror::Error;

use crate::config::Backend;
use crate::config::RunArgs;
use crate::monitor::DeviceNodeProbe;
use crate::monitor::HealthProbe;

pub use cambricon::CambriconDevices;
pub use mock::MockDevices;
pub use nvml::NvmlDevices;

/// Errors raised by a hardware binding.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("unknown device `{0}`")]
    UnknownDevice(String),
    #[error("devices have already been released")]
    Released,
    #[error("driver error: {0}")]
    Driver(String),
    #[error("failed to scan device nodes matching `{pattern}`")]
    Scan {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
    #[error("nvml: {0}")]
    Nvml(#[from] NvmlError),
}

/// A host device node exposed inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMapping {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    /// cgroup permissions, any of `r`, `w`, `m`
    pub permissions: String,
}

impl DeviceMapping {
    pub fn new(
        host_path: impl Into<PathBuf>,
        container_path: impl Into<PathBuf>,
        permissions: &str,
    ) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            permissions: permissions.to_string(),
        }
    }
}

/// A host file or directory mounted inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountMapping {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    pub read_only: bool,
}

/// Everything one container needs to reach its devices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerGrant {
    pub devices: Vec<DeviceMapping>,
    pub mounts: Vec<MountMapping>,
}

/// Contract between the plugin core and a hardware binding.
pub trait DeviceCapability: Send + Sync + std::fmt::Debug {
    /// Number of devices present on the host.
    fn count(&self) -> Result<usize, DeviceError>;

    /// Device identifiers in advertisement order.
    fn enumerate(&self) -> Result<Vec<String>, DeviceError>;

    /// Device nodes and mounts for a container requesting `ids`.
    fn grant(&self, ids: &[String]) -> Result<ContainerGrant, DeviceError>;

    /// Release the binding. Called once during teardown.
    fn release(&self) -> Result<(), DeviceError>;
}

/// An opened binding together with the probe that watches its devices.
pub struct OpenedBackend {
    pub capability: Arc<dyn DeviceCapability>,
    pub probe: Arc<dyn HealthProbe>,
}

/// Open the hardware binding selected by `args`.
pub fn open(args: &RunArgs) -> Result<OpenedBackend, DeviceError> {
    let opened = match args.backend {
        Backend::Cambricon => OpenedBackend {
            capability: Arc::new(CambriconDevices::new(
                args.device_dir.clone(),
                args.cnmon_path.clone(),
            )),
            probe: Arc::new(DeviceNodeProbe::new(
                args.device_dir.join(cambricon::DEVICE_NODE_PREFIX),
            )),
        },
        Backend::Nvml => {
            let nvml = Arc::new(NvmlDevices::init(args.device_dir.clone())?);
            OpenedBackend {
                capability: nvml.clone(),
                probe: nvml,
            }
        }
    };
    let count = opened.capability.count()?;
    tracing::info!(backend = ?args.backend, count, "opened device backend");
    Ok(opened)
}
