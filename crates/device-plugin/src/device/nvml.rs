//! NVIDIA binding through NVML.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::PoisonError;

use nvml_wrapper::Nvml;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::ContainerGrant;
use super::DeviceCapability;
use super::DeviceError;
use super::DeviceMapping;
use crate::monitor::HealthProbe;
use crate::state::Health;

const CONTROL_NODES: [&str; 3] = ["/dev/nvidiactl", "/dev/nvidia-uvm", "/dev/nvidia-uvm-tools"];

#[derive(Debug)]
pub struct NvmlDevices {
    /// `None` once released
    nvml: Mutex<Option<Nvml>>,
    /// Host directory holding the `nvidia<minor>` nodes probed for health.
    device_dir: PathBuf,
}

impl NvmlDevices {
    pub fn init(device_dir: impl Into<PathBuf>) -> Result<Self, DeviceError> {
        let nvml = match Nvml::init() {
            Ok(nvml) => nvml,
            Err(_) => {
                warn!("Standard NVML init failed, trying with explicit library path");
                Nvml::builder()
                    .lib_path(std::ffi::OsStr::new("libnvidia-ml.so.1"))
                    .init()?
            }
        };
        info!("NVML initialized successfully");
        Ok(Self {
            nvml: Mutex::new(Some(nvml)),
            device_dir: device_dir.into(),
        })
    }

    fn with_nvml<T>(
        &self,
        f: impl FnOnce(&Nvml) -> Result<T, DeviceError>,
    ) -> Result<T, DeviceError> {
        let guard = self.nvml.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(nvml) => f(nvml),
            None => Err(DeviceError::Released),
        }
    }
}

impl DeviceCapability for NvmlDevices {
    fn count(&self) -> Result<usize, DeviceError> {
        self.with_nvml(|nvml| Ok(nvml.device_count()? as usize))
    }

    fn enumerate(&self) -> Result<Vec<String>, DeviceError> {
        let count = self.count()?;
        Ok((0..count).map(|idx| idx.to_string()).collect())
    }

    fn grant(&self, ids: &[String]) -> Result<ContainerGrant, DeviceError> {
        self.with_nvml(|nvml| {
            let count = nvml.device_count()?;
            let mut grant = ContainerGrant::default();

            for node in CONTROL_NODES {
                grant.devices.push(DeviceMapping::new(node, node, "rwm"));
            }

            for (idx, id) in ids.iter().enumerate() {
                let index: u32 = id
                    .parse()
                    .ok()
                    .filter(|index| *index < count)
                    .ok_or_else(|| DeviceError::UnknownDevice(id.clone()))?;
                let minor = nvml.device_by_index(index)?.minor_number()?;
                grant.devices.push(DeviceMapping::new(
                    format!("/dev/nvidia{minor}"),
                    format!("/dev/nvidia{idx}"),
                    "rwm",
                ));
            }

            Ok(grant)
        })
    }

    fn release(&self) -> Result<(), DeviceError> {
        let nvml = self
            .nvml
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match nvml {
            Some(nvml) => {
                nvml.shutdown()?;
                info!("NVML shut down");
            }
            None => warn!("NVML already released"),
        }
        Ok(())
    }
}

/// Ids are NVML indices, so the host node is found through the device's minor
/// number rather than the id itself.
impl HealthProbe for NvmlDevices {
    fn probe(&self, id: &str) -> Health {
        let Ok(index) = id.parse::<u32>() else {
            return Health::Unhealthy;
        };
        let minor = self.with_nvml(|nvml| Ok(nvml.device_by_index(index)?.minor_number()?));
        node_health(&self.device_dir, minor)
    }
}

fn node_health(device_dir: &Path, minor: Result<u32, DeviceError>) -> Health {
    match minor {
        Ok(minor) if device_dir.join(format!("nvidia{minor}")).exists() => Health::Healthy,
        Ok(minor) => {
            debug!(minor, "device node is missing");
            Health::Unhealthy
        }
        Err(e) => {
            debug!("NVML health query failed: {e}");
            Health::Unhealthy
        }
    }
}
