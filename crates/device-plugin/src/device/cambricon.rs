//! Cambricon MLU binding backed by the host device nodes.

use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tracing::debug;
use tracing::warn;

use super::ContainerGrant;
use super::DeviceCapability;
use super::DeviceError;
use super::DeviceMapping;
use super::MountMapping;

pub(crate) const DEVICE_NODE_PREFIX: &str = "cambricon_dev";
const CONTROL_NODE: &str = "cambricon_ctl";
const CONTAINER_DEVICE_DIR: &str = "/dev";

/// Default location of the `cnmon` monitoring tool mounted into containers.
pub const DEFAULT_CNMON_PATH: &str = "/usr/bin/cnmon";

#[derive(Debug)]
pub struct CambriconDevices {
    /// Host directory holding `cambricon_dev<N>` and `cambricon_ctl`
    device_dir: PathBuf,
    cnmon_path: PathBuf,
    released: AtomicBool,
}

impl CambriconDevices {
    pub fn new(device_dir: impl Into<PathBuf>, cnmon_path: impl Into<PathBuf>) -> Self {
        Self {
            device_dir: device_dir.into(),
            cnmon_path: cnmon_path.into(),
            released: AtomicBool::new(false),
        }
    }

    /// Host path of the node backing device `id`.
    pub fn device_node(&self, id: &str) -> PathBuf {
        self.device_dir.join(format!("{DEVICE_NODE_PREFIX}{id}"))
    }

    fn control_node(&self) -> PathBuf {
        self.device_dir.join(CONTROL_NODE)
    }

    fn ensure_active(&self) -> Result<(), DeviceError> {
        if self.released.load(Ordering::Acquire) {
            return Err(DeviceError::Released);
        }
        Ok(())
    }

    /// Indices of every `cambricon_dev<N>` node, in ascending order.
    fn scan(&self) -> Result<Vec<u32>, DeviceError> {
        let pattern = format!(
            "{}/{DEVICE_NODE_PREFIX}*",
            self.device_dir.to_string_lossy()
        );
        let entries = glob::glob(&pattern).map_err(|source| DeviceError::Scan {
            pattern: pattern.clone(),
            source,
        })?;

        let mut indices: Vec<u32> = entries
            .filter_map(|entry| match entry {
                Ok(path) => node_index(&path),
                Err(e) => {
                    warn!("failed to inspect device node: {e}");
                    None
                }
            })
            .collect();
        indices.sort_unstable();
        indices.dedup();
        Ok(indices)
    }
}

fn node_index(path: &Path) -> Option<u32> {
    path.file_name()?
        .to_str()?
        .strip_prefix(DEVICE_NODE_PREFIX)?
        .parse()
        .ok()
}

impl DeviceCapability for CambriconDevices {
    fn count(&self) -> Result<usize, DeviceError> {
        self.ensure_active()?;
        Ok(self.scan()?.len())
    }

    fn enumerate(&self) -> Result<Vec<String>, DeviceError> {
        self.ensure_active()?;
        let ids: Vec<String> = self.scan()?.iter().map(u32::to_string).collect();
        debug!(?ids, "enumerated cambricon devices");
        Ok(ids)
    }

    fn grant(&self, ids: &[String]) -> Result<ContainerGrant, DeviceError> {
        self.ensure_active()?;
        let mut grant = ContainerGrant::default();

        let control = self.control_node();
        if control.exists() {
            grant.devices.push(DeviceMapping::new(
                &control,
                Path::new(CONTAINER_DEVICE_DIR).join(CONTROL_NODE),
                "rw",
            ));
        }

        for (idx, id) in ids.iter().enumerate() {
            let host_path = self.device_node(id);
            if !host_path.exists() {
                return Err(DeviceError::UnknownDevice(id.clone()));
            }
            grant.devices.push(DeviceMapping::new(
                host_path,
                Path::new(CONTAINER_DEVICE_DIR).join(format!("{DEVICE_NODE_PREFIX}{idx}")),
                "rw",
            ));
        }

        grant.mounts.push(MountMapping {
            host_path: self.cnmon_path.clone(),
            container_path: self.cnmon_path.clone(),
            read_only: true,
        });

        Ok(grant)
    }

    fn release(&self) -> Result<(), DeviceError> {
        if self.released.swap(true, Ordering::AcqRel) {
            debug!("cambricon devices already released");
        }
        Ok(())
    }
}
