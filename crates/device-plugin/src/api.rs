//! Generated device plugin API (`v1beta1`) and conversions from the plugin's
//! own types.
#![allow(clippy::doc_markdown)]

mod v1beta1 {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");
}

pub use v1beta1::*;

use crate::device::ContainerGrant;
use crate::state::DeviceRecord;

/// API version sent to the kubelet on registration.
pub const VERSION: &str = "v1beta1";

/// The kubelet's registration socket.
pub const KUBELET_SOCKET: &str = "/var/lib/kubelet/device-plugins/kubelet.sock";

impl From<&DeviceRecord> for Device {
    fn from(record: &DeviceRecord) -> Self {
        Device {
            id: record.id.clone(),
            health: record.health.to_string(),
            topology: None,
        }
    }
}

impl From<ContainerGrant> for ContainerAllocateResponse {
    fn from(grant: ContainerGrant) -> Self {
        ContainerAllocateResponse {
            devices: grant
                .devices
                .into_iter()
                .map(|d| DeviceSpec {
                    container_path: d.container_path.to_string_lossy().into_owned(),
                    host_path: d.host_path.to_string_lossy().into_owned(),
                    permissions: d.permissions,
                })
                .collect(),
            mounts: grant
                .mounts
                .into_iter()
                .map(|m| Mount {
                    container_path: m.container_path.to_string_lossy().into_owned(),
                    host_path: m.host_path.to_string_lossy().into_owned(),
                    read_only: m.read_only,
                })
                .collect(),
            ..Default::default()
        }
    }
}

/// Wire form of a full device list.
pub fn list_response(devices: &[DeviceRecord]) -> ListAndWatchResponse {
    ListAndWatchResponse {
        devices: devices.iter().map(Device::from).collect(),
    }
}
