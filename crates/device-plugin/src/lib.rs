//! Kubernetes device plugin for accelerator cards.
//!
//! [`server::PluginServer`] serves the kubelet's device plugin API over a
//! Unix socket, [`lifecycle::Lifecycle`] orders startup and registration, and
//! [`device::DeviceCapability`] is the only place vendor specifics enter.

pub mod api;
pub mod config;
pub mod device;
pub mod error;
pub mod lifecycle;
pub mod monitor;
pub mod registration;
pub mod server;
pub mod state;
mod transport;
