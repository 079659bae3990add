use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by the device plugin server and its lifecycle.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("failed to enumerate devices")]
    Enumerate,
    #[error("failed to remove stale socket {path:?}")]
    Cleanup { path: PathBuf },
    #[error("failed to bind socket {path:?}")]
    Bind { path: PathBuf },
    #[error("device plugin server is already running")]
    AlreadyRunning,
    #[error("device plugin server has already been stopped")]
    AlreadyStopped,
    #[error("failed to connect to {path:?} within {timeout:?}")]
    Dial { path: PathBuf, timeout: Duration },
    #[error("failed to register resource {resource_name} with kubelet")]
    Registration { resource_name: String },
    #[error("failed to release devices")]
    Release,
    #[error("device plugin server task failed")]
    Serve,
    #[error("failed to install signal handler")]
    Signal,
}
