//! Startup and teardown ordering for the plugin.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::error::PluginError;
use crate::monitor::HealthMonitor;
use crate::monitor::HealthProbe;
use crate::registration::register_with_kubelet;
use crate::server::PluginServer;

/// Drives a [`PluginServer`] from bind to kubelet registration and back down.
pub struct Lifecycle {
    server: PluginServer,
    kubelet_socket: PathBuf,
    resource_name: String,
    monitor: Option<HealthMonitor>,
    monitor_task: Option<(CancellationToken, JoinHandle<()>)>,
}

impl Lifecycle {
    pub fn new(
        server: PluginServer,
        kubelet_socket: impl Into<PathBuf>,
        resource_name: impl Into<String>,
    ) -> Self {
        Self {
            server,
            kubelet_socket: kubelet_socket.into(),
            resource_name: resource_name.into(),
            monitor: None,
            monitor_task: None,
        }
    }

    /// Probe device health every `period` once the plugin is registered.
    pub fn with_health_probe(
        mut self,
        probe: Arc<dyn HealthProbe>,
        period: Duration,
    ) -> Self {
        self.monitor = Some(HealthMonitor::new(
            probe,
            self.server.health_reporter(),
            period,
        ));
        self
    }

    pub fn server(&self) -> &PluginServer {
        &self.server
    }

    /// Start serving, then register with the kubelet.
    ///
    /// If registration fails the server is stopped and its socket removed
    /// before the error is returned.
    #[tracing::instrument(skip(self), fields(resource = %self.resource_name))]
    pub async fn start(&mut self) -> Result<(), Report<PluginError>> {
        self.server.start().await?;
        info!("Starting to serve on socket {:?}", self.server.socket_path());

        let registered = register_with_kubelet(
            &self.kubelet_socket,
            &self.server.endpoint(),
            &self.resource_name,
            self.server.dial_timeout(),
        )
        .await;

        if let Err(e) = registered {
            error!("registration failed, stopping device plugin: {e:?}");
            if let Err(stop_err) = self.server.stop().await {
                warn!("failed to stop device plugin after registration failure: {stop_err:?}");
            }
            return Err(e);
        }
        info!("Registered resource {}", self.resource_name);

        if let Some(monitor) = self.monitor.take() {
            let token = CancellationToken::new();
            let ids = self.server.devices().into_iter().map(|d| d.id).collect();
            let task = tokio::spawn(monitor.run(ids, token.clone()));
            self.monitor_task = Some((token, task));
        }

        Ok(())
    }

    /// Tear everything down. Safe to call more than once.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&mut self) -> Result<(), Report<PluginError>> {
        if let Some((token, task)) = self.monitor_task.take() {
            token.cancel();
            if let Err(e) = task.await {
                warn!("health monitor task failed: {e}");
            }
        }
        self.server.stop().await
    }

    /// Start, wait for SIGINT or SIGTERM, then stop.
    pub async fn run_until_signal(mut self) -> Result<(), Report<PluginError>> {
        self.start().await?;

        let signalled = wait_for_signal().await;
        let stopped = self.stop().await;
        signalled.and(stopped)
    }
}

async fn wait_for_signal() -> Result<(), Report<PluginError>> {
    use tokio::signal::unix::signal;
    use tokio::signal::unix::SignalKind;

    let mut sigterm = signal(SignalKind::terminate()).change_context(PluginError::Signal)?;
    let mut sigint = signal(SignalKind::interrupt()).change_context(PluginError::Signal)?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
        _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
    }
    Ok(())
}
