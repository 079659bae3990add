//! Device plugin gRPC server.

use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use futures::Stream;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::api;
use crate::api::device_plugin_server::DevicePlugin;
use crate::api::device_plugin_server::DevicePluginServer;
use crate::api::AllocateRequest;
use crate::api::AllocateResponse;
use crate::api::DevicePluginOptions;
use crate::api::Empty;
use crate::api::ListAndWatchResponse;
use crate::api::PreStartContainerRequest;
use crate::api::PreStartContainerResponse;
use crate::api::PreferredAllocationRequest;
use crate::api::PreferredAllocationResponse;
use crate::device::DeviceCapability;
use crate::error::PluginError;
use crate::state::apply_health_updates;
use crate::state::DeviceRecord;
use crate::state::HealthReporter;
use crate::state::HealthUpdate;
use crate::state::PluginState;
use crate::transport;

/// Default bound on the startup self-check and the kubelet dial.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

const HEALTH_CHANNEL_CAPACITY: usize = 64;
const SERVER_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

enum Phase {
    Idle,
    Running(RunningServer),
    Stopped,
}

struct RunningServer {
    cancellation_token: CancellationToken,
    server_task: JoinHandle<Result<(), tonic::transport::Error>>,
    applier_task: JoinHandle<()>,
}

/// Owns the plugin socket, the advertised devices and the hardware binding.
pub struct PluginServer {
    socket_path: PathBuf,
    /// Socket dialed by the startup self-check, normally `socket_path`.
    self_check_path: PathBuf,
    dial_timeout: Duration,
    capability: Arc<dyn DeviceCapability>,
    state: Arc<PluginState>,
    health_tx: mpsc::Sender<HealthUpdate>,
    health_rx: Option<mpsc::Receiver<HealthUpdate>>,
    phase: Phase,
}

impl PluginServer {
    /// Enumerate the devices of `capability` and prepare a server for
    /// `socket_path`. Nothing is bound until [`PluginServer::start`].
    pub fn new(
        socket_path: impl Into<PathBuf>,
        capability: Arc<dyn DeviceCapability>,
    ) -> Result<Self, Report<PluginError>> {
        let ids = capability
            .enumerate()
            .change_context(PluginError::Enumerate)?;
        info!(count = ids.len(), "advertising devices: {ids:?}");

        let socket_path = socket_path.into();
        let (health_tx, health_rx) = mpsc::channel(HEALTH_CHANNEL_CAPACITY);
        Ok(Self {
            self_check_path: socket_path.clone(),
            socket_path,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            capability,
            state: Arc::new(PluginState::new(ids)),
            health_tx,
            health_rx: Some(health_rx),
            phase: Phase::Idle,
        })
    }

    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    #[cfg(test)]
    fn with_self_check_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.self_check_path = path.into();
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Socket file name, as announced to the kubelet.
    pub fn endpoint(&self) -> String {
        self.socket_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn dial_timeout(&self) -> Duration {
        self.dial_timeout
    }

    pub fn is_running(&self) -> bool {
        matches!(self.phase, Phase::Running(_))
    }

    /// Current device list.
    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.state.snapshot()
    }

    /// Handle for feeding health changes into the server.
    pub fn health_reporter(&self) -> HealthReporter {
        HealthReporter::new(self.health_tx.clone())
    }

    /// Bind the socket, serve in the background and check the socket answers.
    ///
    /// Fails with [`PluginError::AlreadyRunning`] rather than binding twice.
    /// A failed self-check stops the server and removes the socket.
    #[tracing::instrument(skip(self), fields(socket = ?self.socket_path))]
    pub async fn start(&mut self) -> Result<(), Report<PluginError>> {
        match self.phase {
            Phase::Idle => {}
            Phase::Running(_) => return Err(Report::new(PluginError::AlreadyRunning)),
            Phase::Stopped => return Err(Report::new(PluginError::AlreadyStopped)),
        }

        remove_socket(&self.socket_path).change_context_lazy(|| PluginError::Cleanup {
            path: self.socket_path.clone(),
        })?;

        let listener = UnixListener::bind(&self.socket_path).change_context_lazy(|| {
            PluginError::Bind {
                path: self.socket_path.clone(),
            }
        })?;

        let cancellation_token = CancellationToken::new();
        let service = DevicePluginService::new(
            self.state.clone(),
            self.capability.clone(),
            cancellation_token.clone(),
        );

        let server_task = {
            let token = cancellation_token.clone();
            tokio::spawn(async move {
                tonic::transport::Server::builder()
                    .add_service(DevicePluginServer::new(service))
                    .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                        token.cancelled().await;
                        info!("shutting down gRPC server");
                    })
                    .await
            })
        };

        let applier_task = {
            let state = self.state.clone();
            let token = cancellation_token.clone();
            // start() only gets past Idle once, so the receiver is still here
            let updates = self.health_rx.take();
            tokio::spawn(async move {
                if let Some(updates) = updates {
                    apply_health_updates(&state, updates, token).await;
                }
            })
        };

        self.phase = Phase::Running(RunningServer {
            cancellation_token,
            server_task,
            applier_task,
        });
        info!("gRPC server is bound to: {:?}", self.socket_path);

        match transport::dial(&self.self_check_path, self.dial_timeout).await {
            Ok(_channel) => {
                debug!("self-check connection succeeded");
                Ok(())
            }
            Err(e) => {
                error!("device plugin server is unreachable, stopping: {e:?}");
                if let Err(stop_err) = self.stop().await {
                    warn!("failed to stop unreachable server: {stop_err:?}");
                }
                Err(e)
            }
        }
    }

    /// Stop serving, end every ListAndWatch stream, release the devices and
    /// remove the socket.
    ///
    /// A no-op when the server never started or has already stopped. Every
    /// step runs even if an earlier one failed; the first failure is
    /// returned.
    #[tracing::instrument(skip(self), fields(socket = ?self.socket_path))]
    pub async fn stop(&mut self) -> Result<(), Report<PluginError>> {
        let running = match std::mem::replace(&mut self.phase, Phase::Stopped) {
            Phase::Running(running) => running,
            Phase::Idle => {
                self.phase = Phase::Idle;
                return Ok(());
            }
            Phase::Stopped => return Ok(()),
        };

        info!("stopping device plugin server");
        let mut failure: Option<Report<PluginError>> = None;

        running.cancellation_token.cancel();
        let mut server_task = running.server_task;
        match tokio::time::timeout(SERVER_SHUTDOWN_GRACE, &mut server_task).await {
            Ok(Ok(Ok(()))) => debug!("gRPC server exited"),
            Ok(Ok(Err(e))) => {
                error!("gRPC server exited with error: {e}");
                failure.get_or_insert(Report::new(e).change_context(PluginError::Serve));
            }
            Ok(Err(e)) => {
                error!("gRPC server task panicked: {e}");
                failure.get_or_insert(Report::new(e).change_context(PluginError::Serve));
            }
            Err(_) => {
                warn!("gRPC server did not exit within {SERVER_SHUTDOWN_GRACE:?}, aborting");
                server_task.abort();
            }
        }
        if let Err(e) = running.applier_task.await {
            warn!("health update applier panicked: {e}");
        }

        if let Err(e) = self.capability.release() {
            error!("failed to release devices: {e}");
            failure.get_or_insert(Report::new(e).change_context(PluginError::Release));
        }

        if let Err(e) = remove_socket(&self.socket_path) {
            error!("failed to remove socket {:?}: {e}", self.socket_path);
            failure.get_or_insert(Report::new(e).change_context(PluginError::Cleanup {
                path: self.socket_path.clone(),
            }));
        }

        info!("device plugin server stopped");
        match failure {
            Some(report) => Err(report),
            None => Ok(()),
        }
    }
}

/// Remove `path`, treating a missing file as success.
fn remove_socket(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!("removed socket {path:?}");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// RPC handlers. Each call runs on its own task; shared state sits behind
/// [`PluginState`].
#[derive(Debug, Clone)]
pub struct DevicePluginService {
    state: Arc<PluginState>,
    capability: Arc<dyn DeviceCapability>,
    cancellation_token: CancellationToken,
}

impl DevicePluginService {
    pub fn new(
        state: Arc<PluginState>,
        capability: Arc<dyn DeviceCapability>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            state,
            capability,
            cancellation_token,
        }
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        debug!("getting device plugin options");
        Ok(Response::new(DevicePluginOptions {
            pre_start_required: false,
            get_preferred_allocation_available: false,
        }))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!("starting to watch device list");

        let (tx, rx) = mpsc::channel(1);
        let state = self.state.clone();
        let cancellation_token = self.cancellation_token.clone();
        let mut changes = state.subscribe();

        tokio::spawn(async move {
            if tx
                .send(Ok(api::list_response(&state.snapshot())))
                .await
                .is_err()
            {
                debug!("watcher went away before the initial device list");
                return;
            }

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("device watch stopped by server shutdown");
                        break;
                    }
                    _ = tx.closed() => {
                        info!("device watcher disconnected");
                        break;
                    }
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        changes.borrow_and_update();
                        let devices = state.snapshot();
                        debug!("sending device list update: {devices:?}");
                        if tx.send(Ok(api::list_response(&devices))).await.is_err() {
                            info!("device watcher disconnected");
                            break;
                        }
                    }
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        debug!("getting preferred device allocation: {:?}", request.get_ref());
        Ok(Response::new(PreferredAllocationResponse {
            container_responses: vec![],
        }))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let req = request.into_inner();
        info!(
            containers = req.container_requests.len(),
            "allocating devices"
        );

        let mut container_responses = Vec::with_capacity(req.container_requests.len());
        for container_req in req.container_requests {
            debug!("allocating device IDs: {:?}", container_req.devices_ids);
            let grant = self
                .capability
                .grant(&container_req.devices_ids)
                .map_err(|e| {
                    error!(
                        "failed to allocate devices {:?}: {e}",
                        container_req.devices_ids
                    );
                    Status::internal(format!(
                        "failed to allocate devices {:?}: {e}",
                        container_req.devices_ids
                    ))
                })?;
            container_responses.push(grant.into());
        }

        Ok(Response::new(AllocateResponse {
            container_responses,
        }))
    }

    async fn pre_start_container(
        &self,
        request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        debug!("pre-start container: {:?}", request.get_ref());
        Ok(Response::new(PreStartContainerResponse {}))
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::api::AllocateRequest;
    use crate::api::ContainerAllocateRequest;
    use crate::api::Device;
    use crate::device::MockDevices;
    use crate::state::Health;

    fn service(
        capability: MockDevices,
    ) -> (DevicePluginService, Arc<PluginState>, CancellationToken) {
        let capability: Arc<dyn DeviceCapability> = Arc::new(capability);
        let state = Arc::new(PluginState::new(capability.enumerate().unwrap()));
        let token = CancellationToken::new();
        let service = DevicePluginService::new(state.clone(), capability, token.clone());
        (service, state, token)
    }

    fn device(id: &str, health: &str) -> Device {
        Device {
            id: id.to_string(),
            health: health.to_string(),
            topology: None,
        }
    }

    type WatchStream = <DevicePluginService as DevicePlugin>::ListAndWatchStream;

    async fn next_devices(stream: &mut WatchStream) -> Vec<Device> {
        tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("should emit within timeout")
            .expect("stream should be open")
            .expect("should not be an error")
            .devices
    }

    fn allocate_request(requests: &[&[&str]]) -> Request<AllocateRequest> {
        Request::new(AllocateRequest {
            container_requests: requests
                .iter()
                .map(|ids| ContainerAllocateRequest {
                    devices_ids: ids.iter().map(|id| id.to_string()).collect(),
                })
                .collect(),
        })
    }

    #[test(tokio::test)]
    async fn options_are_static() {
        let (service, _, _) = service(MockDevices::new(["0"]));
        let options = service
            .get_device_plugin_options(Request::new(Empty {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(
            options,
            DevicePluginOptions {
                pre_start_required: false,
                get_preferred_allocation_available: false,
            }
        );
    }

    #[test(tokio::test)]
    async fn list_and_watch_rebroadcasts_health_changes() {
        let (service, state, _) = service(MockDevices::new(["0", "1"]));
        let mut stream = service
            .list_and_watch(Request::new(Empty {}))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(
            next_devices(&mut stream).await,
            vec![device("0", "Healthy"), device("1", "Healthy")]
        );

        state.apply(&HealthUpdate::new("1", Health::Unhealthy));
        assert_eq!(
            next_devices(&mut stream).await,
            vec![device("0", "Healthy"), device("1", "Unhealthy")]
        );

        // unknown device: nothing new is emitted
        state.apply(&HealthUpdate::new("9", Health::Unhealthy));
        let idle = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
        assert!(idle.is_err(), "no emission expected for unknown device");

        state.apply(&HealthUpdate::new("0", Health::Unhealthy));
        assert_eq!(
            next_devices(&mut stream).await,
            vec![device("0", "Unhealthy"), device("1", "Unhealthy")]
        );
    }

    #[test(tokio::test)]
    async fn list_and_watch_every_watcher_sees_latest_state() {
        let (service, state, _) = service(MockDevices::new(["0", "1"]));
        let mut first = service
            .list_and_watch(Request::new(Empty {}))
            .await
            .unwrap()
            .into_inner();
        let mut second = service
            .list_and_watch(Request::new(Empty {}))
            .await
            .unwrap()
            .into_inner();
        next_devices(&mut first).await;
        next_devices(&mut second).await;

        state.apply(&HealthUpdate::new("0", Health::Unhealthy));
        state.apply(&HealthUpdate::new("1", Health::Unhealthy));

        let expected = vec![device("0", "Unhealthy"), device("1", "Unhealthy")];
        for stream in [&mut first, &mut second] {
            let mut latest = next_devices(stream).await;
            // intermediate states may or may not be coalesced
            if latest != expected {
                latest = next_devices(stream).await;
            }
            assert_eq!(latest, expected);
        }
    }

    #[test(tokio::test)]
    async fn list_and_watch_ends_on_shutdown() {
        let (service, _, token) = service(MockDevices::new(["0"]));
        let mut streams = Vec::new();
        for _ in 0..3 {
            let mut stream = service
                .list_and_watch(Request::new(Empty {}))
                .await
                .unwrap()
                .into_inner();
            next_devices(&mut stream).await;
            streams.push(stream);
        }

        token.cancel();
        for mut stream in streams {
            let end = tokio::time::timeout(Duration::from_secs(2), stream.next())
                .await
                .expect("stream should end after shutdown");
            assert!(end.is_none());
        }

        // a watcher attaching after shutdown still gets the list, then ends
        let mut late = service
            .list_and_watch(Request::new(Empty {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(next_devices(&mut late).await.len(), 1);
        assert!(late.next().await.is_none());
    }

    #[test(tokio::test)]
    async fn allocate_preserves_request_order() {
        let (service, state, _) = service(MockDevices::new(["0", "1", "2"]));
        let response = service
            .allocate(allocate_request(&[&["2"], &["0", "1"]]))
            .await
            .expect("should allocate")
            .into_inner();

        assert_eq!(response.container_responses.len(), 2);
        let host_paths: Vec<Vec<String>> = response
            .container_responses
            .iter()
            .map(|r| r.devices.iter().map(|d| d.host_path.clone()).collect())
            .collect();
        assert_eq!(
            host_paths,
            vec![
                vec!["/dev/mock2".to_string()],
                vec!["/dev/mock0".to_string(), "/dev/mock1".to_string()],
            ]
        );
        assert_eq!(
            response.container_responses[1].devices[1].container_path,
            "/dev/mock1"
        );
        // allocation leaves health untouched
        assert!(state.snapshot().iter().all(|d| d.health == Health::Healthy));
    }

    #[test(tokio::test)]
    async fn allocate_fails_whole_call_on_any_grant_failure() {
        let (service, _, _) = service(MockDevices::new(["0", "1"]).fail_grant_for("1"));
        let status = service
            .allocate(allocate_request(&[&["0"], &["1"]]))
            .await
            .expect_err("whole call should fail");

        assert_eq!(status.code(), tonic::Code::Internal);
        assert!(status.message().contains("grant failed for device 1"));
    }

    #[test(tokio::test)]
    async fn preferred_allocation_and_pre_start_are_no_ops() {
        let (service, _, _) = service(MockDevices::new(["0"]));

        let preferred = service
            .get_preferred_allocation(Request::new(PreferredAllocationRequest {
                container_requests: vec![],
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(preferred.container_responses.is_empty());

        service
            .pre_start_container(Request::new(PreStartContainerRequest {
                devices_ids: vec!["0".to_string()],
            }))
            .await
            .expect("pre-start should succeed");
    }

    #[test(tokio::test)]
    async fn stop_without_start_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockDevices::new(["0"]));
        let mut server = PluginServer::new(dir.path().join("plugin.sock"), mock.clone()).unwrap();

        server.stop().await.expect("stop should succeed");
        server.stop().await.expect("second stop should succeed");
        assert_eq!(mock.release_calls(), 0);
        assert!(!server.is_running());
    }

    #[test(tokio::test)]
    async fn start_twice_is_rejected_and_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("plugin.sock");
        let mock = Arc::new(MockDevices::new(["0", "1"]));
        let mut server = PluginServer::new(&socket, mock.clone()).unwrap();

        server.start().await.expect("should start");
        assert!(socket.exists());
        assert_eq!(server.endpoint(), "plugin.sock");

        let err = server.start().await.expect_err("second start must not rebind");
        assert!(matches!(err.current_context(), PluginError::AlreadyRunning));
        assert!(server.is_running());

        server.stop().await.expect("should stop");
        assert!(!socket.exists());
        assert_eq!(mock.release_calls(), 1);

        server.stop().await.expect("second stop should succeed");
        assert_eq!(mock.release_calls(), 1);

        let err = server.start().await.expect_err("restart after stop");
        assert!(matches!(err.current_context(), PluginError::AlreadyStopped));
    }

    #[test(tokio::test)]
    async fn start_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("plugin.sock");
        std::fs::write(&socket, b"stale").unwrap();

        let mut server = PluginServer::new(&socket, Arc::new(MockDevices::new(["0"]))).unwrap();
        server.start().await.expect("should replace stale socket");
        server.stop().await.unwrap();
    }

    #[test(tokio::test)]
    async fn start_fails_when_socket_dir_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("missing").join("plugin.sock");
        let mock = Arc::new(MockDevices::new(["0"]));

        let mut server = PluginServer::new(&socket, mock.clone()).unwrap();
        let err = server.start().await.expect_err("bind should fail");
        assert!(matches!(err.current_context(), PluginError::Bind { .. }));
        assert!(!server.is_running());
        assert_eq!(mock.release_calls(), 0);
    }

    #[test(tokio::test)]
    async fn failed_self_check_unwinds_start() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("plugin.sock");
        let mock = Arc::new(MockDevices::new(["0"]));

        let mut server = PluginServer::new(&socket, mock.clone())
            .unwrap()
            .with_dial_timeout(Duration::from_millis(200))
            .with_self_check_path(dir.path().join("unreachable.sock"));
        let err = server.start().await.expect_err("self-check should fail");

        assert!(matches!(err.current_context(), PluginError::Dial { .. }));
        assert!(!server.is_running());
        assert!(!socket.exists());
        assert_eq!(mock.release_calls(), 1);

        let err = server.start().await.expect_err("no restart after unwinding");
        assert!(matches!(err.current_context(), PluginError::AlreadyStopped));
    }

    #[test(tokio::test)]
    async fn reporter_feeds_running_server() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = PluginServer::new(
            dir.path().join("plugin.sock"),
            Arc::new(MockDevices::new(["0", "1"])),
        )
        .unwrap();
        server.start().await.unwrap();

        let reporter = server.health_reporter();
        let mut changes = server.state.subscribe();
        assert!(reporter.report(HealthUpdate::new("1", Health::Unhealthy)).await);
        changes.changed().await.unwrap();
        assert_eq!(
            server.devices(),
            vec![
                DeviceRecord::new("0", Health::Healthy),
                DeviceRecord::new("1", Health::Unhealthy),
            ]
        );

        server.stop().await.unwrap();
    }
}
