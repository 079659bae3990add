use std::path::Path;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tower::service_fn;

use crate::error::PluginError;

/// Open a gRPC channel over the Unix socket at `socket_path`, giving up
/// after `timeout`.
pub(crate) async fn dial(
    socket_path: &Path,
    timeout: Duration,
) -> Result<Channel, Report<PluginError>> {
    let dial_error = || PluginError::Dial {
        path: socket_path.to_path_buf(),
        timeout,
    };
    let path = socket_path.to_path_buf();

    // The URI is a placeholder, the connector below always dials the socket.
    let endpoint = Endpoint::from_static("http://[::]:50051").connect_timeout(timeout);
    let connect = endpoint.connect_with_connector(service_fn(move |_: Uri| {
        let path = path.clone();
        async move { UnixStream::connect(path).await.map(TokioIo::new) }
    }));

    tokio::time::timeout(timeout, connect)
        .await
        .change_context_lazy(dial_error)
        .attach_printable("timed out")?
        .change_context_lazy(dial_error)
}
