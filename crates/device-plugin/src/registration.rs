//! One-shot registration handshake with the kubelet.

use std::path::Path;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use tonic::Request;
use tracing::info;

use crate::api;
use crate::api::registration_client::RegistrationClient;
use crate::api::DevicePluginOptions;
use crate::api::RegisterRequest;
use crate::error::PluginError;
use crate::transport;

/// Announce the plugin listening on socket `endpoint` (a file name inside the
/// kubelet's device plugin directory) under `resource_name`.
///
/// Dial, transport and rejection errors are returned as they are; retrying
/// is up to the caller.
#[tracing::instrument(skip(dial_timeout))]
pub async fn register_with_kubelet(
    kubelet_socket: &Path,
    endpoint: &str,
    resource_name: &str,
    dial_timeout: Duration,
) -> Result<(), Report<PluginError>> {
    info!("registering device plugin with kubelet");
    let registration_error = || PluginError::Registration {
        resource_name: resource_name.to_string(),
    };

    let channel = transport::dial(kubelet_socket, dial_timeout)
        .await
        .change_context_lazy(registration_error)?;
    let mut client = RegistrationClient::new(channel);

    let request = RegisterRequest {
        version: api::VERSION.to_string(),
        endpoint: endpoint.to_string(),
        resource_name: resource_name.to_string(),
        options: Some(DevicePluginOptions::default()),
    };

    client
        .register(Request::new(request))
        .await
        .change_context_lazy(registration_error)?;

    info!("successfully registered device plugin with kubelet");
    Ok(())
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test(tokio::test)]
    async fn missing_kubelet_is_reported_as_registration_failure() {
        let dir = tempfile::tempdir().expect("should create temp dir");

        let err = register_with_kubelet(
            &dir.path().join("kubelet.sock"),
            "plugin.sock",
            "example.com/accel",
            Duration::from_millis(200),
        )
        .await
        .expect_err("no kubelet is listening");

        assert!(matches!(
            err.current_context(),
            PluginError::Registration { resource_name } if resource_name == "example.com/accel"
        ));
        assert!(format!("{err:?}").contains("kubelet.sock"));
    }
}
