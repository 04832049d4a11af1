use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tb_shared::{utils, ClientConfig, ConnectInfo, CurrentFirmware, PlatformTopic, Result, RpcRequest};
use tracing::debug;

use crate::attributes::{AttributeCallback, AttributeScope, SubscriptionTarget};
use crate::connection::{ConnectCallback, ConnectionManager, RpcRequestHandler};
use crate::firmware::{FirmwareInstaller, FirmwareState};
use crate::transport::{RumqttTransport, Transport};

/// Client for a single device speaking for itself.
#[derive(Clone)]
pub struct DeviceClient {
    manager: Arc<ConnectionManager>,
}

impl DeviceClient {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_transport(config, Arc::new(RumqttTransport::new()))
    }

    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            manager: ConnectionManager::new(config, transport),
        }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub async fn connect(&self) -> Result<ConnectInfo> {
        self.manager.connect().await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.manager.disconnect().await
    }

    pub async fn is_connected(&self) -> bool {
        self.manager.is_connected().await
    }

    pub async fn set_connect_callback(&self, callback: ConnectCallback) {
        self.manager.set_connect_callback(callback).await;
    }

    /// Publishes telemetry. A single object is sent as a one-entry array;
    /// payloads above the server's maximum size go out in several publishes.
    pub async fn send_telemetry(&self, telemetry: Value) -> Result<()> {
        let topic = PlatformTopic::DeviceTelemetry.to_string();
        let limits = self.manager.rate_limits();
        let groups = utils::split_by_payload_size(utils::telemetry_entries(telemetry), self.manager.max_payload_size());

        for group in groups {
            let datapoints = utils::count_datapoints(&group) as u64;
            debug!("Sending {} telemetry entries ({} datapoints)", group.len(), datapoints);
            self.manager
                .publish_json(&topic, &Value::Array(group), &limits.telemetry_request(datapoints))
                .await?;
        }
        Ok(())
    }

    pub async fn send_attributes(&self, attributes: Value) -> Result<()> {
        self.manager
            .publish_json(
                &PlatformTopic::DeviceAttributes.to_string(),
                &attributes,
                &self.manager.rate_limits().message_request(),
            )
            .await
    }

    fn attribute_request(client_keys: &[&str], shared_keys: &[&str]) -> Value {
        let mut request = serde_json::Map::new();
        if !client_keys.is_empty() {
            request.insert("clientKeys".to_string(), Value::from(utils::join_keys(client_keys)));
        }
        if !shared_keys.is_empty() {
            request.insert("sharedKeys".to_string(), Value::from(utils::join_keys(shared_keys)));
        }
        Value::Object(request)
    }

    /// Fetches attribute values, waiting for the response.
    pub async fn request_attributes(&self, client_keys: &[&str], shared_keys: &[&str]) -> Result<Value> {
        let payload = Self::attribute_request(client_keys, shared_keys);
        let pending = self
            .manager
            .send_request(
                |id| PlatformTopic::DeviceAttributesResponse(id).to_string(),
                |id| (PlatformTopic::DeviceAttributesRequest(id).to_string(), payload),
                &self.manager.rate_limits().message_request(),
                self.manager.config().request_timeout(),
            )
            .await?;
        pending.wait().await
    }

    /// Callback form of [`request_attributes`](Self::request_attributes);
    /// returns the request id.
    pub async fn request_attributes_with_callback(
        &self,
        client_keys: &[&str],
        shared_keys: &[&str],
        callback: impl FnOnce(Result<Value>) + Send + 'static,
    ) -> Result<u32> {
        let payload = Self::attribute_request(client_keys, shared_keys);
        self.manager
            .send_request_with_callback(
                |id| PlatformTopic::DeviceAttributesResponse(id).to_string(),
                |id| (PlatformTopic::DeviceAttributesRequest(id).to_string(), payload),
                &self.manager.rate_limits().message_request(),
                self.manager.config().request_timeout(),
                callback,
            )
            .await
    }

    pub async fn subscribe_to_attribute(&self, key: &str, callback: AttributeCallback) -> u32 {
        self.manager
            .registry()
            .subscribe(SubscriptionTarget::OwnDevice, AttributeScope::Key(key.to_string()), callback)
            .await
    }

    pub async fn subscribe_to_all_attributes(&self, callback: AttributeCallback) -> u32 {
        self.manager
            .registry()
            .subscribe(SubscriptionTarget::OwnDevice, AttributeScope::All, callback)
            .await
    }

    /// Idempotent; unknown ids return `false`.
    pub async fn unsubscribe_from_attribute(&self, subscription_id: u32) -> bool {
        self.manager.registry().unsubscribe(subscription_id).await
    }

    pub async fn set_server_side_rpc_request_handler(&self, handler: RpcRequestHandler) {
        self.manager.set_rpc_handler(handler).await;
    }

    /// Answers a server-side RPC request.
    pub async fn send_rpc_reply(&self, request_id: u32, response: Value) -> Result<()> {
        self.manager
            .publish_json(
                &PlatformTopic::DeviceRpcResponse(request_id).to_string(),
                &response,
                &self.manager.rate_limits().message_request(),
            )
            .await
    }

    /// Client-side RPC, waiting for the server's answer.
    pub async fn send_rpc_call(&self, method: &str, params: Value) -> Result<Value> {
        let pending = self
            .manager
            .rpc_call(method, params, self.manager.config().request_timeout())
            .await?;
        pending.wait().await
    }

    pub async fn send_rpc_call_with_callback(
        &self,
        method: &str,
        params: Value,
        callback: impl FnOnce(Result<Value>) + Send + 'static,
    ) -> Result<u32> {
        self.manager
            .send_request_with_callback(
                |id| PlatformTopic::DeviceRpcResponse(id).to_string(),
                |id| {
                    (
                        PlatformTopic::DeviceRpcRequest(id).to_string(),
                        json!({ "method": method, "params": params }),
                    )
                },
                &self.manager.rate_limits().message_request(),
                self.manager.config().request_timeout(),
                callback,
            )
            .await
    }

    /// Starts the claiming procedure for this device.
    pub async fn claim(&self, secret_key: &str, duration: Duration) -> Result<()> {
        let payload = json!({
            "secretKey": secret_key,
            "durationMs": duration.as_millis() as u64,
        });
        self.manager
            .publish_json(
                &PlatformTopic::DeviceClaim.to_string(),
                &payload,
                &self.manager.rate_limits().message_request(),
            )
            .await
    }

    pub async fn set_firmware_installer(&self, installer: Arc<dyn FirmwareInstaller>) {
        self.manager.set_firmware_installer(installer).await;
    }

    pub async fn set_current_firmware(&self, title: &str, version: &str) {
        self.manager
            .set_current_firmware(CurrentFirmware {
                title: Some(title.to_string()),
                version: Some(version.to_string()),
            })
            .await;
    }

    /// Asks the server for the assigned firmware and downloads it if it
    /// differs from the current one.
    pub async fn get_firmware_update(&self) -> Result<()> {
        self.manager.request_firmware_update().await
    }

    pub async fn firmware_state(&self) -> FirmwareState {
        self.manager.firmware_state().await
    }
}

/// Convenience for handlers that only need the request.
pub fn rpc_handler(handler: impl Fn(RpcRequest) + Send + Sync + 'static) -> RpcRequestHandler {
    Arc::new(handler)
}
