use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tb_shared::{
    utils, AttributeUpdate, ClientConfig, ClientError, ConnectInfo, PlatformTopic, QoS, RateLimitsConfig, Result,
    RpcRequest, TopicFilter, NO_LIMIT,
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::attributes::{AttributeCallback, AttributeScope, SubscriptionTarget};
use crate::connection::{ConnectionExtension, ConnectionManager, RpcRequestHandler};
use crate::rate_limit::{RateLimit, RateLimits};
use crate::transport::{RumqttTransport, Transport};

/// A device that reaches the platform through this gateway.
#[derive(Debug, Clone)]
pub struct LogicalDevice {
    pub name: String,
    pub device_type: String,
    pub connected: bool,
    pub subscriptions: HashSet<u32>,
    limits: Option<Arc<RateLimits>>,
}

impl LogicalDevice {
    fn new(name: &str, device_type: &str) -> Self {
        Self {
            name: name.to_string(),
            device_type: device_type.to_string(),
            connected: true,
            subscriptions: HashSet::new(),
            limits: None,
        }
    }

    pub fn has_rate_limits(&self) -> bool {
        self.limits.is_some()
    }
}

/// Gateway state the connection manager calls back into.
struct GatewayCore {
    devices: RwLock<HashMap<String, LogicalDevice>>,
    limits: RateLimits,
    rpc_handler: RwLock<Option<RpcRequestHandler>>,
    rate_limits_received: AtomicBool,
}

impl GatewayCore {
    async fn on_attributes(&self, manager: &ConnectionManager, payload: &[u8]) -> Result<()> {
        let message: Value = serde_json::from_slice(payload)?;
        let device = message
            .get("device")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::Protocol("gateway attribute update without device".to_string()))?;
        let data = message.get("data").cloned().unwrap_or(Value::Null);

        let update = AttributeUpdate {
            device: Some(device.to_string()),
            data,
        };
        let delivered = manager.registry().dispatch(&update).await;
        debug!("Gateway attribute update for {} delivered to {} subscriptions", device, delivered);
        Ok(())
    }

    fn on_attributes_response(&self, manager: &ConnectionManager, topic: &str, payload: &[u8]) -> Result<()> {
        let response: Value = serde_json::from_slice(payload)?;
        let id = response
            .get("id")
            .and_then(Value::as_u64)
            .and_then(|id| u32::try_from(id).ok())
            .ok_or_else(|| ClientError::Protocol("gateway attribute response without id".to_string()))?;

        if !manager.tracker().resolve(id, topic, Ok(response)) {
            debug!("Unsolicited gateway attribute response {}", id);
        }
        Ok(())
    }

    async fn on_rpc(&self, payload: &[u8]) -> Result<()> {
        let message: Value = serde_json::from_slice(payload)?;
        let device = message
            .get("device")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::Protocol("gateway RPC without device".to_string()))?;
        let data = message
            .get("data")
            .ok_or_else(|| ClientError::Protocol(format!("gateway RPC for {} without data", device)))?;
        let id = data
            .get("id")
            .and_then(Value::as_u64)
            .and_then(|id| u32::try_from(id).ok())
            .ok_or_else(|| ClientError::Protocol(format!("gateway RPC for {} without id", device)))?;
        let method = data
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::Protocol(format!("gateway RPC {} for {} without method", id, device)))?;

        let request = RpcRequest {
            device: Some(device.to_string()),
            id,
            method: method.to_string(),
            params: data.get("params").cloned().unwrap_or(Value::Null),
        };

        if !self.is_connected(device).await {
            warn!("RPC {} for device {} which is not connected, dropping", id, device);
            return Ok(());
        }

        let handler = self.rpc_handler.read().await.clone();
        match handler {
            Some(handler) => handler(request),
            None => warn!("Gateway RPC {} for {} received but no handler is set", id, device),
        }
        Ok(())
    }

    async fn is_connected(&self, device: &str) -> bool {
        self.devices.read().await.get(device).map(|d| d.connected).unwrap_or(false)
    }

    /// Applies `gatewayRateLimits`; a missing field means no limit.
    fn apply_gateway_limits(&self, limits: &RateLimitsConfig) {
        self.limits.messages.set_limit(limits.messages.as_deref().unwrap_or(NO_LIMIT));
        self.limits
            .telemetry_messages
            .set_limit(limits.telemetry_messages.as_deref().unwrap_or(NO_LIMIT));
        self.limits
            .telemetry_datapoints
            .set_limit(limits.telemetry_data_points.as_deref().unwrap_or(NO_LIMIT));
        info!(
            "Gateway rate limits set: messages {}, telemetry {}, datapoints {}",
            self.limits.messages.spec(),
            self.limits.telemetry_messages.spec(),
            self.limits.telemetry_datapoints.spec()
        );
    }
}

#[async_trait]
impl ConnectionExtension for GatewayCore {
    fn subscriptions(&self, qos: QoS) -> Vec<TopicFilter> {
        TopicFilter::gateway_defaults(qos)
    }

    async fn handle_message(
        &self,
        manager: &Arc<ConnectionManager>,
        route: &PlatformTopic,
        topic: &str,
        payload: &[u8],
    ) -> Result<()> {
        match route {
            PlatformTopic::GatewayAttributes => self.on_attributes(manager, payload).await,
            PlatformTopic::GatewayAttributesResponse => self.on_attributes_response(manager, topic, payload),
            PlatformTopic::GatewayRpc => self.on_rpc(payload).await,
            other => {
                warn!("Unexpected inbound message on gateway topic {}", other);
                Ok(())
            }
        }
    }

    async fn on_service_configuration(&self, _manager: &ConnectionManager, config: Value) -> Option<Value> {
        if let Some(error) = config.get("error") {
            warn!("Gateway service configuration request failed: {}", error);
            self.rate_limits_received.store(true, Ordering::SeqCst);
            return None;
        }

        let mut config = config;
        if let Some(gateway_limits) = config.as_object_mut().and_then(|c| c.remove("gatewayRateLimits")) {
            match serde_json::from_value::<RateLimitsConfig>(gateway_limits) {
                Ok(limits) => self.apply_gateway_limits(&limits),
                Err(e) => warn!("Malformed gatewayRateLimits: {}", e),
            }
        }
        self.rate_limits_received.store(true, Ordering::SeqCst);
        Some(config)
    }
}

/// Fans one connection out to many logical devices.
#[derive(Clone)]
pub struct GatewayMultiplexer {
    manager: Arc<ConnectionManager>,
    core: Arc<GatewayCore>,
}

impl GatewayMultiplexer {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_transport(config, Arc::new(RumqttTransport::new()))
    }

    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let limits = RateLimits::new(
            "gateway ",
            &config.resolved_messages_rate_limit(),
            &config.resolved_telemetry_rate_limit(),
            &config.resolved_telemetry_dp_rate_limit(),
            config.rate_limit_percentage,
        );
        let core = Arc::new(GatewayCore {
            devices: RwLock::new(HashMap::new()),
            limits,
            rpc_handler: RwLock::new(None),
            rate_limits_received: AtomicBool::new(false),
        });

        Self {
            manager: ConnectionManager::new(config, transport),
            core,
        }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Limits shared by all traffic sent on behalf of devices.
    pub fn gateway_rate_limits(&self) -> &RateLimits {
        &self.core.limits
    }

    pub fn rate_limits_received(&self) -> bool {
        self.core.rate_limits_received.load(Ordering::SeqCst)
    }

    pub async fn connect(&self) -> Result<ConnectInfo> {
        self.manager.set_extension(self.core.clone()).await;
        self.manager.connect().await
    }

    /// Disconnects the gateway itself. Device state is kept.
    pub async fn disconnect(&self) -> Result<()> {
        self.manager.disconnect().await
    }

    pub async fn is_connected(&self) -> bool {
        self.manager.is_connected().await
    }

    async fn device_limits(&self, device: &str) -> Result<Option<Arc<RateLimits>>> {
        match self.core.devices.read().await.get(device) {
            Some(d) if d.connected => Ok(d.limits.clone()),
            _ => Err(ClientError::DeviceNotConnected(device.to_string())),
        }
    }

    async fn publish_for(&self, device: &str, topic: PlatformTopic, payload: &Value) -> Result<()> {
        let device_limits = self.device_limits(device).await?;
        let mut admission: Vec<(&RateLimit, u64)> = Vec::with_capacity(2);
        if let Some(limits) = device_limits.as_deref() {
            admission.extend(limits.message_request());
        }
        admission.extend(self.core.limits.message_request());
        self.manager.publish_json(&topic.to_string(), payload, &admission).await
    }

    /// Announces `name` to the platform. Reconnecting a known device reactivates it.
    pub async fn connect_device(&self, name: &str, device_type: &str) -> Result<()> {
        let payload = json!({ "device": name, "type": device_type });
        self.manager
            .publish_json(
                &PlatformTopic::GatewayConnect.to_string(),
                &payload,
                &self.core.limits.message_request(),
            )
            .await?;

        let mut devices = self.core.devices.write().await;
        devices
            .entry(name.to_string())
            .and_modify(|d| {
                d.connected = true;
                d.device_type = device_type.to_string();
            })
            .or_insert_with(|| LogicalDevice::new(name, device_type));
        info!("Device {} ({}) connected through gateway", name, device_type);
        Ok(())
    }

    /// Announces the disconnect and forgets the device with its subscriptions.
    pub async fn disconnect_device(&self, name: &str) -> Result<()> {
        self.publish_for(name, PlatformTopic::GatewayDisconnect, &json!({ "device": name }))
            .await?;

        let removed = self.core.devices.write().await.remove(name);
        let dropped = self.manager.registry().remove_device(name).await;
        if removed.is_some() {
            debug!("{} subscriptions dropped with device {}", dropped.len(), name);
        }
        info!("Device {} disconnected from gateway", name);
        Ok(())
    }

    pub async fn connected_devices(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .core
            .devices
            .read()
            .await
            .values()
            .filter(|d| d.connected)
            .map(|d| d.name.clone())
            .collect();
        names.sort();
        names
    }

    pub async fn device(&self, name: &str) -> Option<LogicalDevice> {
        self.core.devices.read().await.get(name).cloned()
    }

    pub async fn send_telemetry(&self, device: &str, telemetry: Value) -> Result<()> {
        let device_limits = self.device_limits(device).await?;
        let topic = PlatformTopic::GatewayTelemetry.to_string();
        let groups = utils::split_by_payload_size(utils::telemetry_entries(telemetry), self.manager.max_payload_size());

        for group in groups {
            let datapoints = utils::count_datapoints(&group) as u64;
            let mut admission: Vec<(&RateLimit, u64)> = Vec::with_capacity(6);
            if let Some(limits) = device_limits.as_deref() {
                admission.extend(limits.telemetry_request(datapoints));
            }
            admission.extend(self.core.limits.telemetry_request(datapoints));

            let mut payload = Map::new();
            payload.insert(device.to_string(), Value::Array(group));
            self.manager.publish_json(&topic, &Value::Object(payload), &admission).await?;
        }
        Ok(())
    }

    pub async fn send_attributes(&self, device: &str, attributes: Value) -> Result<()> {
        let mut payload = Map::new();
        payload.insert(device.to_string(), attributes);
        self.publish_for(device, PlatformTopic::GatewayAttributes, &Value::Object(payload))
            .await
    }

    async fn request_attributes(&self, device: &str, keys: &[&str], client: bool) -> Result<Value> {
        let device_limits = self.device_limits(device).await?;
        let mut admission: Vec<(&RateLimit, u64)> = Vec::with_capacity(2);
        if let Some(limits) = device_limits.as_deref() {
            admission.extend(limits.message_request());
        }
        admission.extend(self.core.limits.message_request());

        let pending = self
            .manager
            .send_request(
                |_| PlatformTopic::GatewayAttributesResponse.to_string(),
                |id| {
                    (
                        PlatformTopic::GatewayAttributesRequest.to_string(),
                        json!({ "id": id, "device": device, "client": client, "keys": keys }),
                    )
                },
                &admission,
                self.manager.config().request_timeout(),
            )
            .await?;
        pending.wait().await
    }

    pub async fn request_shared_attributes(&self, device: &str, keys: &[&str]) -> Result<Value> {
        self.request_attributes(device, keys, false).await
    }

    pub async fn request_client_attributes(&self, device: &str, keys: &[&str]) -> Result<Value> {
        self.request_attributes(device, keys, true).await
    }

    pub async fn set_server_side_rpc_request_handler(&self, handler: RpcRequestHandler) {
        *self.core.rpc_handler.write().await = Some(handler);
    }

    pub async fn send_rpc_reply(&self, device: &str, request_id: u32, response: Value) -> Result<()> {
        let payload = json!({ "device": device, "id": request_id, "data": response });
        self.publish_for(device, PlatformTopic::GatewayRpc, &payload).await
    }

    /// Attribute updates of every device behind the gateway.
    pub async fn subscribe_to_all_attributes(&self, callback: AttributeCallback) -> u32 {
        self.manager
            .registry()
            .subscribe(SubscriptionTarget::AnyDevice, AttributeScope::All, callback)
            .await
    }

    async fn subscribe_device(&self, device: &str, scope: AttributeScope, callback: AttributeCallback) -> Result<u32> {
        let mut devices = self.core.devices.write().await;
        let entry = match devices.get_mut(device) {
            Some(d) if d.connected => d,
            _ => return Err(ClientError::DeviceNotConnected(device.to_string())),
        };

        let id = self
            .manager
            .registry()
            .subscribe(SubscriptionTarget::Device(device.to_string()), scope, callback)
            .await;
        entry.subscriptions.insert(id);
        Ok(id)
    }

    pub async fn subscribe_to_attribute(&self, device: &str, key: &str, callback: AttributeCallback) -> Result<u32> {
        self.subscribe_device(device, AttributeScope::Key(key.to_string()), callback)
            .await
    }

    pub async fn subscribe_to_all_device_attributes(&self, device: &str, callback: AttributeCallback) -> Result<u32> {
        self.subscribe_device(device, AttributeScope::All, callback).await
    }

    /// Removes exactly one subscription. Unknown or already removed ids are a no-op.
    pub async fn unsubscribe(&self, subscription_id: u32) -> bool {
        for device in self.core.devices.write().await.values_mut() {
            device.subscriptions.remove(&subscription_id);
        }
        self.manager.registry().unsubscribe(subscription_id).await
    }

    pub async fn claim(&self, device: &str, secret_key: &str, duration: Duration) -> Result<()> {
        let mut payload = Map::new();
        payload.insert(
            device.to_string(),
            json!({ "secretKey": secret_key, "durationMs": duration.as_millis() as u64 }),
        );
        self.publish_for(device, PlatformTopic::GatewayClaim, &Value::Object(payload))
            .await
    }

    /// Per-device limits applied on top of the gateway-wide ones.
    pub async fn set_device_rate_limits(&self, device: &str, limits: &RateLimitsConfig) -> Result<()> {
        let mut devices = self.core.devices.write().await;
        let entry = match devices.get_mut(device) {
            Some(d) if d.connected => d,
            _ => return Err(ClientError::DeviceNotConnected(device.to_string())),
        };

        let device_limits = RateLimits::unlimited(&format!("{} ", device));
        device_limits.apply(limits);
        entry.limits = Some(Arc::new(device_limits));
        Ok(())
    }
}
