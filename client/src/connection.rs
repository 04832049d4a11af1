use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tb_shared::{
    connack_reason, fw_keys, utils, AttributeUpdate, ClientConfig, ClientError, ConnectInfo, ConnectionState,
    CurrentFirmware, FirmwareInfo, PlatformTopic, QoS, Result, RpcRequest, ServiceConfiguration, TopicFilter,
};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::attributes::AttributeSubscriptionRegistry;
use crate::firmware::{FileInstaller, FirmwareAction, FirmwareInstaller, FirmwareSession, FirmwareState};
use crate::rate_limit::{acquire_together, RateLimit, RateLimits};
use crate::request_tracker::{PendingResponse, RequestTracker};
use crate::transport::{ConnectOptions, Transport, TransportEvent};

pub const SESSION_LIMITS_METHOD: &str = "getSessionLimits";
const SESSION_LIMITS_TIMEOUT_MS: u64 = 5000;

pub type ConnectCallback = Arc<dyn Fn(&ConnectionManager, &ConnectInfo) + Send + Sync>;
pub type RpcRequestHandler = Arc<dyn Fn(RpcRequest) + Send + Sync>;

/// A protocol layer stacked on top of the device connection. The gateway
/// multiplexer is the only implementation.
#[async_trait]
pub trait ConnectionExtension: Send + Sync + 'static {
    /// Extra topics to subscribe on every (re)connect.
    fn subscriptions(&self, qos: QoS) -> Vec<TopicFilter>;

    /// Handles an inbound message on one of the extension's topics.
    async fn handle_message(
        &self,
        manager: &Arc<ConnectionManager>,
        route: &PlatformTopic,
        topic: &str,
        payload: &[u8],
    ) -> Result<()>;

    /// Sees the service configuration first. Returns what the device layer
    /// should still apply, or `None` when the response was consumed.
    async fn on_service_configuration(&self, manager: &ConnectionManager, config: Value) -> Option<Value>;
}

#[derive(Debug, Default)]
struct ServiceState {
    request_required: bool,
    request_in_flight: bool,
    received: bool,
    max_payload_size: Option<usize>,
    max_inflight_messages: Option<usize>,
}

/// Work for the firmware task, kept off the dispatch loop.
enum FirmwareInput {
    Info(Result<Value>),
    Actions(Vec<FirmwareAction>),
}

struct Tasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Owns the transport and everything correlated over it.
pub struct ConnectionManager {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    state: RwLock<ConnectionState>,
    service: StdMutex<ServiceState>,
    tracker: RequestTracker,
    rate_limits: RateLimits,
    registry: AttributeSubscriptionRegistry,
    rpc_handler: RwLock<Option<RpcRequestHandler>>,
    connect_callback: RwLock<Option<ConnectCallback>>,
    firmware: Mutex<FirmwareSession>,
    installer: RwLock<Option<Arc<dyn FirmwareInstaller>>>,
    extension: RwLock<Option<Arc<dyn ConnectionExtension>>>,
    firmware_tx: StdMutex<Option<mpsc::UnboundedSender<FirmwareInput>>>,
    tasks: Mutex<Option<Tasks>>,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Arc<Self> {
        let rate_limits = RateLimits::new(
            "",
            &config.resolved_messages_rate_limit(),
            &config.resolved_telemetry_rate_limit(),
            &config.resolved_telemetry_dp_rate_limit(),
            config.rate_limit_percentage,
        );
        let firmware = FirmwareSession::new(
            config.firmware_chunk_size,
            Duration::from_millis(config.firmware_chunk_timeout_ms),
            config.firmware_max_retries,
        )
        .with_max_image_size(config.firmware_max_size);

        Arc::new(Self {
            config,
            transport,
            state: RwLock::new(ConnectionState::Disconnected),
            service: StdMutex::new(ServiceState::default()),
            tracker: RequestTracker::new(),
            rate_limits,
            registry: AttributeSubscriptionRegistry::new(),
            rpc_handler: RwLock::new(None),
            connect_callback: RwLock::new(None),
            firmware: Mutex::new(firmware),
            installer: RwLock::new(None),
            extension: RwLock::new(None),
            firmware_tx: StdMutex::new(None),
            tasks: Mutex::new(None),
        })
    }

    fn service(&self) -> MutexGuard<'_, ServiceState> {
        self.service.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn tracker(&self) -> &RequestTracker {
        &self.tracker
    }

    pub fn registry(&self) -> &AttributeSubscriptionRegistry {
        &self.registry
    }

    /// The connection's own limiters.
    pub fn rate_limits(&self) -> &RateLimits {
        &self.rate_limits
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    pub fn service_configuration_required(&self) -> bool {
        self.service().request_required
    }

    pub fn service_configuration_received(&self) -> bool {
        self.service().received
    }

    pub fn max_payload_size(&self) -> Option<usize> {
        self.service().max_payload_size
    }

    pub fn max_inflight_messages(&self) -> Option<usize> {
        self.service().max_inflight_messages
    }

    pub async fn set_connect_callback(&self, callback: ConnectCallback) {
        *self.connect_callback.write().await = Some(callback);
    }

    pub async fn set_rpc_handler(&self, handler: RpcRequestHandler) {
        *self.rpc_handler.write().await = Some(handler);
    }

    pub async fn set_extension(&self, extension: Arc<dyn ConnectionExtension>) {
        *self.extension.write().await = Some(extension);
    }

    pub async fn set_firmware_installer(&self, installer: Arc<dyn FirmwareInstaller>) {
        *self.installer.write().await = Some(installer);
    }

    pub async fn set_current_firmware(&self, current: CurrentFirmware) {
        self.firmware.lock().await.set_current(current);
    }

    pub async fn firmware_state(&self) -> FirmwareState {
        self.firmware.lock().await.state()
    }

    /// Opens the connection and starts the dispatch and maintenance tasks.
    pub async fn connect(self: &Arc<Self>) -> Result<ConnectInfo> {
        {
            let mut state = self.state.write().await;
            if matches!(*state, ConnectionState::Connected | ConnectionState::Connecting) {
                return Err(ClientError::Connection(format!("already {:?}", *state)));
            }
            *state = ConnectionState::Connecting;
        }

        let options = ConnectOptions::from(&self.config);
        info!("Connecting to {}:{} as {}", options.host, options.port, options.client_id);

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let ack = match self.transport.connect(&options, events_tx).await {
            Ok(ack) => ack,
            Err(e) => {
                error!("connection FAIL with error {}", e);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e);
            }
        };

        if ack.code != 0 {
            *self.state.write().await = ConnectionState::Disconnected;
            return Err(Self::refused(ack.code));
        }

        let (firmware_tx, firmware_rx) = mpsc::unbounded_channel();
        *self.firmware_tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(firmware_tx);

        let cancel = CancellationToken::new();
        let handles = vec![
            tokio::spawn(self.clone().process_events(events_rx, cancel.clone())),
            tokio::spawn(self.clone().run_maintenance(cancel.clone())),
            tokio::spawn(self.clone().process_firmware(firmware_rx, cancel.clone())),
        ];
        if let Some(previous) = self.tasks.lock().await.replace(Tasks { cancel, handles }) {
            previous.cancel.cancel();
        }

        let info = ConnectInfo {
            session_present: ack.session_present,
            reason_code: ack.code,
        };
        self.on_connected(&info).await;
        Ok(info)
    }

    fn log_refusal(code: u8) {
        match connack_reason(code) {
            Some(reason) => error!("connection FAIL with error {} {}", code, reason),
            None => error!("connection FAIL with unknown error"),
        }
    }

    fn refused(code: u8) -> ClientError {
        Self::log_refusal(code);
        match connack_reason(code) {
            Some(reason) => ClientError::Connection(format!("{} {}", code, reason)),
            None => ClientError::Connection(format!("unknown error {}", code)),
        }
    }

    async fn on_connected(&self, info: &ConnectInfo) {
        *self.state.write().await = ConnectionState::Connected;
        info!("Connected to {}:{}", self.config.host, self.config.port);

        let qos = self.config.qos;
        let mut topics = TopicFilter::device_defaults(qos);
        if let Some(extension) = self.extension.read().await.as_ref() {
            topics.extend(extension.subscriptions(qos));
        }
        if self.firmware.lock().await.state().is_active() {
            topics.push(TopicFilter::firmware_responses(qos));
        }

        for filter in &topics {
            if let Err(e) = self.transport.subscribe(&filter.topic_pattern, filter.qos).await {
                error!("Failed to subscribe to {}: {}", filter.topic_pattern, e);
            }
        }

        // limits may have changed while offline
        {
            let mut service = self.service();
            service.request_required = true;
            service.received = false;
        }

        let callback = self.connect_callback.read().await.clone();
        if let Some(callback) = callback {
            callback(self, info);
        }
    }

    /// Stops the tasks, closes the transport and cancels every pending request.
    pub async fn disconnect(&self) -> Result<()> {
        *self.state.write().await = ConnectionState::Disconnected;

        if let Some(tasks) = self.tasks.lock().await.take() {
            tasks.cancel.cancel();
            drop(tasks.handles);
        }
        self.firmware_tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();

        let result = self.transport.disconnect().await;
        let cancelled = self.tracker.cancel_all();
        if cancelled > 0 {
            info!("Cancelled {} pending requests on disconnect", cancelled);
        }
        info!("Disconnected from {}:{}", self.config.host, self.config.port);
        result
    }

    async fn process_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<TransportEvent>, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                TransportEvent::Message { topic, payload } => {
                    if let Err(e) = self.dispatch(&topic, &payload).await {
                        error!("Failed to handle message on {}: {}", topic, e);
                    }
                }
                TransportEvent::Connected(ack) if ack.code == 0 => {
                    let info = ConnectInfo {
                        session_present: ack.session_present,
                        reason_code: ack.code,
                    };
                    self.on_connected(&info).await;
                }
                TransportEvent::Connected(ack) => {
                    Self::log_refusal(ack.code);
                    *self.state.write().await = ConnectionState::Reconnecting;
                }
                TransportEvent::Disconnected(reason) => {
                    let mut state = self.state.write().await;
                    if *state != ConnectionState::Disconnected {
                        warn!("Connection lost: {}", reason);
                        *state = ConnectionState::Reconnecting;
                    }
                }
            }
        }
        debug!("Event dispatcher stopped");
    }

    /// Routes one inbound message to its handler.
    pub async fn dispatch(self: &Arc<Self>, topic: &str, payload: &[u8]) -> Result<()> {
        let Some(route) = PlatformTopic::from_string(topic) else {
            warn!("No handler for topic {}, dropping message", topic);
            return Ok(());
        };

        if route.is_gateway() {
            let extension = self.extension.read().await.clone();
            return match extension {
                Some(extension) => extension.handle_message(self, &route, topic, payload).await,
                None => {
                    warn!("Gateway message on {} without a gateway, dropping", topic);
                    Ok(())
                }
            };
        }

        match route {
            PlatformTopic::DeviceAttributes => {
                let data: Value = serde_json::from_slice(payload)?;
                self.on_attribute_push(data).await
            }
            PlatformTopic::DeviceAttributesResponse(id) | PlatformTopic::DeviceRpcResponse(id) => {
                let result = parse_response(payload);
                if !self.tracker.resolve(id, topic, result) {
                    debug!("Unsolicited response on {}", topic);
                }
                Ok(())
            }
            PlatformTopic::DeviceRpcRequest(id) => {
                let body: Value = serde_json::from_slice(payload)?;
                let method = body
                    .get("method")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ClientError::Protocol(format!("RPC request {} without method", id)))?;
                let request = RpcRequest {
                    device: None,
                    id,
                    method: method.to_string(),
                    params: body.get("params").cloned().unwrap_or(Value::Null),
                };
                self.deliver_rpc(request).await;
                Ok(())
            }
            PlatformTopic::FirmwareResponse { request_id, chunk } => {
                let actions = self.firmware.lock().await.on_chunk(request_id, chunk, payload, Instant::now());
                self.queue_firmware_actions(actions)
            }
            other => {
                warn!("Unexpected inbound message on outbound topic {}", other);
                Ok(())
            }
        }
    }

    pub(crate) async fn deliver_rpc(&self, request: RpcRequest) {
        let handler = self.rpc_handler.read().await.clone();
        match handler {
            Some(handler) => handler(request),
            None => warn!("RPC request {} ({}) received but no handler is set", request.id, request.method),
        }
    }

    async fn on_attribute_push(&self, data: Value) -> Result<()> {
        let firmware_enabled = self.installer.read().await.is_some();
        if firmware_enabled {
            if let Some(info) = FirmwareInfo::from_attributes(&data) {
                self.start_firmware(info).await?;
            }
        }

        self.registry.dispatch(&AttributeUpdate { device: None, data }).await;
        Ok(())
    }

    async fn start_firmware(&self, info: FirmwareInfo) -> Result<()> {
        let request_id = self.tracker.reserve_id()?;
        let actions = self.firmware.lock().await.on_info(info, request_id, Instant::now());
        self.queue_firmware_actions(actions)
    }

    fn firmware_sender(&self) -> Result<mpsc::UnboundedSender<FirmwareInput>> {
        self.firmware_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(ClientError::NotConnected)
    }

    /// Hands actions to the firmware task; they may wait on rate limits.
    fn queue_firmware_actions(&self, actions: Vec<FirmwareAction>) -> Result<()> {
        if actions.is_empty() {
            return Ok(());
        }
        self.firmware_sender()?
            .send(FirmwareInput::Actions(actions))
            .map_err(|_| ClientError::NotConnected)
    }

    /// Reports the installed firmware and asks the server for the current one.
    pub async fn request_firmware_update(&self) -> Result<()> {
        // the firmware task only exists while connected
        self.firmware_sender()?;
        {
            let mut installer = self.installer.write().await;
            if installer.is_none() {
                *installer = Some(Arc::new(FileInstaller::new(self.config.firmware_dir.clone())));
            }
        }
        let actions = self.firmware.lock().await.begin_request();
        self.queue_firmware_actions(actions)
    }

    async fn run_firmware_actions(&self, actions: Vec<FirmwareAction>) {
        let mut queue: VecDeque<FirmwareAction> = actions.into();

        while let Some(action) = queue.pop_front() {
            let result = match action {
                FirmwareAction::Subscribe(topic) => self.transport.subscribe(&topic, self.config.qos).await,
                FirmwareAction::Unsubscribe(topic) => self.transport.unsubscribe(&topic).await,
                FirmwareAction::Publish { topic, payload } => {
                    self.publish_raw(&topic, payload.into_bytes(), &self.rate_limits.message_request()).await
                }
                FirmwareAction::Report(telemetry) => {
                    let datapoints = utils::entry_datapoints(&telemetry) as u64;
                    self.publish_json(
                        &PlatformTopic::DeviceTelemetry.to_string(),
                        &telemetry,
                        &self.rate_limits.telemetry_request(datapoints),
                    )
                    .await
                }
                FirmwareAction::RequestInfo => self.request_firmware_info().await,
                FirmwareAction::Install { info, image } => {
                    let installer = self.installer.read().await.clone();
                    let installed = match installer {
                        Some(installer) => installer.install(&info, &image).await,
                        None => Err(anyhow::anyhow!("no firmware installer configured")),
                    };
                    queue.extend(self.firmware.lock().await.on_installed(installed));
                    Ok(())
                }
            };

            if let Err(e) = result {
                error!("Firmware action failed: {}", e);
            }
        }
    }

    async fn request_firmware_info(&self) -> Result<()> {
        let responses = self.firmware_sender()?;
        let keys = utils::join_keys(&fw_keys::SHARED_KEYS);

        self.send_request_with_callback(
            |id| PlatformTopic::DeviceAttributesResponse(id).to_string(),
            |id| {
                (
                    PlatformTopic::DeviceAttributesRequest(id).to_string(),
                    json!({ "sharedKeys": keys }),
                )
            },
            &self.rate_limits.message_request(),
            self.config.request_timeout(),
            move |response| {
                // the firmware task is gone after disconnect
                let _ = responses.send(FirmwareInput::Info(response));
            },
        )
        .await?;
        Ok(())
    }

    /// Runs firmware side effects in order, so rate-limit waits and the
    /// installer never hold up inbound dispatch.
    async fn process_firmware(self: Arc<Self>, mut inputs: mpsc::UnboundedReceiver<FirmwareInput>, cancel: CancellationToken) {
        loop {
            let input = tokio::select! {
                _ = cancel.cancelled() => break,
                input = inputs.recv() => match input {
                    Some(input) => input,
                    None => break,
                },
            };

            match input {
                FirmwareInput::Actions(actions) => self.run_firmware_actions(actions).await,
                FirmwareInput::Info(response) => self.on_firmware_info(response).await,
            }
        }
        debug!("Firmware task stopped");
    }

    async fn on_firmware_info(&self, response: Result<Value>) {
        let info = response.as_ref().ok().and_then(FirmwareInfo::from_attributes);
        let actions = match (info, response) {
            (Some(info), _) => {
                if let Err(e) = self.start_firmware(info).await {
                    error!("Failed to start firmware update: {}", e);
                }
                return;
            }
            (None, Ok(_)) => {
                info!("No firmware assigned to this device");
                self.firmware.lock().await.on_info_unavailable()
            }
            (None, Err(e)) => {
                warn!("Firmware info request failed: {}", e);
                self.firmware.lock().await.on_info_unavailable()
            }
        };
        self.run_firmware_actions(actions).await;
    }

    async fn ensure_online(&self) -> Result<()> {
        match self.state().await {
            ConnectionState::Connected | ConnectionState::Reconnecting => Ok(()),
            _ => Err(ClientError::NotConnected),
        }
    }

    /// Publishes once every limiter in `limits` admits the message, waiting
    /// for window resets up to the configured bound.
    pub async fn publish_raw(&self, topic: &str, payload: Vec<u8>, limits: &[(&RateLimit, u64)]) -> Result<()> {
        self.ensure_online().await?;
        acquire_together(limits, self.config.rate_limit_wait()).await?;
        debug!("Publishing {} bytes to {}", payload.len(), topic);
        self.transport.publish(topic, payload, self.config.qos, false).await
    }

    pub async fn publish_json(&self, topic: &str, payload: &Value, limits: &[(&RateLimit, u64)]) -> Result<()> {
        let bytes = serde_json::to_vec(payload)?;
        self.publish_raw(topic, bytes, limits).await
    }

    /// Registers a pending request, then publishes it. A request whose
    /// publish fails is withdrawn and the error returned.
    pub async fn send_request(
        &self,
        response_topic: impl FnOnce(u32) -> String,
        request: impl FnOnce(u32) -> (String, Value),
        limits: &[(&RateLimit, u64)],
        timeout: Duration,
    ) -> Result<PendingResponse> {
        let pending = self.tracker.begin_wait(response_topic, timeout)?;
        let (topic, payload) = request(pending.id());
        if let Err(e) = self.publish_json(&topic, &payload, limits).await {
            self.tracker.withdraw(pending.id());
            return Err(e);
        }
        Ok(pending)
    }

    /// Callback form of [`send_request`](Self::send_request).
    pub async fn send_request_with_callback(
        &self,
        response_topic: impl FnOnce(u32) -> String,
        request: impl FnOnce(u32) -> (String, Value),
        limits: &[(&RateLimit, u64)],
        timeout: Duration,
        callback: impl FnOnce(Result<Value>) + Send + 'static,
    ) -> Result<u32> {
        let id = self.tracker.begin_callback(response_topic, timeout, callback)?;
        let (topic, payload) = request(id);
        if let Err(e) = self.publish_json(&topic, &payload, limits).await {
            self.tracker.withdraw(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Client-side RPC on the device's own RPC topics.
    pub async fn rpc_call(&self, method: &str, params: Value, timeout: Duration) -> Result<PendingResponse> {
        self.send_request(
            |id| PlatformTopic::DeviceRpcResponse(id).to_string(),
            |id| {
                (
                    PlatformTopic::DeviceRpcRequest(id).to_string(),
                    json!({ "method": method, "params": params }),
                )
            },
            &self.rate_limits.message_request(),
            timeout,
        )
        .await
    }

    async fn run_maintenance(self: Arc<Self>, cancel: CancellationToken) {
        let period = Duration::from_millis(self.config.maintenance_interval_ms.max(10));
        info!("Starting maintenance task with interval={:?}", period);
        let mut interval = time::interval(period);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let expired = self.tracker.expire();
            if expired > 0 {
                debug!("Expired {} pending requests", expired);
            }

            if self.is_connected().await && self.claim_service_request() {
                tokio::spawn(self.clone().request_service_configuration());
            }

            let actions = self.firmware.lock().await.check_timeout(Instant::now());
            if let Err(e) = self.queue_firmware_actions(actions) {
                warn!("Dropping firmware retry: {}", e);
            }
        }
        debug!("Maintenance task stopped");
    }

    fn claim_service_request(&self) -> bool {
        let mut service = self.service();
        if service.request_required && !service.request_in_flight {
            service.request_required = false;
            service.request_in_flight = true;
            true
        } else {
            false
        }
    }

    async fn request_service_configuration(self: Arc<Self>) {
        debug!("Requesting service configuration");
        let timeout = Duration::from_millis(SESSION_LIMITS_TIMEOUT_MS);
        let response = match self
            .rpc_call(SESSION_LIMITS_METHOD, json!({ "timeout": SESSION_LIMITS_TIMEOUT_MS }), timeout)
            .await
        {
            Ok(pending) => pending.wait().await,
            Err(e) => Err(e),
        };

        match response {
            Ok(config) => self.on_service_configuration(config).await,
            Err(e) => {
                warn!("Service configuration unavailable, keeping current limits: {}", e);
                self.service().received = true;
            }
        }
        self.service().request_in_flight = false;
    }

    /// Applies a `getSessionLimits` response, giving the extension the first look.
    pub async fn on_service_configuration(&self, config: Value) {
        let extension = self.extension.read().await.clone();
        let config = match extension {
            Some(extension) => match extension.on_service_configuration(self, config).await {
                Some(remainder) => remainder,
                None => return,
            },
            None => config,
        };
        self.apply_service_configuration(config);
    }

    fn apply_service_configuration(&self, config: Value) {
        if let Some(error) = config.get("error") {
            warn!("Service configuration request failed: {}", error);
            self.service().received = true;
            return;
        }

        let parsed: ServiceConfiguration = match serde_json::from_value(config) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Malformed service configuration: {}", e);
                self.service().received = true;
                return;
            }
        };

        if let Some(limits) = &parsed.rate_limits {
            self.rate_limits.apply(limits);
        }

        let mut service = self.service();
        if parsed.max_payload_size.is_some() {
            service.max_payload_size = parsed.max_payload_size;
        }
        if parsed.max_inflight_messages.is_some() {
            service.max_inflight_messages = parsed.max_inflight_messages;
        }
        service.received = true;
        info!(
            "Service configuration applied: max payload {:?}, max inflight {:?}",
            service.max_payload_size, service.max_inflight_messages
        );
    }

    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        self.transport.subscribe(topic, self.config.qos).await
    }
}

/// Responses are JSON; anything else is passed on as a string.
pub(crate) fn parse_response(payload: &[u8]) -> Result<Value> {
    match serde_json::from_slice(payload) {
        Ok(value) => Ok(value),
        Err(_) => match std::str::from_utf8(payload) {
            Ok(text) => Ok(Value::String(text.to_string())),
            Err(_) => Err(ClientError::Protocol("response is neither JSON nor UTF-8".to_string())),
        },
    }
}
