use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

// Error taxonomy
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Client is not connected")]
    NotConnected,

    #[error("Request {id} timed out after {timeout:?}")]
    Timeout { id: u32, timeout: Duration },

    #[error("Request {0} was cancelled")]
    Cancelled(u32),

    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Unsupported checksum algorithm: {0}")]
    UnsupportedChecksumAlgorithm(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Device not connected: {0}")]
    DeviceNotConnected(String),

    #[error("No free request id left")]
    RequestIdsExhausted,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ClientError {
    /// Errors the caller can retry without reconnecting.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ClientError::Timeout { .. } | ClientError::Cancelled(_) | ClientError::RateLimitExceeded(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Connection lifecycle of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Outcome of the MQTT handshake handed to the user connect callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectInfo {
    pub session_present: bool,
    pub reason_code: u8,
}

// Firmware attribute and telemetry keys
pub mod fw_keys {
    pub const TITLE: &str = "fw_title";
    pub const VERSION: &str = "fw_version";
    pub const SIZE: &str = "fw_size";
    pub const CHECKSUM: &str = "fw_checksum";
    pub const CHECKSUM_ALGORITHM: &str = "fw_checksum_algorithm";
    pub const STATE: &str = "fw_state";
    pub const ERROR: &str = "fw_error";
    pub const CURRENT_TITLE: &str = "current_fw_title";
    pub const CURRENT_VERSION: &str = "current_fw_version";

    pub const SHARED_KEYS: [&str; 5] = [CHECKSUM, CHECKSUM_ALGORITHM, SIZE, TITLE, VERSION];
}

/// Firmware metadata announced by the server through shared attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareInfo {
    #[serde(rename = "fw_title")]
    pub title: String,
    #[serde(rename = "fw_version")]
    pub version: String,
    #[serde(rename = "fw_size")]
    pub size: usize,
    #[serde(rename = "fw_checksum")]
    pub checksum: String,
    #[serde(rename = "fw_checksum_algorithm")]
    pub checksum_algorithm: String,
}

impl FirmwareInfo {
    /// Reads firmware metadata from an attribute object. Accepts both the flat
    /// push shape and the `{"shared": {...}}` response shape.
    pub fn from_attributes(value: &Value) -> Option<Self> {
        let source = value.get("shared").unwrap_or(value);
        if source.get(fw_keys::TITLE).is_none() || source.get(fw_keys::VERSION).is_none() {
            return None;
        }
        serde_json::from_value(source.clone()).ok()
    }
}

/// Firmware the device is currently running.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentFirmware {
    #[serde(rename = "current_fw_title")]
    pub title: Option<String>,
    #[serde(rename = "current_fw_version")]
    pub version: Option<String>,
}

impl CurrentFirmware {
    pub fn matches(&self, info: &FirmwareInfo) -> bool {
        self.title.as_deref() == Some(info.title.as_str())
            && self.version.as_deref() == Some(info.version.as_str())
    }
}

/// Values reported under `fw_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FirmwareReportState {
    Downloading,
    Downloaded,
    Verified,
    Updating,
    Updated,
    Failed,
}

/// Server-to-device RPC, addressed to the client itself or to a gateway device.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub device: Option<String>,
    pub id: u32,
    pub method: String,
    pub params: Value,
}

/// Attribute change notification delivered to subscription callbacks.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeUpdate {
    pub device: Option<String>,
    pub data: Value,
}

/// Limits the server advertises for one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitsConfig {
    pub messages: Option<String>,
    pub telemetry_messages: Option<String>,
    pub telemetry_data_points: Option<String>,
}

/// Response to the `getSessionLimits` RPC.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfiguration {
    pub rate_limits: Option<RateLimitsConfig>,
    pub gateway_rate_limits: Option<RateLimitsConfig>,
    pub max_payload_size: Option<usize>,
    pub max_inflight_messages: Option<usize>,
}
