use serde::{Deserialize, Serialize};
use std::fmt;

pub(crate) mod qos_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use super::QoS;

    pub fn serialize<S>(qos: &QoS, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(*qos as u8)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<QoS, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = u8::deserialize(deserializer)?;
        QoS::from_u8(value)
            .ok_or_else(|| serde::de::Error::custom(format!("Invalid QoS value: {}", value)))
    }
}

/// MQTT delivery guarantee requested for a publish or subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QoS {
    AtMostOnce = 0,
    #[default]
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

/// Topic filters the client subscribes to.
pub mod filters {
    pub const DEVICE_ATTRIBUTES: &str = "v1/devices/me/attributes";
    pub const DEVICE_ATTRIBUTES_RESPONSE: &str = "v1/devices/me/attributes/response/+";
    pub const DEVICE_RPC_REQUEST: &str = "v1/devices/me/rpc/request/+";
    pub const DEVICE_RPC_RESPONSE: &str = "v1/devices/me/rpc/response/+";
    pub const FIRMWARE_RESPONSE: &str = "v2/fw/response/+/chunk/+";
    pub const GATEWAY_ATTRIBUTES: &str = "v1/gateway/attributes";
    pub const GATEWAY_ATTRIBUTES_RESPONSE: &str = "v1/gateway/attributes/response";
    pub const GATEWAY_RPC: &str = "v1/gateway/rpc";
}

/// Every topic the platform protocol uses, in both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformTopic {
    DeviceTelemetry,                       // v1/devices/me/telemetry
    DeviceAttributes,                      // v1/devices/me/attributes
    DeviceAttributesRequest(u32),          // v1/devices/me/attributes/request/{id}
    DeviceAttributesResponse(u32),         // v1/devices/me/attributes/response/{id}
    DeviceRpcRequest(u32),                 // v1/devices/me/rpc/request/{id}
    DeviceRpcResponse(u32),                // v1/devices/me/rpc/response/{id}
    DeviceClaim,                           // v1/devices/me/claim
    FirmwareRequest { request_id: u32, chunk: u32 },  // v2/fw/request/{id}/chunk/{n}
    FirmwareResponse { request_id: u32, chunk: u32 }, // v2/fw/response/{id}/chunk/{n}

    GatewayConnect,                        // v1/gateway/connect
    GatewayDisconnect,                     // v1/gateway/disconnect
    GatewayTelemetry,                      // v1/gateway/telemetry
    GatewayAttributes,                     // v1/gateway/attributes
    GatewayAttributesRequest,              // v1/gateway/attributes/request
    GatewayAttributesResponse,             // v1/gateway/attributes/response
    GatewayRpc,                            // v1/gateway/rpc
    GatewayClaim,                          // v1/gateway/claim
}

impl fmt::Display for PlatformTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformTopic::DeviceTelemetry => write!(f, "v1/devices/me/telemetry"),
            PlatformTopic::DeviceAttributes => write!(f, "v1/devices/me/attributes"),
            PlatformTopic::DeviceAttributesRequest(id) => write!(f, "v1/devices/me/attributes/request/{}", id),
            PlatformTopic::DeviceAttributesResponse(id) => write!(f, "v1/devices/me/attributes/response/{}", id),
            PlatformTopic::DeviceRpcRequest(id) => write!(f, "v1/devices/me/rpc/request/{}", id),
            PlatformTopic::DeviceRpcResponse(id) => write!(f, "v1/devices/me/rpc/response/{}", id),
            PlatformTopic::DeviceClaim => write!(f, "v1/devices/me/claim"),
            PlatformTopic::FirmwareRequest { request_id, chunk } => {
                write!(f, "v2/fw/request/{}/chunk/{}", request_id, chunk)
            }
            PlatformTopic::FirmwareResponse { request_id, chunk } => {
                write!(f, "v2/fw/response/{}/chunk/{}", request_id, chunk)
            }
            PlatformTopic::GatewayConnect => write!(f, "v1/gateway/connect"),
            PlatformTopic::GatewayDisconnect => write!(f, "v1/gateway/disconnect"),
            PlatformTopic::GatewayTelemetry => write!(f, "v1/gateway/telemetry"),
            PlatformTopic::GatewayAttributes => write!(f, "v1/gateway/attributes"),
            PlatformTopic::GatewayAttributesRequest => write!(f, "v1/gateway/attributes/request"),
            PlatformTopic::GatewayAttributesResponse => write!(f, "v1/gateway/attributes/response"),
            PlatformTopic::GatewayRpc => write!(f, "v1/gateway/rpc"),
            PlatformTopic::GatewayClaim => write!(f, "v1/gateway/claim"),
        }
    }
}

impl PlatformTopic {
    /// Parses a concrete topic. Returns `None` for anything outside the protocol,
    /// including id segments that are not numeric.
    pub fn from_string(topic: &str) -> Option<Self> {
        let parts: Vec<&str> = topic.split('/').collect();

        match parts.as_slice() {
            ["v1", "devices", "me", "telemetry"] => Some(PlatformTopic::DeviceTelemetry),
            ["v1", "devices", "me", "attributes"] => Some(PlatformTopic::DeviceAttributes),
            ["v1", "devices", "me", "attributes", "request", id] => {
                id.parse().ok().map(PlatformTopic::DeviceAttributesRequest)
            }
            ["v1", "devices", "me", "attributes", "response", id] => {
                id.parse().ok().map(PlatformTopic::DeviceAttributesResponse)
            }
            ["v1", "devices", "me", "rpc", "request", id] => {
                id.parse().ok().map(PlatformTopic::DeviceRpcRequest)
            }
            ["v1", "devices", "me", "rpc", "response", id] => {
                id.parse().ok().map(PlatformTopic::DeviceRpcResponse)
            }
            ["v1", "devices", "me", "claim"] => Some(PlatformTopic::DeviceClaim),
            ["v2", "fw", "request", id, "chunk", n] => Some(PlatformTopic::FirmwareRequest {
                request_id: id.parse().ok()?,
                chunk: n.parse().ok()?,
            }),
            ["v2", "fw", "response", id, "chunk", n] => Some(PlatformTopic::FirmwareResponse {
                request_id: id.parse().ok()?,
                chunk: n.parse().ok()?,
            }),
            ["v1", "gateway", "connect"] => Some(PlatformTopic::GatewayConnect),
            ["v1", "gateway", "disconnect"] => Some(PlatformTopic::GatewayDisconnect),
            ["v1", "gateway", "telemetry"] => Some(PlatformTopic::GatewayTelemetry),
            ["v1", "gateway", "attributes"] => Some(PlatformTopic::GatewayAttributes),
            ["v1", "gateway", "attributes", "request"] => Some(PlatformTopic::GatewayAttributesRequest),
            ["v1", "gateway", "attributes", "response"] => Some(PlatformTopic::GatewayAttributesResponse),
            ["v1", "gateway", "rpc"] => Some(PlatformTopic::GatewayRpc),
            ["v1", "gateway", "claim"] => Some(PlatformTopic::GatewayClaim),
            _ => None,
        }
    }

    /// Correlation id carried in the topic path, if any.
    pub fn request_id(&self) -> Option<u32> {
        match self {
            PlatformTopic::DeviceAttributesRequest(id)
            | PlatformTopic::DeviceAttributesResponse(id)
            | PlatformTopic::DeviceRpcRequest(id)
            | PlatformTopic::DeviceRpcResponse(id) => Some(*id),
            PlatformTopic::FirmwareRequest { request_id, .. }
            | PlatformTopic::FirmwareResponse { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    pub fn is_gateway(&self) -> bool {
        matches!(
            self,
            PlatformTopic::GatewayConnect
                | PlatformTopic::GatewayDisconnect
                | PlatformTopic::GatewayTelemetry
                | PlatformTopic::GatewayAttributes
                | PlatformTopic::GatewayAttributesRequest
                | PlatformTopic::GatewayAttributesResponse
                | PlatformTopic::GatewayRpc
                | PlatformTopic::GatewayClaim
        )
    }
}

/// MQTT topic-filter matching with `+` (one level) and `#` (remaining levels).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Topic filter with the QoS it is subscribed at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicFilter {
    pub topic_pattern: String,
    #[serde(with = "qos_serde")]
    pub qos: QoS,
}

impl TopicFilter {
    pub fn new(topic_pattern: impl Into<String>, qos: QoS) -> Self {
        Self {
            topic_pattern: topic_pattern.into(),
            qos,
        }
    }

    /// Subscriptions every client re-establishes on (re)connect.
    pub fn device_defaults(qos: QoS) -> Vec<Self> {
        vec![
            Self::new(filters::DEVICE_ATTRIBUTES, qos),
            Self::new(filters::DEVICE_ATTRIBUTES_RESPONSE, qos),
            Self::new(filters::DEVICE_RPC_REQUEST, qos),
            Self::new(filters::DEVICE_RPC_RESPONSE, qos),
        ]
    }

    /// Additional subscriptions of a gateway connection.
    pub fn gateway_defaults(qos: QoS) -> Vec<Self> {
        vec![
            Self::new(filters::GATEWAY_ATTRIBUTES, qos),
            Self::new(filters::GATEWAY_ATTRIBUTES_RESPONSE, qos),
            Self::new(filters::GATEWAY_RPC, qos),
        ]
    }

    pub fn firmware_responses(qos: QoS) -> Self {
        Self::new(filters::FIRMWARE_RESPONSE, qos)
    }

    pub fn matches(&self, topic: &str) -> bool {
        topic_matches(&self.topic_pattern, topic)
    }
}

/// Human readable text for a CONNACK return code, `None` when the code is unknown.
pub fn connack_reason(code: u8) -> Option<&'static str> {
    match code {
        1 => Some("incorrect protocol version"),
        2 => Some("invalid client identifier"),
        3 => Some("server unavailable"),
        4 => Some("bad username or password"),
        5 => Some("not authorised"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_parsing() {
        let topic = "v1/devices/me/attributes/response/17";
        let parsed = PlatformTopic::from_string(topic);
        assert_eq!(parsed, Some(PlatformTopic::DeviceAttributesResponse(17)));

        let constructed = PlatformTopic::DeviceAttributesResponse(17).to_string();
        assert_eq!(constructed, topic);
    }

    #[test]
    fn test_firmware_topic_parsing() {
        let parsed = PlatformTopic::from_string("v2/fw/response/3/chunk/12").unwrap();
        assert_eq!(parsed, PlatformTopic::FirmwareResponse { request_id: 3, chunk: 12 });
        assert_eq!(parsed.request_id(), Some(3));
        assert_eq!(
            PlatformTopic::FirmwareRequest { request_id: 3, chunk: 0 }.to_string(),
            "v2/fw/request/3/chunk/0"
        );
    }

    #[test]
    fn test_non_numeric_id_is_rejected() {
        assert_eq!(PlatformTopic::from_string("v1/devices/me/rpc/request/abc"), None);
        assert_eq!(PlatformTopic::from_string("v1/devices/other/telemetry"), None);
    }

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("v1/devices/me/rpc/request/+", "v1/devices/me/rpc/request/5"));
        assert!(!topic_matches("v1/devices/me/rpc/request/+", "v1/devices/me/rpc/request/5/x"));
        assert!(topic_matches("v2/fw/response/+/chunk/+", "v2/fw/response/1/chunk/0"));
        assert!(topic_matches("v1/#", "v1/gateway/rpc"));
        assert!(topic_matches("v1/gateway/rpc", "v1/gateway/rpc"));
        assert!(!topic_matches("v1/gateway/rpc", "v1/gateway/attributes"));
    }

    #[test]
    fn test_default_filters() {
        let defaults = TopicFilter::device_defaults(QoS::AtLeastOnce);
        assert_eq!(defaults.len(), 4);
        assert_eq!(defaults[0].topic_pattern, "v1/devices/me/attributes");
        assert!(defaults[3].matches("v1/devices/me/rpc/response/9"));
        assert_eq!(TopicFilter::gateway_defaults(QoS::AtMostOnce).len(), 3);
    }

    #[test]
    fn test_connack_reason() {
        assert_eq!(connack_reason(4), Some("bad username or password"));
        assert_eq!(connack_reason(999u16 as u8), None);
    }
}
