//! MQTT client for a ThingsBoard-style platform.
//!
//! [`DeviceClient`] speaks for a single device; [`GatewayMultiplexer`] shares
//! one connection among many logical devices. Both sit on a
//! [`ConnectionManager`] which owns the transport, request correlation,
//! rate limiting, attribute subscriptions and firmware updates.

pub mod attributes;
pub mod checksum;
pub mod connection;
pub mod device;
pub mod firmware;
pub mod gateway;
pub mod rate_limit;
pub mod request_tracker;
pub mod transport;

pub use attributes::{AttributeCallback, AttributeScope, AttributeSubscriptionRegistry, SubscriptionTarget};
pub use checksum::{verify_checksum, ChecksumAlgorithm};
pub use connection::{ConnectCallback, ConnectionExtension, ConnectionManager, RpcRequestHandler};
pub use device::{rpc_handler, DeviceClient};
pub use firmware::{FileInstaller, FirmwareInstaller, FirmwareSession, FirmwareState};
pub use gateway::{GatewayMultiplexer, LogicalDevice};
pub use rate_limit::{parse_rate_limit, RateLimit, RateLimits, TrafficCategory};
pub use request_tracker::{PendingResponse, RequestTracker};
pub use transport::{RumqttTransport, Transport, TransportEvent};

pub use tb_shared::{ClientConfig, ClientError, Result};
