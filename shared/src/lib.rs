//! Wire vocabulary shared by the device and gateway sides of the client:
//! topics, payload types, the error taxonomy and configuration loading.

pub mod config;
pub mod mqtt;
pub mod types;
pub mod utils;

pub use config::{load_config, ClientConfig, DEFAULT_MAX_FIRMWARE_SIZE, NO_LIMIT};
pub use mqtt::{connack_reason, filters, topic_matches, PlatformTopic, QoS, TopicFilter};
pub use types::*;
pub use utils::now_utc;
