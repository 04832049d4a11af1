use crate::mqtt::{qos_serde, QoS};
use crate::types::ClientError;
use anyhow::Result;
use config::{Config, Environment, File};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Keyword that resolves a rate limit from the broker host.
pub const DEFAULT_RATE_LIMIT: &str = "DEFAULT";
/// Sentinel meaning "no limit".
pub const NO_LIMIT: &str = "0:0,";

pub const MAX_FIRMWARE_CHUNK_SIZE: usize = 8192;
/// Largest firmware image accepted unless configured otherwise (64 MiB).
pub const DEFAULT_MAX_FIRMWARE_SIZE: usize = 64 * 1024 * 1024;

/// Client configuration. Every field except `host` has a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Device access token, sent as the MQTT user name.
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub keep_alive_secs: u64,
    #[serde(with = "qos_serde")]
    pub qos: QoS,
    pub clean_session: bool,
    pub reconnect_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub rate_limit_wait_ms: u64,
    pub maintenance_interval_ms: u64,
    pub messages_rate_limit: String,
    pub telemetry_rate_limit: String,
    pub telemetry_dp_rate_limit: String,
    pub rate_limit_percentage: u64,
    pub firmware_chunk_size: usize,
    pub firmware_chunk_timeout_ms: u64,
    pub firmware_max_retries: u32,
    /// Announced images above this size are refused.
    pub firmware_max_size: usize,
    pub firmware_dir: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: format!("tb-{}", uuid::Uuid::new_v4()),
            keep_alive_secs: 120,
            qos: QoS::AtLeastOnce,
            clean_session: true,
            reconnect_delay_ms: 5000,
            connect_timeout_ms: 10_000,
            request_timeout_ms: 10_000,
            rate_limit_wait_ms: 30_000,
            maintenance_interval_ms: 1000,
            messages_rate_limit: DEFAULT_RATE_LIMIT.to_string(),
            telemetry_rate_limit: DEFAULT_RATE_LIMIT.to_string(),
            telemetry_dp_rate_limit: DEFAULT_RATE_LIMIT.to_string(),
            rate_limit_percentage: 100,
            firmware_chunk_size: 4096,
            firmware_chunk_timeout_ms: 10_000,
            firmware_max_retries: 5,
            firmware_max_size: DEFAULT_MAX_FIRMWARE_SIZE,
            firmware_dir: PathBuf::from("."),
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16, username: Option<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username,
            ..Self::default()
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn rate_limit_wait(&self) -> Duration {
        Duration::from_millis(self.rate_limit_wait_ms)
    }

    /// Messages limit with `DEFAULT` resolved against the host.
    pub fn resolved_messages_rate_limit(&self) -> String {
        rate_limit_for_host(&self.host, &self.messages_rate_limit)
    }

    pub fn resolved_telemetry_rate_limit(&self) -> String {
        rate_limit_for_host(&self.host, &self.telemetry_rate_limit)
    }

    pub fn resolved_telemetry_dp_rate_limit(&self) -> String {
        dp_rate_limit_for_host(&self.host, &self.telemetry_dp_rate_limit)
    }

    pub fn validate(&self) -> std::result::Result<(), ClientError> {
        if self.host.trim().is_empty() {
            return Err(ClientError::Config("host cannot be empty".to_string()));
        }

        if self.port == 0 {
            return Err(ClientError::Config("port cannot be zero".to_string()));
        }

        if self.firmware_chunk_size == 0 || self.firmware_chunk_size > MAX_FIRMWARE_CHUNK_SIZE {
            return Err(ClientError::Config(format!(
                "firmware_chunk_size must be between 1 and {}",
                MAX_FIRMWARE_CHUNK_SIZE
            )));
        }

        if self.firmware_max_size == 0 {
            return Err(ClientError::Config("firmware_max_size cannot be zero".to_string()));
        }

        if self.rate_limit_percentage == 0 || self.rate_limit_percentage > 100 {
            return Err(ClientError::Config(
                "rate_limit_percentage must be between 1 and 100".to_string(),
            ));
        }

        Ok(())
    }
}

fn is_cloud_host(host: &str) -> bool {
    host.contains("thingsboard.cloud")
        || host.contains("demo.thingsboard.io")
        || (host.contains("tb") && host.contains("cloud"))
}

/// Resolves the `DEFAULT` keyword for message and telemetry limits.
pub fn rate_limit_for_host(host: &str, rate_limit: &str) -> String {
    if rate_limit != DEFAULT_RATE_LIMIT {
        return rate_limit.to_string();
    }

    if is_cloud_host(host) {
        "10:1,60:60,".to_string()
    } else {
        NO_LIMIT.to_string()
    }
}

/// Resolves the `DEFAULT` keyword for the telemetry datapoint limit.
pub fn dp_rate_limit_for_host(host: &str, rate_limit: &str) -> String {
    if rate_limit != DEFAULT_RATE_LIMIT {
        return rate_limit.to_string();
    }

    if is_cloud_host(host) {
        "10:1,300:60,".to_string()
    } else {
        NO_LIMIT.to_string()
    }
}

pub fn load_config() -> Result<ClientConfig> {
    // .env is optional
    dotenv().ok();

    let settings = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            File::with_name(&format!("config/{}", env::var("ENV").unwrap_or_else(|_| "development".to_string())))
                .required(false)
        )
        // TB__HOST, TB__PORT, TB__USERNAME, ...
        .add_source(Environment::with_prefix("TB").separator("__"))
        .build()?;

    let config: ClientConfig = settings.try_deserialize()?;

    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.port, 1883);
        assert_eq!(config.keep_alive_secs, 120);
        assert_eq!(config.qos, QoS::AtLeastOnce);
        assert!(config.client_id.starts_with("tb-"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rate_limit_resolution() {
        assert_eq!(rate_limit_for_host("thingsboard.cloud", DEFAULT_RATE_LIMIT), "10:1,60:60,");
        assert_eq!(dp_rate_limit_for_host("eu.thingsboard.cloud", DEFAULT_RATE_LIMIT), "10:1,300:60,");
        assert_eq!(rate_limit_for_host("localhost", DEFAULT_RATE_LIMIT), NO_LIMIT);
        assert_eq!(rate_limit_for_host("localhost", "5:1"), "5:1");
    }

    #[test]
    fn test_validation() {
        let mut config = ClientConfig::new("", 1883, None);
        assert!(config.validate().is_err());

        config.host = "localhost".to_string();
        config.firmware_chunk_size = MAX_FIRMWARE_CHUNK_SIZE + 1;
        assert!(config.validate().is_err());

        config.firmware_chunk_size = 1024;
        config.firmware_max_size = 0;
        assert!(config.validate().is_err());

        config.firmware_max_size = DEFAULT_MAX_FIRMWARE_SIZE;
        config.rate_limit_percentage = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: ClientConfig = serde_json::from_value(serde_json::json!({
            "host": "broker.local",
            "username": "T",
            "qos": 0
        }))
        .unwrap();
        assert_eq!(config.host, "broker.local");
        assert_eq!(config.username.as_deref(), Some("T"));
        assert_eq!(config.qos, QoS::AtMostOnce);
        assert_eq!(config.port, 1883);
    }
}
