//! 边缘节点运行配置加载。

use std::env;
use std::time::Duration;

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env: {0}")]
    Missing(String),
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
}

/// 唯一支持的数据库驱动。
pub const SQLITE_DRIVER: &str = "sqlite";

/// 应用运行配置。
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub node_name: String,
    pub db_driver: String,
    pub db_name: String,
    pub db_source: String,
    pub dmi_sock_path: String,
    pub rate_limit_capacity: u32,
    pub rate_limit_refill_ms: u64,
    pub mqtt_enabled: bool,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_qos: u8,
    pub mqtt_publish_max_retries: u64,
    pub mqtt_publish_backoff_ms: u64,
    pub health_check_secs: u64,
    pub worker_timeout_secs: u64,
    pub db_retry_times: u32,
    pub db_retry_interval_ms: u64,
}

impl AppConfig {
    /// 从环境变量读取配置。
    pub fn from_env() -> Result<Self, ConfigError> {
        let node_name = env::var("TWIN_NODE_NAME")
            .map_err(|_| ConfigError::Missing("TWIN_NODE_NAME".to_string()))?;
        let db_driver = env::var("TWIN_DB_DRIVER").unwrap_or_else(|_| SQLITE_DRIVER.to_string());
        if db_driver != SQLITE_DRIVER {
            return Err(ConfigError::Invalid("TWIN_DB_DRIVER".to_string(), db_driver));
        }
        let db_name = env::var("TWIN_DB_NAME").unwrap_or_else(|_| "default".to_string());
        let db_source = env::var("TWIN_DB_SOURCE")
            .unwrap_or_else(|_| "/var/lib/kubeedge/edgecore.db".to_string());
        let dmi_sock_path = env::var("TWIN_DMI_SOCK_PATH")
            .unwrap_or_else(|_| "/etc/kubeedge/dmi.sock".to_string());
        let rate_limit_capacity = read_u32_with_default("TWIN_RATE_LIMIT_CAPACITY", 100)?;
        if rate_limit_capacity == 0 {
            return Err(ConfigError::Invalid(
                "TWIN_RATE_LIMIT_CAPACITY".to_string(),
                "0".to_string(),
            ));
        }
        let rate_limit_refill_ms = read_u64_with_default("TWIN_RATE_LIMIT_REFILL_MS", 1000)?;
        let mqtt_enabled = read_bool_with_default("TWIN_MQTT_ENABLED", false);
        let mqtt_host = env::var("TWIN_MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let mqtt_port = read_u16_with_default("TWIN_MQTT_PORT", 1883)?;
        let mqtt_username = read_optional("TWIN_MQTT_USERNAME");
        let mqtt_password = read_optional("TWIN_MQTT_PASSWORD");
        let mqtt_qos = read_u8_with_default("TWIN_MQTT_QOS", 1)?;
        let mqtt_publish_max_retries = read_u64_with_default("TWIN_MQTT_PUBLISH_MAX_RETRIES", 2)?;
        let mqtt_publish_backoff_ms = read_u64_with_default("TWIN_MQTT_PUBLISH_BACKOFF_MS", 200)?;
        let health_check_secs = read_u64_with_default("TWIN_HEALTH_CHECK_SECS", 60)?;
        let worker_timeout_secs = read_u64_with_default("TWIN_WORKER_TIMEOUT_SECS", 120)?;
        let db_retry_times = read_u32_with_default("TWIN_DB_RETRY_TIMES", 5)?;
        let db_retry_interval_ms = read_u64_with_default("TWIN_DB_RETRY_INTERVAL_MS", 10_000)?;

        Ok(Self {
            node_name,
            db_driver,
            db_name,
            db_source,
            dmi_sock_path,
            rate_limit_capacity,
            rate_limit_refill_ms,
            mqtt_enabled,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_qos,
            mqtt_publish_max_retries,
            mqtt_publish_backoff_ms,
            health_check_secs,
            worker_timeout_secs,
            db_retry_times,
            db_retry_interval_ms,
        })
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_secs)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }

    pub fn db_retry_interval(&self) -> Duration {
        Duration::from_millis(self.db_retry_interval_ms)
    }

    pub fn rate_limit_refill(&self) -> Duration {
        Duration::from_millis(self.rate_limit_refill_ms)
    }
}

fn read_u16_with_default(key: &str, default: u16) -> Result<u16, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u16>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_u8_with_default(key: &str, default: u8) -> Result<u8, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u8>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_u32_with_default(key: &str, default: u32) -> Result<u32, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u32>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_u64_with_default(key: &str, default: u64) -> Result<u64, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_optional(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

fn read_bool_with_default(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "on"),
        Err(_) => default,
    }
}
