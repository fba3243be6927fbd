use std::net::IpAddr;
use std::time::Duration;

use relay_core::{DEFAULT_MAX_READ_MESSAGE_SIZE, DEFAULT_WRITE_LIST_LIMIT, SessionOptions};
use serde::Deserialize;

pub const DEFAULT_RESPONSE_QUEUE_LIMIT: usize = 64;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub address: IpAddr,
    pub port: u16,

    /// Worker pool size. Consumed by the binary that builds the runtime;
    /// the library runs on whatever runtime drives it.
    #[serde(default = "default_thread_count")]
    pub thread_count: usize,

    /// Liveness interval. A session that shows no activity for two intervals
    /// in a row is torn down.
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    #[serde(default = "default_max_read_message_size")]
    pub max_read_message_size: usize,

    #[serde(default = "default_response_queue_limit")]
    pub response_queue_limit: usize,

    #[serde(default = "default_write_list_limit")]
    pub write_list_limit: usize,

    /// HTTP read timeout. Defaults to the ping interval.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

fn default_thread_count() -> usize {
    1
}

fn default_ping_interval_ms() -> u64 {
    15_000
}

fn default_max_read_message_size() -> usize {
    DEFAULT_MAX_READ_MESSAGE_SIZE
}

fn default_response_queue_limit() -> usize {
    DEFAULT_RESPONSE_QUEUE_LIMIT
}

fn default_write_list_limit() -> usize {
    DEFAULT_WRITE_LIST_LIMIT
}

impl ServerConfig {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self {
            address,
            port,
            thread_count: default_thread_count(),
            ping_interval_ms: default_ping_interval_ms(),
            max_read_message_size: default_max_read_message_size(),
            response_queue_limit: default_response_queue_limit(),
            write_list_limit: default_write_list_limit(),
            request_timeout_ms: None,
        }
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.ping_interval())
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            ping_interval: self.ping_interval(),
            write_list_limit: self.write_list_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: ServerConfig = serde_json::from_str(r#"{"address": "127.0.0.1", "port": 8080}"#).unwrap();
        assert_eq!(config.thread_count, 1);
        assert_eq!(config.ping_interval(), Duration::from_secs(15));
        assert_eq!(config.max_read_message_size, 16 * 1024 * 1024);
        assert_eq!(config.response_queue_limit, 64);
        assert_eq!(config.write_list_limit, 64);
        assert_eq!(config.request_timeout(), config.ping_interval());
    }

    #[test]
    fn test_request_timeout_override() {
        let mut config = ServerConfig::new("0.0.0.0".parse().unwrap(), 0);
        config.request_timeout_ms = Some(250);
        assert_eq!(config.request_timeout(), Duration::from_millis(250));
    }
}
