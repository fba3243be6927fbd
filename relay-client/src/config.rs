use std::time::Duration;

use relay_core::{DEFAULT_MAX_READ_MESSAGE_SIZE, DEFAULT_WRITE_LIST_LIMIT, SessionOptions};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    #[serde(default = "default_max_read_message_size")]
    pub max_read_message_size: usize,

    #[serde(default = "default_write_list_limit")]
    pub write_list_limit: usize,
}

fn default_ping_interval_ms() -> u64 {
    15_000
}

fn default_max_read_message_size() -> usize {
    DEFAULT_MAX_READ_MESSAGE_SIZE
}

fn default_write_list_limit() -> usize {
    DEFAULT_WRITE_LIST_LIMIT
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval_ms(),
            max_read_message_size: default_max_read_message_size(),
            write_list_limit: default_write_list_limit(),
        }
    }
}

impl ClientConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            ping_interval: self.ping_interval(),
            write_list_limit: self.write_list_limit,
        }
    }
}
