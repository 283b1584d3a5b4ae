use std::path::PathBuf;
use std::time::Duration;

use config::{ConfigError, Environment};
use serde::Deserialize;

use crate::payments::service::DEFAULT_MAX_IN_FLIGHT;
use crate::transport::Endpoint;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Public Unix socket path
    pub socket: String,
    /// Listen on TCP instead of `socket` when set
    pub bind_address: Option<String>,
    /// Sibling instance's private socket; unset means local-only summaries
    pub peer_socket: Option<String>,
    pub main_processor_host: String,
    pub main_processor_port: u16,
    pub fallback_processor_host: String,
    pub fallback_processor_port: u16,
    pub processor_pool_size: usize,
    /// Payments dispatched concurrently before ingestion spills into the retry queue
    pub max_in_flight: usize,
    pub rinha_dlq_buffer_size: usize,
    pub rinha_dlq_worker_num: usize,
    pub fallback_enabled: bool,
    pub health_check_interval_ms: u64,
    pub health_recovery_delay_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_environment(Environment::default().try_parsing(true))
    }

    fn from_environment(environment: Environment) -> Result<Self, ConfigError> {
        config::Config::builder()
            .set_default("socket", "/tmp/rinha.sock")?
            .set_default("main_processor_host", "localhost")?
            .set_default("main_processor_port", 8001)?
            .set_default("fallback_processor_host", "localhost")?
            .set_default("fallback_processor_port", 8002)?
            .set_default("processor_pool_size", 256)?
            .set_default("max_in_flight", DEFAULT_MAX_IN_FLIGHT as i64)?
            .set_default("rinha_dlq_buffer_size", 7000)?
            .set_default("rinha_dlq_worker_num", 1)?
            .set_default("fallback_enabled", false)?
            .set_default("health_check_interval_ms", 5000)?
            .set_default("health_recovery_delay_ms", 5040)?
            .add_source(environment)
            .build()?
            .try_deserialize()
    }

    pub fn listen_endpoint(&self) -> Endpoint {
        match non_empty(&self.bind_address) {
            Some(address) => Endpoint::Tcp(address.to_string()),
            None => Endpoint::Unix(PathBuf::from(&self.socket)),
        }
    }

    /// A path is a Unix socket; `host:port` is TCP
    pub fn peer_endpoint(&self) -> Option<Endpoint> {
        non_empty(&self.peer_socket).map(|peer| {
            if !peer.starts_with('/') && peer.contains(':') {
                Endpoint::Tcp(peer.to_string())
            } else {
                Endpoint::Unix(PathBuf::from(peer))
            }
        })
    }

    pub fn main_processor_address(&self) -> String {
        format!("{}:{}", self.main_processor_host, self.main_processor_port)
    }

    pub fn fallback_processor_address(&self) -> String {
        format!("{}:{}", self.fallback_processor_host, self.fallback_processor_port)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn health_recovery_delay(&self) -> Duration {
        Duration::from_millis(self.health_recovery_delay_ms)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}
