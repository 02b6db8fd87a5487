use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Includes settings for the broker's listening side, the routing engine and
/// the client transport.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub client: ClientSettings,
}

/// Where and how the broker daemon listens.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    /// Listen addresses, `tcp://host:port` or `unix:///path`.
    pub listen: Vec<String>,
    pub no_delay: bool,
    pub pid_file: PathBuf,
}

/// Limits of the routing engine.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub max_connections: usize,
    pub max_routes: usize,
    pub max_payload_length: usize,
    /// Frames queued for one client before it counts as dead.
    pub outbound_queue_length: usize,
    /// Install a catch-all route that logs every message.
    pub debug_route: bool,
}

/// Connection behaviour of the client transport.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ClientSettings {
    pub address: String,
    pub connect_attempts: u32,
    pub retry_delay_ms: u64,
    pub send_attempts: u32,
    pub max_subscriptions: usize,
    pub max_payload_length: usize,
    pub no_delay: bool,
}

impl ClientSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Partial configuration settings loaded from files or environment.
///
/// Settings where every field is optional. Missing values can be filled using defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub client: Option<PartialClientSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub listen: Option<Vec<String>>,
    pub no_delay: Option<bool>,
    pub pid_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub max_connections: Option<usize>,
    pub max_routes: Option<usize>,
    pub max_payload_length: Option<usize>,
    pub outbound_queue_length: Option<usize>,
    pub debug_route: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct PartialClientSettings {
    pub address: Option<String>,
    pub connect_attempts: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub send_attempts: Option<u32>,
    pub max_subscriptions: Option<usize>,
    pub max_payload_length: Option<usize>,
    pub no_delay: Option<bool>,
}

pub const DEFAULT_BROKER_ADDRESS: &str = "tcp://127.0.0.1:10001";
pub const DEFAULT_MAX_PAYLOAD_LENGTH: usize = 4 * 1024 * 1024;

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: vec![DEFAULT_BROKER_ADDRESS.to_string()],
            no_delay: true,
            pid_file: PathBuf::from("/tmp/popbusd.pid"),
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            max_connections: 64,
            max_routes: 512,
            max_payload_length: DEFAULT_MAX_PAYLOAD_LENGTH,
            outbound_queue_length: 1024,
            debug_route: false,
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            address: DEFAULT_BROKER_ADDRESS.to_string(),
            connect_attempts: 4,
            retry_delay_ms: 1000,
            send_attempts: 3,
            max_subscriptions: 64,
            max_payload_length: DEFAULT_MAX_PAYLOAD_LENGTH,
            no_delay: true,
        }
    }
}

/// Provides default values for `Settings`.
///
/// A broker started without any configuration listens on the well-known
/// local TCP port.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            broker: BrokerSettings::default(),
            client: ClientSettings::default(),
        }
    }
}
