mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{
    BrokerSettings, ClientSettings, DEFAULT_BROKER_ADDRESS, DEFAULT_MAX_PAYLOAD_LENGTH,
    ServerSettings, Settings,
};

/// Prefix of environment overrides, e.g. `POPBUS__SERVER__LISTEN`.
pub const ENV_PREFIX: &str = "POPBUS";

/// Loads the configuration from `config/default` and environment variables.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Loads the configuration from the given file (any format the `config`
/// crate recognises, extension optional) and environment variables, then
/// merges it over the default values.
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("server.listen")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(merge(partial, Settings::default()))
}

fn merge(partial: PartialSettings, default: Settings) -> Settings {
    let server = partial.server;
    let broker = partial.broker;
    let client = partial.client;

    Settings {
        server: ServerSettings {
            listen: server
                .as_ref()
                .and_then(|s| s.listen.clone())
                .filter(|l| !l.is_empty())
                .unwrap_or(default.server.listen),
            no_delay: server
                .as_ref()
                .and_then(|s| s.no_delay)
                .unwrap_or(default.server.no_delay),
            pid_file: server
                .as_ref()
                .and_then(|s| s.pid_file.clone())
                .unwrap_or(default.server.pid_file),
        },
        broker: BrokerSettings {
            max_connections: broker
                .as_ref()
                .and_then(|b| b.max_connections)
                .unwrap_or(default.broker.max_connections),
            max_routes: broker
                .as_ref()
                .and_then(|b| b.max_routes)
                .unwrap_or(default.broker.max_routes),
            max_payload_length: broker
                .as_ref()
                .and_then(|b| b.max_payload_length)
                .unwrap_or(default.broker.max_payload_length),
            outbound_queue_length: broker
                .as_ref()
                .and_then(|b| b.outbound_queue_length)
                .unwrap_or(default.broker.outbound_queue_length),
            debug_route: broker
                .as_ref()
                .and_then(|b| b.debug_route)
                .unwrap_or(default.broker.debug_route),
        },
        client: ClientSettings {
            address: client
                .as_ref()
                .and_then(|c| c.address.clone())
                .unwrap_or(default.client.address),
            connect_attempts: client
                .as_ref()
                .and_then(|c| c.connect_attempts)
                .unwrap_or(default.client.connect_attempts),
            retry_delay_ms: client
                .as_ref()
                .and_then(|c| c.retry_delay_ms)
                .unwrap_or(default.client.retry_delay_ms),
            send_attempts: client
                .as_ref()
                .and_then(|c| c.send_attempts)
                .unwrap_or(default.client.send_attempts),
            max_subscriptions: client
                .as_ref()
                .and_then(|c| c.max_subscriptions)
                .unwrap_or(default.client.max_subscriptions),
            max_payload_length: client
                .as_ref()
                .and_then(|c| c.max_payload_length)
                .unwrap_or(default.client.max_payload_length),
            no_delay: client
                .as_ref()
                .and_then(|c| c.no_delay)
                .unwrap_or(default.client.no_delay),
        },
    }
}
