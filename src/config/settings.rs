use serde::Deserialize;

/// Top-level configuration settings for the application.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
}

/// Where the WebSocket front end listens.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Delivery and retry behaviour of the broker core.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    /// Concurrent connections accepted by the transport.
    pub max_connections: usize,
    /// Prefetch used when a client does not ask for one.
    pub default_prefetch: usize,
    /// Requeues allowed for queues declared without `max_retry`.
    pub default_max_retry: u32,
    /// Unsettled deliveries older than this are requeued. 0 disables.
    pub redelivery_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    /// Default message TTL for new queues. 0 means messages never expire.
    pub message_ttl_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sled,
    Memory,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    pub path: String,
    pub flush_every_write: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values are filled from defaults.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub storage: Option<PartialStorageSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub max_connections: Option<usize>,
    pub default_prefetch: Option<usize>,
    pub default_max_retry: Option<u32>,
    pub redelivery_timeout_ms: Option<u64>,
    pub sweep_interval_ms: Option<u64>,
    pub message_ttl_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialStorageSettings {
    pub backend: Option<StorageBackend>,
    pub path: Option<String>,
    pub flush_every_write: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            broker: BrokerSettings::default(),
            storage: StorageSettings {
                backend: StorageBackend::Sled,
                path: "popmq_db".to_string(),
                flush_every_write: false,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            default_prefetch: 10,
            default_max_retry: 5,
            redelivery_timeout_ms: 30_000,
            sweep_interval_ms: 1000,
            message_ttl_secs: 0,
        }
    }
}

impl PartialSettings {
    /// Fill every missing value from `Settings::default()`.
    pub fn merge_with_defaults(self) -> Settings {
        let default = Settings::default();
        let server = self.server.unwrap_or_default();
        let broker = self.broker.unwrap_or_default();
        let storage = self.storage.unwrap_or_default();
        let logging = self.logging.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(default.server.host),
                port: server.port.unwrap_or(default.server.port),
            },
            broker: BrokerSettings {
                max_connections: broker
                    .max_connections
                    .unwrap_or(default.broker.max_connections),
                default_prefetch: broker
                    .default_prefetch
                    .unwrap_or(default.broker.default_prefetch),
                default_max_retry: broker
                    .default_max_retry
                    .unwrap_or(default.broker.default_max_retry),
                redelivery_timeout_ms: broker
                    .redelivery_timeout_ms
                    .unwrap_or(default.broker.redelivery_timeout_ms),
                sweep_interval_ms: broker
                    .sweep_interval_ms
                    .unwrap_or(default.broker.sweep_interval_ms),
                message_ttl_secs: broker
                    .message_ttl_secs
                    .unwrap_or(default.broker.message_ttl_secs),
            },
            storage: StorageSettings {
                backend: storage.backend.unwrap_or(default.storage.backend),
                path: storage.path.unwrap_or(default.storage.path),
                flush_every_write: storage
                    .flush_every_write
                    .unwrap_or(default.storage.flush_every_write),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(default.logging.level),
            },
        }
    }
}
