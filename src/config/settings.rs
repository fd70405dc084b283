use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Includes settings for the transport server, the broker core and logging.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub log: LogSettings,
}

/// Configuration settings for the server.
///
/// Defines the host and port the server will bind to.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Configuration settings for the broker.
///
/// `shard_bits` is log2 of the shard count. `enqueue_timeout_ms = 0` lets callers wait
/// on a full shard queue without bound; `stats_interval_secs = 0` turns the periodic
/// stats log off.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub shard_bits: u32,
    pub queue_capacity: usize,
    pub enqueue_timeout_ms: u64,
    pub max_connections: usize,
    pub stats_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Every field is optional; missing values are filled from defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub shard_bits: Option<u32>,
    pub queue_capacity: Option<usize>,
    pub enqueue_timeout_ms: Option<u64>,
    pub max_connections: Option<usize>,
    pub stats_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            shard_bits: 3,
            queue_capacity: 32,
            enqueue_timeout_ms: 1000,
            max_connections: 10_000,
            stats_interval_secs: 60,
        }
    }
}

/// Provides default values for `Settings`.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            broker: BrokerSettings::default(),
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl PartialSettings {
    /// Fill every missing value from `defaults`.
    pub fn merge_over(self, defaults: Settings) -> Settings {
        let server = self.server;
        let broker = self.broker;
        let log = self.log;

        Settings {
            server: ServerSettings {
                host: server
                    .as_ref()
                    .and_then(|s| s.host.clone())
                    .unwrap_or(defaults.server.host),
                port: server
                    .as_ref()
                    .and_then(|s| s.port)
                    .unwrap_or(defaults.server.port),
            },
            broker: BrokerSettings {
                shard_bits: broker
                    .as_ref()
                    .and_then(|b| b.shard_bits)
                    .unwrap_or(defaults.broker.shard_bits),
                queue_capacity: broker
                    .as_ref()
                    .and_then(|b| b.queue_capacity)
                    .unwrap_or(defaults.broker.queue_capacity),
                enqueue_timeout_ms: broker
                    .as_ref()
                    .and_then(|b| b.enqueue_timeout_ms)
                    .unwrap_or(defaults.broker.enqueue_timeout_ms),
                max_connections: broker
                    .as_ref()
                    .and_then(|b| b.max_connections)
                    .unwrap_or(defaults.broker.max_connections),
                stats_interval_secs: broker
                    .as_ref()
                    .and_then(|b| b.stats_interval_secs)
                    .unwrap_or(defaults.broker.stats_interval_secs),
            },
            log: LogSettings {
                level: log
                    .and_then(|l| l.level)
                    .unwrap_or(defaults.log.level),
            },
        }
    }
}
