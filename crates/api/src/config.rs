//! Application configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use saga::SagaConfig;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

const DURABLE_BUS_REQUIRED: &str =
    "DATABASE_URL is set but KAFKA_BROKERS is not: durable stores need a durable event bus";

/// Event bus the saga runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusBackend {
    /// In-process bus. Nothing survives a restart.
    InMemory,
    /// Kafka cluster reached through the given bootstrap servers.
    Kafka { brokers: String },
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `text` or `json` (default: `text`)
/// - `DATABASE_URL`: PostgreSQL stores when set, in-memory stores otherwise
/// - `KAFKA_BROKERS`: Kafka event bus when set, in-memory bus otherwise.
///   Required whenever `DATABASE_URL` is set.
/// - `SEED_PATH`: JSON file of stock, users and carts loaded at start-up
/// - `SAGA_CALL_TIMEOUT_MS` (default: `5000`)
/// - `SAGA_HANDLER_TIMEOUT_MS` (default: `15000`)
/// - `SAGA_MAX_DELIVERY_ATTEMPTS` (default: `5`)
/// - `SAGA_OUTBOX_POLL_MS` (default: `500`)
/// - `SAGA_OUTBOX_RETENTION_SECS` (default: `86400`)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub kafka_brokers: Option<String>,
    pub seed_path: Option<PathBuf>,
    pub saga: SagaConfig,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let millis = |key: &str, default: Duration| {
            parsed(key).map(Duration::from_millis).unwrap_or(default)
        };

        let saga = SagaConfig {
            call_timeout: millis("SAGA_CALL_TIMEOUT_MS", defaults.saga.call_timeout),
            handler_timeout: millis("SAGA_HANDLER_TIMEOUT_MS", defaults.saga.handler_timeout),
            max_delivery_attempts: parsed("SAGA_MAX_DELIVERY_ATTEMPTS")
                .and_then(|n| u32::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.saga.max_delivery_attempts),
            outbox_poll_interval: millis("SAGA_OUTBOX_POLL_MS", defaults.saga.outbox_poll_interval),
            outbox_retention: parsed("SAGA_OUTBOX_RETENTION_SECS")
                .and_then(|secs| i64::try_from(secs).ok())
                .map(chrono::Duration::seconds)
                .unwrap_or(defaults.saga.outbox_retention),
            ..defaults.saga
        };

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: lookup("LOG_FORMAT")
                .and_then(|f| f.parse().ok())
                .unwrap_or_default(),
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            kafka_brokers: lookup("KAFKA_BROKERS").filter(|brokers| !brokers.trim().is_empty()),
            seed_path: lookup("SEED_PATH")
                .filter(|path| !path.trim().is_empty())
                .map(PathBuf::from),
            saga,
        }
    }

    /// Picks the event bus.
    ///
    /// Durable stores are refused on the in-memory bus: an order committed to
    /// PostgreSQL whose events only lived in process memory would be stuck
    /// after a restart.
    pub fn bus_backend(&self) -> Result<BusBackend, String> {
        match (&self.kafka_brokers, &self.database_url) {
            (Some(brokers), _) => Ok(BusBackend::Kafka {
                brokers: brokers.clone(),
            }),
            (None, Some(_)) => Err(DURABLE_BUS_REQUIRED.to_string()),
            (None, None) => Ok(BusBackend::InMemory),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            kafka_brokers: None,
            seed_path: None,
            saga: SagaConfig::default(),
        }
    }
}
