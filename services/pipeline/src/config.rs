//! Configuration for the museum pipeline.
//!
//! Configuration is built once at startup and handed by reference to the
//! consumer and the record store. It can be loaded in two ways:
//!
//! 1. [`PipelineConfig::load`]: layered defaults, an optional config file and
//!    `PIPELINE__` prefixed environment variables.
//! 2. [`PipelineConfig::from_env`]: the plain variable names used by the
//!    deployment `.env` file (`BOOTSTRAP_SERVERS`, `DATABASE_IP`, ...).

use chrono::NaiveTime;
use rdkafka::config::ClientConfig;
use serde::Deserialize;
use sqlx::postgres::PgConnectOptions;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to load configuration: {0}")]
    LoadError(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::LoadError(e.to_string())
    }
}

/// Security protocol for Kafka connections
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(try_from = "String")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "plaintext",
            SecurityProtocol::Ssl => "ssl",
            SecurityProtocol::SaslPlaintext => "sasl_plaintext",
            SecurityProtocol::SaslSsl => "sasl_ssl",
        }
    }

    pub fn uses_sasl(&self) -> bool {
        matches!(
            self,
            SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl
        )
    }
}

impl FromStr for SecurityProtocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "plaintext" => Ok(SecurityProtocol::Plaintext),
            "ssl" => Ok(SecurityProtocol::Ssl),
            "sasl_plaintext" => Ok(SecurityProtocol::SaslPlaintext),
            "sasl_ssl" => Ok(SecurityProtocol::SaslSsl),
            other => Err(ConfigError::InvalidValue {
                key: "security_protocol".to_string(),
                message: format!("unknown protocol '{}'", other),
            }),
        }
    }
}

impl TryFrom<String> for SecurityProtocol {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// SASL mechanism for authentication
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(try_from = "String")]
pub enum SaslMechanism {
    #[default]
    Plain,
    ScramSha256,
    ScramSha512,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

impl FromStr for SaslMechanism {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().replace('_', "-").as_str() {
            "PLAIN" => Ok(SaslMechanism::Plain),
            "SCRAM-SHA-256" => Ok(SaslMechanism::ScramSha256),
            "SCRAM-SHA-512" => Ok(SaslMechanism::ScramSha512),
            other => Err(ConfigError::InvalidValue {
                key: "sasl.mechanism".to_string(),
                message: format!("unknown mechanism '{}'", other),
            }),
        }
    }
}

impl TryFrom<String> for SaslMechanism {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// SASL authentication configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SaslConfig {
    #[serde(default)]
    pub mechanism: SaslMechanism,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Kafka consumer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated list of broker addresses
    pub bootstrap_servers: String,
    /// Client ID for this connection
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Security protocol
    #[serde(default)]
    pub security_protocol: SecurityProtocol,
    /// SASL configuration
    #[serde(default)]
    pub sasl: SaslConfig,
    /// Consumer group ID
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// Auto offset reset: earliest, latest, none
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Topic carrying exhibition kiosk events
    #[serde(default = "default_topic")]
    pub topic: String,
    /// How long a single poll waits for a message
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Additional librdkafka properties
    #[serde(default)]
    pub extra_properties: HashMap<String, String>,
}

fn default_client_id() -> String {
    "museum-pipeline".to_string()
}

fn default_group_id() -> String {
    "museum-pipeline".to_string()
}

fn default_auto_offset_reset() -> String {
    "latest".to_string()
}

fn default_topic() -> String {
    "lmnh".to_string()
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

impl KafkaConfig {
    /// Create a new KafkaConfig with the specified bootstrap servers
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            client_id: default_client_id(),
            security_protocol: SecurityProtocol::default(),
            sasl: SaslConfig::default(),
            group_id: default_group_id(),
            auto_offset_reset: default_auto_offset_reset(),
            topic: default_topic(),
            poll_timeout_ms: default_poll_timeout_ms(),
            extra_properties: HashMap::new(),
        }
    }

    /// Build a consumer ClientConfig.
    ///
    /// Offsets are committed by the client itself; the loader never commits
    /// manually.
    pub fn build_consumer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("client.id", &self.client_id);
        config.set("security.protocol", self.security_protocol.as_str());
        config.set("group.id", &self.group_id);
        config.set("auto.offset.reset", &self.auto_offset_reset);
        config.set("enable.auto.commit", "true");

        if self.security_protocol.uses_sasl() {
            config.set("sasl.mechanism", self.sasl.mechanism.as_str());
            if let Some(ref username) = self.sasl.username {
                config.set("sasl.username", username);
            }
            if let Some(ref password) = self.sasl.password {
                config.set("sasl.password", password);
            }
        }

        for (key, value) in &self.extra_properties {
            config.set(key, value);
        }

        config
    }

    /// Get poll timeout as Duration
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Which database a run writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseTarget {
    Local,
    Remote,
}

impl DatabaseTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseTarget::Local => "local",
            DatabaseTarget::Remote => "remote",
        }
    }
}

/// Connection details for one Postgres database
#[derive(Clone, Deserialize)]
pub struct ConnectionConfig {
    pub username: String,
    pub password: String,
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    pub name: String,
}

fn default_db_port() -> u16 {
    5432
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("username", &self.username)
            .field("password", &"***")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .finish()
    }
}

impl ConnectionConfig {
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.username)
            .password(&self.password)
            .database(&self.name)
    }
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// The hosted database used by default
    pub remote: Option<ConnectionConfig>,
    /// A developer database selected with `--local-db`
    pub local: Option<ConnectionConfig>,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Connection acquire timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default)]
    pub run_migrations: bool,
}

fn default_max_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            remote: None,
            local: None,
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            run_migrations: false,
        }
    }
}

impl DatabaseConfig {
    /// Connection details for the chosen target
    pub fn target(&self, target: DatabaseTarget) -> Result<&ConnectionConfig, ConfigError> {
        let connection = match target {
            DatabaseTarget::Local => self.local.as_ref(),
            DatabaseTarget::Remote => self.remote.as_ref(),
        };

        connection.ok_or_else(|| {
            ConfigError::MissingRequired(format!("database.{}", target.as_str()))
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Business rules applied to incoming events
#[derive(Debug, Clone, Deserialize)]
pub struct ValidationConfig {
    /// How far ahead of the local clock an event timestamp may be
    #[serde(default = "default_future_tolerance_ms")]
    pub future_tolerance_ms: u64,
    /// Earliest accepted wall-clock time (inclusive)
    #[serde(default = "default_opening_time")]
    pub opening_time: NaiveTime,
    /// Latest accepted wall-clock time (inclusive)
    #[serde(default = "default_closing_time")]
    pub closing_time: NaiveTime,
}

fn default_future_tolerance_ms() -> u64 {
    900
}

fn default_opening_time() -> NaiveTime {
    NaiveTime::from_hms_opt(8, 45, 0).expect("08:45:00 is a valid time")
}

fn default_closing_time() -> NaiveTime {
    NaiveTime::from_hms_opt(18, 15, 0).expect("18:15:00 is a valid time")
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            future_tolerance_ms: default_future_tolerance_ms(),
            opening_time: default_opening_time(),
            closing_time: default_closing_time(),
        }
    }
}

/// Log sink configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Append-only log file
    #[serde(default = "default_log_file")]
    pub file: PathBuf,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> PathBuf {
    PathBuf::from("./logs/pipeline.log")
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Main configuration for the pipeline
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PipelineConfig {
    /// Load configuration from config files and `PIPELINE__` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("kafka.topic", default_topic())?
            .set_default("logging.level", default_log_level())?;

        builder = match path {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(config::File::with_name("config/pipeline").required(false)),
        };

        // PIPELINE__KAFKA__BOOTSTRAP_SERVERS -> kafka.bootstrap_servers
        let config = builder
            .add_source(
                config::Environment::with_prefix("PIPELINE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Load configuration from the plain deployment environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from any key lookup using the deployment variable names
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bootstrap_servers = lookup("BOOTSTRAP_SERVERS")
            .ok_or_else(|| ConfigError::MissingRequired("BOOTSTRAP_SERVERS".to_string()))?;

        let mut kafka = KafkaConfig::new(bootstrap_servers);

        if let Some(protocol) = lookup("SECURITY_PROTOCOL") {
            kafka.security_protocol = protocol.parse()?;
        }
        if let Some(mechanism) = lookup("SASL_MECHANISM") {
            kafka.sasl.mechanism = mechanism.parse()?;
        }
        kafka.sasl.username = lookup("USERNAME");
        kafka.sasl.password = lookup("PASSWORD");

        if let Some(group_id) = lookup("GROUP_ID") {
            kafka.group_id = group_id;
        }
        if let Some(reset) = lookup("AUTO_OFFSET") {
            kafka.auto_offset_reset = reset;
        }
        if let Some(topic) = lookup("TOPIC") {
            kafka.topic = topic;
        }

        let database = DatabaseConfig {
            remote: connection_from_lookup(&lookup, "")?,
            local: connection_from_lookup(&lookup, "LOCAL_")?,
            ..Default::default()
        };

        let mut validation = ValidationConfig::default();
        if let Some(tolerance) = lookup("FUTURE_TOLERANCE_MS") {
            validation.future_tolerance_ms =
                tolerance.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "FUTURE_TOLERANCE_MS".to_string(),
                    message: format!("'{}' is not a number of milliseconds", tolerance),
                })?;
        }

        let mut logging = LoggingConfig::default();
        if let Some(level) = lookup("LOG_LEVEL") {
            logging.level = level;
        }

        Ok(Self {
            kafka,
            database,
            validation,
            logging,
        })
    }

    /// Validate the configuration for a run that loads into `target`
    pub fn validate(&self, target: Option<DatabaseTarget>) -> Result<(), ConfigError> {
        if self.kafka.bootstrap_servers.is_empty() {
            return Err(ConfigError::MissingRequired(
                "kafka.bootstrap_servers".to_string(),
            ));
        }

        if self.kafka.group_id.is_empty() {
            return Err(ConfigError::MissingRequired("kafka.group_id".to_string()));
        }

        if self.kafka.topic.is_empty() {
            return Err(ConfigError::MissingRequired("kafka.topic".to_string()));
        }

        if self.kafka.security_protocol.uses_sasl()
            && (self.kafka.sasl.username.is_none() || self.kafka.sasl.password.is_none())
        {
            return Err(ConfigError::MissingRequired(
                "kafka.sasl.username and kafka.sasl.password (required for SASL)".to_string(),
            ));
        }

        if self.validation.opening_time > self.validation.closing_time {
            return Err(ConfigError::InvalidValue {
                key: "validation.opening_time".to_string(),
                message: format!(
                    "opening time {} is after closing time {}",
                    self.validation.opening_time, self.validation.closing_time
                ),
            });
        }

        let tolerance_ms = self.validation.future_tolerance_ms;
        if i64::try_from(tolerance_ms)
            .ok()
            .and_then(chrono::Duration::try_milliseconds)
            .is_none()
        {
            return Err(ConfigError::InvalidValue {
                key: "validation.future_tolerance_ms".to_string(),
                message: format!("{} ms is out of range", tolerance_ms),
            });
        }

        if let Some(target) = target {
            self.database.target(target)?;
        }

        Ok(())
    }
}

/// Read `{prefix}DATABASE_*` variables. An unset host means the target is not configured.
fn connection_from_lookup<F>(
    lookup: &F,
    prefix: &str,
) -> Result<Option<ConnectionConfig>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let key = |name: &str| format!("{}DATABASE_{}", prefix, name);

    let Some(host) = lookup(&key("IP")) else {
        return Ok(None);
    };

    let required = |name: &str| {
        let key = key(name);
        lookup(&key).ok_or(ConfigError::MissingRequired(key))
    };

    let port = match lookup(&key("PORT")) {
        Some(port) => port.parse().map_err(|_| ConfigError::InvalidValue {
            key: key("PORT"),
            message: format!("'{}' is not a valid port", port),
        })?,
        None => default_db_port(),
    };

    Ok(Some(ConnectionConfig {
        username: required("USERNAME")?,
        password: required("PASSWORD")?,
        host,
        port,
        name: required("NAME")?,
    }))
}
