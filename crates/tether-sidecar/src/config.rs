//! Sidecar configuration with layered loading.
//!
//! Defaults are overlaid by `tether.toml` in the working directory, then by
//! an explicit file, then by `TETHER_` environment variables (nested keys
//! separated by `__`, e.g. `TETHER_APP__PORT=9000`). Command line flags are
//! applied last by the binary.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::{Error as FigmentError, Figment};
use serde::{Deserialize, Deserializer};
use tether_state::{BusConfig, KvConfig, StateConfig};
use thiserror::Error;

use crate::delivery::ClientSettings;
use crate::retry::RetryPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "tether.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Figment(Box<FigmentError>),

    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<FigmentError> for ConfigError {
    fn from(err: FigmentError) -> Self {
        Self::Figment(Box::new(err))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SidecarConfig {
    #[serde(default)]
    pub sidecar: IdentityConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub app: AppConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub store: KvConfig,

    #[serde(default)]
    pub placement: PlacementConfig,

    #[serde(default)]
    pub direct: DirectConfig,
}

impl SidecarConfig {
    /// Loads `tether.toml` if present, then `path` if given, then the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Toml::file(DEFAULT_CONFIG_FILE));

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::FileNotFound(path.display().to_string()));
            }
            figment = figment.merge(Toml::file(path));
        }

        // Variables exported to the launched application are not settings.
        let env = Env::prefixed("TETHER_")
            .ignore(&["port", "app_port", "sidecar"])
            .split("__");
        let config: Self = figment.merge(env).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::new().merge(Toml::string(content)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "retry.multiplier must be at least 1.0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.randomization_factor) {
            return Err(ConfigError::Invalid(
                "retry.randomization_factor must be between 0 and 1".into(),
            ));
        }
        if self.dispatch.workers == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.workers must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn state(&self) -> StateConfig {
        StateConfig {
            bus: self.bus.clone(),
            store: self.store.clone(),
        }
    }
}

/// Who this sidecar is and what it serves.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    /// Unique sidecar id; generated when absent.
    #[serde(default)]
    pub id: Option<String>,

    /// Service name of the local application, if it joins one.
    #[serde(default)]
    pub service: Option<String>,

    /// Actor types the local application hosts.
    #[serde(default)]
    pub actors: Vec<String>,

    /// Key prefix for the application's store operations.
    #[serde(default = "default_state_prefix")]
    pub state_prefix: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            id: None,
            service: None,
            actors: Vec::new(),
            state_prefix: default_state_prefix(),
        }
    }
}

fn default_state_prefix() -> String {
    "state".to_owned()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,

    /// Time to wait for in-flight requests during shutdown.
    #[serde(
        default = "default_shutdown_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

const fn default_bind_address() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 3500)
}

const fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

/// The local application.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_host")]
    pub host: String,

    #[serde(default = "default_app_port")]
    pub port: u16,

    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    #[serde(
        default = "default_pool_idle_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub pool_idle_timeout: Duration,

    /// Limit for a single delivery attempt.
    #[serde(
        default = "default_request_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub request_timeout: Duration,
}

impl AppConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            pool_max_idle_per_host: self.pool_max_idle_per_host,
            pool_idle_timeout: self.pool_idle_timeout,
            request_timeout: self.request_timeout,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_app_host(),
            port: default_app_port(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout: default_pool_idle_timeout(),
            request_timeout: default_request_timeout(),
        }
    }
}

fn default_app_host() -> String {
    "127.0.0.1".to_owned()
}

const fn default_app_port() -> u16 {
    8080
}

const fn default_pool_max_idle_per_host() -> usize {
    256
}

const fn default_pool_idle_timeout() -> Duration {
    Duration::from_secs(90)
}

const fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(
        default = "default_initial_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub initial_interval: Duration,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_randomization_factor")]
    pub randomization_factor: f64,

    #[serde(
        default = "default_max_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub max_interval: Duration,

    /// Unset retries until success or shutdown.
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval: default_initial_interval(),
            multiplier: default_multiplier(),
            randomization_factor: default_randomization_factor(),
            max_interval: default_max_interval(),
            max_elapsed: None,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            initial_interval: config.initial_interval,
            multiplier: config.multiplier,
            randomization_factor: config.randomization_factor,
            max_interval: config.max_interval,
            max_elapsed: config.max_elapsed,
        }
    }
}

const fn default_initial_interval() -> Duration {
    Duration::from_millis(500)
}

const fn default_multiplier() -> f64 {
    1.5
}

const fn default_randomization_factor() -> f64 {
    0.5
}

const fn default_max_interval() -> Duration {
    Duration::from_secs(60)
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Inbound messages processed concurrently. One keeps arrival order.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

const fn default_workers() -> usize {
    1
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlacementMode {
    /// Any sidecar hosting the type executes the invocation.
    #[default]
    Local,
    /// Instances are claimed in the shared store.
    Store,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlacementConfig {
    #[serde(default)]
    pub mode: PlacementMode,
}

/// Base URLs for direct invocations, keyed by service name or actor type.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DirectConfig {
    #[serde(default)]
    pub routes: HashMap<String, String>,
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

fn deserialize_optional_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: Option<String> = Option::deserialize(deserializer)?;
    s.map(|s| parse_duration(&s))
        .transpose()
        .map_err(serde::de::Error::custom)
}

/// Parses `250ms`, `30s`, `5m` or a bare number of seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let number = |raw: &str| -> Result<u64, String> {
        raw.trim()
            .parse()
            .map_err(|_| format!("Invalid duration: {s}"))
    };

    if let Some(stripped) = s.strip_suffix("ms") {
        Ok(Duration::from_millis(number(stripped)?))
    } else if let Some(stripped) = s.strip_suffix('s') {
        Ok(Duration::from_secs(number(stripped)?))
    } else if let Some(stripped) = s.strip_suffix('m') {
        Ok(Duration::from_secs(number(stripped)? * 60))
    } else {
        Ok(Duration::from_secs(number(s)?))
    }
}
