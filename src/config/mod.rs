//! Configuration: read-only key/value sources and typed relay settings.

pub mod keys;

pub use keys::ApiKeyPool;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::types::{BackendKind, SessionMode};

const ENV_PREFIX: &str = "AGENT_RELAY_";

/// Read-only key/value lookups.
pub trait ConfigSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Process environment. Logical key `cli_path` reads `AGENT_RELAY_CLI_PATH`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSource;

impl EnvSource {
    /// Load `.env` if present, then read from the environment.
    pub fn load() -> Self {
        let _ = dotenvy::dotenv();
        Self
    }

    pub fn env_name(key: &str) -> String {
        format!("{ENV_PREFIX}{}", key.to_ascii_uppercase())
    }
}

impl ConfigSource for EnvSource {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(Self::env_name(key))
            .ok()
            .filter(|value| !value.trim().is_empty())
    }
}

/// In-memory source keyed by logical key.
#[derive(Debug, Clone, Default)]
pub struct MapSource {
    values: HashMap<String, String>,
}

impl MapSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

impl ConfigSource for MapSource {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// Settings for the WebSocket gateway adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Command used to launch a local gateway when none is listening.
    pub command: Option<String>,
    pub args: Vec<String>,
    /// Never spawn; connect to an already running gateway.
    pub use_external: bool,
    pub token: Option<String>,
    pub ping_interval_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 18789,
            command: None,
            args: Vec::new(),
            use_external: false,
            token: None,
            ping_interval_ms: 15_000,
        }
    }
}

impl GatewayConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

/// Typed relay settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub backend: BackendKind,
    pub cli_path: Option<PathBuf>,
    pub cli_args: Vec<String>,
    pub session_mode: SessionMode,
    /// When set, new conversations default to yolo mode.
    pub yolo: bool,
    /// Multi-key credential string, comma or newline delimited.
    pub api_keys: String,
    pub base_url: String,
    pub model: String,
    pub system_prompt: Option<String>,
    pub gateway: GatewayConfig,
    pub heartbeat_threshold_ms: u64,
    pub heartbeat_check_interval_ms: u64,
    pub connection_timeout_ms: u64,
    pub confirmation_timeout_ms: u64,
    pub invalid_stream_retries: u32,
    pub invalid_stream_retry_delay_ms: u64,
    pub max_tool_iterations: usize,
    pub working_dir: PathBuf,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Sdk,
            cli_path: None,
            cli_args: Vec::new(),
            session_mode: SessionMode::Default,
            yolo: false,
            api_keys: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            system_prompt: None,
            gateway: GatewayConfig::default(),
            heartbeat_threshold_ms: 60_000,
            heartbeat_check_interval_ms: 5_000,
            connection_timeout_ms: 30_000,
            confirmation_timeout_ms: 70_000,
            invalid_stream_retries: 2,
            invalid_stream_retry_delay_ms: 1_000,
            max_tool_iterations: 20,
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

impl RelayConfig {
    /// Load from the process environment (and `.env`).
    pub fn from_env() -> Self {
        Self::from_source(&EnvSource::load())
    }

    /// Parse a TOML document; missing keys take their defaults.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| RelayError::Configuration(e.to_string()))
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Resolve every setting from `source`, falling back to defaults.
    pub fn from_source(source: &dyn ConfigSource) -> Self {
        let defaults = Self::default();
        let gateway_defaults = GatewayConfig::default();

        let gateway = GatewayConfig {
            host: source
                .get("gateway_host")
                .unwrap_or(gateway_defaults.host),
            port: parse_or(source, "gateway_port", gateway_defaults.port),
            command: source.get("gateway_command"),
            args: source
                .get("gateway_args")
                .map(|raw| split_args(&raw))
                .unwrap_or_default(),
            use_external: parse_bool_or(
                source,
                "use_external_gateway",
                gateway_defaults.use_external,
            ),
            token: source.get("gateway_token"),
            ping_interval_ms: parse_or(
                source,
                "gateway_ping_interval_ms",
                gateway_defaults.ping_interval_ms,
            ),
        };

        Self {
            backend: parse_or(source, "backend", defaults.backend),
            cli_path: source.get("cli_path").map(PathBuf::from),
            cli_args: source
                .get("cli_args")
                .map(|raw| split_args(&raw))
                .unwrap_or_default(),
            session_mode: parse_or(source, "session_mode", defaults.session_mode),
            yolo: parse_bool_or(source, "yolo", defaults.yolo),
            api_keys: source.get("api_keys").unwrap_or_default(),
            base_url: source.get("base_url").unwrap_or(defaults.base_url),
            model: source.get("model").unwrap_or(defaults.model),
            system_prompt: source.get("system_prompt"),
            gateway,
            heartbeat_threshold_ms: parse_or(
                source,
                "heartbeat_threshold_ms",
                defaults.heartbeat_threshold_ms,
            ),
            heartbeat_check_interval_ms: parse_or(
                source,
                "heartbeat_check_interval_ms",
                defaults.heartbeat_check_interval_ms,
            ),
            connection_timeout_ms: parse_or(
                source,
                "connection_timeout_ms",
                defaults.connection_timeout_ms,
            ),
            confirmation_timeout_ms: parse_or(
                source,
                "confirmation_timeout_ms",
                defaults.confirmation_timeout_ms,
            ),
            invalid_stream_retries: parse_or(
                source,
                "invalid_stream_retries",
                defaults.invalid_stream_retries,
            ),
            invalid_stream_retry_delay_ms: parse_or(
                source,
                "invalid_stream_retry_delay_ms",
                defaults.invalid_stream_retry_delay_ms,
            ),
            max_tool_iterations: parse_or(
                source,
                "max_tool_iterations",
                defaults.max_tool_iterations,
            ),
            working_dir: source
                .get("working_dir")
                .map(PathBuf::from)
                .unwrap_or(defaults.working_dir),
        }
    }

    /// Mode a conversation starts in when nothing is persisted.
    pub fn default_session_mode(&self) -> SessionMode {
        if self.yolo {
            SessionMode::Yolo
        } else {
            self.session_mode
        }
    }

    pub fn api_key_pool(&self) -> ApiKeyPool {
        ApiKeyPool::parse(&self.api_keys)
    }

    pub fn heartbeat_threshold(&self) -> Duration {
        Duration::from_millis(self.heartbeat_threshold_ms)
    }

    pub fn heartbeat_check_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_check_interval_ms.max(1))
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }

    pub fn invalid_stream_retry_delay(&self) -> Duration {
        Duration::from_millis(self.invalid_stream_retry_delay_ms)
    }
}

fn parse_or<T: FromStr>(source: &dyn ConfigSource, key: &str, default: T) -> T {
    let Some(raw) = source.get(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable config value");
            default
        }
    }
}

fn parse_bool_or(source: &dyn ConfigSource, key: &str, default: bool) -> bool {
    let Some(raw) = source.get(key) else {
        return default;
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable boolean config value");
            default
        }
    }
}

fn split_args(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}
