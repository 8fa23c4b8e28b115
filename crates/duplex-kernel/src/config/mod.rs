//! Gateway configuration.
//!
//! One startup file describes the whole deployment: which contract majors
//! are served, delivery timing, worker pools, REST routes, topic bindings
//! and credentials. The loader accepts YAML, TOML and JSON.
//!
//! ## Loading order
//!
//! 1. Format detected from the file extension
//! 2. `${VAR}` / `$VAR` references substituted from the environment
//! 3. `DUPLEX__<FIELD>` environment variables override file values
//!    (e.g. `DUPLEX__ACK_TIMEOUT_MS=5000`)
//! 4. [`GatewaySettings::validate`] runs before anything is allocated
//!
//! Durations are integer milliseconds.

use crate::artifact::HttpMethod;
use crate::contract::{SchemaDefinition, UnknownFields};
use crate::delivery::{DeliveryConfig, DeliveryMode};
use crate::scope::{ScopeGrant, ScopePattern};
use config::{Config as Cfg, Environment, File, FileFormat};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "DUPLEX";

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

// ─────────────────────────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────────────────────────

/// What happens to a pub/sub message rejected at validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidMessagePolicy {
    /// Record in the dead-letter store and publish to `dead_letter_topic`.
    #[default]
    DeadLetter,
    /// Acknowledge and discard; a `Dropped` event is emitted.
    Drop,
}

/// A caller and the scopes it is granted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialConfig {
    pub principal: String,
    /// Name of the secret holding this caller's API key.
    pub secret: String,
    /// Grants written as `<channel>:<pattern>`, e.g. `pubsub:tenant1/devices/#`.
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl CredentialConfig {
    pub fn grants(&self) -> Result<Vec<ScopeGrant>, ConfigError> {
        self.scopes
            .iter()
            .map(|s| ScopeGrant::parse(s).map_err(|e| ConfigError::Invalid(e.to_string())))
            .collect()
    }
}

/// A REST route bound to a contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestRouteConfig {
    pub id: String,
    /// Path template with `{param}` segments.
    pub path_pattern: String,
    #[serde(default = "default_methods")]
    pub methods: Vec<HttpMethod>,
    pub contract: String,
    /// Higher wins when two routes match the same path.
    #[serde(default)]
    pub priority: i32,
}

/// Topics matching `pattern` carry payloads of `contract`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicBinding {
    pub pattern: String,
    pub contract: String,
}

/// Full gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewaySettings {
    pub supported_major_versions: BTreeSet<u64>,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,
    #[serde(default = "default_dedup_retention_window_ms")]
    pub dedup_retention_window_ms: u64,
    #[serde(default)]
    pub delivery_mode: DeliveryMode,
    #[serde(default)]
    pub invalid_message_policy: InvalidMessagePolicy,
    #[serde(default)]
    pub unknown_fields: UnknownFields,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_workers")]
    pub rest_workers: usize,
    #[serde(default = "default_workers")]
    pub pubsub_workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub rest_queue_capacity: usize,
    #[serde(default = "default_queue_capacity")]
    pub pubsub_queue_capacity: usize,
    #[serde(default = "default_interval_ms")]
    pub redelivery_scan_interval_ms: u64,
    #[serde(default = "default_interval_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub outbound_queue_capacity: usize,
    #[serde(default)]
    pub dead_letter_topic: Option<String>,
    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,

    /// Files holding `SchemaDefinition` lists (YAML, TOML or JSON).
    #[serde(default)]
    pub schema_files: Vec<PathBuf>,
    #[serde(default)]
    pub credentials: Vec<CredentialConfig>,
    #[serde(default)]
    pub routes: Vec<RestRouteConfig>,
    #[serde(default)]
    pub topics: Vec<TopicBinding>,
}

fn default_methods() -> Vec<HttpMethod> {
    vec![HttpMethod::Post]
}
fn default_ack_timeout_ms() -> u64 {
    30_000
}
fn default_max_delivery_attempts() -> u32 {
    3
}
fn default_dedup_retention_window_ms() -> u64 {
    300_000
}
fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_workers() -> usize {
    8
}
fn default_queue_capacity() -> usize {
    1024
}
fn default_interval_ms() -> u64 {
    1000
}
fn default_dead_letter_capacity() -> usize {
    1000
}

impl GatewaySettings {
    /// Settings with every default applied, serving `majors`.
    pub fn new(majors: impl IntoIterator<Item = u64>) -> Self {
        Self {
            supported_major_versions: majors.into_iter().collect(),
            ack_timeout_ms: default_ack_timeout_ms(),
            max_delivery_attempts: default_max_delivery_attempts(),
            dedup_retention_window_ms: default_dedup_retention_window_ms(),
            delivery_mode: DeliveryMode::default(),
            invalid_message_policy: InvalidMessagePolicy::default(),
            unknown_fields: UnknownFields::default(),
            listen_addr: default_listen_addr(),
            rest_workers: default_workers(),
            pubsub_workers: default_workers(),
            rest_queue_capacity: default_queue_capacity(),
            pubsub_queue_capacity: default_queue_capacity(),
            redelivery_scan_interval_ms: default_interval_ms(),
            reconnect_delay_ms: default_interval_ms(),
            outbound_queue_capacity: default_queue_capacity(),
            dead_letter_topic: None,
            dead_letter_capacity: default_dead_letter_capacity(),
            schema_files: Vec::new(),
            credentials: Vec::new(),
            routes: Vec::new(),
            topics: Vec::new(),
        }
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn dedup_retention_window(&self) -> Duration {
        Duration::from_millis(self.dedup_retention_window_ms)
    }

    pub fn redelivery_scan_interval(&self) -> Duration {
        Duration::from_millis(self.redelivery_scan_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            mode: self.delivery_mode,
            ack_timeout: self.ack_timeout(),
            max_attempts: self.max_delivery_attempts,
            retention_window: self.dedup_retention_window(),
        }
    }

    pub fn socket_addr(&self) -> ConfigResult<SocketAddr> {
        self.listen_addr.parse().map_err(|e| {
            ConfigError::Invalid(format!("listen_addr '{}': {e}", self.listen_addr))
        })
    }

    /// Check every invariant the runtime relies on.
    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.supported_major_versions.is_empty() {
            return invalid("supported_major_versions must not be empty".into());
        }
        for (name, value) in [
            ("ack_timeout_ms", self.ack_timeout_ms),
            ("max_delivery_attempts", u64::from(self.max_delivery_attempts)),
            ("dedup_retention_window_ms", self.dedup_retention_window_ms),
            ("redelivery_scan_interval_ms", self.redelivery_scan_interval_ms),
            ("rest_workers", self.rest_workers as u64),
            ("pubsub_workers", self.pubsub_workers as u64),
            ("rest_queue_capacity", self.rest_queue_capacity as u64),
            ("pubsub_queue_capacity", self.pubsub_queue_capacity as u64),
            ("outbound_queue_capacity", self.outbound_queue_capacity as u64),
            ("dead_letter_capacity", self.dead_letter_capacity as u64),
        ] {
            if value == 0 {
                return invalid(format!("{name} must be greater than zero"));
            }
        }
        self.socket_addr()?;

        let mut route_ids = HashSet::new();
        for route in &self.routes {
            if !route_ids.insert(route.id.as_str()) {
                return invalid(format!("duplicate route id '{}'", route.id));
            }
            if !route.path_pattern.starts_with('/') {
                return invalid(format!(
                    "route '{}': path_pattern must start with '/'",
                    route.id
                ));
            }
            if route.methods.is_empty() {
                return invalid(format!("route '{}': methods must not be empty", route.id));
            }
            if route.contract.trim().is_empty() {
                return invalid(format!("route '{}': contract must be set", route.id));
            }
        }

        for binding in &self.topics {
            ScopePattern::parse(&binding.pattern)
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
            if binding.contract.trim().is_empty() {
                return invalid(format!("topic '{}': contract must be set", binding.pattern));
            }
        }

        let mut principals = HashSet::new();
        for cred in &self.credentials {
            if !principals.insert(cred.principal.as_str()) {
                return invalid(format!("duplicate principal '{}'", cred.principal));
            }
            if cred.secret.trim().is_empty() {
                return invalid(format!("principal '{}': secret must be set", cred.principal));
            }
            cred.grants()?;
        }

        if self
            .dead_letter_topic
            .as_deref()
            .is_some_and(|t| t.trim().is_empty())
        {
            return invalid("dead_letter_topic must not be blank".into());
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loading
// ─────────────────────────────────────────────────────────────────────────────

/// Detect configuration format from file extension.
pub fn detect_format(path: &Path) -> ConfigResult<FileFormat> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("No file extension found".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

/// Substitute `${VAR}` and `$VAR` references from the environment.
///
/// Unset variables are left as written.
pub fn substitute_env_vars(content: &str) -> ConfigResult<String> {
    let re_braced = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| ConfigError::Parse(e.to_string()))?;
    let result = re_braced
        .replace_all(content, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .to_string();

    let re_simple = Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)\b")
        .map_err(|e| ConfigError::Parse(e.to_string()))?;
    Ok(re_simple
        .replace_all(&result, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .to_string())
}

fn env_overrides() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("supported_major_versions")
}

/// Load, override and validate settings from `path`.
pub fn load_settings(path: impl AsRef<Path>) -> ConfigResult<GatewaySettings> {
    let path = path.as_ref();
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    let substituted = substitute_env_vars(&content)?;

    let settings: GatewaySettings = Cfg::builder()
        .add_source(File::from_str(&substituted, format))
        .add_source(env_overrides())
        .build()
        .map_err(|e| ConfigError::Parse(e.to_string()))?
        .try_deserialize()
        .map_err(|e| ConfigError::Serialization(e.to_string()))?;

    settings.validate()?;
    Ok(settings)
}

/// Parse and validate settings from a string, without environment overrides.
pub fn settings_from_str(content: &str, format: FileFormat) -> ConfigResult<GatewaySettings> {
    let settings: GatewaySettings = from_str(content, format)?;
    settings.validate()?;
    Ok(settings)
}

/// Deserialize any type from a string with explicit format.
pub fn from_str<T>(content: &str, format: FileFormat) -> ConfigResult<T>
where
    T: serde::de::DeserializeOwned,
{
    let substituted = substitute_env_vars(content)?;
    Cfg::builder()
        .add_source(File::from_str(&substituted, format))
        .build()
        .map_err(|e| ConfigError::Parse(e.to_string()))?
        .try_deserialize()
        .map_err(|e| ConfigError::Serialization(e.to_string()))
}

/// Load a list of schema definitions from a YAML, TOML or JSON file.
///
/// YAML and JSON files hold a top-level list; TOML files hold a
/// `[[schemas]]` array.
pub fn load_schema_file(path: impl AsRef<Path>) -> ConfigResult<Vec<SchemaDefinition>> {
    let path = path.as_ref();
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    match format {
        FileFormat::Yaml => {
            serde_yaml::from_str(&content).map_err(|e| ConfigError::Serialization(e.to_string()))
        }
        FileFormat::Json => {
            serde_json::from_str(&content).map_err(|e| ConfigError::Serialization(e.to_string()))
        }
        _ => {
            #[derive(Deserialize)]
            struct SchemaTable {
                schemas: Vec<SchemaDefinition>,
            }
            toml::from_str::<SchemaTable>(&content)
                .map(|t| t.schemas)
                .map_err(|e| ConfigError::Serialization(e.to_string()))
        }
    }
}
