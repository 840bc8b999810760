use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    gate::{profile::ProfileStoreConfig, types::GateConfig},
    inference::types::{CredentialsConfig, DispatcherConfig, InferenceConfig, MARKER_PLACEHOLDER},
};

const SCHEMA_FILE_NAME: &str = "gatekeeper.schema.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub profile_store: ProfileStoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Browser origins allowed to call `/chat`. Empty admits every origin.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            allowed_origins: Vec::new(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8000))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Environment variable holding the admin secret. Admin routes refuse
    /// every request while it is unset.
    #[serde(default = "default_admin_secret_env")]
    pub secret_env: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            secret_env: default_admin_secret_env(),
        }
    }
}

impl AdminConfig {
    pub fn secret_from_env(&self) -> Option<String> {
        std::env::var(&self.secret_env)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

fn default_admin_secret_env() -> String {
    "GATEKEEPER_ADMIN_SECRET".to_string()
}

fn default_logging_dir() -> PathBuf {
    PathBuf::from("./logs")
}

fn default_logging_filter() -> String {
    "info".to_string()
}

fn default_logging_retention_days() -> usize {
    14
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LoggingRotation {
    #[default]
    Daily,
    Hourly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_logging_filter")]
    pub filter: String,
    #[serde(default)]
    pub rotation: LoggingRotation,
    #[serde(default = "default_logging_retention_days")]
    pub retention_days: usize,
    #[serde(default = "default_true")]
    pub stderr_warn_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_logging_dir(),
            filter: default_logging_filter(),
            rotation: LoggingRotation::Daily,
            retention_days: default_logging_retention_days(),
            stderr_warn_enabled: true,
        }
    }
}

impl Config {
    pub fn load(config_path: &Path) -> Result<Self> {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let value: Value = json5::from_str(&content)
            .with_context(|| format!("failed to parse {}", config_path.display()))?;

        let config_base = config_path.parent().unwrap_or_else(|| Path::new("."));
        let schema_path = resolve_schema_path(config_base, &value)?;
        validate_against_schema(&value, &schema_path)?;

        let mut config: Config =
            serde_json::from_value(value).context("failed to deserialize gatekeeper config")?;
        if !config.logging.dir.is_absolute() {
            config.logging.dir = config_base.join(&config.logging.dir);
        }
        config.check()?;

        Ok(config)
    }

    /// Cross-field rules the schema cannot express.
    pub fn check(&self) -> Result<()> {
        if self.gate.sentinel_marker.trim().is_empty() {
            bail!("gate.sentinel_marker cannot be empty");
        }
        if !self.inference.system_prompt.contains(MARKER_PLACEHOLDER) {
            bail!("inference.system_prompt must contain the {MARKER_PLACEHOLDER} placeholder");
        }
        if self.gate.history_window == 0 {
            bail!("gate.history_window must be at least 1");
        }
        if self.gate.persistence_threshold > 0
            && self.gate.max_messages <= self.gate.persistence_threshold
        {
            bail!(
                "gate.max_messages ({}) must exceed gate.persistence_threshold ({})",
                self.gate.max_messages,
                self.gate.persistence_threshold
            );
        }
        if self.dispatcher.fallback_message.trim().is_empty() {
            bail!("dispatcher.fallback_message cannot be empty");
        }
        Ok(())
    }
}

fn resolve_schema_path(config_base: &Path, value: &Value) -> Result<PathBuf> {
    if let Some(path_text) = value.get("$schema").and_then(Value::as_str) {
        let configured = PathBuf::from(path_text);
        if configured.is_absolute() {
            return Ok(configured);
        }
        return Ok(config_base.join(configured));
    }

    let local_default = config_base.join(SCHEMA_FILE_NAME);
    if local_default.exists() {
        return Ok(local_default);
    }

    Err(anyhow!(
        "unable to resolve schema path: expected $schema in config or {SCHEMA_FILE_NAME} next to it"
    ))
}

fn validate_against_schema(value: &Value, schema_path: &Path) -> Result<()> {
    let schema_content = fs::read_to_string(schema_path)
        .with_context(|| format!("failed to read schema {}", schema_path.display()))?;
    let schema: Value = serde_json::from_str(&schema_content)
        .with_context(|| format!("failed to parse schema {}", schema_path.display()))?;

    let compiled =
        JSONSchema::compile(&schema).map_err(|e| anyhow!("failed to compile schema: {e}"))?;

    if let Err(errors) = compiled.validate(value) {
        let messages: Vec<String> = errors.map(|error| error.to_string()).collect();
        bail!("config validation failed: {}", messages.join("; "));
    }
    Ok(())
}
