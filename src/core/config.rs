//! Configuration management for the proxy server.
//!
//! Configuration is a JSON file with support for environment variable
//! expansion, followed by a handful of environment overrides.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// File name looked up in the OS config directories.
pub const DEFAULT_CONFIG_FILE: &str = "llmsee.json";

/// File name of the audit database inside the data directory.
pub const DEFAULT_DATABASE_FILE: &str = "llmsee.db";

/// Path segment of the unified endpoint.
pub const UNIFIED_BACKEND_ID: &str = "v1";

/// Leading path segments owned by the server itself.
pub const RESERVED_BACKEND_IDS: &[&str] = &[UNIFIED_BACKEND_ID, "log", "ui", "health", "metrics"];

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,

    /// Number of summaries per `/log` page
    #[serde(default = "default_page_size", alias = "pagesize")]
    pub page_size: u32,

    /// Audit database location (OS data directory when unset)
    #[serde(default, alias = "databasefile")]
    pub database_file: Option<PathBuf>,

    /// Ceiling for one proxied call, headers and body included
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Timeout for each backend's `/models` fetch
    #[serde(default = "default_model_list_timeout")]
    pub model_list_timeout_secs: u64,

    /// Largest accepted inbound request body
    #[serde(default = "default_max_request_body")]
    pub max_request_body_bytes: usize,

    /// How long shutdown waits for in-flight calls
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Bounded queue length per live-update subscriber
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue_capacity: usize,

    /// Backends keyed by id
    #[serde(default)]
    pub providers: BTreeMap<String, BackendConfig>,
}

/// Configuration for a single backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// Backend id, filled from the `providers` map key
    #[serde(skip)]
    pub id: String,

    /// Base URL requests are forwarded to
    #[serde(alias = "baseurl")]
    pub base_url: String,

    /// Static credential, replaces any client-supplied bearer token
    #[serde(default, alias = "apikey")]
    pub api_key: Option<String>,

    /// Header renames applied after credential injection
    #[serde(default, alias = "headermapping")]
    pub header_mapping: BTreeMap<String, String>,

    /// Fixed model list, skips the `/models` fetch
    #[serde(default)]
    pub models: Option<Vec<String>>,

    #[serde(default)]
    pub enabled: Option<bool>,

    /// Body rewrite for backends that reject some request fields
    #[serde(default)]
    pub quirks: Option<BodyQuirks>,
}

/// Data-driven request body transform for a quirky backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BodyQuirks {
    /// Top-level fields removed before forwarding
    #[serde(default)]
    pub strip_fields: Vec<String>,

    /// Top-level fields set (or overwritten) before forwarding
    #[serde(default)]
    pub set_fields: Map<String, Value>,
}

impl BackendConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// The static credential, if a non-empty one is configured.
    pub fn credential(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|k| !k.is_empty())
    }

    /// Active body quirks, if any are configured.
    pub fn active_quirks(&self) -> Option<&BodyQuirks> {
        self.quirks
            .as_ref()
            .filter(|q| !q.strip_fields.is_empty() || !q.set_fields.is_empty())
    }
}

fn default_host() -> String {
    std::env::var("LLMSEE_HOST").unwrap_or_else(|_| "localhost".to_string())
}

fn default_port() -> u16 {
    5050
}

fn default_page_size() -> u32 {
    20
}

fn default_request_timeout() -> u64 {
    3600
}

fn default_model_list_timeout() -> u64 {
    30
}

fn default_max_request_body() -> usize {
    10 << 20
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_subscriber_queue() -> usize {
    100
}

fn default_ollama() -> BackendConfig {
    let host = std::env::var("LLMSEE_LOCALHOST").unwrap_or_else(|_| "localhost".to_string());
    BackendConfig {
        id: "ollama".to_string(),
        base_url: format!("http://{}:11434/v1", host),
        ..Default::default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            page_size: default_page_size(),
            database_file: None,
            request_timeout_secs: default_request_timeout(),
            model_list_timeout_secs: default_model_list_timeout(),
            max_request_body_bytes: default_max_request_body(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            subscriber_queue_capacity: default_subscriber_queue(),
            providers: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional JSON file.
    ///
    /// Without a file the built-in defaults are used. Environment overrides
    /// are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file: {}", path.display()))?;
                let config = Self::from_json_str(&content)
                    .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
                tracing::info!("Config file {}", path.display());
                config
            }
            None => {
                tracing::info!("No config file found, using defaults");
                Self::default()
            }
        };

        config.apply_env_overrides();
        config.normalize();
        Ok(config)
    }

    /// Parse configuration content after expanding `${VAR}` references.
    pub fn from_json_str(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let mut config: AppConfig = serde_json::from_str(&expanded)?;
        config.normalize();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("LLMSEE_HOST") {
            self.host = host;
        }

        if let Ok(port_str) = std::env::var("LLMSEE_PORT") {
            if let Ok(port) = port_str.parse::<u16>() {
                self.port = port;
            }
        }

        if let Ok(db) = std::env::var("LLMSEE_DATABASEFILE") {
            if !db.is_empty() {
                self.database_file = Some(PathBuf::from(db));
            }
        }
    }

    /// Fill backend ids, strip trailing slashes and add the default backend.
    fn normalize(&mut self) {
        if self.page_size == 0 {
            self.page_size = default_page_size();
        }

        self.providers
            .entry("ollama".to_string())
            .or_insert_with(default_ollama);

        for (id, backend) in self.providers.iter_mut() {
            backend.id = id.clone();
            while backend.base_url.ends_with('/') {
                backend.base_url.pop();
            }
        }
    }

    /// Address string for the listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Resolve the audit database path, creating its directory.
    pub fn database_path(&self) -> Result<PathBuf> {
        let path = match &self.database_file {
            Some(path) => path.clone(),
            None => match dirs::data_dir() {
                Some(dir) => dir.join("llmsee").join(DEFAULT_DATABASE_FILE),
                None => std::env::current_dir()
                    .context("failed to get current working directory")?
                    .join(DEFAULT_DATABASE_FILE),
            },
        };

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory: {}", dir.display()))?;
        }

        Ok(path)
    }
}

/// Locate the configuration file.
///
/// An explicit path (flag or `LLMSEE_CONFIGFILE`) wins; otherwise the OS
/// config directory and `~/.config` are searched.
pub fn find_config_file(explicit: Option<PathBuf>) -> Option<PathBuf> {
    if explicit.is_some() {
        return explicit;
    }

    let candidates = [
        dirs::config_dir().map(|d| d.join(DEFAULT_CONFIG_FILE)),
        dirs::home_dir().map(|d| d.join(".config").join(DEFAULT_CONFIG_FILE)),
    ];

    candidates.into_iter().flatten().find(|p| p.exists())
}

/// Expand environment variables in configuration content.
///
/// Supports patterns: ${VAR}, ${VAR:-default}, ${VAR:default}
fn expand_env_vars(content: &str) -> String {
    let re = Regex::new(r#"\$\{([^}:]+)(?::-?([^}]*))?\}"#).expect("valid env var pattern");

    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default_value.to_string())
    })
    .to_string()
}
