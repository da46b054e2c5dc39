use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::bce::types::Credentials;
use crate::upload::MultipartConfig;

/// Service id of object storage, used to derive the default endpoint
pub const BOS_SERVICE_ID: &str = "bos";

/// Settings for one client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Full endpoint URL; derived from protocol, service and region when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// `http` or `https` (default: http)
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// Region (default: bj)
    #[serde(default = "default_region")]
    pub region: String,

    #[serde(default)]
    pub credentials: Credentials,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// TCP connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default)]
    pub multipart: MultipartConfig,
}

fn default_protocol() -> String {
    "http".to_string()
}

fn default_region() -> String {
    "bj".to_string()
}

fn default_request_timeout() -> u64 {
    300
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            protocol: default_protocol(),
            region: default_region(),
            credentials: Credentials::default(),
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            multipart: MultipartConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            ..Self::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_multipart(mut self, multipart: MultipartConfig) -> Self {
        self.multipart = multipart;
        self
    }

    /// Endpoint for `service_id`: the configured one, or
    /// `<protocol>://<service_id>.<region>.baidubce.com`
    pub fn endpoint_for(&self, service_id: &str) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!(
                "{}://{}.{}.baidubce.com",
                self.protocol, service_id, self.region
            ),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Named client profiles
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub profiles: HashMap<String, ClientConfig>,

    /// Profile used when none is named
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_profile: Option<String>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a profile by name, or the default profile if not specified
    pub fn get_profile(&self, name: Option<&str>) -> Option<&ClientConfig> {
        if let Some(name) = name {
            self.profiles.get(name)
        } else if let Some(default) = &self.default_profile {
            self.profiles.get(default)
        } else {
            self.profiles.values().next()
        }
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config = serde_yaml::from_str(&content)
        .context("Failed to parse YAML configuration")?;

    Ok(config)
}

/// Load configuration from environment variables
///
/// - BCE_ACCESS_KEY_ID / BCE_SECRET_ACCESS_KEY (required)
/// - BCE_SESSION_TOKEN (optional, temporary credentials)
/// - BCE_ENDPOINT (optional, full URL)
/// - BCE_REGION (optional, defaults to bj)
/// - BCE_PROTOCOL (optional, defaults to http)
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let access_key = std::env::var("BCE_ACCESS_KEY_ID")
        .context("BCE_ACCESS_KEY_ID environment variable is not set")?;
    let secret_key = std::env::var("BCE_SECRET_ACCESS_KEY")
        .context("BCE_SECRET_ACCESS_KEY environment variable is not set")?;

    if access_key.trim().is_empty() || secret_key.trim().is_empty() {
        anyhow::bail!("BCE_ACCESS_KEY_ID and BCE_SECRET_ACCESS_KEY must not be empty");
    }

    let mut credentials = Credentials::new(access_key, secret_key);
    if let Ok(token) = std::env::var("BCE_SESSION_TOKEN") {
        if !token.is_empty() {
            credentials = credentials.with_session_token(token);
        }
    }

    let mut client = ClientConfig::new(credentials);
    if let Ok(endpoint) = std::env::var("BCE_ENDPOINT") {
        client.endpoint = Some(endpoint);
    }
    if let Ok(region) = std::env::var("BCE_REGION") {
        client.region = region;
    }
    if let Ok(protocol) = std::env::var("BCE_PROTOCOL") {
        client.protocol = protocol;
    }

    if let Ok(timeout) = std::env::var("BCE_REQUEST_TIMEOUT") {
        if let Ok(val) = timeout.parse() {
            client.request_timeout_secs = val;
        }
    }

    let mut config = Config::new();
    config.profiles.insert("default".to_string(), client);
    config.default_profile = Some("default".to_string());
    Ok(config)
}

/// Load configuration from file or environment
///
/// Reads the YAML file when a path is given, else the environment.
/// `profile_name` selects the default profile of a YAML config.
pub fn load_config(config_path: Option<&str>, profile_name: Option<&str>) -> Result<Config> {
    if let Some(path) = config_path {
        let mut config = load_from_yaml(path)?;

        if let Some(name) = profile_name {
            if !config.profiles.contains_key(name) {
                anyhow::bail!("Profile '{}' not found in config file", name);
            }
            config.default_profile = Some(name.to_string());
        }

        Ok(config)
    } else {
        load_from_env()
    }
}
