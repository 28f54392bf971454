//! Cloud network API configuration, read from the `NET_CONF` environment variable

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use vpc_route_core::{Result, RouteError};

pub const NET_CONF_ENV: &str = "NET_CONF";
pub const DEFAULT_NETWORK_ENDPOINT: &str = "http://internal.api.ksyun.com";

#[derive(Clone, Debug, Deserialize)]
pub struct CloudConfig {
    #[serde(default = "default_network_endpoint")]
    pub network_endpoint: String,

    /// VPC whose route table is managed
    #[serde(default)]
    pub vpc_id: String,

    #[serde(default)]
    pub region: String,

    #[serde(default)]
    pub cluster_uuid: String,

    /// Extra headers sent with every request
    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default, alias = "securityToken")]
    pub security_token: Option<String>,

    /// How long a create waits for the new route to become visible
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_seconds: u64,

    #[serde(default = "default_wait_interval")]
    pub wait_interval_seconds: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_network_endpoint() -> String {
    DEFAULT_NETWORK_ENDPOINT.to_string()
}

fn default_wait_timeout() -> u64 {
    60
}

fn default_wait_interval() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    30
}

impl CloudConfig {
    pub fn from_json(content: &str) -> Result<Self> {
        let mut config: CloudConfig = serde_json::from_str(content).map_err(|e| {
            RouteError::InvalidConfiguration(format!("cannot parse {}: {}", NET_CONF_ENV, e))
        })?;
        if config.network_endpoint.is_empty() {
            config.network_endpoint = default_network_endpoint();
        }
        config.validate()?;
        Ok(config)
    }

    /// Load from `NET_CONF`; an unset or empty variable is an error.
    pub fn from_env() -> Result<Self> {
        match std::env::var(NET_CONF_ENV) {
            Ok(content) if !content.trim().is_empty() => Self::from_json(&content),
            _ => Err(RouteError::InvalidConfiguration(format!(
                "{} is not set",
                NET_CONF_ENV
            ))),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.vpc_id.is_empty() {
            return Err(RouteError::InvalidConfiguration(
                "vpc_id is required".to_string(),
            ));
        }
        if !self.network_endpoint.starts_with("http://")
            && !self.network_endpoint.starts_with("https://")
        {
            return Err(RouteError::InvalidConfiguration(format!(
                "network_endpoint must start with http:// or https://, got: {}",
                self.network_endpoint
            )));
        }
        if self.wait_interval_seconds == 0 {
            return Err(RouteError::InvalidConfiguration(
                "wait_interval_seconds must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_seconds)
    }

    pub fn wait_interval(&self) -> Duration {
        Duration::from_secs(self.wait_interval_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}
