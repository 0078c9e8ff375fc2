//! Configuration management for taskrelay.
//!
//! Configuration is set via environment variables:
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `10000`.
//! - `PUBLIC_URL` - Optional. URL advertised in the agent card. Defaults to `http://{HOST}:{PORT}/`.
//! - `AGENT_REGISTRY_PATH` - Optional. JSON array of agent base URLs. Defaults to `agent_registry.json`.
//! - `MCP_CONFIG_PATH` - Optional. Tool-server file. Defaults to `mcp_config.json`.
//! - `OPENROUTER_API_KEY` - Optional. Without it routing uses the offline lexical collaborator.
//! - `DEFAULT_MODEL` - Optional. Routing model. Defaults to `anthropic/claude-sonnet-4`.
//! - `MAX_ROUTING_TURNS` - Optional. Extra collaborator turns per request. Defaults to `2`.
//! - `CONNECTOR_TIMEOUT_SECS` - Optional. Deadline per remote call. Defaults to `60`.
//! - `POLL_INTERVAL_MS` - Optional. `tasks/get` polling interval. Defaults to `500`.
//! - `CONNECTOR_RETRIES` - Optional. Retries after an unreachable target. Defaults to `0`.
//! - `REGISTRY_REFRESH_SECS` - Optional. Periodic registry refresh; `0` disables. Defaults to `0`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::router::RouterConfig;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// URL published in `/.well-known/agent.json`
    pub public_url: String,
    pub agent_registry_path: PathBuf,
    pub mcp_config_path: PathBuf,
    /// Reasoning API key; `None` selects the offline collaborator
    pub api_key: Option<String>,
    pub default_model: String,
    pub max_routing_turns: usize,
    pub connector_timeout: Duration,
    pub poll_interval: Duration,
    pub connector_retries: u32,
    /// `None` disables the background refresh loop
    pub registry_refresh: Option<Duration>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let host = var("HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let port: u16 = parse_or(&var, "PORT", 10000)?;
        let public_url = var("PUBLIC_URL").unwrap_or_else(|| format!("http://{}:{}/", host, port));
        url::Url::parse(&public_url)
            .map_err(|e| ConfigError::InvalidValue("PUBLIC_URL".to_string(), e.to_string()))?;

        let registry_refresh_secs: u64 = parse_or(&var, "REGISTRY_REFRESH_SECS", 0)?;

        Ok(Self {
            host,
            port,
            public_url,
            agent_registry_path: var("AGENT_REGISTRY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("agent_registry.json")),
            mcp_config_path: var("MCP_CONFIG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("mcp_config.json")),
            api_key: var("OPENROUTER_API_KEY"),
            default_model: var("DEFAULT_MODEL").unwrap_or_else(|| RouterConfig::default().model),
            max_routing_turns: parse_or(&var, "MAX_ROUTING_TURNS", 2)?,
            connector_timeout: Duration::from_secs(parse_or(&var, "CONNECTOR_TIMEOUT_SECS", 60)?),
            poll_interval: Duration::from_millis(parse_or(&var, "POLL_INTERVAL_MS", 500)?),
            connector_retries: parse_or(&var, "CONNECTOR_RETRIES", 0)?,
            registry_refresh: (registry_refresh_secs > 0).then(|| Duration::from_secs(registry_refresh_secs)),
        })
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            model: self.default_model.clone(),
            max_followup_turns: self.max_routing_turns,
        }
    }
}

fn parse_or<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(key.to_string(), format!("{}", e))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let env: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = tokio_test::assert_ok!(load(&[]));
        assert_eq!(config.port, 10000);
        assert_eq!(config.public_url, "http://127.0.0.1:10000/");
        assert_eq!(config.agent_registry_path, PathBuf::from("agent_registry.json"));
        assert!(config.api_key.is_none());
        assert_eq!(config.max_routing_turns, 2);
        assert_eq!(config.connector_timeout, Duration::from_secs(60));
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.connector_retries, 0);
        assert!(config.registry_refresh.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("HOST", "0.0.0.0"),
            ("PORT", "8080"),
            ("OPENROUTER_API_KEY", "sk-test"),
            ("CONNECTOR_RETRIES", "2"),
            ("REGISTRY_REFRESH_SECS", "30"),
        ])
        .unwrap();
        assert_eq!(config.public_url, "http://0.0.0.0:8080/");
        assert_eq!(config.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.connector_retries, 2);
        assert_eq!(config.registry_refresh, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_blank_api_key_is_absent() {
        let config = load(&[("OPENROUTER_API_KEY", "  ")]).unwrap();
        assert!(config.api_key.is_none());
    }

    #[test]
    fn test_invalid_number() {
        let err = tokio_test::assert_err!(load(&[("PORT", "not-a-port")]));
        assert!(matches!(err, ConfigError::InvalidValue(key, _) if key == "PORT"));
    }

    #[test]
    fn test_invalid_public_url() {
        let err = load(&[("PUBLIC_URL", "not a url")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(key, _) if key == "PUBLIC_URL"));
    }
}
