//! Registry inputs: the agent URL list and the MCP server configuration.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use super::{CapabilityCard, McpTransport, RegistryError, RegistrySnapshot};
use crate::connector::{CallControl, McpConnector};
use crate::protocol::a2a::{AgentCard, AGENT_CARD_PATH};

/// Contents of the MCP config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpServersFile {
    #[serde(rename = "mcpServers", default)]
    pub servers: BTreeMap<String, McpServerEntry>,
}

/// One server entry: either a process to launch or an HTTP endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpServerEntry {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl McpServerEntry {
    /// Resolve to a transport, expanding `${VAR}` placeholders in `env`.
    pub fn transport(&self) -> Option<McpTransport> {
        if let Some(command) = self.command.as_deref().filter(|c| !c.trim().is_empty()) {
            return Some(McpTransport::Stdio {
                command: command.to_string(),
                args: self.args.clone(),
                env: expand_env_placeholders(&self.env),
            });
        }
        self.url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .map(|u| McpTransport::Http {
                endpoint: u.trim_end_matches('/').to_string(),
            })
    }
}

/// Replace values of the form `${NAME}` with the process environment's `NAME`.
///
/// Unset variables keep the literal placeholder.
pub fn expand_env_placeholders(env: &HashMap<String, String>) -> HashMap<String, String> {
    expand_with(env, |name| std::env::var(name).ok())
}

fn expand_with<F>(env: &HashMap<String, String>, lookup: F) -> HashMap<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    env.iter()
        .map(|(key, value)| {
            let expanded = match value.strip_prefix("${").and_then(|v| v.strip_suffix('}')) {
                Some(name) => match lookup(name) {
                    Some(resolved) => {
                        tracing::debug!("Expanded {} from ${{{}}}", key, name);
                        resolved
                    }
                    None => {
                        tracing::warn!("Environment variable {} not set; keeping placeholder for {}", name, key);
                        value.clone()
                    }
                },
                None => value.clone(),
            };
            (key.clone(), expanded)
        })
        .collect()
}

/// Read the agent registry: a JSON array of agent base URLs.
///
/// A missing file is an empty registry.
pub async fn read_agent_registry(path: &Path) -> Result<Vec<String>, RegistryError> {
    let Some(content) = read_optional(path).await? else {
        tracing::warn!("Agent registry {} not found; no agents loaded", path.display());
        return Ok(Vec::new());
    };
    serde_json::from_str(&content).map_err(|source| RegistryError::Parse {
        path: path.display().to_string(),
        source,
    })
}

/// Read the MCP server configuration. A missing file means no tool servers.
pub async fn read_mcp_config(path: &Path) -> Result<McpServersFile, RegistryError> {
    let Some(content) = read_optional(path).await? else {
        tracing::info!("MCP config {} not found; no tool servers loaded", path.display());
        return Ok(McpServersFile::default());
    };
    serde_json::from_str(&content).map_err(|source| RegistryError::Parse {
        path: path.display().to_string(),
        source,
    })
}

async fn read_optional(path: &Path) -> Result<Option<String>, RegistryError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(RegistryError::Io {
            path: path.display().to_string(),
            source,
        }),
    }
}

/// Where registry snapshots are built from.
pub struct RegistrySource {
    agent_registry_path: PathBuf,
    mcp_config_path: PathBuf,
    client: reqwest::Client,
    mcp: McpConnector,
    discovery_timeout: Duration,
}

impl RegistrySource {
    pub fn new(
        agent_registry_path: impl Into<PathBuf>,
        mcp_config_path: impl Into<PathBuf>,
        discovery_timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(discovery_timeout)
            .build()
            .unwrap_or_default();
        Self {
            agent_registry_path: agent_registry_path.into(),
            mcp_config_path: mcp_config_path.into(),
            client,
            mcp: McpConnector::new(),
            discovery_timeout,
        }
    }

    /// Read both files and discover every agent and tool.
    ///
    /// Unreachable agents and servers are skipped with a warning; only
    /// unreadable or malformed files fail the load.
    pub async fn load(&self) -> Result<RegistrySnapshot, RegistryError> {
        let urls = read_agent_registry(&self.agent_registry_path).await?;
        let servers = read_mcp_config(&self.mcp_config_path).await?;

        let agent_discovery = join_all(urls.iter().map(|url| self.discover_agent(url)));
        let tool_discovery = join_all(
            servers
                .servers
                .iter()
                .map(|(name, entry)| self.discover_tools(name, entry)),
        );
        let (agents, tools) = tokio::join!(agent_discovery, tool_discovery);

        let mut cards: Vec<CapabilityCard> = agents.into_iter().flatten().collect();
        cards.extend(tools.into_iter().flatten());
        Ok(RegistrySnapshot::new(cards))
    }

    /// Fetch `{url}/.well-known/agent.json` and normalize it.
    async fn discover_agent(&self, base_url: &str) -> Option<CapabilityCard> {
        let card_url = match agent_card_url(base_url) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!("Invalid agent URL '{}': {}", base_url, e);
                return None;
            }
        };

        let response = match self.client.get(card_url.clone()).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                tracing::warn!("Agent card at {} returned HTTP {}", card_url, r.status());
                return None;
            }
            Err(e) => {
                tracing::warn!("Failed to reach agent at {}: {}", card_url, e);
                return None;
            }
        };

        match response.json::<AgentCard>().await {
            Ok(card) => {
                tracing::info!("Discovered agent '{}' at {}", card.name, base_url);
                Some(CapabilityCard::from_agent_card(&card, base_url))
            }
            Err(e) => {
                tracing::warn!("Malformed agent card at {}: {}", card_url, e);
                None
            }
        }
    }

    /// Initialize one MCP server and turn each listed tool into a card.
    async fn discover_tools(&self, server: &str, entry: &McpServerEntry) -> Vec<CapabilityCard> {
        let Some(transport) = entry.transport() else {
            tracing::warn!("MCP server '{}' has neither command nor url; skipped", server);
            return Vec::new();
        };

        let control = CallControl::new(self.discovery_timeout);
        match self.mcp.list_tools(&transport, &control).await {
            Ok(tools) => {
                tracing::info!("Loaded {} tools from MCP server '{}'", tools.len(), server);
                tools
                    .iter()
                    .map(|tool| CapabilityCard::from_mcp_tool(server, tool, &transport))
                    .collect()
            }
            Err(e) => {
                tracing::warn!("Failed to list tools from MCP server '{}': {}", server, e);
                Vec::new()
            }
        }
    }
}

fn agent_card_url(base_url: &str) -> Result<url::Url, url::ParseError> {
    let mut base = url::Url::parse(base_url)?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(AGENT_CARD_PATH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CapabilityKind;
    use axum::{routing::get, Json, Router};
    use std::io::Write;

    #[test]
    fn test_expand_env_placeholders() {
        let env = HashMap::from([
            ("TOKEN".to_string(), "${TASKRELAY_TEST_TOKEN}".to_string()),
            ("MISSING".to_string(), "${TASKRELAY_TEST_UNSET}".to_string()),
            ("PLAIN".to_string(), "value".to_string()),
        ]);
        let expanded = expand_with(&env, |name| {
            (name == "TASKRELAY_TEST_TOKEN").then(|| "secret".to_string())
        });
        assert_eq!(expanded["TOKEN"], "secret");
        assert_eq!(expanded["MISSING"], "${TASKRELAY_TEST_UNSET}");
        assert_eq!(expanded["PLAIN"], "value");
    }

    #[test]
    fn test_agent_card_url_keeps_base_path() {
        let url = agent_card_url("http://localhost:10002").unwrap();
        assert_eq!(url.as_str(), "http://localhost:10002/.well-known/agent.json");

        let url = agent_card_url("http://host/agents/time").unwrap();
        assert_eq!(url.as_str(), "http://host/agents/time/.well-known/agent.json");
    }

    #[test]
    fn test_server_entry_transport() {
        let file: McpServersFile = serde_json::from_value(serde_json::json!({
            "mcpServers": {
                "terminal": { "command": "uv", "args": ["run", "server.py"] },
                "remote": { "url": "http://localhost:9000/mcp/" },
                "broken": {}
            }
        }))
        .unwrap();

        assert!(matches!(
            file.servers["terminal"].transport(),
            Some(McpTransport::Stdio { ref command, .. }) if command == "uv"
        ));
        assert_eq!(
            file.servers["remote"].transport(),
            Some(McpTransport::Http { endpoint: "http://localhost:9000/mcp".to_string() })
        );
        assert!(file.servers["broken"].transport().is_none());
    }

    #[tokio::test]
    async fn test_missing_files_are_empty() {
        let dir = tempfile::tempdir().unwrap();
        let urls = read_agent_registry(&dir.path().join("absent.json")).await.unwrap();
        assert!(urls.is_empty());
        let servers = read_mcp_config(&dir.path().join("absent.json")).await.unwrap();
        assert!(servers.servers.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_registry_fails() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = read_agent_registry(file.path()).await.unwrap_err();
        assert!(matches!(err, RegistryError::Parse { .. }));
    }

    #[tokio::test]
    async fn test_load_discovers_agents_and_skips_unreachable() {
        let app = Router::new().route(
            "/.well-known/agent.json",
            get(|| async {
                Json(serde_json::json!({
                    "name": "TellTimeAgent",
                    "description": "Tells the current time",
                    "url": "",
                    "skills": [{
                        "id": "tell_time",
                        "name": "Tell Time",
                        "examples": ["What time is it?"]
                    }]
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let registry_path = dir.path().join("agent_registry.json");
        let base = format!("http://{}", addr);
        std::fs::write(
            &registry_path,
            serde_json::to_string(&vec![base.clone(), "http://127.0.0.1:1".to_string()]).unwrap(),
        )
        .unwrap();

        let source = RegistrySource::new(
            &registry_path,
            dir.path().join("mcp_config.json"),
            Duration::from_secs(5),
        );
        let snapshot = source.load().await.unwrap();

        assert_eq!(snapshot.len(), 1);
        let card = snapshot.get("TellTimeAgent").unwrap();
        assert_eq!(card.kind(), CapabilityKind::Agent);
        assert_eq!(card.address(), base);
        assert_eq!(card.examples, vec!["What time is it?"]);
    }
}
