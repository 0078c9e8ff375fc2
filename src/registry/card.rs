//! Capability cards: normalized descriptors of remote agents and tools.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::protocol::a2a::AgentCard;
use crate::protocol::mcp::McpToolDescriptor;

/// Transport type for MCP server communication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpTransport {
    /// HTTP JSON-RPC transport (server must be running and listening)
    Http { endpoint: String },
    /// Stdio transport (spawn process, communicate via stdin/stdout)
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
}

impl McpTransport {
    /// Short description for logs and diagnostics.
    pub fn describe(&self) -> String {
        match self {
            McpTransport::Http { endpoint } => endpoint.clone(),
            McpTransport::Stdio { command, args, .. } => {
                if args.is_empty() {
                    command.clone()
                } else {
                    format!("{} {}", command, args.join(" "))
                }
            }
        }
    }
}

/// Where and how a capability is reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum Endpoint {
    /// An A2A agent reachable over HTTP JSON-RPC
    A2a { url: String },
    /// A single tool on an MCP server
    Mcp { transport: McpTransport, tool: String },
}

/// Whether a card describes a conversational agent or a callable tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Agent,
    Tool,
}

/// Normalized descriptor of one remote agent or tool.
///
/// Cards are immutable once loaded; a registry refresh replaces them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityCard {
    pub id: String,
    pub name: String,
    pub description: String,
    pub input_modes: BTreeSet<String>,
    pub output_modes: BTreeSet<String>,
    pub examples: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// JSON schema of tool arguments (tools only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
    pub endpoint: Endpoint,
}

fn text_modes() -> BTreeSet<String> {
    BTreeSet::from(["text".to_string()])
}

impl CapabilityCard {
    /// Minimal agent card; mostly useful for tests and static registries.
    pub fn agent(id: impl Into<String>, url: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: String::new(),
            input_modes: text_modes(),
            output_modes: text_modes(),
            examples: Vec::new(),
            tags: Vec::new(),
            input_schema: None,
            endpoint: Endpoint::A2a { url: url.into() },
        }
    }

    /// Minimal tool card.
    pub fn tool(id: impl Into<String>, transport: McpTransport, tool: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: String::new(),
            input_modes: text_modes(),
            output_modes: text_modes(),
            examples: Vec::new(),
            tags: Vec::new(),
            input_schema: Some(serde_json::json!({ "type": "object", "properties": {} })),
            endpoint: Endpoint::Mcp {
                transport,
                tool: tool.into(),
            },
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_examples<I, S>(mut self, examples: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.examples = examples.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_input_schema(mut self, schema: serde_json::Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    /// Normalize an A2A agent card.
    ///
    /// The agent name becomes the card id. `fallback_url` is used when the
    /// published card leaves `url` empty.
    pub fn from_agent_card(card: &AgentCard, fallback_url: &str) -> Self {
        let url = if card.url.trim().is_empty() {
            fallback_url.to_string()
        } else {
            card.url.clone()
        };

        let mut description = card.description.clone().unwrap_or_default();
        let skill_lines: Vec<String> = card
            .skills
            .iter()
            .map(|s| match &s.description {
                Some(d) if !d.is_empty() => format!("{}: {}", s.name, d),
                _ => s.name.clone(),
            })
            .collect();
        if !skill_lines.is_empty() {
            if !description.is_empty() {
                description.push_str(" Skills: ");
            } else {
                description.push_str("Skills: ");
            }
            description.push_str(&skill_lines.join("; "));
        }

        Self {
            id: card.name.clone(),
            name: card.name.clone(),
            description,
            input_modes: card.default_input_modes.iter().cloned().collect(),
            output_modes: card.default_output_modes.iter().cloned().collect(),
            examples: card
                .skills
                .iter()
                .flat_map(|s| s.examples.iter().cloned())
                .collect(),
            tags: card.skills.iter().flat_map(|s| s.tags.iter().cloned()).collect(),
            input_schema: None,
            endpoint: Endpoint::A2a { url },
        }
    }

    /// Normalize one tool advertised by an MCP server.
    pub fn from_mcp_tool(server: &str, tool: &McpToolDescriptor, transport: &McpTransport) -> Self {
        let schema = if tool.input_schema.is_object() {
            tool.input_schema.clone()
        } else {
            serde_json::json!({ "type": "object", "properties": {} })
        };
        Self {
            id: format!("{}/{}", server, tool.name),
            name: tool.name.clone(),
            description: tool.description.clone(),
            input_modes: text_modes(),
            output_modes: text_modes(),
            examples: Vec::new(),
            tags: vec![server.to_string()],
            input_schema: Some(schema),
            endpoint: Endpoint::Mcp {
                transport: transport.clone(),
                tool: tool.name.clone(),
            },
        }
    }

    pub fn kind(&self) -> CapabilityKind {
        match self.endpoint {
            Endpoint::A2a { .. } => CapabilityKind::Agent,
            Endpoint::Mcp { .. } => CapabilityKind::Tool,
        }
    }

    /// Address shown in diagnostics.
    pub fn address(&self) -> String {
        match &self.endpoint {
            Endpoint::A2a { url } => url.clone(),
            Endpoint::Mcp { transport, tool } => format!("{} ({})", transport.describe(), tool),
        }
    }
}
