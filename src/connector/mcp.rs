//! MCP connector: `tools/list` and `tools/call` over HTTP or a spawned stdio process.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use super::{CallControl, ConnectorError, Outbound, Payload, RemoteConnector};
use crate::protocol::mcp::{InitializeParams, InitializeResult, McpCallToolResponse, McpToolDescriptor, McpToolsResponse};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse, RequestId};
use crate::registry::{CapabilityCard, Endpoint, McpTransport};
use crate::task::{Artifact, Message, Part, Task, TaskState};

/// Client for MCP tool servers.
///
/// Each call opens a fresh session: HTTP servers get a new `initialize`
/// handshake, stdio servers a new process that is killed when the call ends.
pub struct McpConnector {
    client: reqwest::Client,
    request_id: AtomicU64,
}

impl Default for McpConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl McpConnector {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            request_id: AtomicU64::new(1),
        }
    }

    fn next_request_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    /// List the tools a server advertises.
    pub async fn list_tools(
        &self,
        transport: &McpTransport,
        control: &CallControl,
    ) -> Result<Vec<McpToolDescriptor>, ConnectorError> {
        let target = transport.describe();
        control
            .bound(&target, async {
                let mut session = self.open(&target, transport).await?;
                let result = session.request("tools/list", None).await;
                session.close().await;
                let response: McpToolsResponse = serde_json::from_value(result?)
                    .map_err(|e| ConnectorError::protocol(&target, format!("malformed tools/list result: {}", e)))?;
                Ok(response.tools)
            })
            .await
    }

    /// Call one tool and return the raw MCP result.
    pub async fn call_tool(
        &self,
        target: &str,
        transport: &McpTransport,
        tool: &str,
        arguments: serde_json::Value,
        control: &CallControl,
    ) -> Result<McpCallToolResponse, ConnectorError> {
        control
            .bound(target, async {
                let mut session = self.open(target, transport).await?;
                let params = serde_json::json!({ "name": tool, "arguments": arguments });
                let result = session.request("tools/call", Some(params)).await;
                session.close().await;
                serde_json::from_value(result?)
                    .map_err(|e| ConnectorError::protocol(target, format!("malformed tools/call result: {}", e)))
            })
            .await
    }

    /// Connect and run the `initialize` handshake.
    async fn open(&self, target: &str, transport: &McpTransport) -> Result<McpSession<'_>, ConnectorError> {
        let mut session = match transport {
            McpTransport::Http { endpoint } => McpSession::Http {
                connector: self,
                target: target.to_string(),
                endpoint: endpoint.trim_end_matches('/').to_string(),
            },
            McpTransport::Stdio { command, args, env } => {
                McpSession::Stdio(StdioSession::spawn(target, command, args, env)?)
            }
        };

        let params = serde_json::to_value(InitializeParams::for_this_client())
            .map_err(|e| ConnectorError::protocol(target, e.to_string()))?;
        let result = match session.request("initialize", Some(params)).await {
            Ok(result) => result,
            Err(e) => {
                session.close().await;
                return Err(e);
            }
        };
        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| ConnectorError::protocol(target, format!("malformed initialize result: {}", e)))?;
        tracing::debug!(
            "MCP session with {} initialized (protocol {}, server {:?})",
            target,
            init.protocol_version,
            init.server_info.as_ref().map(|s| s.name.as_str())
        );

        session.notify("notifications/initialized").await;
        Ok(session)
    }

    /// POST one JSON-RPC request to an HTTP MCP endpoint.
    async fn post_jsonrpc(
        &self,
        target: &str,
        endpoint: &str,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ConnectorError> {
        let request = JsonRpcRequest::new(self.next_request_id(), method, params);

        let response = self
            .client
            .post(endpoint)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| ConnectorError::from_reqwest(target, e))?;

        if !response.status().is_success() {
            return Err(ConnectorError::protocol(
                target,
                format!("{} returned HTTP {}", method, response.status()),
            ));
        }

        let rpc: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| ConnectorError::protocol(target, format!("invalid JSON-RPC response: {}", e)))?;
        into_result(target, method, rpc)
    }
}

fn into_result(target: &str, method: &str, rpc: JsonRpcResponse) -> Result<serde_json::Value, ConnectorError> {
    if let Some(error) = rpc.error {
        return Err(ConnectorError::protocol(target, error.to_string()));
    }
    rpc.result
        .ok_or_else(|| ConnectorError::protocol(target, format!("{} returned no result", method)))
}

enum McpSession<'a> {
    Http {
        connector: &'a McpConnector,
        target: String,
        endpoint: String,
    },
    Stdio(StdioSession),
}

impl McpSession<'_> {
    async fn request(
        &mut self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ConnectorError> {
        match self {
            McpSession::Http {
                connector,
                target,
                endpoint,
            } => connector.post_jsonrpc(target, endpoint, method, params).await,
            McpSession::Stdio(session) => session.request(method, params).await,
        }
    }

    /// Send a notification; some servers require it, none answer it.
    async fn notify(&mut self, method: &str) {
        let notification = JsonRpcRequest::notification(method);
        match self {
            McpSession::Http {
                connector, endpoint, ..
            } => {
                let _ = connector
                    .client
                    .post(endpoint.as_str())
                    .header("Content-Type", "application/json")
                    .json(&notification)
                    .send()
                    .await;
            }
            McpSession::Stdio(session) => {
                let _ = session.write_line(&notification).await;
            }
        }
    }

    async fn close(self) {
        if let McpSession::Stdio(session) = self {
            session.close().await;
        }
    }
}

/// Newline-delimited JSON-RPC over a child process's stdin/stdout.
struct StdioSession {
    target: String,
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
}

impl StdioSession {
    fn spawn(
        target: &str,
        command: &str,
        args: &[String],
        env: &std::collections::HashMap<String, String>,
    ) -> Result<Self, ConnectorError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            tracing::error!("Failed to spawn MCP server '{}': {}", command, e);
            ConnectorError::unreachable(target, format!("failed to spawn '{}': {}", command, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ConnectorError::unreachable(target, "failed to capture stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ConnectorError::unreachable(target, "failed to capture stdout"))?;

        // Drain stderr so a chatty server cannot block on a full pipe.
        if let Some(stderr) = child.stderr.take() {
            let label = target.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.is_empty() {
                        tracing::debug!("MCP {} stderr: {}", label, line);
                    }
                }
            });
        }

        Ok(Self {
            target: target.to_string(),
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            next_id: 1,
        })
    }

    async fn write_line(&mut self, message: &JsonRpcRequest) -> Result<(), ConnectorError> {
        let mut line =
            serde_json::to_string(message).map_err(|e| ConnectorError::protocol(&self.target, e.to_string()))?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ConnectorError::unreachable(&self.target, format!("write failed: {}", e)))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| ConnectorError::unreachable(&self.target, format!("flush failed: {}", e)))
    }

    async fn request(
        &mut self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ConnectorError> {
        let id = self.next_id;
        self.next_id += 1;
        self.write_line(&JsonRpcRequest::new(id, method, params)).await?;

        loop {
            let line = self
                .stdout
                .next_line()
                .await
                .map_err(|e| ConnectorError::unreachable(&self.target, format!("read failed: {}", e)))?
                .ok_or_else(|| ConnectorError::unreachable(&self.target, "server closed its output"))?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            // Servers may log to stdout or send notifications; skip anything
            // that is not the answer to this request.
            let Ok(response) = serde_json::from_str::<JsonRpcResponse>(line) else {
                tracing::debug!("Skipping non-JSON-RPC line from {}: {}", self.target, line);
                continue;
            };
            if response.id != Some(RequestId::Number(id)) {
                continue;
            }
            return into_result(&self.target, method, response);
        }
    }

    async fn close(mut self) {
        drop(self.stdin);
        if let Err(e) = self.child.kill().await {
            tracing::debug!("MCP server {} already exited: {}", self.target, e);
        }
    }
}

/// Turn an MCP tool result into a completed task.
fn normalize(target: &str, tool: &str, outbound: &Outbound, response: McpCallToolResponse) -> Result<Task, ConnectorError> {
    let text = response.text();
    if response.is_error {
        let reason = if text.is_empty() {
            format!("tool {} reported an error", tool)
        } else {
            text
        };
        return Err(ConnectorError::remote_failed(target, reason));
    }

    let reply = if !text.is_empty() {
        text
    } else if let Some(structured) = &response.structured_content {
        structured.to_string()
    } else {
        format!("Tool {} returned no output", tool)
    };

    let artifacts = response
        .structured_content
        .map(|data| Artifact {
            name: Some(tool.to_string()),
            parts: vec![Part::Data { data }],
        })
        .into_iter()
        .collect();

    Ok(Task::from_remote(
        &outbound.task_id,
        &outbound.session_id,
        TaskState::Completed,
        vec![Message::agent(reply)],
    )
    .with_artifacts(artifacts))
}

#[async_trait]
impl RemoteConnector for McpConnector {
    async fn send(
        &self,
        target: &CapabilityCard,
        outbound: &Outbound,
        control: &CallControl,
    ) -> Result<Task, ConnectorError> {
        let Endpoint::Mcp { transport, tool } = &target.endpoint else {
            return Err(ConnectorError::protocol(&target.id, "not an MCP endpoint"));
        };
        let Payload::ToolArguments(arguments) = &outbound.payload else {
            return Err(ConnectorError::protocol(&target.id, "tools accept arguments, not messages"));
        };

        tracing::info!("Calling tool {} via {} for task {}", tool, transport.describe(), outbound.task_id);
        let response = self
            .call_tool(&target.id, transport, tool, arguments.clone(), control)
            .await?;
        normalize(&target.id, tool, outbound, response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::ConnectorErrorKind;
    use axum::{routing::post, Json, Router};
    use std::collections::HashMap;
    use std::time::Duration;

    async fn spawn_http_server() -> McpTransport {
        let app = Router::new().route(
            "/mcp",
            post(|Json(req): Json<serde_json::Value>| async move {
                let result = match req["method"].as_str().unwrap_or_default() {
                    "initialize" => serde_json::json!({
                        "protocolVersion": "2024-11-05",
                        "serverInfo": { "name": "calc", "version": "1.0" }
                    }),
                    "tools/list" => serde_json::json!({
                        "tools": [{
                            "name": "add",
                            "description": "Add two numbers",
                            "inputSchema": {
                                "type": "object",
                                "properties": { "a": { "type": "number" }, "b": { "type": "number" } }
                            }
                        }]
                    }),
                    "tools/call" => {
                        let a = req["params"]["arguments"]["a"].as_f64().unwrap_or(0.0);
                        let b = req["params"]["arguments"]["b"].as_f64().unwrap_or(0.0);
                        if a < 0.0 {
                            serde_json::json!({
                                "content": [{ "type": "text", "text": "negative input" }],
                                "isError": true
                            })
                        } else {
                            serde_json::json!({
                                "content": [{ "type": "text", "text": format!("{}", a + b) }],
                                "structuredContent": { "sum": a + b }
                            })
                        }
                    }
                    _ => serde_json::Value::Null,
                };
                Json(serde_json::json!({ "jsonrpc": "2.0", "id": req["id"], "result": result }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        McpTransport::Http {
            endpoint: format!("http://{}/mcp", addr),
        }
    }

    fn tool_call(args: serde_json::Value) -> Outbound {
        Outbound {
            task_id: "t9".to_string(),
            session_id: "s9".to_string(),
            payload: Payload::ToolArguments(args),
        }
    }

    #[tokio::test]
    async fn test_http_list_and_call() {
        let transport = spawn_http_server().await;
        let connector = McpConnector::new();
        let control = CallControl::new(Duration::from_secs(5));

        let tools = connector.list_tools(&transport, &control).await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "add");

        let card = CapabilityCard::from_mcp_tool("calc", &tools[0], &transport);
        let task = connector
            .send(&card, &tool_call(serde_json::json!({ "a": 2, "b": 3 })), &control)
            .await
            .unwrap();
        assert_eq!(task.id(), "t9");
        assert_eq!(task.state(), TaskState::Completed);
        assert_eq!(task.history()[0].text_content(), "5");
        assert_eq!(task.artifacts().len(), 1);
    }

    #[tokio::test]
    async fn test_tool_error_is_remote_failure() {
        let transport = spawn_http_server().await;
        let connector = McpConnector::new();
        let card = CapabilityCard::tool("calc/add", transport, "add");

        let err = connector
            .send(
                &card,
                &tool_call(serde_json::json!({ "a": -1, "b": 3 })),
                &CallControl::new(Duration::from_secs(5)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ConnectorErrorKind::RemoteTaskFailed);
        assert_eq!(err.message, "negative input");
    }

    #[tokio::test]
    async fn test_spawn_failure_is_unreachable() {
        let transport = McpTransport::Stdio {
            command: "/nonexistent/taskrelay-mcp-server".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
        };
        let err = McpConnector::new()
            .list_tools(&transport, &CallControl::new(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ConnectorErrorKind::Unreachable);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdio_list_tools_skips_noise() {
        // Reads initialize, answers it, reads the initialized notification,
        // then reads tools/list and answers with one tool.
        let script = r#"
read line
echo "server starting"
echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05"}}'
read line
read line
echo '{"jsonrpc":"2.0","method":"notifications/message","params":{}}'
echo '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","description":"Echo text"}]}}'
"#;
        let transport = McpTransport::Stdio {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: HashMap::new(),
        };
        let tools = McpConnector::new()
            .list_tools(&transport, &CallControl::new(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");
        assert_eq!(tools[0].description, "Echo text");
    }
}
