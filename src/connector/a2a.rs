//! A2A connector: `tasks/send` then `tasks/get` polling over HTTP JSON-RPC.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::{CallControl, ConnectorError, ConnectorErrorKind, Outbound, Payload, RemoteConnector};
use crate::protocol::a2a::{TaskIdParams, TaskQueryParams, TaskSendParams, METHOD_CANCEL, METHOD_GET, METHOD_SEND};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::registry::{CapabilityCard, Endpoint};
use crate::task::{Message, Role, Task, TaskState};

/// Client for remote A2A agents.
pub struct A2aConnector {
    client: reqwest::Client,
    poll_interval: Duration,
    request_id: AtomicU64,
}

impl A2aConnector {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            poll_interval,
            request_id: AtomicU64::new(1),
        }
    }

    fn next_request_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Send one JSON-RPC request and return its `result`.
    async fn call(
        &self,
        target: &str,
        url: &str,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ConnectorError> {
        let request = JsonRpcRequest::new(self.next_request_id(), method, Some(params));

        let response = self
            .client
            .post(url)
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

        if let Some(error) = rpc.error {
            return Err(ConnectorError::protocol(target, error.to_string()));
        }

        rpc.result
            .ok_or_else(|| ConnectorError::protocol(target, format!("{} returned no result", method)))
    }

    async fn call_for_task(
        &self,
        target: &str,
        url: &str,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Task, ConnectorError> {
        let result = self.call(target, url, method, params).await?;
        serde_json::from_value(result)
            .map_err(|e| ConnectorError::protocol(target, format!("malformed task in {} result: {}", method, e)))
    }

    /// Submit a message and poll until the remote stops working on it.
    async fn exchange(
        &self,
        target: &str,
        url: &str,
        remote_id: &str,
        session_id: &str,
        message: &Message,
    ) -> Result<Task, ConnectorError> {
        let params = TaskSendParams {
            id: remote_id.to_string(),
            session_id: Some(session_id.to_string()),
            message: message.clone(),
            history_length: None,
            metadata: None,
        };
        let params = serde_json::to_value(&params).map_err(|e| ConnectorError::protocol(target, e.to_string()))?;

        let mut task = self.call_for_task(target, url, METHOD_SEND, params).await?;
        tracing::debug!("{} accepted remote task {} ({})", target, remote_id, task.state());

        while matches!(task.state(), TaskState::Submitted | TaskState::Working) {
            tokio::time::sleep(self.poll_interval).await;
            let query = serde_json::to_value(TaskQueryParams {
                id: remote_id.to_string(),
                history_length: None,
            })
            .map_err(|e| ConnectorError::protocol(target, e.to_string()))?;
            task = self.call_for_task(target, url, METHOD_GET, query).await?;
            tracing::debug!("{} polled remote task {} ({})", target, remote_id, task.state());
        }

        Ok(task)
    }

    /// Ask the remote to cancel; failures are only logged.
    fn abort_remote(&self, target: &str, url: &str, remote_id: &str) {
        let client = self.client.clone();
        let request = JsonRpcRequest::new(
            self.next_request_id(),
            METHOD_CANCEL,
            serde_json::to_value(TaskIdParams { id: remote_id.to_string() }).ok(),
        );
        let url = url.to_string();
        let target = target.to_string();
        tokio::spawn(async move {
            if let Err(e) = client.post(&url).json(&request).send().await {
                tracing::debug!("Remote cancel to {} failed: {}", target, e);
            }
        });
    }
}

/// Normalize a remote task into the local task's shape.
///
/// Keeps the remote's agent messages (or its status message when the remote
/// returns no history) and maps its state; a remote failure becomes an error.
fn normalize(target: &str, outbound: &Outbound, remote: Task) -> Result<Task, ConnectorError> {
    let mut produced: Vec<Message> = remote
        .history()
        .iter()
        .filter(|m| m.role == Role::Agent)
        .cloned()
        .collect();
    if produced.is_empty() {
        if let Some(message) = remote.status().message.clone() {
            produced.push(message);
        }
    }

    match remote.state() {
        TaskState::Failed => {
            let reason = produced
                .iter()
                .map(Message::text_content)
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join("\n");
            let reason = if reason.is_empty() {
                "remote reported failure without detail".to_string()
            } else {
                reason
            };
            Err(ConnectorError::remote_failed(target, reason))
        }
        state @ (TaskState::Completed | TaskState::InputRequired | TaskState::Canceled) => Ok(
            Task::from_remote(&outbound.task_id, &outbound.session_id, state, produced)
                .with_artifacts(remote.artifacts().to_vec()),
        ),
        other => Err(ConnectorError::protocol(
            target,
            format!("remote stopped in non-final state {}", other),
        )),
    }
}

#[async_trait]
impl RemoteConnector for A2aConnector {
    async fn send(
        &self,
        target: &CapabilityCard,
        outbound: &Outbound,
        control: &CallControl,
    ) -> Result<Task, ConnectorError> {
        let Endpoint::A2a { url } = &target.endpoint else {
            return Err(ConnectorError::protocol(&target.id, "not an A2A endpoint"));
        };
        let Payload::Message(message) = &outbound.payload else {
            return Err(ConnectorError::protocol(&target.id, "agents accept messages, not tool arguments"));
        };

        let remote_id = Uuid::new_v4().simple().to_string();
        tracing::info!("Sending task {} to {} at {} (remote id {})", outbound.task_id, target.id, url, remote_id);

        let result = control
            .bound(
                &target.id,
                self.exchange(&target.id, url, &remote_id, &outbound.session_id, message),
            )
            .await;

        match result {
            Ok(remote) => normalize(&target.id, outbound, remote),
            Err(e) => {
                if matches!(e.kind, ConnectorErrorKind::Canceled | ConnectorErrorKind::Timeout) {
                    self.abort_remote(&target.id, url, &remote_id);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, routing::post, Json, Router};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    /// Fake agent: answers `working` to send and for the first `polls` gets.
    async fn spawn_agent(final_state: &'static str, reply: &'static str, polls: usize) -> (String, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/",
                post(
                    move |State(calls): State<Arc<AtomicUsize>>, Json(req): Json<serde_json::Value>| async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst);
                        let id = req["params"]["id"].clone();
                        let body = if n < polls {
                            serde_json::json!({ "id": id, "sessionId": "s", "status": { "state": "working" } })
                        } else {
                            serde_json::json!({
                                "id": id,
                                "sessionId": "s",
                                "status": { "state": final_state },
                                "history": [
                                    { "role": "user", "parts": [{ "type": "text", "text": "q" }] },
                                    { "role": "agent", "parts": [{ "type": "text", "text": reply }] }
                                ]
                            })
                        };
                        Json(serde_json::json!({ "jsonrpc": "2.0", "id": req["id"], "result": body }))
                    },
                ),
            )
            .with_state(Arc::clone(&calls));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/", addr), calls)
    }

    fn outbound(text: &str) -> Outbound {
        Outbound {
            task_id: "t1".to_string(),
            session_id: "s1".to_string(),
            payload: Payload::Message(Message::user(text)),
        }
    }

    #[tokio::test]
    async fn test_send_polls_until_final() {
        let (url, calls) = spawn_agent("completed", "It is 10:00", 2).await;
        let connector = A2aConnector::new(Duration::from_millis(10));
        let card = CapabilityCard::agent("time-agent", url);

        let task = connector
            .send(&card, &outbound("What time is it?"), &CallControl::new(Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(task.id(), "t1");
        assert_eq!(task.session_id(), "s1");
        assert_eq!(task.state(), TaskState::Completed);
        assert_eq!(task.history().len(), 1);
        assert_eq!(task.history()[0].text_content(), "It is 10:00");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_remote_failure_is_typed() {
        let (url, _) = spawn_agent("failed", "disk full", 0).await;
        let connector = A2aConnector::new(Duration::from_millis(10));
        let card = CapabilityCard::agent("broken-agent", url);

        let err = connector
            .send(&card, &outbound("hi"), &CallControl::new(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ConnectorErrorKind::RemoteTaskFailed);
        assert!(err.message.contains("disk full"));
    }

    #[tokio::test]
    async fn test_input_required_is_kept() {
        let (url, _) = spawn_agent("input-required", "Which city?", 0).await;
        let connector = A2aConnector::new(Duration::from_millis(10));
        let card = CapabilityCard::agent("weather-agent", url);

        let task = connector
            .send(&card, &outbound("weather"), &CallControl::new(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(task.state(), TaskState::InputRequired);
    }

    #[tokio::test]
    async fn test_deadline_while_polling() {
        let (url, _) = spawn_agent("completed", "late", usize::MAX).await;
        let connector = A2aConnector::new(Duration::from_millis(10));
        let card = CapabilityCard::agent("slow-agent", url);

        let err = connector
            .send(&card, &outbound("hi"), &CallControl::new(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ConnectorErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_cancel_stops_polling() {
        let (url, _) = spawn_agent("completed", "never", usize::MAX).await;
        let connector = A2aConnector::new(Duration::from_millis(10));
        let card = CapabilityCard::agent("slow-agent", url);
        let control = CallControl::new(Duration::from_secs(10));
        let cancel = control.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let err = connector.send(&card, &outbound("hi"), &control).await.unwrap_err();
        assert_eq!(err.kind, ConnectorErrorKind::Canceled);
    }

    #[tokio::test]
    async fn test_unreachable_agent() {
        let connector = A2aConnector::new(Duration::from_millis(10));
        let card = CapabilityCard::agent("time-agent", "http://127.0.0.1:1/");

        let err = connector
            .send(&card, &outbound("hi"), &CallControl::new(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ConnectorErrorKind::Unreachable);
        assert_eq!(err.target, "time-agent");
    }

    #[tokio::test]
    async fn test_jsonrpc_error_is_protocol_error() {
        let app = Router::new().route(
            "/",
            post(|Json(req): Json<serde_json::Value>| async move {
                Json(serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": req["id"],
                    "error": { "code": -32601, "message": "Method not found" }
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let connector = A2aConnector::new(Duration::from_millis(10));
        let card = CapabilityCard::agent("odd-agent", format!("http://{}/", addr));
        let err = connector
            .send(&card, &outbound("hi"), &CallControl::new(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ConnectorErrorKind::ProtocolError);
        assert!(err.message.contains("-32601"));
    }
}
