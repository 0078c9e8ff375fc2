//! Task manager: runs one inbound request end to end.
//!
//! `handle` validates the request, upserts the task, then under the task's
//! writer lease appends the user message, routes, calls the chosen remote and
//! folds the answer back. Every failure after validation ends in a terminal
//! task carrying a diagnostic message; no path leaves a task `working`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::connector::{CallControl, ConnectorError, ConnectorErrorKind, Outbound, Payload, RemoteConnector};
use crate::protocol::a2a::TaskSendParams;
use crate::registry::{CapabilityCard, Registry};
use crate::router::{Router, RoutingDecision};
use crate::task::{Message, Role, Task, TaskError, TaskLease, TaskState, TaskStore};
use crate::util::{backoff_delay, preview};

/// Inbound request rejected before any work was recorded.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RequestError {
    #[error("Task id must not be empty")]
    MissingId,

    #[error("Message must come from the user")]
    WrongRole,

    #[error("Message must contain non-empty text")]
    EmptyMessage,

    #[error(transparent)]
    Store(#[from] TaskError),

    #[error("Request was interrupted: {0}")]
    Interrupted(String),
}

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Deadline for one connector call (including polling)
    pub call_deadline: Duration,
    /// Extra attempts against the same target after `Unreachable`
    pub connector_retries: u32,
    /// First retry delay; doubles per attempt
    pub retry_base_delay: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            call_deadline: Duration::from_secs(60),
            connector_retries: 0,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

/// How a request ended, before it is written to the task.
enum Finish {
    Reply(String),
    Remote(Task),
    Failed(String),
    Canceled(String),
}

struct Validated {
    id: String,
    session_id: String,
    message: Message,
}

fn validate(params: TaskSendParams) -> Result<Validated, RequestError> {
    let id = params.id.trim().to_string();
    if id.is_empty() {
        return Err(RequestError::MissingId);
    }
    if params.message.role != Role::User {
        return Err(RequestError::WrongRole);
    }
    if !params.message.has_text() {
        return Err(RequestError::EmptyMessage);
    }
    let session_id = params
        .session_id
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
    Ok(Validated {
        id,
        session_id,
        message: params.message,
    })
}

/// Cancellation shared by every request running or queued on one task.
struct Inflight {
    token: CancellationToken,
    requests: usize,
}

/// Orchestrates task lifecycles.
pub struct TaskManager {
    store: TaskStore,
    registry: Arc<Registry>,
    router: Router,
    connector: Arc<dyn RemoteConnector>,
    config: ManagerConfig,
    inflight: RwLock<HashMap<String, Inflight>>,
}

impl TaskManager {
    pub fn new(
        registry: Arc<Registry>,
        router: Router,
        connector: Arc<dyn RemoteConnector>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            store: TaskStore::new(),
            registry,
            router,
            connector,
            config,
            inflight: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Run one `tasks/send` request.
    ///
    /// The work runs on its own spawned task, so the request lifecycle always
    /// reaches a terminal state even if the caller stops waiting.
    ///
    /// # Errors
    /// Only request-validation faults; every other failure is reported inside
    /// the returned task.
    pub async fn handle(self: &Arc<Self>, params: TaskSendParams) -> Result<Task, RequestError> {
        let request = validate(params)?;
        let manager = Arc::clone(self);
        match tokio::spawn(async move { manager.run(request).await }).await {
            Ok(result) => result,
            Err(e) => Err(RequestError::Interrupted(e.to_string())),
        }
    }

    async fn run(&self, request: Validated) -> Result<Task, RequestError> {
        // Registered before waiting on the lease so a cancel issued while this
        // request is queued still reaches it.
        let id = request.id.clone();
        let token = self.register(&id).await;
        let result = self.run_leased(request, &token).await;
        self.unregister(&id).await;
        result
    }

    async fn run_leased(&self, request: Validated, token: &CancellationToken) -> Result<Task, RequestError> {
        let utterance = request.message.text_content();

        self.store.upsert(&request.id, &request.session_id).await;
        let lease = self.store.lock(&request.id).await?;

        let current = lease.snapshot().await;
        if current.state().is_terminal() {
            tracing::info!(
                "Task {} is already {}; returning it unchanged",
                request.id,
                current.state()
            );
            return Ok(current);
        }
        let session_id = current.session_id().to_string();
        let prior = current.history().to_vec();

        tracing::info!("Task {} received: {}", request.id, preview(&utterance, 120));
        let finish = match self.begin(&lease, request.message).await {
            Ok(()) => {
                self.execute(&request.id, &session_id, &utterance, &prior, token)
                    .await
            }
            Err(e) => {
                tracing::error!("Task {} could not start: {}", request.id, e);
                Finish::Failed(format!("Task could not start: {}", e))
            }
        };

        self.finish(&lease, finish).await;

        let task = lease.snapshot().await;
        tracing::info!("Task {} finished as {}", task.id(), task.state());
        Ok(task)
    }

    /// Join the in-flight entry for `id`; requests queued on the same task share one token.
    async fn register(&self, id: &str) -> CancellationToken {
        let mut inflight = self.inflight.write().await;
        let entry = inflight
            .entry(id.to_string())
            .or_insert_with(|| Inflight {
                token: CancellationToken::new(),
                requests: 0,
            });
        entry.requests += 1;
        entry.token.clone()
    }

    async fn unregister(&self, id: &str) {
        let mut inflight = self.inflight.write().await;
        if let Some(entry) = inflight.get_mut(id) {
            entry.requests = entry.requests.saturating_sub(1);
            if entry.requests == 0 {
                inflight.remove(id);
            }
        }
    }

    /// Snapshot of a task, optionally keeping only the last `history_length` messages.
    pub async fn get_task(&self, id: &str, history_length: Option<usize>) -> Result<Task, TaskError> {
        let task = self.store.get_task(id).await?;
        Ok(match history_length {
            Some(len) => task.with_history_limit(len),
            None => task,
        })
    }

    /// Cancel a task.
    ///
    /// Stops any in-flight remote call first so the running `handle` releases
    /// the task, then marks it canceled if it is still active.
    pub async fn cancel(&self, id: &str) -> Result<Task, TaskError> {
        if let Some(entry) = self.inflight.read().await.get(id) {
            tracing::info!("Canceling in-flight work for task {} ({} requests)", id, entry.requests);
            entry.token.cancel();
        }

        let lease = self.store.lock(id).await?;
        if !lease.state().await.is_terminal() {
            self.store.update_status(&lease, TaskState::Canceled).await?;
        }
        Ok(lease.snapshot().await)
    }

    async fn begin(&self, lease: &TaskLease, message: Message) -> Result<(), TaskError> {
        self.store.append_history(lease, message).await?;
        self.store.update_status(lease, TaskState::Working).await
    }

    /// Route and call the chosen target. Never touches the store.
    async fn execute(
        &self,
        task_id: &str,
        session_id: &str,
        utterance: &str,
        prior: &[Message],
        token: &CancellationToken,
    ) -> Finish {
        let snapshot = self.registry.snapshot().await;

        let routed = tokio::select! {
            biased;
            _ = token.cancelled() => return Finish::Canceled("Canceled while choosing a capability.".to_string()),
            routed = self.router.route(utterance, session_id, prior, snapshot.cards()) => routed,
        };
        let outcome = match routed {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("Task {} routing failed: {}", task_id, e);
                return Finish::Failed(format!("Routing failed: {}", e));
            }
        };
        tracing::debug!("Task {} routing steps: {:?}", task_id, outcome.steps);

        let (target_id, payload) = match outcome.decision {
            RoutingDecision::DirectReply { text } => return Finish::Reply(text),
            RoutingDecision::DelegateToAgent { card_id, message } => (card_id, Payload::Message(message)),
            RoutingDecision::InvokeTool { tool_id, arguments } => (tool_id, Payload::ToolArguments(arguments)),
        };
        let Some(target) = snapshot.get(&target_id) else {
            return Finish::Failed(format!("Routing failed: capability '{}' is not registered", target_id));
        };

        let outbound = Outbound {
            task_id: task_id.to_string(),
            session_id: session_id.to_string(),
            payload,
        };
        match self.call_with_retry(target, &outbound, token).await {
            Ok(remote) => Finish::Remote(remote),
            Err(e) if e.kind == ConnectorErrorKind::Canceled => {
                Finish::Canceled(format!("Canceled while waiting for {}.", target.id))
            }
            Err(e) => {
                tracing::warn!("Task {} connector call failed: {}", task_id, e);
                Finish::Failed(diagnostic(target, &e))
            }
        }
    }

    /// Call `target`, retrying the same target after `Unreachable` only.
    async fn call_with_retry(
        &self,
        target: &CapabilityCard,
        outbound: &Outbound,
        token: &CancellationToken,
    ) -> Result<Task, ConnectorError> {
        let mut attempt = 0;
        loop {
            let control = CallControl::with_cancel(self.config.call_deadline, token.clone());
            let error = match self.connector.send(target, outbound, &control).await {
                Ok(task) => return Ok(task),
                Err(e) => e,
            };

            if error.kind != ConnectorErrorKind::Unreachable || attempt >= self.config.connector_retries {
                return Err(error);
            }

            let delay = backoff_delay(self.config.retry_base_delay, attempt, Duration::from_secs(10));
            attempt += 1;
            tracing::warn!(
                "{} unreachable, retry {}/{} in {:?}: {}",
                target.id,
                attempt,
                self.config.connector_retries,
                delay,
                error.message
            );
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(ConnectorError::canceled(&target.id)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Write the outcome into the task; on any store error, force `failed`.
    async fn finish(&self, lease: &TaskLease, finish: Finish) {
        let result = match finish {
            Finish::Reply(text) => self.conclude(lease, Message::agent(text), TaskState::Completed).await,
            Finish::Failed(diagnostic) => self.conclude(lease, Message::agent(diagnostic), TaskState::Failed).await,
            Finish::Canceled(diagnostic) => {
                self.conclude(lease, Message::agent(diagnostic), TaskState::Canceled).await
            }
            Finish::Remote(remote) => self.fold(lease, remote).await,
        };

        if let Err(e) = result {
            tracing::error!("Task {} could not record its result: {}", lease.id(), e);
            if !lease.state().await.is_terminal() {
                let _ = self
                    .store
                    .append_history(lease, Message::agent(format!("Internal error: {}", e)))
                    .await;
                if let Err(e) = self.store.update_status(lease, TaskState::Failed).await {
                    tracing::error!("Task {} could not be marked failed: {}", lease.id(), e);
                }
            }
        }
    }

    async fn conclude(&self, lease: &TaskLease, message: Message, state: TaskState) -> Result<(), TaskError> {
        self.store.append_history(lease, message).await?;
        self.store.update_status(lease, state).await
    }

    /// Append the remote's messages and artifacts, then adopt its state.
    async fn fold(&self, lease: &TaskLease, remote: Task) -> Result<(), TaskError> {
        for message in remote.history() {
            self.store.append_history(lease, message.clone()).await?;
        }
        for artifact in remote.artifacts() {
            self.store.append_artifact(lease, artifact.clone()).await?;
        }
        self.store.update_status(lease, remote.state()).await
    }
}

/// Human-readable failure naming the target.
fn diagnostic(target: &CapabilityCard, error: &ConnectorError) -> String {
    let what = match error.kind {
        ConnectorErrorKind::Unreachable => "is unreachable",
        ConnectorErrorKind::Timeout => "did not answer in time",
        ConnectorErrorKind::ProtocolError => "sent an invalid response",
        ConnectorErrorKind::RemoteTaskFailed => "reported a failure",
        ConnectorErrorKind::Canceled => "call was canceled",
    };
    format!(
        "{} ({}) {}: {}",
        target.id,
        target.address(),
        what,
        error.message
    )
}
