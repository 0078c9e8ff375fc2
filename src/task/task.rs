//! Core Task type, its status state machine, and message history.
//!
//! # Invariants
//! - `history` is append-only: messages are pushed, never removed or rewritten
//! - `status.state` only moves forward along the state machine below
//! - nothing leaves a terminal state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a task.
///
/// # State Machine
/// ```text
/// Submitted -> Working -> Completed
///                     \-> Failed
///                     \-> InputRequired -> Working
/// (any non-terminal) -> Canceled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    /// Task was accepted but no work started yet
    Submitted,
    /// Task is being routed or executed
    Working,
    /// The handling agent needs a follow-up message
    InputRequired,
    /// Task completed successfully
    Completed,
    /// Task was canceled before completion
    Canceled,
    /// Task failed; the last history entry explains why
    Failed,
}

impl TaskState {
    /// Check if the task is in a terminal state.
    ///
    /// # Property
    /// `is_terminal() => !can_transition_to(x)` for every `x`
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Canceled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (Submitted, Working) => true,
            (Working, Completed | Failed | InputRequired) => true,
            (InputRequired, Working) => true,
            (from, Canceled) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Submitted => "submitted",
            TaskState::Working => "working",
            TaskState::InputRequired => "input-required",
            TaskState::Completed => "completed",
            TaskState::Canceled => "canceled",
            TaskState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

/// Typed content part of a message.
///
/// Tagged on `type` so new part kinds can be added without breaking readers
/// that only look at text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Part {
    /// Plain text content
    Text { text: String },
    /// Structured JSON content
    Data { data: serde_json::Value },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text { text } => Some(text),
            Part::Data { .. } => None,
        }
    }
}

/// A single conversational turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Message {
    /// Create a single-part text message.
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![Part::text(text)],
            metadata: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn agent(text: impl Into<String>) -> Self {
        Self::new(Role::Agent, text)
    }

    /// All text parts joined by newlines.
    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter_map(Part::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Whether the message carries at least one non-blank text part.
    pub fn has_text(&self) -> bool {
        self.parts
            .iter()
            .filter_map(Part::as_text)
            .any(|t| !t.trim().is_empty())
    }
}

/// Current status of a task plus when it was last changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl TaskStatus {
    pub fn new(state: TaskState) -> Self {
        Self {
            state,
            message: None,
            timestamp: Utc::now(),
        }
    }
}

/// Structured output attached to a task (for example raw tool results).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub parts: Vec<Part>,
}

/// One unit of user-requested work.
///
/// Fields are private; mutation goes through `transition` and `push_message`
/// so the state machine and append-only history cannot be bypassed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    id: String,
    #[serde(rename = "sessionId", default)]
    session_id: String,
    status: TaskStatus,
    #[serde(default)]
    history: Vec<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<serde_json::Value>,
}

impl Task {
    /// Create a fresh task.
    ///
    /// # Postconditions
    /// - `status.state == Submitted`
    /// - `history` is empty
    pub fn new(id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            status: TaskStatus::new(TaskState::Submitted),
            history: Vec::new(),
            artifacts: Vec::new(),
            metadata: None,
        }
    }

    /// Build a task that already carries a result, as returned by a remote.
    ///
    /// Used by connectors when normalizing responses; bypasses the transition
    /// rules because it describes remote state rather than mutating ours.
    pub fn from_remote(
        id: impl Into<String>,
        session_id: impl Into<String>,
        state: TaskState,
        history: Vec<Message>,
    ) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            status: TaskStatus::new(state),
            history,
            artifacts: Vec::new(),
            metadata: None,
        }
    }

    pub fn with_artifacts(mut self, artifacts: Vec<Artifact>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn status(&self) -> &TaskStatus {
        &self.status
    }

    pub fn state(&self) -> TaskState {
        self.status.state
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    pub fn metadata(&self) -> Option<&serde_json::Value> {
        self.metadata.as_ref()
    }

    /// The most recent message, if any.
    pub fn latest_message(&self) -> Option<&Message> {
        self.history.last()
    }

    /// Move to `next`, validating the state machine.
    ///
    /// # Errors
    /// `TaskError::InvalidTransition` if the move is not allowed.
    pub fn transition(&mut self, next: TaskState) -> Result<(), TaskError> {
        if !self.status.state.can_transition_to(next) {
            return Err(TaskError::InvalidTransition {
                id: self.id.clone(),
                from: self.status.state,
                to: next,
            });
        }
        self.status = TaskStatus::new(next);
        Ok(())
    }

    /// Append a message to the history.
    ///
    /// # Errors
    /// `TaskError::HistoryClosed` once the task is terminal.
    pub fn push_message(&mut self, message: Message) -> Result<(), TaskError> {
        if self.status.state.is_terminal() {
            return Err(TaskError::HistoryClosed {
                id: self.id.clone(),
                state: self.status.state,
            });
        }
        self.history.push(message);
        Ok(())
    }

    /// Attach a structured result.
    pub fn push_artifact(&mut self, artifact: Artifact) -> Result<(), TaskError> {
        if self.status.state.is_terminal() {
            return Err(TaskError::HistoryClosed {
                id: self.id.clone(),
                state: self.status.state,
            });
        }
        self.artifacts.push(artifact);
        Ok(())
    }

    /// Copy of this task whose history keeps only the last `len` entries.
    pub fn with_history_limit(&self, len: usize) -> Task {
        let mut task = self.clone();
        let skip = task.history.len().saturating_sub(len);
        task.history.drain(..skip);
        task
    }
}

/// Errors raised by task and task-store operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskError {
    #[error("Task {0} not found")]
    NotFound(String),

    #[error("Invalid state transition for task {id} from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: TaskState,
        to: TaskState,
    },

    #[error("Task {id} is {state}; its history is closed")]
    HistoryClosed { id: String, state: TaskState },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_have_no_exits() {
        let all = [
            TaskState::Submitted,
            TaskState::Working,
            TaskState::InputRequired,
            TaskState::Completed,
            TaskState::Canceled,
            TaskState::Failed,
        ];
        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in all {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_follow_up_cycle() {
        let mut task = Task::new("t1", "s1");
        task.transition(TaskState::Working).unwrap();
        task.transition(TaskState::InputRequired).unwrap();
        task.transition(TaskState::Working).unwrap();
        task.transition(TaskState::Completed).unwrap();
        assert_eq!(task.state(), TaskState::Completed);
    }

    #[test]
    fn test_submitted_cannot_complete_directly() {
        let mut task = Task::new("t1", "s1");
        let err = task.transition(TaskState::Completed).unwrap_err();
        assert_eq!(
            err,
            TaskError::InvalidTransition {
                id: "t1".to_string(),
                from: TaskState::Submitted,
                to: TaskState::Completed,
            }
        );
    }

    #[test]
    fn test_cancel_from_any_active_state() {
        for path in [
            vec![],
            vec![TaskState::Working],
            vec![TaskState::Working, TaskState::InputRequired],
        ] {
            let mut task = Task::new("t", "s");
            for step in path {
                task.transition(step).unwrap();
            }
            task.transition(TaskState::Canceled).unwrap();
        }
    }

    #[test]
    fn test_history_closed_after_terminal() {
        let mut task = Task::new("t1", "s1");
        task.transition(TaskState::Working).unwrap();
        task.push_message(Message::user("hi")).unwrap();
        task.transition(TaskState::Failed).unwrap();
        assert!(matches!(
            task.push_message(Message::agent("late")),
            Err(TaskError::HistoryClosed { .. })
        ));
        assert_eq!(task.history().len(), 1);
    }

    #[test]
    fn test_wire_shape() {
        let mut task = Task::new("t1", "s1");
        task.transition(TaskState::Working).unwrap();
        task.push_message(Message::user("What time is it?")).unwrap();
        task.transition(TaskState::InputRequired).unwrap();

        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["sessionId"], "s1");
        assert_eq!(value["status"]["state"], "input-required");
        assert_eq!(value["history"][0]["role"], "user");
        assert_eq!(value["history"][0]["parts"][0]["type"], "text");
        assert_eq!(value["history"][0]["parts"][0]["text"], "What time is it?");
        assert!(value.get("artifacts").is_none());
    }

    #[test]
    fn test_parse_remote_task_without_timestamp() {
        let raw = serde_json::json!({
            "id": "abc",
            "sessionId": "s",
            "status": { "state": "completed" },
            "history": [
                { "role": "user", "parts": [{ "type": "text", "text": "hi" }] },
                { "role": "agent", "parts": [{ "type": "data", "data": { "n": 1 } }] }
            ]
        });
        let task: Task = serde_json::from_value(raw).unwrap();
        assert_eq!(task.state(), TaskState::Completed);
        assert_eq!(task.history().len(), 2);
        assert_eq!(task.history()[1].text_content(), "");
    }

    #[test]
    fn test_history_limit_keeps_tail() {
        let mut task = Task::new("t", "s");
        task.transition(TaskState::Working).unwrap();
        for i in 0..5 {
            task.push_message(Message::user(format!("m{}", i))).unwrap();
        }
        let trimmed = task.with_history_limit(2);
        let texts: Vec<_> = trimmed.history().iter().map(|m| m.text_content()).collect();
        assert_eq!(texts, vec!["m3", "m4"]);
        assert_eq!(task.history().len(), 5);
    }
}
