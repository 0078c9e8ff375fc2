//! In-memory task store with per-task writer locks.
//!
//! The map itself is guarded by a `RwLock` held only long enough to look up or
//! insert a slot. Each slot carries its own writer mutex; a `TaskLease` owns
//! that mutex guard, and every mutating operation requires a lease. Writers on
//! different task ids never wait on each other, writers on the same id are
//! strictly serialized, and readers only take the slot's short data lock.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use super::task::{Artifact, Message, Task, TaskError, TaskState};

struct TaskSlot {
    writer: Arc<Mutex<()>>,
    task: RwLock<Task>,
}

/// Exclusive write access to one task.
///
/// Dropping the lease releases the task for the next writer.
pub struct TaskLease {
    id: String,
    slot: Arc<TaskSlot>,
    _guard: OwnedMutexGuard<()>,
}

impl TaskLease {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current state of the leased task.
    pub async fn snapshot(&self) -> Task {
        self.slot.task.read().await.clone()
    }

    pub async fn state(&self) -> TaskState {
        self.slot.task.read().await.state()
    }
}

/// Concurrency-safe map from task id to task.
///
/// Tasks are retained for the lifetime of the store; there is no eviction.
#[derive(Default)]
pub struct TaskStore {
    tasks: RwLock<HashMap<String, Arc<TaskSlot>>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the task if absent, otherwise return the existing one.
    ///
    /// The incoming message is deliberately not appended here; the caller
    /// appends once it holds the lease.
    pub async fn upsert(&self, id: &str, session_id: &str) -> Task {
        if let Some(slot) = self.tasks.read().await.get(id).cloned() {
            return slot.task.read().await.clone();
        }

        let slot = {
            let mut tasks = self.tasks.write().await;
            Arc::clone(tasks.entry(id.to_string()).or_insert_with(|| {
                tracing::debug!("Created task {} (session {})", id, session_id);
                Arc::new(TaskSlot {
                    writer: Arc::new(Mutex::new(())),
                    task: RwLock::new(Task::new(id, session_id)),
                })
            }))
        };
        let task = slot.task.read().await;
        task.clone()
    }

    /// Snapshot of a task.
    pub async fn get_task(&self, id: &str) -> Result<Task, TaskError> {
        let slot = self.slot(id).await?;
        let task = slot.task.read().await.clone();
        Ok(task)
    }

    /// Acquire the exclusive writer lease for a task, waiting for any
    /// current writer to finish.
    pub async fn lock(&self, id: &str) -> Result<TaskLease, TaskError> {
        let slot = self.slot(id).await?;
        let guard = Arc::clone(&slot.writer).lock_owned().await;
        Ok(TaskLease {
            id: id.to_string(),
            slot,
            _guard: guard,
        })
    }

    /// Move the leased task to `state`.
    ///
    /// # Errors
    /// `TaskError::InvalidTransition` if the state machine forbids it; the
    /// stored status is left untouched.
    pub async fn update_status(&self, lease: &TaskLease, state: TaskState) -> Result<(), TaskError> {
        let mut task = lease.slot.task.write().await;
        let from = task.state();
        task.transition(state)?;
        tracing::debug!("Task {} {} -> {}", lease.id, from, state);
        Ok(())
    }

    /// Append a message to the leased task's history.
    pub async fn append_history(&self, lease: &TaskLease, message: Message) -> Result<(), TaskError> {
        lease.slot.task.write().await.push_message(message)
    }

    /// Attach a structured result to the leased task.
    pub async fn append_artifact(&self, lease: &TaskLease, artifact: Artifact) -> Result<(), TaskError> {
        lease.slot.task.write().await.push_artifact(artifact)
    }

    /// Number of tasks ever created.
    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    /// Count tasks per state.
    pub async fn state_counts(&self) -> HashMap<TaskState, usize> {
        let slots: Vec<Arc<TaskSlot>> = self.tasks.read().await.values().cloned().collect();
        let mut counts = HashMap::new();
        for slot in slots {
            *counts.entry(slot.task.read().await.state()).or_insert(0) += 1;
        }
        counts
    }

    async fn slot(&self, id: &str) -> Result<Arc<TaskSlot>, TaskError> {
        self.tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| TaskError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = TaskStore::new();
        let first = store.upsert("t1", "s1").await;
        let second = store.upsert("t1", "other-session").await;

        assert_eq!(first.id(), second.id());
        assert_eq!(second.session_id(), "s1");
        assert_eq!(second.state(), TaskState::Submitted);
        assert!(second.history().is_empty());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_get_unknown_task() {
        let store = TaskStore::new();
        assert_eq!(
            store.get_task("missing").await.unwrap_err(),
            TaskError::NotFound("missing".to_string())
        );
        assert!(store.lock("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_history_is_concatenation_in_call_order() {
        let store = TaskStore::new();
        store.upsert("t1", "s1").await;
        let lease = store.lock("t1").await.unwrap();
        store.update_status(&lease, TaskState::Working).await.unwrap();

        let texts: Vec<String> = (0..20).map(|i| format!("msg-{}", i)).collect();
        for text in &texts {
            store.append_history(&lease, Message::user(text.clone())).await.unwrap();
        }
        drop(lease);

        let task = store.get_task("t1").await.unwrap();
        let stored: Vec<String> = task.history().iter().map(|m| m.text_content()).collect();
        assert_eq!(stored, texts);
    }

    #[tokio::test]
    async fn test_terminal_task_rejects_changes() {
        let store = TaskStore::new();
        store.upsert("t1", "s1").await;
        let lease = store.lock("t1").await.unwrap();
        store.update_status(&lease, TaskState::Working).await.unwrap();
        store.update_status(&lease, TaskState::Completed).await.unwrap();

        for next in [TaskState::Working, TaskState::Failed, TaskState::Canceled, TaskState::Completed] {
            let err = store.update_status(&lease, next).await.unwrap_err();
            assert!(matches!(err, TaskError::InvalidTransition { from: TaskState::Completed, .. }));
        }
        assert!(store.append_history(&lease, Message::agent("late")).await.is_err());
        assert_eq!(lease.state().await, TaskState::Completed);
    }

    #[tokio::test]
    async fn test_writers_on_same_id_are_serialized() {
        let store = Arc::new(TaskStore::new());
        store.upsert("shared", "s").await;
        {
            let lease = store.lock("shared").await.unwrap();
            store.update_status(&lease, TaskState::Working).await.unwrap();
        }

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let lease = store.lock("shared").await.unwrap();
                store
                    .append_history(&lease, Message::user(format!("q{}", i)))
                    .await
                    .unwrap();
                tokio::time::sleep(Duration::from_millis(2)).await;
                store
                    .append_history(&lease, Message::agent(format!("a{}", i)))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let task = store.get_task("shared").await.unwrap();
        assert_eq!(task.history().len(), 32);
        for pair in task.history().chunks(2) {
            let q = pair[0].text_content();
            let a = pair[1].text_content();
            assert_eq!(&q[1..], &a[1..], "interleaved entries: {} / {}", q, a);
        }
    }

    #[tokio::test]
    async fn test_readers_do_not_wait_for_writers() {
        let store = TaskStore::new();
        store.upsert("t1", "s1").await;
        let _lease = store.lock("t1").await.unwrap();
        let read = tokio::time::timeout(Duration::from_millis(200), store.get_task("t1")).await;
        assert!(read.is_ok());
    }
}
