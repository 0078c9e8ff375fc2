//! Task module - task model, status state machine, and the task store.
//!
//! - All types use algebraic data types with exhaustive matching
//! - Transitions are validated in one place (`TaskState::can_transition_to`)
//! - The store is the only shared mutable structure; writers hold a lease

mod store;
pub mod task;

pub use store::{TaskLease, TaskStore};
pub use task::{Artifact, Message, Part, Role, Task, TaskError, TaskState, TaskStatus};
