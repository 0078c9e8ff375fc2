//! # taskrelay
//!
//! Task orchestrator that routes natural-language requests to remote agents
//! and tools.
//!
//! This library provides:
//! - A JSON-RPC task endpoint (`tasks/send`, `tasks/get`, `tasks/cancel`)
//! - A capability registry built from agent cards and tool-server listings
//! - A router that asks a reasoning collaborator to pick one target
//! - Connectors that call agents over A2A and tools over MCP
//!
//! ## Task Flow
//! 1. Receive `tasks/send` via the API
//! 2. Append the user message and mark the task `working`
//! 3. Route the utterance against the current registry snapshot
//! 4. Call the chosen agent or tool, or reply directly
//! 5. Fold the answer into the task and return it
//!
//! ## Modules
//! - `task`: task model and in-memory store
//! - `registry`: capability cards and discovery
//! - `router`: routing decisions through a reasoning collaborator
//! - `connector`: A2A and MCP client transports
//! - `manager`: per-request lifecycle

pub mod api;
pub mod config;
pub mod connector;
pub mod llm;
pub mod manager;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod task;
pub mod util;

pub use config::Config;
pub use manager::TaskManager;
