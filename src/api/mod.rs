//! HTTP API for the orchestrator.
//!
//! ## Endpoints
//!
//! - `POST /` - JSON-RPC 2.0: `tasks/send`, `tasks/get`, `tasks/cancel`
//! - `GET /.well-known/agent.json` - The orchestrator's agent card
//! - `GET /api/health` - Health check with task counts
//! - `GET /api/capabilities` - Current registry snapshot
//! - `POST /api/registry/refresh` - Rebuild the registry from its files

mod jsonrpc;
mod routes;
pub mod types;

pub use routes::{app, orchestrator_card, serve, AppState};
pub use types::*;
