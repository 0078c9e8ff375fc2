//! API request and response types for the REST endpoints.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::registry::CapabilityCard;

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Service version
    pub version: String,

    /// Number of tasks held in memory
    pub tasks: usize,

    /// Task count per state (`working`, `completed`, ...)
    pub task_states: BTreeMap<String, usize>,

    /// Number of capabilities in the current registry snapshot
    pub capabilities: usize,

    /// Whether routing uses the offline collaborator
    pub offline_routing: bool,
}

/// Current registry snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitiesResponse {
    pub loaded_at: DateTime<Utc>,
    pub agents: usize,
    pub tools: usize,
    pub cards: Vec<CapabilityCard>,
}
