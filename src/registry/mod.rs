//! Capability registry: the set of agents and tools the orchestrator can route to.
//!
//! The registry hands out immutable `RegistrySnapshot`s. A refresh builds a new
//! snapshot and swaps it in atomically; callers holding the old snapshot keep
//! a consistent view until they ask again.

mod card;
mod loader;

pub use card::{CapabilityCard, CapabilityKind, Endpoint, McpTransport};
pub use loader::{expand_env_placeholders, McpServerEntry, McpServersFile, RegistrySource};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

/// Errors while reading registry inputs.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("No registry source configured")]
    NoSource,
}

/// Immutable view of every known capability at one point in time.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    cards: Vec<CapabilityCard>,
    loaded_at: DateTime<Utc>,
}

impl RegistrySnapshot {
    /// Build a snapshot, dropping cards whose id was already seen.
    pub fn new(cards: Vec<CapabilityCard>) -> Self {
        let mut unique: Vec<CapabilityCard> = Vec::with_capacity(cards.len());
        for card in cards {
            if unique.iter().any(|c| c.id == card.id) {
                tracing::warn!("Duplicate capability id '{}' ignored", card.id);
                continue;
            }
            unique.push(card);
        }
        Self {
            cards: unique,
            loaded_at: Utc::now(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn cards(&self) -> &[CapabilityCard] {
        &self.cards
    }

    pub fn get(&self, id: &str) -> Option<&CapabilityCard> {
        self.cards.iter().find(|c| c.id == id)
    }

    pub fn agents(&self) -> impl Iterator<Item = &CapabilityCard> {
        self.cards.iter().filter(|c| c.kind() == CapabilityKind::Agent)
    }

    pub fn tools(&self) -> impl Iterator<Item = &CapabilityCard> {
        self.cards.iter().filter(|c| c.kind() == CapabilityKind::Tool)
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}

/// Holder of the current snapshot, injected into the router and task manager.
pub struct Registry {
    current: RwLock<Arc<RegistrySnapshot>>,
    source: Option<RegistrySource>,
}

impl Registry {
    /// A registry with a fixed snapshot and no reload source.
    pub fn fixed(snapshot: RegistrySnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
            source: None,
        }
    }

    /// Load the initial snapshot from `source`; later refreshes re-read it.
    pub async fn load(source: RegistrySource) -> Result<Self, RegistryError> {
        let snapshot = source.load().await?;
        tracing::info!(
            "Registry loaded: {} agents, {} tools",
            snapshot.agents().count(),
            snapshot.tools().count()
        );
        Ok(Self {
            current: RwLock::new(Arc::new(snapshot)),
            source: Some(source),
        })
    }

    /// Current snapshot.
    pub async fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&*self.current.read().await)
    }

    /// Swap in a new snapshot wholesale.
    pub async fn replace(&self, snapshot: RegistrySnapshot) -> Arc<RegistrySnapshot> {
        let snapshot = Arc::new(snapshot);
        *self.current.write().await = Arc::clone(&snapshot);
        snapshot
    }

    /// Rebuild the snapshot from the source.
    ///
    /// On error the previous snapshot stays in place.
    pub async fn refresh(&self) -> Result<Arc<RegistrySnapshot>, RegistryError> {
        let source = self.source.as_ref().ok_or(RegistryError::NoSource)?;
        let snapshot = source.load().await?;
        tracing::info!(
            "Registry refreshed: {} agents, {} tools",
            snapshot.agents().count(),
            snapshot.tools().count()
        );
        Ok(self.replace(snapshot).await)
    }

    /// Refresh on a fixed period until the process exits.
    pub fn spawn_refresh_loop(self: Arc<Self>, period: std::time::Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick fires immediately; the initial load already happened.
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = self.refresh().await {
                    tracing::warn!("Registry refresh failed, keeping previous snapshot: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: &str) -> CapabilityCard {
        CapabilityCard::agent(id, format!("http://{}.local/", id))
    }

    #[test]
    fn test_duplicates_are_dropped() {
        let snapshot = RegistrySnapshot::new(vec![agent("a"), agent("b"), agent("a")]);
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.get("b").is_some());
    }

    #[tokio::test]
    async fn test_replace_is_wholesale() {
        let registry = Registry::fixed(RegistrySnapshot::new(vec![agent("old")]));
        let before = registry.snapshot().await;

        registry.replace(RegistrySnapshot::new(vec![agent("new")])).await;
        let after = registry.snapshot().await;

        assert!(before.get("old").is_some());
        assert!(after.get("old").is_none());
        assert!(after.get("new").is_some());
    }

    #[tokio::test]
    async fn test_fixed_registry_cannot_refresh() {
        let registry = Registry::fixed(RegistrySnapshot::empty());
        assert!(matches!(registry.refresh().await, Err(RegistryError::NoSource)));
    }
}
