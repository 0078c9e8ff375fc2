//! HTTP route handlers and server bootstrap.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::jsonrpc;
use super::types::*;
use crate::config::Config;
use crate::connector::TransportConnector;
use crate::llm::{LlmClient, OpenRouterClient};
use crate::manager::{ManagerConfig, TaskManager};
use crate::protocol::a2a::{AgentCapabilities, AgentCard, AgentSkill};
use crate::registry::{Registry, RegistryError, RegistrySource};
use crate::router::{LexicalCollaborator, Router as TaskRouter};
use crate::task::TaskState;

/// Shared application state.
pub struct AppState {
    pub manager: Arc<TaskManager>,
    pub registry: Arc<Registry>,
    /// Card served at `/.well-known/agent.json`
    pub card: AgentCard,
    /// Routing runs without a reasoning API key
    pub offline_routing: bool,
}

/// The orchestrator's own agent card.
pub fn orchestrator_card(public_url: &str) -> AgentCard {
    AgentCard {
        name: "TaskRelayOrchestrator".to_string(),
        description: Some(
            "Routes each request to the best registered agent or tool and tracks it as a task".to_string(),
        ),
        url: public_url.to_string(),
        version: Some(env!("CARGO_PKG_VERSION").to_string()),
        capabilities: AgentCapabilities::default(),
        default_input_modes: vec!["text".to_string()],
        default_output_modes: vec!["text".to_string()],
        skills: vec![AgentSkill {
            id: "orchestrate_agents".to_string(),
            name: "Agent Orchestration".to_string(),
            description: Some("Coordinates between specialized agents and tools".to_string()),
            tags: vec!["orchestration".to_string(), "routing".to_string()],
            examples: vec![
                "What time is it?".to_string(),
                "Greet me with a short poem".to_string(),
                "List the available tools".to_string(),
            ],
            input_modes: None,
            output_modes: None,
        }],
    }
}

/// Build the application router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", post(jsonrpc::handle_rpc))
        .route("/.well-known/agent.json", get(agent_card))
        .route("/api/health", get(health))
        .route("/api/capabilities", get(capabilities))
        .route("/api/registry/refresh", post(refresh_registry))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let source = RegistrySource::new(
        config.agent_registry_path.clone(),
        config.mcp_config_path.clone(),
        config.connector_timeout,
    );
    let registry = Arc::new(Registry::load(source).await?);
    if let Some(period) = config.registry_refresh {
        tracing::info!("Refreshing registry every {:?}", period);
        Arc::clone(&registry).spawn_refresh_loop(period);
    }

    let collaborator: Arc<dyn LlmClient> = match &config.api_key {
        Some(key) => {
            tracing::info!("Routing with {}", config.default_model);
            Arc::new(OpenRouterClient::new(key.clone()))
        }
        None => {
            tracing::warn!("OPENROUTER_API_KEY not set; routing with the offline lexical collaborator");
            Arc::new(LexicalCollaborator::new())
        }
    };
    let router = TaskRouter::new(collaborator, config.router_config());
    let connector = Arc::new(TransportConnector::new(config.poll_interval));
    let manager = Arc::new(TaskManager::new(
        Arc::clone(&registry),
        router,
        connector,
        ManagerConfig {
            call_deadline: config.connector_timeout,
            connector_retries: config.connector_retries,
            ..Default::default()
        },
    ));

    let state = Arc::new(AppState {
        manager,
        registry,
        card: orchestrator_card(&config.public_url),
        offline_routing: config.api_key.is_none(),
    });

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {} (advertised as {})", addr, config.public_url);

    let shutdown_state = Arc::clone(&state);
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            shutdown_signal(shutdown_state).await;
        })
        .await?;

    Ok(())
}

/// Wait for Ctrl-C or SIGTERM.
async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    let counts = state.manager.store().state_counts().await;
    let working = counts.get(&TaskState::Working).copied().unwrap_or(0);
    if working > 0 {
        tracing::warn!("Shutdown signal received with {} tasks still working", working);
    } else {
        tracing::info!("Shutdown signal received");
    }
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let task_states: BTreeMap<String, usize> = state
        .manager
        .store()
        .state_counts()
        .await
        .into_iter()
        .map(|(s, n)| (s.to_string(), n))
        .collect();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        tasks: task_states.values().sum(),
        task_states,
        capabilities: state.registry.snapshot().await.len(),
        offline_routing: state.offline_routing,
    })
}

async fn agent_card(State(state): State<Arc<AppState>>) -> Json<AgentCard> {
    Json(state.card.clone())
}

/// Current registry snapshot.
async fn capabilities(State(state): State<Arc<AppState>>) -> Json<CapabilitiesResponse> {
    let snapshot = state.registry.snapshot().await;
    Json(CapabilitiesResponse {
        loaded_at: snapshot.loaded_at(),
        agents: snapshot.agents().count(),
        tools: snapshot.tools().count(),
        cards: snapshot.cards().to_vec(),
    })
}

/// Rebuild the registry now. The old snapshot stays on failure.
async fn refresh_registry(
    State(state): State<Arc<AppState>>,
) -> Result<Json<CapabilitiesResponse>, (StatusCode, String)> {
    match state.registry.refresh().await {
        Ok(snapshot) => Ok(Json(CapabilitiesResponse {
            loaded_at: snapshot.loaded_at(),
            agents: snapshot.agents().count(),
            tools: snapshot.tools().count(),
            cards: snapshot.cards().to_vec(),
        })),
        Err(RegistryError::NoSource) => Err((
            StatusCode::CONFLICT,
            "Registry has no source to refresh from".to_string(),
        )),
        Err(e) => {
            tracing::warn!("Registry refresh failed: {}", e);
            Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}
