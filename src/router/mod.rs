//! Intent routing: decide which single capability handles an utterance.
//!
//! Each capability card is offered to the reasoning collaborator as a
//! callable function. The collaborator either picks one (delegate to an agent
//! or invoke a tool), asks to describe one first, or answers in plain text.
//! Describe requests are answered and fed back for a bounded number of turns.

mod lexical;

pub use lexical::LexicalCollaborator;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::llm::{ChatMessage, ChatOptions, LlmClient, Role as ChatRole, ToolCall, ToolDefinition};
use crate::registry::{CapabilityCard, CapabilityKind};
use crate::task::{Message, Role};
use crate::util::{function_name, preview};

/// Built-in function the collaborator calls to read a capability's full card.
pub const LOOKUP_FUNCTION: &str = "describe_capability";

/// Router settings.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Model passed to the collaborator
    pub model: String,
    /// Extra collaborator turns allowed after describe requests
    pub max_followup_turns: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            model: "anthropic/claude-sonnet-4".to_string(),
            max_followup_turns: 2,
        }
    }
}

/// Where an utterance goes.
#[derive(Debug, Clone, PartialEq)]
pub enum RoutingDecision {
    DelegateToAgent { card_id: String, message: Message },
    InvokeTool { tool_id: String, arguments: serde_json::Value },
    DirectReply { text: String },
}

impl RoutingDecision {
    /// Card id of the chosen target, if any.
    pub fn target(&self) -> Option<&str> {
        match self {
            RoutingDecision::DelegateToAgent { card_id, .. } => Some(card_id),
            RoutingDecision::InvokeTool { tool_id, .. } => Some(tool_id),
            RoutingDecision::DirectReply { .. } => None,
        }
    }
}

/// One logged step of the routing loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum RouteStep {
    Lookup { turn: usize, capability: String },
    Selected { turn: usize, capability: String },
    Replied { turn: usize },
}

/// Decision plus the steps that led to it.
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    pub decision: RoutingDecision,
    pub steps: Vec<RouteStep>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RouterError {
    #[error("Ambiguous route: collaborator chose unknown capability '{function}'")]
    AmbiguousRoute { function: String },

    #[error("Routing exhausted: no decision after {turns} collaborator turns")]
    RoutingExhausted { turns: usize },

    #[error("Malformed arguments for '{function}': {reason}")]
    MalformedArguments { function: String, reason: String },

    #[error("Reasoning collaborator failed: {0}")]
    Collaborator(String),

    #[error("Reasoning collaborator returned neither a choice nor a reply")]
    EmptyResponse,
}

/// Functions offered to the collaborator for one routing call.
struct Catalog<'a> {
    definitions: Vec<ToolDefinition>,
    by_function: HashMap<String, &'a CapabilityCard>,
}

impl<'a> Catalog<'a> {
    fn build(cards: &'a [CapabilityCard]) -> Self {
        let mut definitions = Vec::with_capacity(cards.len() + 1);
        let mut by_function: HashMap<String, &'a CapabilityCard> = HashMap::new();

        for card in cards {
            let base = function_name(&card.id);
            let mut name = base.clone();
            let mut n = 2;
            while name == LOOKUP_FUNCTION || by_function.contains_key(&name) {
                name = format!("{}_{}", base, n);
                n += 1;
            }

            let parameters = match card.kind() {
                CapabilityKind::Agent => serde_json::json!({
                    "type": "object",
                    "properties": {
                        "message": {
                            "type": "string",
                            "description": "The request to forward, rewritten so the agent can act on it alone"
                        }
                    },
                    "required": ["message"]
                }),
                CapabilityKind::Tool => card
                    .input_schema
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({ "type": "object", "properties": {} })),
            };

            definitions.push(ToolDefinition::function(name.clone(), describe_briefly(card), parameters));
            by_function.insert(name, card);
        }

        let mut names: Vec<&String> = by_function.keys().collect();
        names.sort();
        definitions.push(ToolDefinition::function(
            LOOKUP_FUNCTION,
            "Return the full description, example requests and parameters of one capability before choosing it.",
            serde_json::json!({
                "type": "object",
                "properties": { "name": { "type": "string", "enum": names } },
                "required": ["name"]
            }),
        ));

        Self {
            definitions,
            by_function,
        }
    }

    /// Answer a describe request.
    fn describe(&self, arguments: &str) -> String {
        let requested = serde_json::from_str::<serde_json::Value>(arguments)
            .ok()
            .and_then(|v| v.get("name").and_then(|n| n.as_str()).map(str::to_string));

        match requested.as_deref().and_then(|name| self.by_function.get(name)) {
            Some(card) => {
                let mut out = format!("{} ({:?})\n{}", card.name, card.kind(), card.description);
                if !card.examples.is_empty() {
                    out.push_str("\nExample requests:");
                    for example in &card.examples {
                        out.push_str("\n- ");
                        out.push_str(example);
                    }
                }
                if let Some(schema) = &card.input_schema {
                    out.push_str(&format!("\nParameters: {}", schema));
                }
                out
            }
            None => {
                let mut names: Vec<&str> = self.by_function.keys().map(String::as_str).collect();
                names.sort_unstable();
                format!(
                    "Unknown capability {:?}. Known capabilities: {}",
                    requested.unwrap_or_default(),
                    names.join(", ")
                )
            }
        }
    }
}

fn describe_briefly(card: &CapabilityCard) -> String {
    let mut description = if card.description.is_empty() {
        card.name.clone()
    } else {
        card.description.clone()
    };
    if !card.examples.is_empty() {
        let examples: Vec<&str> = card.examples.iter().take(3).map(String::as_str).collect();
        description.push_str(&format!(" Examples: {}", examples.join(" | ")));
    }
    description
}

fn system_prompt(session_id: &str) -> String {
    format!(
        "You are a task orchestrator (session {session_id}). Each available function is a remote agent or tool.\n\
         - To hand the request to an agent or tool, call exactly one function.\n\
         - If you need details about a capability before choosing, call {LOOKUP_FUNCTION}.\n\
         - If no capability fits, or the user only needs a short answer about what you can do, reply in plain text."
    )
}

/// Routes utterances using a reasoning collaborator.
pub struct Router {
    collaborator: Arc<dyn LlmClient>,
    config: RouterConfig,
}

impl Router {
    pub fn new(collaborator: Arc<dyn LlmClient>, config: RouterConfig) -> Self {
        Self { collaborator, config }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Decide which capability handles `utterance`.
    ///
    /// `prior` is the earlier conversation of the task (without `utterance`).
    pub async fn route(
        &self,
        utterance: &str,
        session_id: &str,
        prior: &[Message],
        cards: &[CapabilityCard],
    ) -> Result<RouteOutcome, RouterError> {
        let catalog = Catalog::build(cards);
        let mut steps = Vec::new();

        let mut messages = vec![ChatMessage::new(ChatRole::System, system_prompt(session_id))];
        for message in prior {
            let role = match message.role {
                Role::User => ChatRole::User,
                Role::Agent => ChatRole::Assistant,
            };
            messages.push(ChatMessage::new(role, message.text_content()));
        }
        messages.push(ChatMessage::new(ChatRole::User, utterance));

        let options = ChatOptions {
            temperature: Some(0.0),
            ..Default::default()
        };

        for turn in 0..=self.config.max_followup_turns {
            let response = self
                .collaborator
                .chat_completion_with_options(&self.config.model, &messages, Some(&catalog.definitions), options.clone())
                .await
                .map_err(|e| RouterError::Collaborator(e.to_string()))?;

            let calls = response.tool_calls.clone().unwrap_or_default();
            if calls.is_empty() {
                let text = response.content.as_deref().map(str::trim).unwrap_or_default();
                if text.is_empty() {
                    return Err(RouterError::EmptyResponse);
                }
                tracing::info!("Routing turn {}: direct reply ({})", turn, preview(text, 80));
                steps.push(RouteStep::Replied { turn });
                return Ok(RouteOutcome {
                    decision: RoutingDecision::DirectReply { text: text.to_string() },
                    steps,
                });
            }

            if let Some(call) = calls.iter().find(|c| c.function.name != LOOKUP_FUNCTION) {
                if calls.len() > 1 {
                    tracing::warn!(
                        "Routing turn {}: collaborator made {} calls; using '{}'",
                        turn,
                        calls.len(),
                        call.function.name
                    );
                }
                let decision = decide(call, utterance, &catalog)?;
                tracing::info!("Routing turn {}: selected '{}'", turn, call.function.name);
                steps.push(RouteStep::Selected {
                    turn,
                    capability: decision.target().unwrap_or_default().to_string(),
                });
                return Ok(RouteOutcome { decision, steps });
            }

            // Only describe requests: answer each and ask again.
            messages.push(ChatMessage::assistant_tool_calls(response.content.clone(), calls.clone()));
            for call in &calls {
                let answer = catalog.describe(&call.function.arguments);
                let capability = serde_json::from_str::<serde_json::Value>(&call.function.arguments)
                    .ok()
                    .and_then(|v| v.get("name").and_then(|n| n.as_str()).map(str::to_string))
                    .unwrap_or_default();
                tracing::debug!("Routing turn {}: describe '{}'", turn, capability);
                steps.push(RouteStep::Lookup { turn, capability });
                messages.push(ChatMessage::tool_result(call.id.clone(), answer));
            }
        }

        let turns = self.config.max_followup_turns + 1;
        tracing::warn!("Routing exhausted after {} turns: {:?}", turns, steps);
        Err(RouterError::RoutingExhausted { turns })
    }
}

/// Turn the collaborator's chosen function call into a decision.
fn decide(call: &ToolCall, utterance: &str, catalog: &Catalog<'_>) -> Result<RoutingDecision, RouterError> {
    let function = call.function.name.as_str();
    let card = catalog
        .by_function
        .get(function)
        .ok_or_else(|| RouterError::AmbiguousRoute {
            function: function.to_string(),
        })?;

    let malformed = |reason: String| RouterError::MalformedArguments {
        function: function.to_string(),
        reason,
    };

    let raw = call.function.arguments.trim();
    let arguments: serde_json::Value = if raw.is_empty() {
        serde_json::json!({})
    } else {
        serde_json::from_str(raw).map_err(|e| malformed(format!("not valid JSON: {}", e)))?
    };
    let Some(object) = arguments.as_object() else {
        return Err(malformed("expected a JSON object".to_string()));
    };

    match card.kind() {
        CapabilityKind::Agent => {
            let text = match object.get("message") {
                None | Some(serde_json::Value::Null) => utterance.to_string(),
                Some(serde_json::Value::String(s)) if s.trim().is_empty() => utterance.to_string(),
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(other) => return Err(malformed(format!("'message' must be a string, got {}", other))),
            };
            Ok(RoutingDecision::DelegateToAgent {
                card_id: card.id.clone(),
                message: Message::user(text),
            })
        }
        CapabilityKind::Tool => {
            let required = card
                .input_schema
                .as_ref()
                .and_then(|s| s.get("required"))
                .and_then(|r| r.as_array())
                .cloned()
                .unwrap_or_default();
            let missing: Vec<&str> = required
                .iter()
                .filter_map(|r| r.as_str())
                .filter(|key| !object.contains_key(*key))
                .collect();
            if !missing.is_empty() {
                return Err(malformed(format!("missing required fields: {}", missing.join(", "))));
            }
            Ok(RoutingDecision::InvokeTool {
                tool_id: card.id.clone(),
                arguments,
            })
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::llm::ChatResponse;
    use crate::registry::McpTransport;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Collaborator that plays back scripted responses and records what it saw.
    pub(crate) struct ScriptedCollaborator {
        responses: Mutex<VecDeque<ChatResponse>>,
        pub(crate) seen: Mutex<Vec<(Vec<ChatMessage>, Vec<String>)>>,
    }

    impl ScriptedCollaborator {
        pub(crate) fn new(responses: Vec<ChatResponse>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                seen: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedCollaborator {
        async fn chat_completion(
            &self,
            _model: &str,
            messages: &[ChatMessage],
            tools: Option<&[ToolDefinition]>,
        ) -> anyhow::Result<ChatResponse> {
            let names = tools
                .unwrap_or_default()
                .iter()
                .map(|t| t.function.name.clone())
                .collect();
            self.seen.lock().unwrap().push((messages.to_vec(), names));
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("script exhausted"))
        }
    }

    pub(crate) fn call(name: &str, arguments: serde_json::Value) -> ChatResponse {
        ChatResponse::calls(vec![ToolCall::function("call_1", name, arguments.to_string())])
    }

    fn lookup(name: &str) -> ChatResponse {
        call(LOOKUP_FUNCTION, serde_json::json!({ "name": name }))
    }

    fn cards() -> Vec<CapabilityCard> {
        vec![
            CapabilityCard::agent("time-agent", "http://localhost:10002/")
                .with_description("Tells the current time")
                .with_examples(["What time is it?"]),
            CapabilityCard::tool(
                "terminal/run_command",
                McpTransport::Http {
                    endpoint: "http://localhost:9000/mcp".to_string(),
                },
                "run_command",
            )
            .with_description("Run a shell command")
            .with_input_schema(serde_json::json!({
                "type": "object",
                "properties": { "command": { "type": "string" } },
                "required": ["command"]
            })),
        ]
    }

    fn setup(script: Vec<ChatResponse>, turns: usize) -> (Router, Arc<ScriptedCollaborator>) {
        let collaborator = Arc::new(ScriptedCollaborator::new(script));
        let router = Router::new(
            collaborator.clone(),
            RouterConfig {
                model: "test".to_string(),
                max_followup_turns: turns,
            },
        );
        (router, collaborator)
    }

    #[tokio::test]
    async fn test_delegate_to_agent() {
        let (router, collaborator) = setup(vec![call("time-agent", serde_json::json!({ "message": "Current time?" }))], 2);
        let outcome = router.route("What time is it?", "s1", &[], &cards()).await.unwrap();

        assert_eq!(
            outcome.decision,
            RoutingDecision::DelegateToAgent {
                card_id: "time-agent".to_string(),
                message: Message::user("Current time?"),
            }
        );
        let seen = collaborator.seen.lock().unwrap();
        let (_, offered) = &seen[0];
        assert_eq!(offered, &vec!["time-agent", "terminal_run_command", LOOKUP_FUNCTION]);
    }

    #[tokio::test]
    async fn test_missing_message_falls_back_to_utterance() {
        let (router, _) = setup(vec![call("time-agent", serde_json::json!({}))], 2);
        let outcome = router.route("What time is it?", "s1", &[], &cards()).await.unwrap();
        match outcome.decision {
            RoutingDecision::DelegateToAgent { message, .. } => {
                assert_eq!(message.text_content(), "What time is it?")
            }
            other => panic!("unexpected decision {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invoke_tool() {
        let (router, _) = setup(
            vec![call("terminal_run_command", serde_json::json!({ "command": "date" }))],
            2,
        );
        let outcome = router.route("run date", "s1", &[], &cards()).await.unwrap();
        assert_eq!(
            outcome.decision,
            RoutingDecision::InvokeTool {
                tool_id: "terminal/run_command".to_string(),
                arguments: serde_json::json!({ "command": "date" }),
            }
        );
    }

    #[tokio::test]
    async fn test_direct_reply() {
        let (router, _) = setup(vec![ChatResponse::text("I can tell the time.")], 2);
        let outcome = router.route("what can you do?", "s1", &[], &cards()).await.unwrap();
        assert_eq!(
            outcome.decision,
            RoutingDecision::DirectReply {
                text: "I can tell the time.".to_string()
            }
        );
        assert_eq!(outcome.steps, vec![RouteStep::Replied { turn: 0 }]);
    }

    #[tokio::test]
    async fn test_unknown_function_is_ambiguous() {
        let (router, _) = setup(vec![call("weather-agent", serde_json::json!({}))], 2);
        let err = router.route("weather?", "s1", &[], &cards()).await.unwrap_err();
        assert_eq!(
            err,
            RouterError::AmbiguousRoute {
                function: "weather-agent".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_malformed_arguments() {
        let bad_json = ChatResponse::calls(vec![ToolCall::function("c", "time-agent", "{not json")]);
        let (router, _) = setup(vec![bad_json], 2);
        let err = router.route("time", "s1", &[], &cards()).await.unwrap_err();
        assert!(matches!(err, RouterError::MalformedArguments { .. }));

        let (router, _) = setup(vec![call("terminal_run_command", serde_json::json!({}))], 2);
        let err = router.route("run", "s1", &[], &cards()).await.unwrap_err();
        assert!(matches!(err, RouterError::MalformedArguments { ref reason, .. } if reason.contains("command")));
    }

    #[tokio::test]
    async fn test_lookup_result_is_fed_back() {
        let (router, collaborator) = setup(
            vec![
                lookup("time-agent"),
                call("time-agent", serde_json::json!({ "message": "time" })),
            ],
            2,
        );
        let outcome = router.route("time", "s1", &[], &cards()).await.unwrap();
        assert_eq!(
            outcome.steps,
            vec![
                RouteStep::Lookup {
                    turn: 0,
                    capability: "time-agent".to_string()
                },
                RouteStep::Selected {
                    turn: 1,
                    capability: "time-agent".to_string()
                },
            ]
        );

        let seen = collaborator.seen.lock().unwrap();
        let (second_turn, _) = &seen[1];
        let fed_back = second_turn.last().unwrap();
        assert_eq!(fed_back.role, ChatRole::Tool);
        assert!(fed_back.text_content().unwrap().contains("What time is it?"));
    }

    #[tokio::test]
    async fn test_exhaustion_on_third_request() {
        let (router, collaborator) = setup(
            vec![lookup("time-agent"), lookup("time-agent"), lookup("time-agent"), lookup("time-agent")],
            2,
        );
        let err = router.route("time", "s1", &[], &cards()).await.unwrap_err();
        assert_eq!(err, RouterError::RoutingExhausted { turns: 3 });
        assert_eq!(collaborator.calls(), 3);
    }

    #[tokio::test]
    async fn test_collaborator_failure() {
        let (router, _) = setup(Vec::new(), 2);
        let err = router.route("time", "s1", &[], &cards()).await.unwrap_err();
        assert!(matches!(err, RouterError::Collaborator(_)));
    }

    #[test]
    fn test_function_name_collisions() {
        let cards = vec![
            CapabilityCard::agent("a b", "http://a/"),
            CapabilityCard::agent("a_b", "http://b/"),
            CapabilityCard::agent(LOOKUP_FUNCTION, "http://c/"),
        ];
        let catalog = Catalog::build(&cards);
        let names: Vec<&str> = catalog.definitions.iter().map(|d| d.function.name.as_str()).collect();
        assert_eq!(names, vec!["a_b", "a_b_2", "describe_capability_2", LOOKUP_FUNCTION]);
        assert_eq!(catalog.by_function["a_b_2"].id, "a_b");
    }
}
