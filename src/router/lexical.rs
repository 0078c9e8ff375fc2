//! Offline collaborator: picks a capability by word overlap.
//!
//! Used when no reasoning API key is configured. It sees the same function
//! catalog a real model would and answers with either one function call or a
//! help text.

use std::collections::HashSet;

use async_trait::async_trait;

use super::LOOKUP_FUNCTION;
use crate::llm::{ChatMessage, ChatResponse, LlmClient, Role, ToolCall, ToolDefinition};

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "what", "who", "how", "are", "you", "can", "please", "with", "this", "that", "from",
    "about", "into", "your", "have", "does", "tell", "give", "show", "want", "need", "would", "could", "should",
    "examples",
];

/// Minimum number of shared words for a capability to be chosen.
const MIN_SCORE: usize = 1;

fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 3)
        .map(|w| w.to_lowercase())
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// `(callable, takes_message)`: callable when nothing but `message` is required.
fn message_shape(definition: &ToolDefinition) -> (bool, bool) {
    let parameters = &definition.function.parameters;
    let takes_message = parameters
        .get("properties")
        .and_then(|p| p.get("message"))
        .is_some();
    let required: Vec<&str> = parameters
        .get("required")
        .and_then(|r| r.as_array())
        .map(|r| r.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();
    let callable = required.iter().all(|r| takes_message && *r == "message");
    (callable, takes_message)
}

/// Word-overlap collaborator.
#[derive(Debug, Default)]
pub struct LexicalCollaborator;

impl LexicalCollaborator {
    pub fn new() -> Self {
        Self
    }

    fn help_text(definitions: &[&ToolDefinition]) -> String {
        if definitions.is_empty() {
            return "No agents or tools are available right now, so I cannot act on this request.".to_string();
        }
        let mut text = String::from("I could not match your request to a capability. I can route requests to:");
        for definition in definitions {
            text.push_str(&format!("\n- {}: {}", definition.function.name, definition.function.description));
        }
        text
    }
}

#[async_trait]
impl LlmClient for LexicalCollaborator {
    async fn chat_completion(
        &self,
        _model: &str,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
    ) -> anyhow::Result<ChatResponse> {
        let utterance = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .and_then(|m| m.text_content())
            .unwrap_or_default();
        let wanted = tokens(utterance);

        let options: Vec<&ToolDefinition> = tools
            .unwrap_or_default()
            .iter()
            .filter(|d| d.function.name != LOOKUP_FUNCTION)
            .collect();

        let mut best: Option<(&ToolDefinition, usize, bool)> = None;
        for definition in options.iter().copied() {
            let (callable, takes_message) = message_shape(definition);
            if !callable {
                continue;
            }
            let mut offered = tokens(&definition.function.description);
            offered.extend(tokens(&definition.function.name));
            let score = wanted.intersection(&offered).count();
            tracing::trace!("Lexical score for {}: {}", definition.function.name, score);
            if score >= MIN_SCORE && best.map_or(true, |(_, s, _)| score > s) {
                best = Some((definition, score, takes_message));
            }
        }

        Ok(match best {
            Some((definition, score, takes_message)) => {
                tracing::debug!("Lexical match '{}' (score {})", definition.function.name, score);
                let arguments = if takes_message {
                    serde_json::json!({ "message": utterance })
                } else {
                    serde_json::json!({})
                };
                ChatResponse::calls(vec![ToolCall::function(
                    "lexical_0",
                    definition.function.name.clone(),
                    arguments.to_string(),
                )])
            }
            None => ChatResponse::text(Self::help_text(&options)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(name: &str, description: &str) -> ToolDefinition {
        ToolDefinition::function(
            name,
            description,
            serde_json::json!({
                "type": "object",
                "properties": { "message": { "type": "string" } },
                "required": ["message"]
            }),
        )
    }

    fn ask(text: &str) -> Vec<ChatMessage> {
        vec![
            ChatMessage::new(Role::System, "route"),
            ChatMessage::new(Role::User, text),
        ]
    }

    #[tokio::test]
    async fn test_picks_best_overlap() {
        let tools = vec![
            agent("TellTimeAgent", "Tells the current time. Examples: What time is it?"),
            agent("GreetingAgent", "Writes a friendly greeting poem"),
        ];
        let response = LexicalCollaborator::new()
            .chat_completion("offline", &ask("What time is it?"), Some(&tools))
            .await
            .unwrap();
        let call = &response.tool_calls.unwrap()[0];
        assert_eq!(call.function.name, "TellTimeAgent");
        let args: serde_json::Value = serde_json::from_str(&call.function.arguments).unwrap();
        assert_eq!(args["message"], "What time is it?");
    }

    #[tokio::test]
    async fn test_skips_tools_with_required_arguments() {
        let tools = vec![ToolDefinition::function(
            "run_command",
            "Run a shell command",
            serde_json::json!({ "type": "object", "required": ["command"] }),
        )];
        let response = LexicalCollaborator::new()
            .chat_completion("offline", &ask("run a command"), Some(&tools))
            .await
            .unwrap();
        assert!(response.tool_calls.is_none());
        assert!(response.content.unwrap().contains("run_command"));
    }

    #[tokio::test]
    async fn test_help_text_without_match() {
        let tools = vec![agent("TellTimeAgent", "Tells the current time")];
        let response = LexicalCollaborator::new()
            .chat_completion("offline", &ask("book a flight to Paris"), Some(&tools))
            .await
            .unwrap();
        let text = response.content.unwrap();
        assert!(text.contains("TellTimeAgent"));
    }

    #[test]
    fn test_tokens() {
        let t = tokens("What's the TIME in Paris?");
        assert_eq!(t, HashSet::from(["time".to_string(), "paris".to_string()]));
    }
}
