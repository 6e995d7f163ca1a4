use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::turns::ConversationTurn;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    Build,
    #[default]
    Execute,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub mode: ChatMode,
    pub message: String,
    #[serde(default)]
    pub messages: Vec<ConversationTurn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default)]
    pub conversation_id: String,
}

/// Body of a non-streaming reply.
///
/// Every field is optional: the chat endpoint answers with `response`, the
/// simulator endpoint with `responses`, and failures carry `error`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responses: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_nodes: Option<Value>,
}

impl FallbackBody {
    /// Reply text: `response` first, then the joined `responses`.
    pub fn reply_text(&self) -> Option<String> {
        if let Some(response) = self.response.as_deref().filter(|r| !r.is_empty()) {
            return Some(response.to_string());
        }

        self.responses
            .as_ref()
            .map(|parts| parts.join("\n\n"))
            .filter(|joined| !joined.is_empty())
    }
}

/// One decoded event from the reply stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Thought {
        thought: String,
    },
    Delta {
        delta: String,
    },
    Done {
        response: Option<String>,
        thinking: Option<String>,
        new_nodes: Option<Value>,
    },
    Error {
        error: Option<String>,
    },
    Ignored {
        name: String,
    },
}

impl StreamEvent {
    /// Decodes a frame's event name and data text.
    ///
    /// Returns `None` for an empty or unparseable payload. Never panics; an
    /// unknown name becomes [`StreamEvent::Ignored`].
    pub fn decode(name: &str, data: &str) -> Option<Self> {
        if data.is_empty() {
            return None;
        }

        let payload: Value = match serde_json::from_str(data) {
            Ok(value) => value,
            Err(err) => {
                tracing::debug!(event = name, error = %err, "dropping frame with malformed payload");
                return None;
            }
        };

        let event = match name {
            "thought" => StreamEvent::Thought {
                thought: coerce_text(payload.get("thought")),
            },
            "delta" => StreamEvent::Delta {
                delta: coerce_text(payload.get("delta")),
            },
            "done" => StreamEvent::Done {
                response: optional_text(payload.get("response")),
                thinking: optional_text(payload.get("thinking")),
                new_nodes: payload.get("newNodes").filter(|v| !v.is_null()).cloned(),
            },
            "error" => StreamEvent::Error {
                error: optional_text(payload.get("error")),
            },
            other => StreamEvent::Ignored {
                name: other.to_string(),
            },
        };

        Some(event)
    }

    pub fn name(&self) -> &str {
        match self {
            StreamEvent::Thought { .. } => "thought",
            StreamEvent::Delta { .. } => "delta",
            StreamEvent::Done { .. } => "done",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Ignored { name } => name,
        }
    }

    /// JSON payload in wire shape, used when emitting frames.
    pub fn payload(&self) -> Value {
        let mut map = Map::new();
        match self {
            StreamEvent::Thought { thought } => {
                map.insert("thought".into(), Value::String(thought.clone()));
            }
            StreamEvent::Delta { delta } => {
                map.insert("delta".into(), Value::String(delta.clone()));
            }
            StreamEvent::Done {
                response,
                thinking,
                new_nodes,
            } => {
                if let Some(response) = response {
                    map.insert("response".into(), Value::String(response.clone()));
                }
                if let Some(thinking) = thinking {
                    map.insert("thinking".into(), Value::String(thinking.clone()));
                }
                if let Some(nodes) = new_nodes {
                    map.insert("newNodes".into(), nodes.clone());
                }
            }
            StreamEvent::Error { error } => {
                if let Some(error) = error {
                    map.insert("error".into(), Value::String(error.clone()));
                }
            }
            StreamEvent::Ignored { .. } => {}
        }
        Value::Object(map)
    }
}

fn coerce_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

fn optional_text(value: Option<&Value>) -> Option<String> {
    match value {
        None | Some(Value::Null) => None,
        some => Some(coerce_text(some)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_maps_known_names() {
        assert_eq!(
            StreamEvent::decode("delta", r#"{"delta":"Hel"}"#),
            Some(StreamEvent::Delta {
                delta: "Hel".to_string()
            })
        );
        assert_eq!(
            StreamEvent::decode("thought", r#"{"thought":"hmm"}"#),
            Some(StreamEvent::Thought {
                thought: "hmm".to_string()
            })
        );
        assert_eq!(
            StreamEvent::decode("error", r#"{"error":"boom"}"#),
            Some(StreamEvent::Error {
                error: Some("boom".to_string())
            })
        );
    }

    #[test]
    fn decode_done_reads_optional_fields() {
        let event = StreamEvent::decode(
            "done",
            r#"{"response":"Final","newNodes":{"nodes":[1]},"thinking":null}"#,
        );
        assert_eq!(
            event,
            Some(StreamEvent::Done {
                response: Some("Final".to_string()),
                thinking: None,
                new_nodes: Some(json!({"nodes": [1]})),
            })
        );
    }

    #[test]
    fn decode_coerces_non_string_fields() {
        assert_eq!(
            StreamEvent::decode("delta", r#"{"delta":42}"#),
            Some(StreamEvent::Delta {
                delta: "42".to_string()
            })
        );
        assert_eq!(
            StreamEvent::decode("delta", r#"{}"#),
            Some(StreamEvent::Delta {
                delta: String::new()
            })
        );
    }

    #[test]
    fn decode_drops_empty_and_malformed_payloads() {
        assert_eq!(StreamEvent::decode("delta", ""), None);
        assert_eq!(StreamEvent::decode("delta", "{not valid json"), None);
    }

    #[test]
    fn decode_unknown_name_is_ignored() {
        assert_eq!(
            StreamEvent::decode("message", r#"{"x":1}"#),
            Some(StreamEvent::Ignored {
                name: "message".to_string()
            })
        );
    }

    #[test]
    fn payload_matches_decoder() {
        let event = StreamEvent::Done {
            response: Some("AB".to_string()),
            thinking: None,
            new_nodes: Some(json!({"id": "n1"})),
        };
        let data = event.payload().to_string();
        assert_eq!(StreamEvent::decode(event.name(), &data), Some(event));
    }

    #[test]
    fn fallback_prefers_response_then_joined_responses() {
        let body: FallbackBody =
            serde_json::from_value(json!({"success": true, "response": "Hi"})).unwrap();
        assert_eq!(body.reply_text().as_deref(), Some("Hi"));

        let body: FallbackBody =
            serde_json::from_value(json!({"responses": ["one", "two"]})).unwrap();
        assert_eq!(body.reply_text().as_deref(), Some("one\n\ntwo"));

        let body: FallbackBody = serde_json::from_value(json!({"success": true})).unwrap();
        assert_eq!(body.reply_text(), None);
    }

    #[test]
    fn chat_request_uses_camel_case() {
        let request = ChatRequest {
            mode: ChatMode::Build,
            message: "hi".to_string(),
            messages: Vec::new(),
            project_id: Some("p1".to_string()),
            conversation_id: "c1".to_string(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["mode"], "build");
        assert_eq!(value["projectId"], "p1");
        assert_eq!(value["conversationId"], "c1");
    }
}
