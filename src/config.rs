use crate::client::OutboundRequest;
use crate::protocol::{ChatMode, ChatRequest};
use crate::turns::ConversationTurn;
use std::path::PathBuf;

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:4870/api/chat";

/// User-facing texts written into a turn when no reply text is available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyText {
    pub error_fallback: String,
    pub network_failure: String,
    pub empty_reply: String,
}

impl Default for ReplyText {
    fn default() -> Self {
        Self {
            error_fallback: "Something went wrong while generating a reply.".to_string(),
            network_failure: "Could not reach the server. Please try again.".to_string(),
            empty_reply: "No response received.".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: String,
    pub token: Option<String>,
    pub mode: ChatMode,
    pub project_id: Option<String>,
    pub conversation_id: String,
    pub reply_text: ReplyText,
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: None,
            mode: ChatMode::default(),
            project_id: None,
            conversation_id: uuid::Uuid::new_v4().to_string(),
            reply_text: ReplyText::default(),
        }
    }

    /// Builds the outbound request for `message`, given the turns that precede it.
    pub fn chat_request(&self, message: &str, history: &[ConversationTurn]) -> OutboundRequest {
        let body = ChatRequest {
            mode: self.mode,
            message: message.to_string(),
            messages: history.to_vec(),
            project_id: self.project_id.clone(),
            conversation_id: self.conversation_id.clone(),
        };

        let body = serde_json::to_value(&body).unwrap_or_default();
        OutboundRequest::post_json(self.endpoint.clone(), body).with_bearer(self.token.clone())
    }
}

pub fn resolve_token(explicit: Option<String>) -> Option<String> {
    if let Some(token) = explicit {
        return Some(token);
    }

    match read_token_file() {
        Ok(token) if !token.is_empty() => Some(token),
        Ok(_) => None,
        Err(err) => {
            tracing::debug!(path = %token_path().display(), error = %err, "no token file");
            None
        }
    }
}

fn read_token_file() -> std::io::Result<String> {
    let token = std::fs::read_to_string(token_path())?;
    Ok(token.trim().to_string())
}

fn token_path() -> PathBuf {
    if let Some(home) = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
        return PathBuf::from(home).join(".connect").join("token");
    }

    PathBuf::from("connect.token")
}
