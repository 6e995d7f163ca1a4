use crate::protocol::{ChatMode, ChatRequest, FallbackBody, StreamEvent};
use axum::Json;
use axum::extract::State;
use axum::http::header::{ACCEPT, AUTHORIZATION};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use futures::StreamExt;
use serde_json::json;
use std::convert::Infallible;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub struct ServerConfig {
    pub listen: String,
    pub auth_token: Option<String>,
    pub word_delay: Duration,
}

struct ServerState {
    auth_token: Option<String>,
    word_delay: Duration,
}

type ServerResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

pub async fn run(config: ServerConfig) -> ServerResult<()> {
    let app = router(config.auth_token, config.word_delay);

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    tracing::info!(listen = %config.listen, "development chat endpoint listening on /api/chat");
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(auth_token: Option<String>, word_delay: Duration) -> axum::Router {
    let state = Arc::new(ServerState {
        auth_token,
        word_delay,
    });

    axum::Router::new()
        .route("/api/chat", post(chat))
        .with_state(state)
}

async fn chat(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Response, StatusCode> {
    if let Some(token) = &state.auth_token {
        authorize(&headers, token)?;
    }

    tracing::info!(
        mode = ?request.mode,
        history = request.messages.len(),
        conversation = %request.conversation_id,
        "chat request"
    );

    let script = reply_script(&request);

    if !wants_event_stream(&headers) {
        return Ok(fallback_response(script).into_response());
    }

    let (tx, rx) = mpsc::channel::<StreamEvent>(32);
    let delay = state.word_delay;
    tokio::spawn(async move {
        for event in script {
            if tx.send(event).await.is_err() {
                tracing::debug!("client went away mid-reply");
                break;
            }
            tokio::time::sleep(delay).await;
        }
    });

    let stream = ReceiverStream::new(rx).map(|event| {
        Ok::<Event, Infallible>(
            Event::default()
                .event(event.name())
                .data(event.payload().to_string()),
        )
    });

    Ok(Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("keep-alive"),
        )
        .into_response())
}

/// Events for an echo reply: a thought, one delta per word, then `done`.
fn reply_script(request: &ChatRequest) -> Vec<StreamEvent> {
    let mut events = vec![StreamEvent::Thought {
        thought: format!(
            "Reading {} earlier messages in {:?} mode.",
            request.messages.len(),
            request.mode
        ),
    }];

    if let Some(reason) = request.message.strip_prefix("/fail") {
        let reason = reason.trim();
        events.push(StreamEvent::Error {
            error: Some(if reason.is_empty() {
                "Simulated failure".to_string()
            } else {
                reason.to_string()
            }),
        });
        return events;
    }

    let reply = format!("You said: {}", request.message);
    for word in reply.split_inclusive(' ') {
        events.push(StreamEvent::Delta {
            delta: word.to_string(),
        });
    }

    let new_nodes = (request.mode == ChatMode::Build).then(|| {
        json!({
            "nodes": [{
                "id": uuid::Uuid::new_v4().to_string(),
                "type": "sendMessage",
                "data": { "text": request.message },
            }],
            "edges": [],
        })
    });

    events.push(StreamEvent::Done {
        response: None,
        thinking: None,
        new_nodes,
    });
    events
}

fn fallback_response(script: Vec<StreamEvent>) -> Response {
    let mut body = FallbackBody {
        success: Some(true),
        ..FallbackBody::default()
    };
    let mut reply = String::new();

    for event in script {
        match event {
            StreamEvent::Delta { delta } => reply.push_str(&delta),
            StreamEvent::Done { new_nodes, .. } => body.new_nodes = new_nodes,
            StreamEvent::Error { error } => {
                body.success = Some(false);
                body.error = error;
                return (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response();
            }
            _ => {}
        }
    }

    body.response = Some(reply);
    Json(body).into_response()
}

fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_none_or(|accept| accept.contains("text/event-stream") || accept.contains("*/*"))
}

fn authorize(headers: &HeaderMap, token: &str) -> Result<(), StatusCode> {
    let header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    match header {
        Some(value) if value == format!("Bearer {}", token) => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::HttpTransport;
    use crate::config::ClientConfig;
    use crate::reconciler::{NewNodesCallback, Reconciler, SessionState};
    use crate::turns::{ConversationTurn, TurnStore, WatchTurns};

    async fn spawn_server(token: Option<&str>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(token.map(str::to_string), Duration::from_millis(1));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/api/chat", addr)
    }

    fn request(message: &str, mode: ChatMode) -> ChatRequest {
        ChatRequest {
            mode,
            message: message.to_string(),
            messages: Vec::new(),
            project_id: None,
            conversation_id: "c1".to_string(),
        }
    }

    #[test]
    fn echo_script_streams_words_then_done() {
        let script = reply_script(&request("hi there", ChatMode::Execute));
        let deltas: String = script
            .iter()
            .filter_map(|event| match event {
                StreamEvent::Delta { delta } => Some(delta.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, "You said: hi there");
        assert!(matches!(
            script.last(),
            Some(StreamEvent::Done {
                new_nodes: None,
                ..
            })
        ));
    }

    #[test]
    fn fail_command_scripts_an_error() {
        let script = reply_script(&request("/fail quota exceeded", ChatMode::Execute));
        assert_eq!(
            script.last(),
            Some(&StreamEvent::Error {
                error: Some("quota exceeded".to_string())
            })
        );
    }

    #[tokio::test]
    async fn streamed_reply_round_trips_through_reconciler() {
        let url = spawn_server(Some("tok")).await;
        let mut config = ClientConfig::new(url);
        config.mode = ChatMode::Build;
        config.token = Some("tok".to_string());

        let store = Arc::new(WatchTurns::new(vec![ConversationTurn::user("build it")]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let callback: NewNodesCallback = Box::new(move |nodes| {
            let _ = tx.send(nodes);
        });

        let state = Reconciler::new(HttpTransport::new())
            .begin_session(
                config.chat_request("build it", &[]),
                Arc::clone(&store),
                Some(callback),
            )
            .finished()
            .await;

        assert_eq!(state, SessionState::Finalized);
        let turns = store.snapshot();
        assert_eq!(turns[1].content, "You said: build it");
        assert!(turns[1].thinking.is_some());
        let nodes = rx.recv().await.unwrap();
        assert_eq!(nodes["nodes"][0]["data"]["text"], "build it");
    }

    #[tokio::test]
    async fn json_clients_get_a_single_body() {
        let url = spawn_server(None).await;
        let response = reqwest::Client::new()
            .post(&url)
            .header(ACCEPT, "application/json")
            .json(&request("hello", ChatMode::Execute))
            .send()
            .await
            .unwrap();

        assert!(response.status().is_success());
        let body: FallbackBody = response.json().await.unwrap();
        assert_eq!(body.response.as_deref(), Some("You said: hello"));
    }

    #[tokio::test]
    async fn missing_token_is_rejected() {
        let url = spawn_server(Some("tok")).await;
        let response = reqwest::Client::new()
            .post(&url)
            .json(&request("hello", ChatMode::Execute))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status().as_u16(), 401);
    }
}
