//! Folds a streamed reply into the caller's turn list.
//!
//! A [`Reconciler`] starts one [`GenerationSession`] per send. The session
//! appends an assistant placeholder, then every decoded event rewrites that
//! turn through [`TurnStore::update`]. Events are applied under the session
//! lock and only while the session is live, so a cancel observed between two
//! events stops the fold immediately.

use crate::client::{OutboundRequest, Transport};
use crate::config::ReplyText;
use crate::protocol::{FallbackBody, StreamEvent};
use crate::sse::EventStreamDecoder;
use crate::turns::{ConversationTurn, TurnStore, with_turn_at, without_turn_at};
use futures::StreamExt;
use futures::future::{AbortHandle, Abortable};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Receives the `newNodes` side channel. Called at most once per session.
pub type NewNodesCallback = Box<dyn FnOnce(Value) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Sending,
    Streaming,
    Finalized,
    Aborted,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Finalized | SessionState::Aborted | SessionState::Failed
        )
    }
}

pub struct GenerationSession<S> {
    store: Arc<S>,
    placeholder: usize,
    state: SessionState,
    content: String,
    thinking: String,
    live_thinking: watch::Sender<String>,
    on_new_nodes: Option<NewNodesCallback>,
    reply_text: ReplyText,
}

impl<S: TurnStore> GenerationSession<S> {
    /// Appends the placeholder turn and returns the session with a receiver
    /// for the live thinking trace.
    pub fn start(
        store: Arc<S>,
        reply_text: ReplyText,
        on_new_nodes: Option<NewNodesCallback>,
    ) -> (Self, watch::Receiver<String>) {
        let mut placeholder = 0;
        store.update(|prev| {
            placeholder = prev.len();
            let mut next = prev.to_vec();
            next.push(ConversationTurn::placeholder());
            next
        });

        let (live_thinking, thinking_rx) = watch::channel(String::new());
        let session = Self {
            store,
            placeholder,
            state: SessionState::Idle,
            content: String::new(),
            thinking: String::new(),
            live_thinking,
            on_new_nodes,
            reply_text,
        };
        (session, thinking_rx)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn placeholder_index(&self) -> usize {
        self.placeholder
    }

    fn transition(&mut self, next: SessionState) {
        if self.state.is_terminal() || self.state == next {
            return;
        }
        tracing::debug!(from = ?self.state, to = ?next, index = self.placeholder, "session state");
        self.state = next;
    }

    pub fn apply(&mut self, event: StreamEvent) {
        if self.state.is_terminal() {
            return;
        }

        match event {
            StreamEvent::Thought { thought } => {
                if thought.is_empty() {
                    return;
                }
                self.thinking.push_str(&thought);
                self.live_thinking.send_replace(self.thinking.clone());
            }
            StreamEvent::Delta { delta } => {
                if delta.is_empty() {
                    return;
                }
                self.content.push_str(&delta);
                let content = self.content.clone();
                self.write(move |turn| ConversationTurn {
                    content,
                    ..turn.clone()
                });
            }
            StreamEvent::Done {
                response,
                thinking,
                new_nodes,
            } => {
                let content = response
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| self.content.clone());
                let thinking = thinking.unwrap_or_else(|| self.thinking.clone());
                self.settle(content, thinking);
                if let Some(nodes) = new_nodes {
                    self.dispatch_new_nodes(nodes);
                }
                self.transition(SessionState::Finalized);
            }
            StreamEvent::Error { error } => {
                let message = error
                    .filter(|e| !e.is_empty())
                    .unwrap_or_else(|| self.reply_text.error_fallback.clone());
                tracing::warn!(error = %message, "reply stream reported an error");
                self.fail(message);
            }
            StreamEvent::Ignored { name } => {
                tracing::trace!(event = %name, "ignoring stream event");
            }
        }
    }

    /// Settles the turn when the stream closes without a `done` event.
    pub fn finish_stream(&mut self) {
        if self.state.is_terminal() {
            return;
        }

        let content = if self.content.is_empty() {
            self.reply_text.empty_reply.clone()
        } else {
            self.content.clone()
        };
        let thinking = self.thinking.clone();
        self.settle(content, thinking);
        self.transition(SessionState::Finalized);
    }

    /// Handles a complete non-streaming body.
    pub fn apply_fallback(&mut self, ok: bool, body: &[u8]) {
        if self.state.is_terminal() {
            return;
        }

        let body: FallbackBody = match serde_json::from_slice(body) {
            Ok(body) => body,
            Err(err) => {
                tracing::debug!(error = %err, ok, "unreadable reply body");
                let message = self.reply_text.error_fallback.clone();
                self.fail(message);
                return;
            }
        };

        if !ok || body.success == Some(false) {
            let message = body
                .error
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| self.reply_text.error_fallback.clone());
            self.fail(message);
            return;
        }

        let content = body
            .reply_text()
            .unwrap_or_else(|| self.reply_text.empty_reply.clone());
        self.settle(content, String::new());
        if let Some(nodes) = body.new_nodes {
            self.dispatch_new_nodes(nodes);
        }
        self.transition(SessionState::Finalized);
    }

    pub fn fail_network(&mut self) {
        let message = self.reply_text.network_failure.clone();
        self.fail(message);
    }

    fn fail(&mut self, message: String) {
        if self.state.is_terminal() {
            return;
        }
        self.content = message.clone();
        self.write(move |turn| ConversationTurn {
            content: message,
            ..turn.clone()
        });
        self.clear_live_thinking();
        self.transition(SessionState::Failed);
    }

    /// Returns `false` when the session had already ended.
    pub fn cancel(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }

        self.transition(SessionState::Aborted);
        let index = self.placeholder;
        self.store.update(|prev| match prev.get(index) {
            Some(turn) if turn.is_placeholder() => without_turn_at(prev, index),
            _ => prev.to_vec(),
        });
        self.clear_live_thinking();
        true
    }

    fn settle(&mut self, content: String, thinking: String) {
        self.content = content.clone();
        let thinking = if thinking.is_empty() {
            None
        } else {
            Some(thinking)
        };
        self.write(move |turn| ConversationTurn {
            role: turn.role,
            content,
            thinking,
        });
        self.clear_live_thinking();
    }

    fn write<F>(&self, f: F)
    where
        F: FnOnce(&ConversationTurn) -> ConversationTurn,
    {
        let index = self.placeholder;
        self.store.update(|prev| with_turn_at(prev, index, f));
    }

    fn dispatch_new_nodes(&mut self, nodes: Value) {
        if let Some(callback) = self.on_new_nodes.take() {
            callback(nodes);
        }
    }

    fn clear_live_thinking(&mut self) {
        self.thinking.clear();
        self.live_thinking.send_replace(String::new());
    }
}

pub struct Reconciler<T> {
    transport: Arc<T>,
    reply_text: ReplyText,
}

impl<T: Transport> Reconciler<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport: Arc::new(transport),
            reply_text: ReplyText::default(),
        }
    }

    pub fn with_reply_text(mut self, reply_text: ReplyText) -> Self {
        self.reply_text = reply_text;
        self
    }

    /// Starts a generation. The caller must already have appended the user
    /// turn, and must not start a second session on the same store while
    /// this one is live. Requires a Tokio runtime.
    pub fn begin_session<S>(
        &self,
        request: OutboundRequest,
        store: Arc<S>,
        on_new_nodes: Option<NewNodesCallback>,
    ) -> SessionHandle<S>
    where
        S: TurnStore + 'static,
    {
        let (session, thinking) =
            GenerationSession::start(store, self.reply_text.clone(), on_new_nodes);
        let placeholder = session.placeholder_index();
        tracing::info!(url = %request.url, placeholder, "starting generation");

        let shared = Arc::new(Mutex::new(session));
        let (abort, registration) = AbortHandle::new_pair();
        let driver = drive(Arc::clone(&self.transport), request, Arc::clone(&shared));
        let task = tokio::spawn(async move {
            let _ = Abortable::new(driver, registration).await;
        });

        SessionHandle {
            shared,
            abort,
            task,
            thinking,
            placeholder,
        }
    }
}

pub struct SessionHandle<S> {
    shared: Arc<Mutex<GenerationSession<S>>>,
    abort: AbortHandle,
    task: JoinHandle<()>,
    thinking: watch::Receiver<String>,
    placeholder: usize,
}

impl<S: TurnStore> SessionHandle<S> {
    /// Stops the generation. Removes the placeholder if nothing visible was
    /// written yet, otherwise keeps the partial reply. No-op once ended.
    pub fn cancel(&self) {
        let cancelled = lock(&self.shared).cancel();
        if cancelled {
            tracing::info!(placeholder = self.placeholder, "generation cancelled");
            self.abort.abort();
        }
    }

    pub fn state(&self) -> SessionState {
        lock(&self.shared).state()
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn placeholder_index(&self) -> usize {
        self.placeholder
    }

    /// Live thinking trace; cleared when the session settles.
    pub fn thinking(&self) -> watch::Receiver<String> {
        self.thinking.clone()
    }

    pub async fn finished(self) -> SessionState {
        if let Err(err) = self.task.await {
            tracing::warn!(error = %err, "generation task ended abnormally");
        }
        lock(&self.shared).state()
    }
}

async fn drive<T, S>(
    transport: Arc<T>,
    request: OutboundRequest,
    shared: Arc<Mutex<GenerationSession<S>>>,
) where
    T: Transport,
    S: TurnStore,
{
    lock(&shared).transition(SessionState::Sending);

    let response = match transport.send(request).await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(error = %err, "request failed");
            lock(&shared).fail_network();
            return;
        }
    };

    if !response.is_success() || !response.is_event_stream() {
        let ok = response.is_success();
        let status = response.status;
        let body = response.read_to_end().await;
        let mut session = lock(&shared);
        match body {
            Ok(body) => {
                tracing::debug!(status, bytes = body.len(), "non-streaming reply");
                session.apply_fallback(ok, &body);
            }
            Err(err) => {
                tracing::warn!(error = %err, status, "failed to read reply body");
                session.fail_network();
            }
        }
        return;
    }

    lock(&shared).transition(SessionState::Streaming);

    let mut decoder = EventStreamDecoder::new();
    let mut body = response.body;
    while let Some(chunk) = body.next().await {
        let events = match chunk {
            Ok(bytes) => decoder.push_events(&bytes),
            Err(err) => {
                tracing::warn!(error = %err, "reply stream interrupted");
                lock(&shared).fail_network();
                return;
            }
        };

        let mut session = lock(&shared);
        for event in events {
            session.apply(event);
        }
        if session.state().is_terminal() {
            return;
        }
    }

    let mut session = lock(&shared);
    for event in decoder.finish_events() {
        session.apply(event);
    }
    session.finish_stream();
}

fn lock<S>(shared: &Arc<Mutex<GenerationSession<S>>>) -> MutexGuard<'_, GenerationSession<S>> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}
