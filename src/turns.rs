use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            thinking: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            thinking: None,
        }
    }

    pub fn placeholder() -> Self {
        Self::assistant(String::new())
    }

    pub fn is_placeholder(&self) -> bool {
        self.role == Role::Assistant && self.content.is_empty()
    }
}

/// Caller-owned turn list.
///
/// Writers never mutate a snapshot they read earlier: `update` receives the
/// list as it is at the moment of the write and returns its replacement.
pub trait TurnStore: Send + Sync {
    fn snapshot(&self) -> Vec<ConversationTurn>;

    fn update<F>(&self, f: F)
    where
        F: FnOnce(&[ConversationTurn]) -> Vec<ConversationTurn>;
}

/// [`TurnStore`] backed by a watch channel, so every write wakes subscribers.
#[derive(Debug, Clone)]
pub struct WatchTurns {
    sender: watch::Sender<Vec<ConversationTurn>>,
}

impl WatchTurns {
    pub fn new(initial: Vec<ConversationTurn>) -> Self {
        let (sender, _) = watch::channel(initial);
        Self { sender }
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<ConversationTurn>> {
        self.sender.subscribe()
    }

    pub fn push(&self, turn: ConversationTurn) {
        self.update(|prev| {
            let mut next = prev.to_vec();
            next.push(turn);
            next
        });
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.sender.borrow().len()
    }
}

impl Default for WatchTurns {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl TurnStore for WatchTurns {
    fn snapshot(&self) -> Vec<ConversationTurn> {
        self.sender.borrow().clone()
    }

    fn update<F>(&self, f: F)
    where
        F: FnOnce(&[ConversationTurn]) -> Vec<ConversationTurn>,
    {
        self.sender.send_modify(|turns| {
            let next = f(turns.as_slice());
            *turns = next;
        });
    }
}

/// Next list with the turn at `index` replaced by `f(turn)`.
pub fn with_turn_at<F>(prev: &[ConversationTurn], index: usize, f: F) -> Vec<ConversationTurn>
where
    F: FnOnce(&ConversationTurn) -> ConversationTurn,
{
    let mut next = prev.to_vec();
    if let Some(slot) = next.get_mut(index) {
        *slot = f(&prev[index]);
    }
    next
}

pub fn without_turn_at(prev: &[ConversationTurn], index: usize) -> Vec<ConversationTurn> {
    let mut next = prev.to_vec();
    if index < next.len() {
        next.remove(index);
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_sees_writes_from_other_holders() {
        let turns = WatchTurns::default();
        let other = turns.clone();
        turns.push(ConversationTurn::user("hi"));
        other.push(ConversationTurn::placeholder());

        turns.update(|prev| with_turn_at(prev, 1, |_| ConversationTurn::assistant("hello")));

        assert_eq!(
            turns.snapshot(),
            vec![
                ConversationTurn::user("hi"),
                ConversationTurn::assistant("hello")
            ]
        );
    }

    #[test]
    fn out_of_range_edits_are_no_ops() {
        let prev = vec![ConversationTurn::user("hi")];
        assert_eq!(
            with_turn_at(&prev, 3, |_| ConversationTurn::assistant("x")),
            prev
        );
        assert_eq!(without_turn_at(&prev, 3), prev);
        assert!(without_turn_at(&prev, 0).is_empty());
    }

    #[tokio::test]
    async fn subscribers_are_notified_on_update() {
        let turns = WatchTurns::default();
        let mut rx = turns.subscribe();
        turns.push(ConversationTurn::user("hi"));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().len(), 1);
    }

    #[test]
    fn thinking_is_omitted_from_history_json() {
        let value = serde_json::to_value(ConversationTurn::assistant("a")).unwrap();
        assert_eq!(value, serde_json::json!({"role": "assistant", "content": "a"}));
    }
}
