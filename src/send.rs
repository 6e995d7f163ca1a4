use crate::client::HttpTransport;
use crate::config::ClientConfig;
use crate::reconciler::{NewNodesCallback, Reconciler, SessionState};
use crate::turns::{ConversationTurn, TurnStore, WatchTurns};
use std::error::Error;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

type SendResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// Writes only what is new since the last call. A value that no longer
/// extends what was printed (an error replacing partial text, or a final
/// answer differing from the deltas) is reprinted on a fresh line.
#[derive(Debug, Default)]
struct ProgressPrinter {
    printed: String,
}

impl ProgressPrinter {
    fn update<W: Write>(&mut self, out: &mut W, current: &str) -> io::Result<()> {
        if current == self.printed {
            return Ok(());
        }

        match current.strip_prefix(self.printed.as_str()) {
            Some(suffix) => write!(out, "{}", suffix)?,
            None => write!(out, "\n{}", current)?,
        }
        out.flush()?;
        self.printed = current.to_string();
        Ok(())
    }
}

pub async fn run(config: ClientConfig, message: String, show_thinking: bool) -> SendResult<SessionState> {
    let turns = Arc::new(WatchTurns::default());
    let request = config.chat_request(&message, &[]);
    turns.push(ConversationTurn::user(message));

    let (nodes_tx, mut nodes_rx) = mpsc::unbounded_channel();
    let on_new_nodes: NewNodesCallback = Box::new(move |nodes| {
        let _ = nodes_tx.send(nodes);
    });

    let mut updates = turns.subscribe();
    let reconciler =
        Reconciler::new(HttpTransport::new()).with_reply_text(config.reply_text.clone());
    let handle = reconciler.begin_session(request, Arc::clone(&turns), Some(on_new_nodes));
    let index = handle.placeholder_index();
    let mut thinking = handle.thinking();

    let mut stdout = io::stdout();
    let mut stderr = io::stderr();
    let mut content = ProgressPrinter::default();
    let mut trace = ProgressPrinter::default();

    loop {
        tokio::select! {
            _ = updates.changed() => {
                let current = updates
                    .borrow_and_update()
                    .get(index)
                    .map(|turn| turn.content.clone());
                if let Some(current) = current {
                    content.update(&mut stdout, &current)?;
                }
            }
            _ = thinking.changed(), if show_thinking => {
                let current = thinking.borrow_and_update().clone();
                if !current.is_empty() {
                    trace.update(&mut stderr, &current)?;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                handle.cancel();
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }

        if handle.is_finished() {
            break;
        }
    }

    let state = handle.finished().await;
    if let Some(turn) = turns.snapshot().get(index).filter(|t| t.content != content.printed) {
        content.update(&mut stdout, &turn.content)?;
    }
    writeln!(stdout)?;

    while let Ok(nodes) = nodes_rx.try_recv() {
        eprintln!("newNodes: {}", serde_json::to_string_pretty(&nodes)?);
    }

    tracing::info!(state = ?state, "generation finished");
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::ProgressPrinter;

    #[test]
    fn printer_writes_only_new_suffix() {
        let mut out = Vec::new();
        let mut printer = ProgressPrinter::default();
        printer.update(&mut out, "A").unwrap();
        printer.update(&mut out, "AB").unwrap();
        printer.update(&mut out, "AB").unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "AB");
    }

    #[test]
    fn printer_reprints_replaced_text_on_new_line() {
        let mut out = Vec::new();
        let mut printer = ProgressPrinter::default();
        printer.update(&mut out, "Hel").unwrap();
        printer.update(&mut out, "boom").unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "Hel\nboom");
    }
}
