use crate::client::HttpTransport;
use crate::config::ClientConfig;
use crate::reconciler::{NewNodesCallback, Reconciler, SessionHandle};
use crate::turns::{ConversationTurn, Role, TurnStore, WatchTurns};
use crossterm::cursor::MoveTo;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Paragraph, Widget, Wrap};
use ratatui::{Frame, Terminal, TerminalOptions, Viewport};
use std::io;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

type TuiTerminal = Terminal<CrosstermBackend<io::Stdout>>;
type UiResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const INPUT_HEIGHT: u16 = 6;
const LIVE_HEIGHT: u16 = 8;

// Restores terminal settings even if the loop exits early.
struct TerminalGuard;

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = io::stdout().flush();
    }
}

#[derive(Debug, Clone)]
struct LineSpec {
    text: String,
    style: Style,
}

impl LineSpec {
    fn new(text: impl Into<String>, style: Style) -> Self {
        Self {
            text: text.into(),
            style,
        }
    }
}

fn thinking_style() -> Style {
    Style::default()
        .fg(Color::Gray)
        .add_modifier(Modifier::ITALIC)
}

fn turn_lines(turn: &ConversationTurn) -> Vec<LineSpec> {
    let (label, color) = match turn.role {
        Role::User => ("You:", Color::Blue),
        Role::Assistant => ("Connect:", Color::Yellow),
    };
    let header_style = Style::default().fg(color).add_modifier(Modifier::BOLD);
    let body_style = Style::default().fg(color);

    let mut lines = vec![LineSpec::new(label, header_style)];
    if let Some(thinking) = turn.thinking.as_deref().filter(|t| !t.is_empty()) {
        for line in thinking.lines() {
            lines.push(LineSpec::new(format!("  ┆ {}", line), thinking_style()));
        }
    }
    for line in turn.content.lines() {
        lines.push(LineSpec::new(format!("  {}", line), body_style));
    }
    lines
}

fn info_lines(message: &str) -> Vec<LineSpec> {
    vec![LineSpec::new(format!("ℹ {}", message), thinking_style())]
}

fn to_text(lines: Vec<LineSpec>) -> Text<'static> {
    Text::from(
        lines
            .into_iter()
            .map(|spec| Line::from(Span::styled(spec.text, spec.style)))
            .collect::<Vec<_>>(),
    )
}

fn rendered_height(lines: &[LineSpec], width: u16) -> u16 {
    let width = width.max(1) as usize;
    let total: usize = lines
        .iter()
        .map(|line| line.text.chars().count().max(1).div_ceil(width))
        .sum();
    u16::try_from(total).unwrap_or(u16::MAX)
}

#[derive(Debug)]
enum UiEvent {
    NewNodes(serde_json::Value),
}

/// Multi-line input; cursor positions count chars, not bytes.
struct InputBuffer {
    lines: Vec<String>,
    cursor_x: usize,
    cursor_y: usize,
}

impl InputBuffer {
    fn new() -> Self {
        Self {
            lines: vec![String::new()],
            cursor_x: 0,
            cursor_y: 0,
        }
    }

    fn clear(&mut self) {
        *self = Self::new();
    }

    fn line_len(&self, y: usize) -> usize {
        self.lines[y].chars().count()
    }

    fn byte_index(&self) -> usize {
        let line = &self.lines[self.cursor_y];
        line.char_indices()
            .nth(self.cursor_x)
            .map_or(line.len(), |(idx, _)| idx)
    }

    fn insert_char(&mut self, c: char) {
        let idx = self.byte_index();
        self.lines[self.cursor_y].insert(idx, c);
        self.cursor_x += 1;
    }

    fn delete_char(&mut self) {
        if self.cursor_x > 0 {
            self.cursor_x -= 1;
            let idx = self.byte_index();
            self.lines[self.cursor_y].remove(idx);
        } else if self.cursor_y > 0 {
            let line = self.lines.remove(self.cursor_y);
            self.cursor_y -= 1;
            self.cursor_x = self.line_len(self.cursor_y);
            self.lines[self.cursor_y].push_str(&line);
        }
    }

    fn new_line(&mut self) {
        let idx = self.byte_index();
        let rest = self.lines[self.cursor_y].split_off(idx);
        self.lines.insert(self.cursor_y + 1, rest);
        self.cursor_y += 1;
        self.cursor_x = 0;
    }

    fn move_left(&mut self) {
        if self.cursor_x > 0 {
            self.cursor_x -= 1;
        } else if self.cursor_y > 0 {
            self.cursor_y -= 1;
            self.cursor_x = self.line_len(self.cursor_y);
        }
    }

    fn move_right(&mut self) {
        if self.cursor_x < self.line_len(self.cursor_y) {
            self.cursor_x += 1;
        } else if self.cursor_y + 1 < self.lines.len() {
            self.cursor_y += 1;
            self.cursor_x = 0;
        }
    }

    fn move_vertical(&mut self, up: bool) {
        if up && self.cursor_y > 0 {
            self.cursor_y -= 1;
        } else if !up && self.cursor_y + 1 < self.lines.len() {
            self.cursor_y += 1;
        }
        self.cursor_x = self.cursor_x.min(self.line_len(self.cursor_y));
    }

    fn text(&self) -> String {
        self.lines.join("\n")
    }

    fn is_blank(&self) -> bool {
        self.lines.iter().all(|l| l.trim().is_empty())
    }

    fn render(&self) -> Text<'static> {
        if self.lines.iter().all(String::is_empty) {
            return Text::from(Span::styled(
                "Type your message here...",
                Style::default().fg(Color::DarkGray),
            ));
        }
        Text::from(
            self.lines
                .iter()
                .map(|l| Line::from(l.clone()))
                .collect::<Vec<_>>(),
        )
    }
}

pub struct App {
    config: ClientConfig,
    reconciler: Reconciler<HttpTransport>,
    turns: Arc<WatchTurns>,
    active: Option<SessionHandle<WatchTurns>>,
    committed: usize,
    input: InputBuffer,
    should_quit: bool,
    sender: mpsc::UnboundedSender<UiEvent>,
    receiver: mpsc::UnboundedReceiver<UiEvent>,
}

impl App {
    pub fn new(config: ClientConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let reconciler =
            Reconciler::new(HttpTransport::new()).with_reply_text(config.reply_text.clone());

        Self {
            config,
            reconciler,
            turns: Arc::new(WatchTurns::default()),
            active: None,
            committed: 0,
            input: InputBuffer::new(),
            should_quit: false,
            sender,
            receiver,
        }
    }

    fn draw(&self, f: &mut Frame) {
        let [live_area, input_area] =
            Layout::vertical([Constraint::Length(LIVE_HEIGHT), Constraint::Min(INPUT_HEIGHT)])
                .areas(f.area());

        if let Some(handle) = &self.active {
            let mut lines = Vec::new();
            let thinking = handle.thinking().borrow().clone();
            if !thinking.is_empty() {
                lines.push(LineSpec::new(format!("┆ {}", thinking), thinking_style()));
            }
            if let Some(turn) = self.turns.snapshot().get(handle.placeholder_index()) {
                lines.extend(turn_lines(turn));
            }
            // Keep the newest text in view.
            let height = rendered_height(&lines, live_area.width);
            let scroll = height.saturating_sub(live_area.height);
            let live = Paragraph::new(to_text(lines))
                .wrap(Wrap { trim: false })
                .scroll((scroll, 0));
            f.render_widget(live, live_area);
        }

        let title = if self.active.is_some() {
            " Input (Esc to stop) [Generating...] "
        } else {
            " Input (Enter to send, Shift+Enter for newline, Esc to quit) "
        };

        let input_paragraph = Paragraph::new(self.input.render())
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(title)
                    .border_style(Style::default().fg(Color::DarkGray)),
            )
            .wrap(Wrap { trim: false });

        f.render_widget(input_paragraph, input_area);

        let cursor_x = u16::try_from(self.input.cursor_x + 1).unwrap_or(u16::MAX);
        let cursor_y = u16::try_from(self.input.cursor_y).unwrap_or(u16::MAX);
        let x = input_area
            .x
            .saturating_add(cursor_x)
            .min(input_area.x + input_area.width.saturating_sub(2));
        let y = (input_area.y + 1)
            .saturating_add(cursor_y)
            .min(input_area.y + input_area.height.saturating_sub(2));
        f.set_cursor_position((x, y));
    }

    fn print_lines(&self, terminal: &mut TuiTerminal, lines: Vec<LineSpec>) -> UiResult<()> {
        let width = terminal.size()?.width;
        let height = rendered_height(&lines, width).saturating_add(1);
        let mut text = to_text(lines);
        text.extend(Text::raw("\n"));
        // Insert above the inline viewport so the log stays in scrollback.
        terminal.insert_before(height, |buf| {
            Paragraph::new(text)
                .wrap(Wrap { trim: false })
                .render(buf.area, buf);
        })?;
        Ok(())
    }

    /// Moves settled turns into scrollback. The turn being generated stays
    /// in the viewport until its session ends.
    fn commit_settled(&mut self, terminal: &mut TuiTerminal) -> UiResult<()> {
        if self.active.as_ref().is_some_and(SessionHandle::is_finished) {
            self.active = None;
        }

        let turns = self.turns.snapshot();
        let limit = self
            .active
            .as_ref()
            .map_or(turns.len(), |handle| handle.placeholder_index())
            .min(turns.len());
        self.committed = self.committed.min(turns.len());

        while self.committed < limit {
            self.print_lines(terminal, turn_lines(&turns[self.committed]))?;
            self.committed += 1;
        }
        Ok(())
    }

    fn submit(&mut self) {
        if self.active.is_some() || self.input.is_blank() {
            return;
        }

        let message = self.input.text();
        self.input.clear();

        let history = self.turns.snapshot();
        let request = self.config.chat_request(&message, &history);
        self.turns.push(ConversationTurn::user(message));

        let sender = self.sender.clone();
        let on_new_nodes: NewNodesCallback = Box::new(move |nodes| {
            let _ = sender.send(UiEvent::NewNodes(nodes));
        });

        let handle =
            self.reconciler
                .begin_session(request, Arc::clone(&self.turns), Some(on_new_nodes));
        self.active = Some(handle);
    }

    fn handle_key(&mut self, key: KeyEvent) {
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            self.should_quit = true;
            return;
        }

        match key.code {
            KeyCode::Esc => match &self.active {
                Some(handle) => handle.cancel(),
                None => self.should_quit = true,
            },
            KeyCode::Enter if key.modifiers.contains(KeyModifiers::SHIFT) => {
                self.input.new_line();
            }
            KeyCode::Enter => self.submit(),
            KeyCode::Char(c) => self.input.insert_char(c),
            KeyCode::Backspace => self.input.delete_char(),
            KeyCode::Left => self.input.move_left(),
            KeyCode::Right => self.input.move_right(),
            KeyCode::Up => self.input.move_vertical(true),
            KeyCode::Down => self.input.move_vertical(false),
            KeyCode::Home => self.input.cursor_x = 0,
            KeyCode::End => self.input.cursor_x = self.input.line_len(self.input.cursor_y),
            _ => {}
        }
    }

    fn handle_events(&mut self, terminal: &mut TuiTerminal) -> UiResult<()> {
        while let Ok(event) = self.receiver.try_recv() {
            match event {
                UiEvent::NewNodes(nodes) => {
                    let count = nodes
                        .get("nodes")
                        .and_then(|n| n.as_array())
                        .map_or(0, Vec::len);
                    tracing::info!(count, "automation nodes received");
                    self.print_lines(
                        terminal,
                        info_lines(&format!("{} automation node(s) added", count)),
                    )?;
                }
            }
        }

        self.commit_settled(terminal)?;

        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                self.handle_key(key);
            }
        }

        Ok(())
    }
}

pub fn run_tui(config: ClientConfig) -> UiResult<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    let (_, rows) = size()?;
    if rows > 0 {
        // Push existing screen content into scrollback without clearing it.
        for _ in 0..rows {
            writeln!(stdout)?;
        }
        stdout.flush()?;
    }
    execute!(stdout, MoveTo(0, 0))?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::with_options(
        backend,
        TerminalOptions {
            viewport: Viewport::Inline(LIVE_HEIGHT + INPUT_HEIGHT),
        },
    )?;

    let mut app = App::new(config);

    let _guard = TerminalGuard;

    while !app.should_quit {
        app.handle_events(&mut terminal)?;
        terminal.draw(|f| app.draw(f))?;
    }

    if let Some(handle) = &app.active {
        handle.cancel();
    }
    terminal.clear()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_buffer_shift_enter_inserts_new_line() {
        let mut buffer = InputBuffer::new();
        for ch in "hello".chars() {
            buffer.insert_char(ch);
        }
        buffer.new_line();
        for ch in "world".chars() {
            buffer.insert_char(ch);
        }

        assert_eq!(buffer.text(), "hello\nworld");
        assert_eq!(buffer.lines.len(), 2);
        assert_eq!(buffer.cursor_y, 1);
    }

    #[test]
    fn input_buffer_edits_multibyte_text() {
        let mut buffer = InputBuffer::new();
        for ch in "olé!".chars() {
            buffer.insert_char(ch);
        }
        buffer.move_left();
        buffer.delete_char();
        buffer.insert_char('e');

        assert_eq!(buffer.text(), "ole!");
        assert_eq!(buffer.cursor_x, 3);
    }

    #[test]
    fn backspace_at_line_start_joins_lines() {
        let mut buffer = InputBuffer::new();
        buffer.insert_char('a');
        buffer.new_line();
        buffer.insert_char('b');
        buffer.move_left();
        buffer.delete_char();

        assert_eq!(buffer.text(), "ab");
        assert_eq!(buffer.cursor_x, 1);
    }

    #[test]
    fn assistant_turn_lists_thinking_before_content() {
        let turn = ConversationTurn {
            role: Role::Assistant,
            content: "answer".to_string(),
            thinking: Some("step one".to_string()),
        };
        let lines: Vec<String> = turn_lines(&turn).into_iter().map(|l| l.text).collect();
        assert_eq!(lines, vec!["Connect:", "  ┆ step one", "  answer"]);
    }

    #[test]
    fn rendered_height_wraps_by_chars() {
        let lines = vec![LineSpec::new("ééééé", Style::default())];
        assert_eq!(rendered_height(&lines, 2), 3);
        assert_eq!(rendered_height(&[], 10), 0);
    }
}
