//! Chat surface that prints to the terminal.
//!
//! Streaming placeholders are printed incrementally; only the part of the
//! content not yet on screen is written on each update.

use std::io::Write;

use pocketcode_core::surface::{ChatSurface, DisplayKind, DisplayMessage};
use pocketcode_core::{Role, ToolStatus};

pub struct TerminalSurface<W: Write + Send> {
    out: W,
    messages: Vec<DisplayMessage>,
    /// Position being streamed and how many bytes of it are on screen.
    live: Option<(usize, usize)>,
}

impl TerminalSurface<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> TerminalSurface<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            messages: Vec::new(),
            live: None,
        }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }

    fn write(&mut self, text: &str) {
        // a closed terminal is not worth failing the session over
        let _ = self.out.write_all(text.as_bytes());
        let _ = self.out.flush();
    }

    fn stream(&mut self, position: usize, message: &DisplayMessage) {
        let printed = match self.live {
            Some((live, printed)) if live == position => printed,
            other => {
                if other.is_some() {
                    self.write("\n");
                }
                self.write("  Assistant > ");
                0
            }
        };
        let suffix = message.content.get(printed..).unwrap_or("");
        self.write(suffix);
        self.live = Some((position, printed.max(message.content.len())));
    }

    fn finish(&mut self, position: usize, message: &DisplayMessage) {
        match self.live.take() {
            Some((live, printed)) if live == position && message.kind == DisplayKind::Text => {
                let suffix = message.content.get(printed..).unwrap_or("");
                let tail = format!("{suffix}\n{}", render_details(message));
                self.write(&tail);
            }
            Some(_) => {
                self.write("\n");
                self.write(&render(message));
            }
            None => self.write(&render(message)),
        }
    }
}

impl<W: Write + Send> ChatSurface for TerminalSurface<W> {
    fn add_message(&mut self, message: DisplayMessage) -> usize {
        let position = self.messages.len();
        if message.streaming {
            self.stream(position, &message);
        } else if message.role != Role::User {
            self.finish(position, &message);
        }
        self.messages.push(message);
        position
    }

    fn update_message(&mut self, position: usize, message: DisplayMessage) {
        if position >= self.messages.len() {
            return;
        }
        if message.streaming {
            self.stream(position, &message);
        } else {
            self.finish(position, &message);
        }
        self.messages[position] = message;
    }

    fn get_message_at(&self, position: usize) -> Option<DisplayMessage> {
        self.messages.get(position).cloned()
    }

    // reasoning is never printed
    fn hide_thinking_message(&mut self) {}
}

/// Full rendering of a finished message.
pub fn render(message: &DisplayMessage) -> String {
    let mut out = String::new();
    match &message.kind {
        DisplayKind::Text | DisplayKind::Thinking => {
            for line in message.content.lines() {
                out.push_str(&format!("  Assistant > {line}\n"));
            }
        }
        DisplayKind::RunningTools => out.push_str(&format!("  ⚙ {}\n", message.content)),
        DisplayKind::Error { retry_prompt } => {
            out.push_str(&format!("  [Error] {}\n", message.content));
            if retry_prompt.is_some() {
                out.push_str("  Type /retry to send it again.\n");
            }
        }
        DisplayKind::Notice => out.push_str(&format!("  · {}\n", message.content)),
        DisplayKind::PlanStep { .. } => out.push_str(&format!("  ▸ {}\n", message.content)),
    }
    out.push_str(&render_details(message));
    out
}

/// Tool usages and proposed file changes, one per line.
fn render_details(message: &DisplayMessage) -> String {
    let mut out = String::new();
    for usage in &message.tool_usages {
        let mark = match usage.status {
            ToolStatus::Completed => "✓",
            ToolStatus::Failed => "✗",
            ToolStatus::Pending | ToolStatus::Running => "…",
        };
        let target = usage
            .file_path
            .as_deref()
            .map(|p| format!(" {p}"))
            .unwrap_or_default();
        out.push_str(&format!(
            "    {mark} {}{target} ({} ms)\n",
            usage.tool_name,
            usage.duration.as_millis()
        ));
    }
    for change in &message.file_changes {
        let operation = format!("{:?}", change.operation).to_lowercase();
        out.push_str(&format!("    {operation} {}\n", change.path));
    }
    out
}
