//! TerminalEvents — implements the [`AppEvents`] port by printing to stdout.

use std::io::Write;

use async_trait::async_trait;

use swarmchat_core::application::ports::{AppEvents, ChatEvent};

/// Prints every event as `[label] text`.
///
/// Logs go to stderr, so stdout only ever carries chat and status lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalEvents;

pub fn render(event: &ChatEvent) -> String {
    format!("[{}] {}", event.label(), event.text())
}

#[async_trait]
impl AppEvents for TerminalEvents {
    async fn emit(&self, event: ChatEvent) {
        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(stdout, "{}", render(&event));
        let _ = stdout.flush();
    }
}
