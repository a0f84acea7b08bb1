//! Terminal verbs for the chat loop.
//!
//! Maps stdin lines onto controller verbs and renders turn events. Anything
//! that is not a recognized slash command is sent as a user message.

use std::io::Write;

use tokio::sync::broadcast;

use crate::chat_core::TurnEvent;

pub const HELP: &str = "type a message, or /retry, /clear, /reset, /help, /quit";

/// One line of user input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    Send(&'a str),
    Retry,
    ClearError,
    Reset,
    Help,
    Quit,
}

impl<'a> Command<'a> {
    pub fn parse(line: &'a str) -> Self {
        match line.trim() {
            "/retry" => Command::Retry,
            "/clear" => Command::ClearError,
            "/reset" => Command::Reset,
            "/help" => Command::Help,
            "/quit" | "/exit" => Command::Quit,
            _ => Command::Send(line),
        }
    }
}

/// Print reply text as it streams in. Runs until the controller goes away.
pub async fn print_events(mut events: broadcast::Receiver<TurnEvent>) {
    let mut stdout = std::io::stdout();
    loop {
        match events.recv().await {
            Ok(TurnEvent::Delta { text, .. }) => {
                let _ = write!(stdout, "{text}");
                let _ = stdout.flush();
            }
            Ok(TurnEvent::Completed { .. }) => {
                let _ = writeln!(stdout);
            }
            Ok(TurnEvent::Failed { error }) => {
                let _ = writeln!(stdout);
                eprintln!("error: {error} (/retry to try again)");
            }
            Ok(TurnEvent::Started { .. }) | Ok(TurnEvent::Reset) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "printer fell behind, some reply text was not shown");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
