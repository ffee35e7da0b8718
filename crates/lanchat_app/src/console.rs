//! Line input and text rendering for the terminal UI.

use std::io::Write;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines, Stdin};

use lanchat_network::identity::peer_placeholder;
use lanchat_network::{ContactDirectory, DiscoveredHost, HistoryEntry, SessionEvent};

/// Words that leave a chat and return to the menu.
const QUIT_WORDS: [&str; 3] = ["sair", "quit", "/quit"];

/// Line-oriented input shared by the menu and the chat loop.
pub struct Prompt<R> {
    lines: Lines<R>,
}

impl Prompt<BufReader<Stdin>> {
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

impl<R: AsyncBufRead + Unpin> Prompt<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
        }
    }

    /// Next raw line, `None` at end of input. Cancel-safe, so it can sit in a
    /// `select!` next to session events.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        self.lines
            .next_line()
            .await
            .context("Failed to read input")
    }

    /// Print `question` without a newline and read the trimmed answer.
    pub async fn ask(&mut self, question: &str) -> Result<Option<String>> {
        print!("{question}");
        std::io::stdout().flush().ok();
        Ok(self.next_line().await?.map(|line| line.trim().to_string()))
    }
}

pub fn is_quit(line: &str) -> bool {
    let line = line.trim();
    QUIT_WORDS.iter().any(|w| line.eq_ignore_ascii_case(w))
}

/// Parse a 1-based menu pick into a 0-based index.
pub fn parse_choice(input: &str, count: usize) -> Option<usize> {
    match input.trim().parse::<usize>() {
        Ok(n) if (1..=count).contains(&n) => Some(n - 1),
        _ => None,
    }
}

pub fn render_hosts(hosts: &[DiscoveredHost]) -> Vec<String> {
    hosts
        .iter()
        .enumerate()
        .map(|(i, h)| format!("  {}. '{}' ({})", i + 1, h.host_name, h.chat_addr()))
        .collect()
}

/// Text for a session event, or `None` for events that stay in the log.
pub fn render_event(event: &SessionEvent) -> Option<String> {
    match event {
        SessionEvent::Hosting { addr, host_id } => Some(format!(
            "--- Chat server started on {addr} ---\nWaiting for friends on the same network...\nYour chat code: {host_id}"
        )),
        SessionEvent::Announcing { .. } => None,
        SessionEvent::JoinedHost { addr } => Some(format!("Connected to chat at {addr}.")),
        SessionEvent::PeerConnected { addr } => Some(format!("New friend connected: {addr}")),
        SessionEvent::PeerIntroduced { name, id, .. } => {
            Some(format!("{name} ({id}) joined the chat."))
        }
        SessionEvent::ContactAdded { id, name } => {
            Some(format!("New contact added: {name} (code: {id})"))
        }
        SessionEvent::Chat {
            sender_name,
            content,
            is_local,
            ..
        } => {
            if *is_local {
                Some(format!("[Me]: {content}"))
            } else {
                Some(format!("[{sender_name}]: {content}"))
            }
        }
        SessionEvent::PeerDisconnected { addr, name } => match name {
            Some(name) => Some(format!("{name} disconnected.")),
            None => Some(format!("{addr} disconnected.")),
        },
        SessionEvent::Stopped { .. } => Some("Chat closed.".to_string()),
    }
}

/// Every history entry as `[sender]: content`, senders resolved through the
/// directory.
pub fn render_history(entries: &[HistoryEntry], contacts: &ContactDirectory) -> Vec<String> {
    entries
        .iter()
        .map(|entry| {
            let sender = if entry.is_local {
                "Me".to_string()
            } else {
                contacts
                    .resolve(&entry.sender_id)
                    .unwrap_or_else(|| peer_placeholder(&entry.sender_id))
            };
            format!(
                "{} [{sender}]: {}",
                entry.timestamp.format("%H:%M:%S"),
                entry.content
            )
        })
        .collect()
}
