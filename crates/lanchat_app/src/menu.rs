//! Main menu and the interactive chat loop.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::AsyncBufRead;
use tracing::{info, warn};

use lanchat_network::discovery::{self, select_host};
use lanchat_network::{
    ClientSession, ContactDirectory, DiscoveredHost, EventReceiver, EventSink, HostSession,
    MessageHistory, NetworkError, PeerIdentity, Selection, Session, SessionContext,
};

use crate::config::AppConfig;
use crate::console::{self, Prompt};
use crate::profile::ProfileStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuChoice {
    Host,
    Join,
    ShowIdentity,
    ShowHistory,
    Exit,
}

impl MenuChoice {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim() {
            "1" => Some(Self::Host),
            "2" => Some(Self::Join),
            "3" => Some(Self::ShowIdentity),
            "4" => Some(Self::ShowHistory),
            "5" => Some(Self::Exit),
            _ => None,
        }
    }
}

/// Load the saved identity or run first-time setup.
///
/// `name_override` (from `--name`) replaces the saved display name and is
/// persisted.
pub async fn load_or_create_identity<R: AsyncBufRead + Unpin>(
    store: &ProfileStore,
    name_override: Option<String>,
    prompt: &mut Prompt<R>,
) -> Result<PeerIdentity> {
    let override_name = name_override
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty());

    if let Some(mut identity) = store.load() {
        if let Some(name) = override_name {
            identity.name = name;
            store.save(&identity)?;
        }
        println!("Welcome back, {}! Your chat code is: {}", identity.name, identity.id);
        return Ok(identity);
    }

    let name = match override_name {
        Some(name) => name,
        None => {
            println!("Welcome");
            let mut answer = prompt.ask("Please enter your user name: ").await?;
            loop {
                match answer {
                    None => anyhow::bail!("Input closed before a name was entered"),
                    Some(ref name) if !name.is_empty() => break name.clone(),
                    Some(_) => {
                        answer = prompt
                            .ask("The name cannot be empty. Enter your user name: ")
                            .await?;
                    }
                }
            }
        }
    };

    let identity = PeerIdentity::generate(name);
    store.save(&identity)?;
    println!("Hello, {}! Your unique chat code is: {}", identity.name, identity.id);
    println!("Keep this code to share with your friends.");
    Ok(identity)
}

/// Application state that outlives individual chat sessions.
pub struct App {
    identity: PeerIdentity,
    config: AppConfig,
    contacts: Arc<ContactDirectory>,
    history: Arc<MessageHistory>,
}

impl App {
    pub fn new(identity: PeerIdentity, config: AppConfig) -> Self {
        Self {
            identity,
            config,
            contacts: Arc::new(ContactDirectory::new()),
            history: Arc::new(MessageHistory::new()),
        }
    }

    pub async fn run<R: AsyncBufRead + Unpin>(&mut self, prompt: &mut Prompt<R>) -> Result<()> {
        loop {
            println!();
            println!("--- Main Menu ---");
            println!("1. Host a new chat");
            println!("2. Join a chat on this network");
            println!("3. Show my chat code");
            println!("4. Show message history");
            println!("5. Exit");

            let Some(answer) = prompt.ask("Choose an option: ").await? else {
                break;
            };

            match MenuChoice::parse(&answer) {
                Some(MenuChoice::Host) => {
                    if let Err(e) = self.host(prompt).await {
                        println!("Could not host a chat: {e:#}");
                    }
                }
                Some(MenuChoice::Join) => {
                    if let Err(e) = self.join(prompt).await {
                        println!("Could not join a chat: {e:#}");
                    }
                }
                Some(MenuChoice::ShowIdentity) => self.show_identity(),
                Some(MenuChoice::ShowHistory) => self.show_history(),
                Some(MenuChoice::Exit) => break,
                None => println!("Invalid option. Try again."),
            }
        }

        println!("Goodbye.");
        Ok(())
    }

    fn context(&self) -> (SessionContext, EventReceiver) {
        let (events, rx) = EventSink::channel();
        let ctx = SessionContext {
            identity: self.identity.clone(),
            config: self.config.network.clone(),
            contacts: Arc::clone(&self.contacts),
            history: Arc::clone(&self.history),
            events,
        };
        (ctx, rx)
    }

    async fn host<R: AsyncBufRead + Unpin>(&mut self, prompt: &mut Prompt<R>) -> Result<()> {
        let (ctx, mut events) = self.context();
        let mut session = HostSession::new(ctx);

        match session.start().await {
            Ok(()) => {}
            Err(NetworkError::BindFailed { addr, .. }) => {
                anyhow::bail!(
                    "port {} is already in use or a server is already running on {addr}",
                    addr.port()
                );
            }
            Err(NetworkError::AddressUnavailable(reason)) => {
                anyhow::bail!("could not detect your local IP ({reason}); check your network");
            }
            Err(e) => return Err(e.into()),
        }

        println!("Type messages and press Enter. 'sair', 'quit' or '/quit' leaves the chat.");
        chat_loop(&mut session, &mut events, prompt).await
    }

    async fn join<R: AsyncBufRead + Unpin>(&mut self, prompt: &mut Prompt<R>) -> Result<()> {
        println!();
        println!("--- Searching for chats on the local network... ---");
        let network = &self.config.network;
        let hosts = discovery::scan(network.discovery_port, &self.identity.id, network.scan_window)
            .await?;

        let Some(target) = self.choose_host(hosts, prompt).await? else {
            return Ok(());
        };

        println!("Connecting to '{}' ({})...", target.host_name, target.chat_addr());
        let (ctx, mut events) = self.context();
        let mut session = ClientSession::for_host(ctx, &target);
        session.start().await?;

        println!("Type messages and press Enter. 'sair', 'quit' or '/quit' leaves the chat.");
        chat_loop(&mut session, &mut events, prompt).await
    }

    async fn choose_host<R: AsyncBufRead + Unpin>(
        &self,
        hosts: Vec<DiscoveredHost>,
        prompt: &mut Prompt<R>,
    ) -> Result<Option<DiscoveredHost>> {
        match select_host(hosts) {
            Selection::NotFound => {
                println!("No chat found on your local network. Make sure a friend is hosting.");
                Ok(None)
            }
            Selection::Single(host) => Ok(Some(host)),
            Selection::Multiple(mut hosts) => {
                println!("Chats found:");
                for line in console::render_hosts(&hosts) {
                    println!("{line}");
                }
                loop {
                    let Some(answer) = prompt.ask("Enter the number of the chat to join: ").await?
                    else {
                        return Ok(None);
                    };
                    match console::parse_choice(&answer, hosts.len()) {
                        Some(idx) => return Ok(Some(hosts.swap_remove(idx))),
                        None => println!("Invalid number. Try again."),
                    }
                }
            }
        }
    }

    fn show_identity(&self) {
        println!();
        println!("Your chat name: {}", self.identity.name);
        println!("Your chat code: {}", self.identity.id);
    }

    fn show_history(&self) {
        let entries = self.history.entries();
        if entries.is_empty() {
            println!();
            println!("--- No messages in this session's history. ---");
            return;
        }
        println!();
        println!("--- Message History ---");
        for line in console::render_history(&entries, &self.contacts) {
            println!("{line}");
        }
        println!("-----------------------");
    }
}

/// Relay stdin lines into the session and print its events until the user
/// quits, input ends, Ctrl+C arrives, or the session ends by itself.
pub async fn chat_loop<S, R>(
    session: &mut S,
    events: &mut EventReceiver,
    prompt: &mut Prompt<R>,
) -> Result<()>
where
    S: Session + ?Sized,
    R: AsyncBufRead + Unpin,
{
    let mut ended = session.shutdown_signal();

    loop {
        tokio::select! {
            line = prompt.next_line() => {
                let Some(line) = line? else {
                    info!("Input closed, leaving chat");
                    break;
                };
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                if console::is_quit(text) {
                    break;
                }
                if let Err(e) = session.send_chat(text).await {
                    warn!("Send failed: {e}");
                    println!("Message not sent: {e}");
                }
            }
            Some(event) = events.recv() => {
                if let Some(line) = console::render_event(&event) {
                    println!("{line}");
                }
            }
            // Resolves at once if the session already ended before the loop.
            _ = ended.wait_for(|stopped| *stopped) => {
                println!("The connection was closed.");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    session.stop().await;
    while let Ok(event) = events.try_recv() {
        if let Some(line) = console::render_event(&event) {
            println!("{line}");
        }
    }
    Ok(())
}
