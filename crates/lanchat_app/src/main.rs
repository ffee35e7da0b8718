//! LAN Chat — terminal client.
//!
//! Host a chat room on the local network or discover and join one.

mod config;
mod console;
mod logging;
mod menu;
mod profile;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use crate::config::AppConfig;
use crate::console::Prompt;
use crate::menu::App;
use crate::profile::ProfileStore;

/// Serverless chat for the local network.
#[derive(Parser)]
#[command(name = "lanchat", version, about)]
struct Cli {
    /// Path to the config file (default: ~/.lanchat/config.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the profile file (default: ~/.lanchat/profile.json).
    #[arg(long)]
    profile: Option<PathBuf>,

    /// Display name to use, saved to the profile.
    #[arg(long)]
    name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => AppConfig::config_path()?,
    };
    let config = AppConfig::load_from_path(&config_path)?;

    let _guard = logging::init_logging(&AppConfig::logs_dir()?, &config.log_level)?;
    info!("LAN Chat v{} starting", env!("CARGO_PKG_VERSION"));

    let profile_path = match cli.profile {
        Some(path) => path,
        None => AppConfig::profile_path()?,
    };
    let store = ProfileStore::new(profile_path);
    info!("Using profile {}", store.path().display());

    let mut prompt = Prompt::stdin();
    let identity = menu::load_or_create_identity(&store, cli.name, &mut prompt).await?;
    info!("Running as '{}' ({})", identity.name, identity.id);

    let mut app = App::new(identity, config);
    app.run(&mut prompt).await?;

    info!("LAN Chat exiting");
    Ok(())
}
