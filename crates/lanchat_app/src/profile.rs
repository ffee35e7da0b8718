//! Persisted local identity: `~/.lanchat/profile.json` holding `{id, name}`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use lanchat_network::PeerIdentity;

pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the saved identity.
    ///
    /// A missing file yields `None`. A corrupt file is removed and also
    /// yields `None`, so the caller falls through to first-run setup.
    pub fn load(&self) -> Option<PeerIdentity> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Cannot read profile {}: {e}", self.path.display());
                return None;
            }
        };

        match serde_json::from_str::<PeerIdentity>(&content) {
            Ok(identity) if !identity.name.trim().is_empty() => Some(identity),
            Ok(_) => {
                warn!("Profile {} has an empty name, recreating", self.path.display());
                self.discard();
                None
            }
            Err(e) => {
                warn!("Corrupt profile {}, recreating: {e}", self.path.display());
                self.discard();
                None
            }
        }
    }

    pub fn save(&self, identity: &PeerIdentity) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(identity)?;
        std::fs::write(&self.path, content)
            .with_context(|| format!("Failed to write profile: {}", self.path.display()))?;
        info!("Saved profile to {}", self.path.display());
        Ok(())
    }

    fn discard(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Could not remove {}: {e}", self.path.display());
        }
    }
}
