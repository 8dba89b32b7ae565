//! Shared command context for CLI commands
//!
//! Extracts the setup shared by every command: loading the configuration,
//! restoring the persisted store, and (for commands that talk to GitHub)
//! resolving credentials and building the engine.

use mergebot::auth::get_github_auth;
use mergebot::config::Config;
use mergebot::engine::Engine;
use mergebot::error::Result;
use mergebot::remote::GitHubService;
use mergebot::store::{MemoryStore, load_state};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Configuration and store, without any GitHub access
pub struct LocalContext {
    /// Project configuration
    pub config: Arc<Config>,
    /// Entity store, persisted to the configured state file
    pub store: Arc<MemoryStore>,
}

impl LocalContext {
    /// Load the configuration at `path` and the store it points to
    pub fn new(path: &Path) -> Result<Self> {
        let config = Config::load(path)?;
        let state_path = config.state_path();
        debug!(state = %state_path.display(), "loading state");
        let store = MemoryStore::with_data(load_state(&state_path)?, Some(state_path));
        Ok(Self {
            config: Arc::new(config),
            store: Arc::new(store),
        })
    }
}

/// Everything a command needs to drive the engine
pub struct CommandContext {
    /// Configuration and store
    pub local: LocalContext,
    /// The engine, wired to GitHub
    pub engine: Engine,
}

impl CommandContext {
    /// Load local state, resolve a token and build the engine
    pub async fn new(path: &Path) -> Result<Self> {
        let local = LocalContext::new(path)?;
        let auth = get_github_auth().await?;
        debug!(source = ?auth.source, "resolved GitHub credentials");

        let remote = GitHubService::new(&auth.token, &local.config.project.api_url)?;
        let engine = Engine::new(
            Arc::clone(&local.config),
            local.store.clone(),
            Arc::new(remote),
            auth.token,
        );
        Ok(Self { local, engine })
    }
}
