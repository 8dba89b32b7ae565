//! Scheduler: one tick runs every periodic job of the merge bot
//!
//! Branches are processed sequentially and each branch is isolated, an error
//! on one is logged and does not keep the others from progressing.

use crate::config::Config;
use crate::error::Result;
use crate::feedback;
use crate::git::{GitCache, Repo};
use crate::remote::RemoteClient;
use crate::staging;
use crate::store::Store;
use crate::types::{StagingId, StagingState};
use crate::validator;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// What a tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Commits whose statuses were re-validated
    pub commits_checked: usize,
    /// Stagings that reached a final state, with that state
    pub stagings_finished: Vec<(StagingId, StagingState)>,
    /// Stagings created
    pub stagings_created: Vec<StagingId>,
    /// Feedback entries delivered
    pub feedback_sent: usize,
}

/// The merge engine and its injected collaborators
pub struct Engine {
    pub(crate) config: Arc<Config>,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) remote: Arc<dyn RemoteClient>,
    pub(crate) git: GitCache,
    token: String,
    /// Held by everything touching the local mirrors
    git_lock: Mutex<()>,
}

impl Engine {
    /// Engine over `store` and `remote`, mirrors cached under the configured
    /// cache directory
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn Store>,
        remote: Arc<dyn RemoteClient>,
        token: impl Into<String>,
    ) -> Self {
        let git = GitCache::new(config.cache_dir());
        Self {
            config,
            store,
            remote,
            git,
            token: token.into(),
            git_lock: Mutex::new(()),
        }
    }

    /// Project configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Entity store
    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    /// GitHub client
    pub fn remote(&self) -> &dyn RemoteClient {
        self.remote.as_ref()
    }

    /// Local mirror of `repository`
    pub(crate) fn local_repo(&self, repository: &str) -> Result<Repo> {
        self.git
            .get_local(repository, &self.config.git_url(repository, &self.token))
    }

    /// Run every periodic job once
    pub async fn tick(&self) -> Result<TickReport> {
        let mut report = TickReport {
            commits_checked: validator::check_commits(self)?,
            ..TickReport::default()
        };

        let branches: Vec<String> = self.config.active_branches().map(String::from).collect();

        for branch in &branches {
            match validator::check_staging(self, branch).await {
                Ok(Some(done)) => report.stagings_finished.push(done),
                Ok(None) => {}
                Err(e) => error!(branch, error = %e, "failed to check staging"),
            }
        }

        {
            let _guard = self.git_lock.lock().await;
            for branch in &branches {
                match staging::create_staging(self, branch).await {
                    Ok(Some(staging)) => {
                        info!(branch, staging = staging.id, batches = ?staging.batches, "created staging");
                        report.stagings_created.push(staging.id);
                    }
                    Ok(None) => debug!(branch, "nothing to stage"),
                    Err(e) => error!(branch, error = %e, "failed to create staging"),
                }
            }
        }

        if let Err(e) = feedback::sync_labels(self).await {
            warn!(error = %e, "failed to update labels");
        }
        report.feedback_sent = feedback::send_feedback(self).await?;

        self.store.flush()?;
        Ok(report)
    }

    /// Aggressive gc of every cached mirror, returns how many were collected
    pub async fn maintenance(&self) -> Result<usize> {
        let _guard = self.git_lock.lock().await;
        let repos = self.git.cached()?;
        for repo in &repos {
            info!(path = %repo.path().display(), "running gc");
            repo.gc()?;
        }
        Ok(repos.len())
    }

    /// Delete the `tmp.*` and `staging.*` branches of inactive branches
    pub async fn cleanup_scratch_branches(&self) -> Result<usize> {
        let mut deleted = 0;
        for branch in self.config.inactive_branches() {
            for repo in &self.config.repositories {
                for scratch in [format!("tmp.{branch}"), format!("staging.{branch}")] {
                    debug!(repository = %repo.name, branch = %scratch, "deleting scratch branch");
                    self.remote.delete_ref(&repo.name, &scratch).await?;
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("project", &self.config.project.name)
            .field("git", &self.git)
            .finish_non_exhaustive()
    }
}
