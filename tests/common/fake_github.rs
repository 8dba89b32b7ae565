//! Fake GitHub backed by local bare repositories
//!
//! Refs, fast-forwards and pushes happen for real in the origin repositories,
//! everything else (PR metadata, statuses, comments, labels) lives in memory.

#![allow(dead_code)]

use async_trait::async_trait;
use mergebot::error::{Error, Result};
use mergebot::git::Repo;
use mergebot::remote::RemoteClient;
use mergebot::types::{PrCommit, RemotePullRequest, RemoteStatus};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

type PrKey = (String, u64);

/// Call record for `comment`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentCall {
    pub repository: String,
    pub number: u64,
    pub body: String,
}

/// Call record for `fast_forward` and `set_ref`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefCall {
    pub repository: String,
    pub branch: String,
    pub sha: String,
}

/// In-memory GitHub over the bare repositories under `root`
pub struct FakeGitHub {
    root: PathBuf,
    pulls: Mutex<HashMap<PrKey, (RemotePullRequest, Vec<PrCommit>)>>,
    statuses: Mutex<HashMap<String, Vec<RemoteStatus>>>,
    labels: Mutex<HashMap<PrKey, Vec<String>>>,
    // Call tracking
    comment_calls: Mutex<Vec<CommentCall>>,
    close_calls: Mutex<Vec<PrKey>>,
    fast_forward_calls: Mutex<Vec<RefCall>>,
    set_ref_calls: Mutex<Vec<RefCall>>,
    // Error injection: remaining rejected fast-forwards per (repository, branch)
    fast_forward_failures: Mutex<HashMap<(String, String), usize>>,
    error_on_statuses: Mutex<Option<String>>,
}

impl FakeGitHub {
    /// Fake serving the bare repositories under `root` (`root/owner/name`)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            pulls: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
            labels: Mutex::new(HashMap::new()),
            comment_calls: Mutex::new(Vec::new()),
            close_calls: Mutex::new(Vec::new()),
            fast_forward_calls: Mutex::new(Vec::new()),
            set_ref_calls: Mutex::new(Vec::new()),
            fast_forward_failures: Mutex::new(HashMap::new()),
            error_on_statuses: Mutex::new(None),
        }
    }

    /// Origin repository of `repository`
    pub fn origin(&self, repository: &str) -> Repo {
        Repo::new(self.root.join(repository))
    }

    /// Directory holding the origins
    pub fn root(&self) -> &Path {
        &self.root
    }

    // === Setup ===

    /// Register (or replace) a PR and its commits, oldest first
    pub fn set_pull_request(&self, repository: &str, pr: RemotePullRequest, commits: Vec<PrCommit>) {
        self.pulls
            .lock()
            .unwrap()
            .insert((repository.to_string(), pr.number), (pr, commits));
    }

    /// Report a status on a commit, replacing one with the same context
    pub fn set_status(&self, sha: &str, status: RemoteStatus) {
        let mut statuses = self.statuses.lock().unwrap();
        let entry = statuses.entry(sha.to_string()).or_default();
        entry.retain(|s| s.context != status.context);
        entry.push(status);
    }

    // === Error injection ===

    /// Reject the next `times` fast-forwards of `repository:branch`
    pub fn fail_fast_forward(&self, repository: &str, branch: &str, times: usize) {
        self.fast_forward_failures
            .lock()
            .unwrap()
            .insert((repository.to_string(), branch.to_string()), times);
    }

    /// Make `statuses` return an error
    pub fn fail_statuses(&self, msg: &str) {
        *self.error_on_statuses.lock().unwrap() = Some(msg.to_string());
    }

    // === Call inspection ===

    pub fn comments(&self) -> Vec<CommentCall> {
        self.comment_calls.lock().unwrap().clone()
    }

    pub fn comments_on(&self, repository: &str, number: u64) -> Vec<String> {
        self.comments()
            .into_iter()
            .filter(|c| c.repository == repository && c.number == number)
            .map(|c| c.body)
            .collect()
    }

    pub fn closed(&self) -> Vec<PrKey> {
        self.close_calls.lock().unwrap().clone()
    }

    pub fn fast_forwards(&self) -> Vec<RefCall> {
        self.fast_forward_calls.lock().unwrap().clone()
    }

    pub fn set_refs(&self) -> Vec<RefCall> {
        self.set_ref_calls.lock().unwrap().clone()
    }

    pub fn labels_of(&self, repository: &str, number: u64) -> Vec<String> {
        self.labels
            .lock()
            .unwrap()
            .get(&(repository.to_string(), number))
            .cloned()
            .unwrap_or_default()
    }

    /// Current sha of a branch of an origin, if it exists
    pub fn branch(&self, repository: &str, branch: &str) -> Option<String> {
        let result = self
            .origin(repository)
            .exec(&["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")])
            .ok()?;
        result.success().then(|| result.stdout.trim().to_string())
    }

    fn update_ref(&self, repository: &str, branch: &str, sha: &str) -> Result<()> {
        let result = self
            .origin(repository)
            .exec(&["update-ref", &format!("refs/heads/{branch}"), sha])?;
        if result.success() {
            Ok(())
        } else {
            Err(Error::GitHubApi(result.combined_output()))
        }
    }

    fn is_ancestor(&self, repository: &str, ancestor: &str, sha: &str) -> bool {
        self.origin(repository)
            .exec(&["merge-base", "--is-ancestor", ancestor, sha])
            .is_ok_and(|r| r.success())
    }
}

#[async_trait]
impl RemoteClient for FakeGitHub {
    async fn head(&self, repository: &str, branch: &str) -> Result<String> {
        self.branch(repository, branch).ok_or_else(|| Error::NotFound {
            kind: "branch",
            id: format!("{repository}:{branch}"),
        })
    }

    async fn pull_request(&self, repository: &str, number: u64) -> Result<RemotePullRequest> {
        self.pulls
            .lock()
            .unwrap()
            .get(&(repository.to_string(), number))
            .map(|(pr, _)| pr.clone())
            .ok_or_else(|| Error::NotFound {
                kind: "pull request",
                id: format!("{repository}#{number}"),
            })
    }

    async fn commits(&self, repository: &str, number: u64) -> Result<Vec<PrCommit>> {
        self.pulls
            .lock()
            .unwrap()
            .get(&(repository.to_string(), number))
            .map(|(_, commits)| commits.clone())
            .ok_or_else(|| Error::NotFound {
                kind: "pull request",
                id: format!("{repository}#{number}"),
            })
    }

    async fn statuses(&self, _repository: &str, sha: &str) -> Result<Vec<RemoteStatus>> {
        if let Some(msg) = self.error_on_statuses.lock().unwrap().clone() {
            return Err(Error::GitHubApi(msg));
        }
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(sha)
            .cloned()
            .unwrap_or_default())
    }

    async fn fast_forward(&self, repository: &str, branch: &str, sha: &str) -> Result<()> {
        self.fast_forward_calls.lock().unwrap().push(RefCall {
            repository: repository.to_string(),
            branch: branch.to_string(),
            sha: sha.to_string(),
        });
        let rejected = {
            let mut failures = self.fast_forward_failures.lock().unwrap();
            match failures.get_mut(&(repository.to_string(), branch.to_string())) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            }
        };
        let current = self.head(repository, branch).await?;
        if rejected || !self.is_ancestor(repository, &current, sha) {
            return Err(Error::FastForward {
                repository: repository.to_string(),
                branch: branch.to_string(),
                sha: sha.to_string(),
                reason: "Update is not a fast forward".to_string(),
            });
        }
        self.update_ref(repository, branch, sha)
    }

    async fn set_ref(&self, repository: &str, branch: &str, sha: &str) -> Result<()> {
        self.set_ref_calls.lock().unwrap().push(RefCall {
            repository: repository.to_string(),
            branch: branch.to_string(),
            sha: sha.to_string(),
        });
        self.update_ref(repository, branch, sha)
    }

    async fn delete_ref(&self, repository: &str, branch: &str) -> Result<()> {
        self.origin(repository)
            .exec(&["update-ref", "-d", &format!("refs/heads/{branch}")])?;
        Ok(())
    }

    async fn comment(&self, repository: &str, number: u64, body: &str) -> Result<()> {
        self.comment_calls.lock().unwrap().push(CommentCall {
            repository: repository.to_string(),
            number,
            body: body.to_string(),
        });
        Ok(())
    }

    async fn close(&self, repository: &str, number: u64) -> Result<()> {
        self.close_calls
            .lock()
            .unwrap()
            .push((repository.to_string(), number));
        Ok(())
    }

    async fn labels(&self, repository: &str, number: u64) -> Result<Vec<String>> {
        Ok(self.labels_of(repository, number))
    }

    async fn replace_labels(&self, repository: &str, number: u64, labels: &[String]) -> Result<()> {
        self.labels
            .lock()
            .unwrap()
            .insert((repository.to_string(), number), labels.to_vec());
        Ok(())
    }
}
