//! Remote façade over the GitHub API
//!
//! The engine only talks to GitHub through [`RemoteClient`], constructed once
//! and injected, so the staging and validation logic can run against a fake.

mod github;
pub mod retry;

pub use github::GitHubService;

use crate::error::Result;
use crate::types::{PrCommit, RemotePullRequest, RemoteStatus};
use async_trait::async_trait;

/// Maximum number of commits a PR may have to be staged (API pagination limit)
pub const MAX_PR_COMMITS: usize = 250;

/// Repository-scoped GitHub operations, `repository` is always `owner/name`
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Current sha of a branch
    async fn head(&self, repository: &str, branch: &str) -> Result<String>;

    /// Live PR data
    async fn pull_request(&self, repository: &str, number: u64) -> Result<RemotePullRequest>;

    /// PR commits, oldest first, topologically sorted
    async fn commits(&self, repository: &str, number: u64) -> Result<Vec<PrCommit>>;

    /// Statuses reported on a commit
    async fn statuses(&self, repository: &str, sha: &str) -> Result<Vec<RemoteStatus>>;

    /// Move a branch to a descendant commit; a non fast-forward update is
    /// rejected with [`Error::FastForward`](crate::error::Error::FastForward)
    async fn fast_forward(&self, repository: &str, branch: &str, sha: &str) -> Result<()>;

    /// Force a branch to `sha`, creating it if needed
    async fn set_ref(&self, repository: &str, branch: &str, sha: &str) -> Result<()>;

    /// Delete a branch, missing branches are not an error
    async fn delete_ref(&self, repository: &str, branch: &str) -> Result<()>;

    /// Post a comment on a PR
    async fn comment(&self, repository: &str, number: u64, body: &str) -> Result<()>;

    /// Close a PR
    async fn close(&self, repository: &str, number: u64) -> Result<()>;

    /// Labels currently set on a PR
    async fn labels(&self, repository: &str, number: u64) -> Result<Vec<String>>;

    /// Replace every label of a PR
    async fn replace_labels(&self, repository: &str, number: u64, labels: &[String])
    -> Result<()>;
}

/// Split `owner/name`
pub fn split_repository(repository: &str) -> Result<(&str, &str)> {
    repository
        .split_once('/')
        .filter(|(owner, name)| !owner.is_empty() && !name.is_empty())
        .ok_or_else(|| {
            crate::error::Error::Config(format!("invalid repository name {repository:?}"))
        })
}

/// Sort commits so parents come before children, keeping the API order otherwise
///
/// GitHub lists PR commits by date, which is wrong for rebased series with
/// out-of-order author dates.
pub fn topological_sort(commits: Vec<PrCommit>) -> Vec<PrCommit> {
    use std::collections::{HashMap, HashSet};

    let index: HashMap<String, usize> = commits
        .iter()
        .enumerate()
        .map(|(i, c)| (c.sha.clone(), i))
        .collect();
    let mut visited = HashSet::new();
    let mut order = Vec::with_capacity(commits.len());

    fn visit(
        i: usize,
        commits: &[PrCommit],
        index: &HashMap<String, usize>,
        visited: &mut HashSet<usize>,
        order: &mut Vec<usize>,
    ) {
        if !visited.insert(i) {
            return;
        }
        for parent in &commits[i].parents {
            if let Some(&p) = index.get(parent) {
                visit(p, commits, index, visited, order);
            }
        }
        order.push(i);
    }

    for i in 0..commits.len() {
        visit(i, &commits, &index, &mut visited, &mut order);
    }

    let mut slots: Vec<Option<PrCommit>> = commits.into_iter().map(Some).collect();
    order
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect()
}
