//! Entity store
//!
//! The engine sees persistence only through [`Store`]: value-typed entities,
//! find-by-predicate, and whole-record writes. Creating a staging is the one
//! operation that must be atomic (check that the branch has no active staging
//! and insert), which is how two concurrent ticks are kept from double-staging.

mod memory;
mod storage;

pub use memory::{MemoryStore, StoreData};
pub use storage::{load_state, save_state};

use crate::error::Result;
use crate::types::{
    Batch, BatchId, Commit, Feedback, NewPullRequest, NewStaging, PrId, PullRequest, Split,
    SplitId, Staging, StagingId,
};

/// Persistence interface used by the engine
pub trait Store: Send + Sync {
    // Pull requests

    /// Register a new PR (state `opened`, priority normal)
    fn create_pr(&self, pr: NewPullRequest) -> Result<PullRequest>;
    /// PR by id
    fn get_pr(&self, id: PrId) -> Result<PullRequest>;
    /// PR by repository and number
    fn find_pr(&self, repository: &str, number: u64) -> Result<Option<PullRequest>>;
    /// PRs matching `filter`, ordered by id
    fn search_prs(&self, filter: &dyn Fn(&PullRequest) -> bool) -> Result<Vec<PullRequest>>;
    /// Overwrite a PR record
    fn write_pr(&self, pr: &PullRequest) -> Result<()>;
    /// Forget a PR
    fn delete_pr(&self, id: PrId) -> Result<()>;

    // Batches

    /// Create an active batch; PRs must share the target and come from
    /// distinct repositories
    fn create_batch(&self, target: &str, prs: &[PrId]) -> Result<Batch>;
    /// Batch by id
    fn get_batch(&self, id: BatchId) -> Result<Batch>;
    /// Overwrite a batch record
    fn write_batch(&self, batch: &Batch) -> Result<()>;

    // Stagings

    /// Active staging of a branch
    fn active_staging(&self, target: &str) -> Result<Option<Staging>>;
    /// Create a staging, failing with
    /// [`Error::StagingExists`](crate::error::Error::StagingExists) if the
    /// branch already has an active one
    fn create_staging(&self, staging: NewStaging) -> Result<Staging>;
    /// Staging by id
    fn get_staging(&self, id: StagingId) -> Result<Staging>;
    /// Overwrite a staging record
    fn write_staging(&self, staging: &Staging) -> Result<()>;
    /// Stagings matching `filter`, ordered by id
    fn search_stagings(&self, filter: &dyn Fn(&Staging) -> bool) -> Result<Vec<Staging>>;

    // Splits

    /// Record the sub-batch sets of a failed staging
    fn create_split(&self, target: &str, parts: Vec<Vec<BatchId>>) -> Result<Split>;
    /// Pending splits of a branch, oldest first
    fn splits(&self, target: &str) -> Result<Vec<Split>>;
    /// Overwrite a split record
    fn write_split(&self, split: &Split) -> Result<()>;
    /// Remove a split
    fn delete_split(&self, id: SplitId) -> Result<()>;

    // Commits

    /// Status cache of a commit
    fn get_commit(&self, sha: &str) -> Result<Option<Commit>>;
    /// Insert or overwrite a commit record
    fn write_commit(&self, commit: &Commit) -> Result<()>;
    /// Commits flagged for re-validation
    fn commits_to_check(&self) -> Result<Vec<Commit>>;

    // Feedback

    /// Queue a comment (and optional close) for a PR
    fn push_feedback(&self, repository: &str, number: u64, message: Option<String>, close: bool)
    -> Result<()>;
    /// Queued feedback, oldest first
    fn pending_feedback(&self) -> Result<Vec<Feedback>>;
    /// Drop a sent feedback entry
    fn remove_feedback(&self, id: u64) -> Result<()>;

    /// Persist pending changes, if the store is backed by something durable
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
