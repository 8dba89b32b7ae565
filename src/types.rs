//! Core types for mergebot

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Store identifier of a pull request
pub type PrId = u64;
/// Store identifier of a batch
pub type BatchId = u64;
/// Store identifier of a staging
pub type StagingId = u64;
/// Store identifier of a split
pub type SplitId = u64;

/// How a PR's commits are integrated into its target branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeMethod {
    /// Merge the PR head as-is with a merge commit
    Merge,
    /// Rebase the commits, then merge them with a merge commit
    RebaseMerge,
    /// Rebase the commits and fast-forward onto them
    RebaseFf,
    /// Squash everything into a single commit
    Squash,
}

impl MergeMethod {
    /// Every method, in the order they are offered to users
    pub const ALL: [Self; 4] = [Self::Merge, Self::RebaseMerge, Self::RebaseFf, Self::Squash];

    /// Command token / serialized name
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::RebaseMerge => "rebase-merge",
            Self::RebaseFf => "rebase-ff",
            Self::Squash => "squash",
        }
    }

    /// One-line description used in method-selection comments
    pub const fn description(self) -> &'static str {
        match self {
            Self::Merge => "integrate the PR with a simple merge commit, using the PR description as message",
            Self::RebaseMerge => "rebases the PR on top of the target branch then integrates with a merge commit, using the PR description as message",
            Self::RebaseFf => "rebases the PR on top of the target branch, then fast-forwards",
            Self::Squash => "squashes the PR as a single commit on the target branch, using the PR description as message",
        }
    }

    /// Whether the method replays the PR's commits one by one
    pub const fn is_rebase(self) -> bool {
        matches!(self, Self::RebaseMerge | Self::RebaseFf)
    }
}

impl fmt::Display for MergeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| format!("unknown merge method {s:?}"))
    }
}

/// Lifecycle state of a pull request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    /// Known, neither reviewed nor validated by CI
    Opened,
    /// Closed without merging (terminal)
    Closed,
    /// CI passed, review pending
    Validated,
    /// Reviewed, CI pending
    Approved,
    /// Reviewed and validated, eligible for staging
    Ready,
    /// Merged into the target (terminal)
    Merged,
    /// Staging or merging failed, needs a human
    Error,
}

impl PrState {
    /// Closed and merged PRs never come back into the queue
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Merged)
    }

    /// State after a successful `r+`
    pub const fn reviewed(self) -> Self {
        match self {
            Self::Opened => Self::Approved,
            Self::Validated => Self::Ready,
            other => other,
        }
    }

    /// State after `r-`
    pub const fn unreviewed(self) -> Self {
        match self {
            Self::Approved => Self::Opened,
            Self::Ready | Self::Error => Self::Validated,
            other => other,
        }
    }

    /// State after all required statuses succeeded
    pub const fn validated(self) -> Self {
        match self {
            Self::Opened => Self::Validated,
            Self::Approved => Self::Ready,
            other => other,
        }
    }

    /// State after the head changed, losing the CI validation
    pub const fn invalidated(self) -> Self {
        match self {
            Self::Validated => Self::Opened,
            Self::Ready => Self::Approved,
            other => other,
        }
    }
}

impl fmt::Display for PrState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Opened => "opened",
            Self::Closed => "closed",
            Self::Validated => "validated",
            Self::Approved => "approved",
            Self::Ready => "ready",
            Self::Merged => "merged",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Staging priority of a pull request, lower is more urgent
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(into = "u8", try_from = "u8")]
pub enum Priority {
    /// Skips review gating and preempts everything
    Urgent = 0,
    /// Staged ahead of pending splits
    Pressing = 1,
    /// Regular queue
    #[default]
    Normal = 2,
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> Self {
        p as Self
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Urgent),
            1 => Ok(Self::Pressing),
            2 => Ok(Self::Normal),
            n => Err(format!("invalid priority {n}, expected 0, 1 or 2")),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

/// Reviewer identity recorded on approval, used for `Signed-off-by`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reviewer {
    /// GitHub login
    pub login: String,
    /// Display name
    pub name: String,
    /// Email used in the sign-off trailer
    pub email: String,
}

/// A tracked pull request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Store id
    pub id: PrId,
    /// Repository (`owner/name`)
    pub repository: String,
    /// PR number on GitHub
    pub number: u64,
    /// Target branch name
    pub target: String,
    /// Login of the PR author
    pub author: String,
    /// Head commit sha
    pub head: String,
    /// Source label (`owner:branch`), links PRs across repositories
    pub label: String,
    /// Title and body, joined by an empty line
    pub message: String,
    /// Whether the PR is a draft
    pub draft: bool,
    /// Whether the PR has a single commit
    pub squash: bool,
    /// Explicitly selected merge method
    pub merge_method: Option<MergeMethod>,
    /// Whether the "select a merge method" comment was already posted
    pub method_warned: bool,
    /// Staging priority
    pub priority: Priority,
    /// Lifecycle state
    pub state: PrState,
    /// Reviewer who approved the PR
    pub reviewed_by: Option<Reviewer>,
    /// Logins allowed to review this PR in addition to project reviewers
    pub delegates: BTreeSet<String>,
    /// Batch this PR currently belongs to, if staged
    pub batch: Option<BatchId>,
    /// Original sha to staged sha, `""` maps to the PR's contribution to the staging head
    pub commits_map: BTreeMap<String, String>,
    /// Tag state last pushed to GitHub labels
    pub synced_tags: Option<TagState>,
}

impl PullRequest {
    /// `owner/name#number`
    pub fn display_name(&self) -> String {
        format!("{}#{}", self.repository, self.number)
    }

    /// Whether the merge method is known, either explicitly or inferred
    pub const fn has_merge_method(&self) -> bool {
        self.squash || self.merge_method.is_some()
    }

    /// Method used at staging time
    pub const fn effective_merge_method(&self) -> Option<MergeMethod> {
        match self.merge_method {
            Some(m) => Some(m),
            None if self.squash => Some(MergeMethod::RebaseFf),
            None => None,
        }
    }

    /// Label-derived tag state; `staged` must be supplied by the caller
    pub const fn tag_state(&self, staged: bool) -> TagState {
        match self.state {
            PrState::Ready if staged => TagState::Staged,
            PrState::Opened => TagState::Opened,
            PrState::Closed => TagState::Closed,
            PrState::Validated => TagState::Validated,
            PrState::Approved => TagState::Approved,
            PrState::Ready => TagState::Ready,
            PrState::Merged => TagState::Merged,
            PrState::Error => TagState::Error,
        }
    }
}

/// Fields needed to register a new pull request
#[derive(Debug, Clone)]
pub struct NewPullRequest {
    /// Repository (`owner/name`)
    pub repository: String,
    /// PR number
    pub number: u64,
    /// Target branch
    pub target: String,
    /// Author login
    pub author: String,
    /// Head sha
    pub head: String,
    /// Source label
    pub label: String,
    /// Title and body
    pub message: String,
    /// Draft flag
    pub draft: bool,
    /// Single commit
    pub squash: bool,
}

/// State exposed through GitHub labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagState {
    /// See [`PrState::Opened`]
    Opened,
    /// See [`PrState::Closed`]
    Closed,
    /// See [`PrState::Validated`]
    Validated,
    /// See [`PrState::Approved`]
    Approved,
    /// See [`PrState::Ready`]
    Ready,
    /// Ready and part of the active staging
    Staged,
    /// See [`PrState::Merged`]
    Merged,
    /// See [`PrState::Error`]
    Error,
}

const SEEN: &str = "seen 🙂";
const CI: &str = "CI 🤖";
const REVIEWED: &str = "r+ 👌";
const MERGING: &str = "merging 👷";
const MERGED: &str = "merged 🎉";
const ERROR: &str = "error 🙅";
const CLOSED: &str = "closed 💔";

impl TagState {
    /// Every label the bot owns
    pub const ALL_LABELS: [&'static str; 7] = [SEEN, CI, REVIEWED, MERGING, MERGED, ERROR, CLOSED];

    /// Labels that should be present on GitHub for this state
    pub fn labels(self) -> Vec<&'static str> {
        match self {
            Self::Opened => vec![SEEN],
            Self::Closed => vec![SEEN, CLOSED],
            Self::Validated => vec![SEEN, CI],
            Self::Approved => vec![SEEN, REVIEWED],
            Self::Ready => vec![SEEN, CI, REVIEWED],
            Self::Staged => vec![SEEN, CI, REVIEWED, MERGING],
            Self::Merged => vec![SEEN, CI, REVIEWED, MERGING, MERGED],
            Self::Error => vec![SEEN, ERROR],
        }
    }
}

/// A set of PRs (one per repository, same target and label) staged as a unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Store id
    pub id: BatchId,
    /// Target branch shared by every PR
    pub target: String,
    /// Member PRs
    pub prs: Vec<PrId>,
    /// Staging this batch was folded into
    pub staging: Option<StagingId>,
    /// Whether the batch is still part of a live staging or split
    pub active: bool,
}

/// Aggregated CI state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CiState {
    /// Some required status missing or pending
    Pending,
    /// Every required status succeeded
    Success,
    /// A required status failed or errored
    Failure,
}

impl fmt::Display for CiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
        };
        f.write_str(s)
    }
}

/// Lifecycle state of a staging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagingState {
    /// Waiting on CI
    Pending,
    /// Fast-forwarded into the branch
    Success,
    /// CI failed or timed out
    Failure,
    /// Dropped because one of its PRs changed
    Cancelled,
    /// Branch moved during fast-forward, batches re-queued
    FfFailed,
}

impl fmt::Display for StagingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled",
            Self::FfFailed => "ff_failed",
        };
        f.write_str(s)
    }
}

/// Per-repository heads of a staging
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingHead {
    /// Repository (`owner/name`)
    pub repository: String,
    /// Commit CI runs on (the staged commit or a force-rebuild commit)
    pub head: String,
    /// Commit the branch is fast-forwarded to on success
    pub commit: String,
    /// Branch head before staging
    pub original: String,
}

/// One attempt at validating a set of batches together
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Staging {
    /// Store id
    pub id: StagingId,
    /// Target branch
    pub target: String,
    /// Batches in staging order
    pub batches: Vec<BatchId>,
    /// Heads per repository
    pub heads: Vec<StagingHead>,
    /// Current state
    pub state: StagingState,
    /// Whether the staging is the branch's live one
    pub active: bool,
    /// When the staging was created
    pub staged_at: DateTime<Utc>,
    /// CI deadline
    pub timeout_limit: DateTime<Utc>,
    /// Why the staging ended, if it did not succeed
    pub reason: Option<String>,
}

impl Staging {
    /// Head record for a repository
    pub fn head_for(&self, repository: &str) -> Option<&StagingHead> {
        self.heads.iter().find(|h| h.repository == repository)
    }
}

/// Fields needed to create a staging
#[derive(Debug, Clone)]
pub struct NewStaging {
    /// Target branch
    pub target: String,
    /// Batches in staging order
    pub batches: Vec<BatchId>,
    /// Heads per repository
    pub heads: Vec<StagingHead>,
    /// CI deadline
    pub timeout_limit: DateTime<Utc>,
}

/// Bisection record: sub-batch sets waiting to be restaged, oldest first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Split {
    /// Store id
    pub id: SplitId,
    /// Target branch
    pub target: String,
    /// Remaining sub-batch sets, each becomes its own staging
    pub parts: Vec<Vec<BatchId>>,
}

/// State reported by a CI status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusState {
    /// Still running
    Pending,
    /// Passed
    Success,
    /// Failed
    Failure,
    /// Errored
    Error,
}

impl StatusState {
    /// Failure or error
    pub const fn is_failed(self) -> bool {
        matches!(self, Self::Failure | Self::Error)
    }
}

impl fmt::Display for StatusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// A CI status for one context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStatus {
    /// Reported state
    pub state: StatusState,
    /// Link to the CI run
    pub target_url: Option<String>,
    /// Free-form description
    pub description: Option<String>,
}

/// Status cache for a commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Commit sha
    pub sha: String,
    /// Statuses by context
    pub statuses: BTreeMap<String, CommitStatus>,
    /// Whether PRs and stagings on this commit need re-validation
    pub to_check: bool,
}

/// Queued message (and optionally close) for a PR
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    /// Store id
    pub id: u64,
    /// Repository (`owner/name`)
    pub repository: String,
    /// PR number
    pub number: u64,
    /// Comment body
    pub message: Option<String>,
    /// Whether to close the PR after commenting
    pub close: bool,
}

/// Identity used for authorship of synthesized commits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Name
    pub name: String,
    /// Email
    pub email: String,
    /// Date in any format git accepts, `None` for now
    pub date: Option<String>,
}

impl Signature {
    /// Signature without an explicit date
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            date: None,
        }
    }
}

/// A commit of a PR as reported by GitHub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrCommit {
    /// Commit sha
    pub sha: String,
    /// Parent shas
    pub parents: Vec<String>,
    /// Full commit message
    pub message: String,
    /// Author
    pub author: Signature,
    /// Committer
    pub committer: Signature,
}

/// Live PR data read from GitHub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePullRequest {
    /// PR number
    pub number: u64,
    /// Title
    pub title: String,
    /// Body
    pub body: Option<String>,
    /// Target branch
    pub base_ref: String,
    /// Head sha
    pub head_sha: String,
    /// Head label (`owner:branch`)
    pub head_label: String,
    /// Number of commits
    pub commits: u64,
    /// Draft flag
    pub draft: bool,
    /// Whether the PR is open
    pub open: bool,
}

impl RemotePullRequest {
    /// Message stored on the PR record: title, and body after an empty line
    pub fn message(&self) -> String {
        let title = self.title.trim();
        match self.body.as_deref().map(str::trim) {
            Some(body) if !body.is_empty() => format!("{title}\n\n{body}"),
            _ => title.to_string(),
        }
    }
}

/// A CI status as listed by GitHub for a commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStatus {
    /// Context name
    pub context: String,
    /// Status
    pub status: CommitStatus,
}
