//! Error types for mergebot

use thiserror::Error;

/// Errors surfaced by the merge engine and its collaborators
#[derive(Error, Debug)]
pub enum Error {
    /// Project configuration could not be loaded or is inconsistent
    #[error("config error: {0}")]
    Config(String),

    /// No usable GitHub credentials
    #[error("authentication failed: {0}")]
    Auth(String),

    /// GitHub API returned an error
    #[error("GitHub API error: {0}")]
    GitHubApi(String),

    /// The branch could not be fast-forwarded (moved concurrently, or the
    /// update itself failed)
    #[error("unable to fast-forward {repository}:{branch} to {sha}: {reason}")]
    FastForward {
        /// Repository (`owner/name`)
        repository: String,
        /// Branch that refused the update
        branch: String,
        /// Commit we tried to move the branch to
        sha: String,
        /// What went wrong
        reason: String,
    },

    /// A git subprocess failed
    #[error("git error: {0}")]
    Git(String),

    /// A merge or rebase produced conflicts
    #[error("merge failed: {0}")]
    Merge(String),

    /// Entity store failure
    #[error("store error: {0}")]
    Store(String),

    /// Entity lookup failed
    #[error("{kind} {id} not found")]
    NotFound {
        /// Entity kind (pull request, batch, ...)
        kind: &'static str,
        /// Identifier that was looked up
        id: String,
    },

    /// A staging already exists for the branch
    #[error("branch {0} already has an active staging")]
    StagingExists(String),

    /// Batch construction violated its invariants
    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    /// Webhook payload could not be interpreted
    #[error("invalid payload: {0}")]
    Payload(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal invariant broken
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<octocrab::Error> for Error {
    fn from(err: octocrab::Error) -> Self {
        match &err {
            octocrab::Error::GitHub { source, .. } => Self::GitHubApi(source.message.clone()),
            _ => Self::GitHubApi(err.to_string()),
        }
    }
}

impl Error {
    /// Whether retrying the operation may succeed
    ///
    /// Connection-level failures and 5xx/429 API answers are transient; anything
    /// else (validation errors, missing refs, conflicts) is not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => {
                e.is_connect()
                    || e.is_timeout()
                    || e.status().is_some_and(|s| s.is_server_error() || s.as_u16() == 429)
            }
            Self::GitHubApi(msg) => msg.starts_with("HTTP 5") || msg.starts_with("HTTP 429"),
            _ => false,
        }
    }
}

/// Result type alias using mergebot's Error
pub type Result<T> = std::result::Result<T, Error>;

/// One field that diverged between the local PR record and GitHub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
    /// Field name (`head`, `target`, `squash`, `message`)
    pub field: &'static str,
    /// Locally recorded value
    pub old: String,
    /// Value currently on GitHub
    pub new: String,
}

/// Outcome kinds of a failed `stage_batch`, branched on by the staging builder
#[derive(Error, Debug)]
pub enum StageError {
    /// The PR record was stale; fields have been re-synced and approval reset
    #[error("{name} was updated on GitHub since last sync")]
    Mismatch {
        /// Store id of the PR
        pr: u64,
        /// Display name of the PR (`owner/name#n`)
        name: String,
        /// Diverged fields
        changes: Vec<FieldChange>,
    },

    /// The PR can never be merged as is
    #[error("{name} is unmergeable: {reason}")]
    Unmergeable {
        /// Store id of the PR
        pr: u64,
        /// Display name of the PR
        name: String,
        /// Human readable reason
        reason: String,
    },

    /// Merging failed, possibly because of an earlier batch
    #[error("{name} failed to merge: {reason}")]
    Merge {
        /// Store id of the PR
        pr: u64,
        /// Display name of the PR
        name: String,
        /// Git output explaining the failure
        reason: String,
    },

    /// Infrastructure failure, aborts the staging attempt
    #[error(transparent)]
    Fatal(#[from] Error),
}
