//! Staging builder
//!
//! Turns the selector's plan into a staging: fetch every repository of the
//! branch into its mirror, fold batches one after the other on top of the
//! branch heads, give untouched repositories a fresh force-rebuild commit,
//! push the heads to `staging.<branch>` and only then persist the staging.

mod batch;
mod strategy;

pub use batch::stage_batch;

use crate::engine::Engine;
use crate::error::{Error, Result, StageError};
use crate::git::{CommitTree, Repo};
use crate::selector::{self, StagingPlan};
use crate::store::Store;
use crate::types::{
    Batch, BatchId, NewStaging, PrId, PrState, PullRequest, SplitId, Staging, StagingHead,
    StagingState,
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use rand::RngCore;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// A repository's state while a staging is being built
#[derive(Debug, Clone)]
pub struct WorkingHead {
    /// Local mirror
    pub repo: Repo,
    /// Branch head when the staging started
    pub original: String,
    /// Head after the batches folded so far
    pub head: String,
}

/// Working heads by repository name
pub type WorkingHeads = BTreeMap<String, WorkingHead>;

/// Build the next staging of `branch`, if there is anything to stage
pub async fn create_staging(engine: &Engine, branch: &str) -> Result<Option<Staging>> {
    let store = engine.store();
    if store.active_staging(branch)?.is_some() {
        return Ok(None);
    }

    let prs = store.search_prs(&|p| p.target == branch)?;
    let splits = store.splits(branch)?;
    let groups = match selector::plan_staging(selector::ready_prs(&prs, branch), &splits) {
        StagingPlan::Idle => return Ok(None),
        StagingPlan::Fresh(groups) => groups,
        StagingPlan::Split { split, batches } => take_split_part(store, branch, split, &batches)?,
    };
    if groups.is_empty() {
        return Ok(None);
    }
    info!(branch, ?groups, "staging");

    let mut heads = setup(engine, branch, &groups).await?;
    let staged = stage_batches(engine, branch, &groups, &mut heads).await?;
    if staged.is_empty() {
        return Ok(None);
    }

    let batch_ids: Vec<BatchId> = staged.iter().map(|b| b.id).collect();
    let created = finalize_heads(engine, &heads).and_then(|staging_heads| {
        push_heads(&heads, branch, &staging_heads)?;
        store.create_staging(NewStaging {
            target: branch.to_string(),
            batches: batch_ids.clone(),
            heads: staging_heads,
            timeout_limit: Utc::now() + engine.config.ci_timeout(),
        })
    });
    match created {
        Ok(staging) => Ok(Some(staging)),
        Err(e) => {
            if let Err(err) = release_batches(store, &batch_ids) {
                warn!(branch, error = %err, "failed to release batches");
            }
            Err(e)
        }
    }
}

/// Push every staging head to `staging.<branch>`
fn push_heads(heads: &WorkingHeads, branch: &str, staging_heads: &[StagingHead]) -> Result<()> {
    for head in staging_heads {
        if let Some(working) = heads.get(&head.repository) {
            debug!(repository = %head.repository, sha = %head.head, "pushing staging head");
            working
                .repo
                .push("origin", &format!("{}:refs/heads/staging.{branch}", head.head), true)?;
        }
    }
    Ok(())
}

/// Pop the first part of a split, releasing its batches and returning their
/// PRs regrouped for restaging
fn take_split_part(
    store: &dyn Store,
    branch: &str,
    split_id: SplitId,
    batches: &[BatchId],
) -> Result<Vec<Vec<PrId>>> {
    if let Some(mut split) = store.splits(branch)?.into_iter().find(|s| s.id == split_id) {
        if !split.parts.is_empty() {
            split.parts.remove(0);
        }
        if split.parts.is_empty() {
            store.delete_split(split.id)?;
        } else {
            store.write_split(&split)?;
        }
    }

    let mut groups = Vec::new();
    for &id in batches {
        let batch = store.get_batch(id)?;
        release_batches(store, &[id])?;
        let prs: Vec<PrId> = batch
            .prs
            .iter()
            .copied()
            .filter(|pr| {
                store
                    .get_pr(*pr)
                    .is_ok_and(|p| !p.state.is_terminal())
            })
            .collect();
        if !prs.is_empty() {
            groups.push(prs);
        }
    }
    Ok(groups)
}

/// Fetch the branch and the PR heads into each repository's mirror
async fn setup(engine: &Engine, branch: &str, groups: &[Vec<PrId>]) -> Result<WorkingHeads> {
    let mut by_repo: BTreeMap<String, Vec<u64>> = BTreeMap::new();
    for id in groups.iter().flatten() {
        let pr = engine.store().get_pr(*id)?;
        by_repo.entry(pr.repository).or_default().push(pr.number);
    }

    let mut heads = WorkingHeads::new();
    for repository in &engine.config.repositories {
        let name = repository.name.as_str();
        let head = engine.remote().head(name, branch).await?;
        let repo = engine.local_repo(name)?;

        let mut refspecs = vec![format!("+refs/heads/{branch}:refs/heads/{branch}")];
        refspecs.extend(
            by_repo
                .get(name)
                .into_iter()
                .flatten()
                .map(|n| format!("refs/pull/{n}/head")),
        );
        debug!(repository = name, ?refspecs, "fetching");
        repo.fetch("origin", &refspecs)?;

        heads.insert(
            name.to_string(),
            WorkingHead {
                repo,
                original: head.clone(),
                head,
            },
        );
    }
    Ok(heads)
}

/// Fold each group on top of the working heads, returning the batches created
///
/// Errors are contained at the batch boundary. A PR which can not be merged
/// is put in error. A merge failure only errors the PR when nothing was staged
/// before it, otherwise it may be caused by an earlier batch and the PR stays
/// ready for a later staging.
async fn stage_batches(
    engine: &Engine,
    branch: &str,
    groups: &[Vec<PrId>],
    heads: &mut WorkingHeads,
) -> Result<Vec<Batch>> {
    let store = engine.store();
    let mut staged: Vec<Batch> = Vec::new();

    for group in groups {
        if staged.len() >= engine.config.project.batch_limit {
            break;
        }
        let prs: Vec<PullRequest> = group
            .iter()
            .filter_map(|id| store.get_pr(*id).ok())
            .collect();
        if prs.is_empty() {
            continue;
        }
        if let Some(reason) = selector::blocked_reason(&prs) {
            debug!(branch, ?group, reason, "skipping blocked group");
            continue;
        }

        match stage_batch(engine, &prs, heads).await {
            Ok(batch) => {
                info!(branch, batch = batch.id, prs = ?batch.prs, "staged batch");
                staged.push(batch);
            }
            Err(StageError::Mismatch { pr, name, changes }) => {
                info!(pr = %name, fields = changes.len(), "PR out of sync, not staging its batch");
                if let Ok(record) = store.get_pr(pr) {
                    store.push_feedback(
                        &record.repository,
                        record.number,
                        Some(batch::mismatch_message(&changes)),
                        false,
                    )?;
                }
            }
            Err(StageError::Unmergeable { pr, name, reason }) => {
                info!(pr = %name, reason, "unmergeable");
                mark_error(store, pr, &name, &reason)?;
            }
            Err(StageError::Merge { pr, name, reason }) if staged.is_empty() => {
                info!(pr = %name, reason, "merge failed on first batch");
                mark_error(store, pr, &name, &reason)?;
            }
            Err(StageError::Merge { name, reason, .. }) => {
                info!(pr = %name, reason, "merge failed, will retry in a later staging");
            }
            Err(StageError::Fatal(e)) => {
                let ids: Vec<BatchId> = staged.iter().map(|b| b.id).collect();
                release_batches(store, &ids)?;
                return Err(e);
            }
        }
    }
    Ok(staged)
}

fn mark_error(store: &dyn Store, pr: PrId, name: &str, reason: &str) -> Result<()> {
    match store.get_pr(pr) {
        Ok(mut record) => {
            record.state = PrState::Error;
            store.write_pr(&record)?;
            store.push_feedback(
                &record.repository,
                record.number,
                Some(format!("Unable to stage PR ({reason})")),
                false,
            )
        }
        // retargeted PRs are forgotten while being staged
        Err(Error::NotFound { .. }) => {
            debug!(pr = name, "PR vanished while staging");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Staging heads, with a force-rebuild commit for repositories no batch touched
fn finalize_heads(engine: &Engine, heads: &WorkingHeads) -> Result<Vec<StagingHead>> {
    let bot = engine.config.bot_identity();
    heads
        .iter()
        .map(|(name, working)| {
            let head = if working.head == working.original {
                let tree = working.repo.tree_of(&working.head)?;
                working.repo.commit_tree(&CommitTree {
                    tree: &tree,
                    parents: vec![working.head.as_str()],
                    message: &force_rebuild_message(&working.head),
                    author: &bot,
                    committer: None,
                })?
            } else {
                working.head.clone()
            };
            Ok(StagingHead {
                repository: name.clone(),
                head,
                commit: working.head.clone(),
                original: working.original.clone(),
            })
        })
        .collect()
}

/// Message of an empty commit giving CI a fresh sha for an unchanged head
pub fn force_rebuild_message(head: &str) -> String {
    let mut nonce = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce);
    format!(
        "force rebuild\n\nuniquifier: {}\nFor-Commit-Id: {head}\n",
        STANDARD.encode(nonce)
    )
}

/// Deactivate batches and detach their PRs
pub fn release_batches(store: &dyn Store, batches: &[BatchId]) -> Result<()> {
    for &id in batches {
        let mut batch = store.get_batch(id)?;
        batch.active = false;
        store.write_batch(&batch)?;
        for &pr in &batch.prs {
            if let Ok(mut record) = store.get_pr(pr)
                && record.batch == Some(id)
            {
                record.batch = None;
                store.write_pr(&record)?;
            }
        }
    }
    Ok(())
}

/// End a staging without merging it, releasing its batches
pub fn cancel_staging(store: &dyn Store, staging: &mut Staging, reason: &str) -> Result<()> {
    info!(staging = staging.id, branch = %staging.target, reason, "cancelling staging");
    staging.state = StagingState::Cancelled;
    staging.active = false;
    staging.reason = Some(reason.to_string());
    store.write_staging(staging)?;
    release_batches(store, &staging.batches)
}

/// Take a PR out of whatever it is staged in
///
/// A live staging containing the PR is cancelled; a batch waiting in a split
/// just loses the PR. `pr.batch` is cleared, the caller persists `pr`.
pub fn unstage(store: &dyn Store, pr: &mut PullRequest, reason: &str) -> Result<()> {
    let Some(batch_id) = pr.batch.take() else {
        return Ok(());
    };
    let mut batch = store.get_batch(batch_id)?;
    if !batch.active {
        return Ok(());
    }

    if let Some(staging_id) = batch.staging {
        let mut staging = store.get_staging(staging_id)?;
        if staging.active {
            return cancel_staging(store, &mut staging, reason);
        }
    }

    batch.prs.retain(|id| *id != pr.id);
    if batch.prs.is_empty() {
        batch.active = false;
    }
    store.write_batch(&batch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_force_rebuild_message_is_unique() {
        let a = force_rebuild_message("abc");
        let b = force_rebuild_message("abc");
        assert_ne!(a, b);
        assert!(a.starts_with("force rebuild\n\nuniquifier: "));
        assert!(a.ends_with("For-Commit-Id: abc\n"));
        let nonce = a.lines().nth(2).and_then(|l| l.strip_prefix("uniquifier: ")).unwrap();
        assert_eq!(STANDARD.decode(nonce).unwrap().len(), 12);
    }
}
