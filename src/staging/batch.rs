//! Staging of one batch: revalidation, method selection, strategy dispatch

use super::WorkingHeads;
use super::strategy::{self, StrategyInput};
use crate::engine::Engine;
use crate::error::{Error, FieldChange, StageError};
use crate::remote::MAX_PR_COMMITS;
use crate::types::{Batch, MergeMethod, PrState, PullRequest, RemotePullRequest};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use tracing::{debug, info, warn};

/// Rebasing longer series is refused
const MAX_REBASE_COMMITS: u64 = 50;

fn unmergeable(pr: &PullRequest, reason: impl Into<String>) -> StageError {
    StageError::Unmergeable {
        pr: pr.id,
        name: pr.display_name(),
        reason: reason.into(),
    }
}

/// Stage every PR of a batch on top of `heads`
///
/// The batch is all or nothing: working heads only move once every PR merged,
/// then the batch is created and the PRs record their commit mappings. A
/// batch whose PRs could not be updated is released again.
pub async fn stage_batch(
    engine: &Engine,
    prs: &[PullRequest],
    heads: &mut WorkingHeads,
) -> Result<Batch, StageError> {
    let Some(first) = prs.first() else {
        return Err(Error::InvalidBatch("empty batch".into()).into());
    };
    let target = first.target.clone();

    let mut staged = Vec::with_capacity(prs.len());
    for pr in prs {
        let related: Vec<PullRequest> = prs.iter().filter(|p| p.id != pr.id).cloned().collect();
        let info = heads.get(&pr.repository).ok_or_else(|| {
            Error::Internal(format!("{} is not a repository of {target}", pr.repository))
        })?;
        debug!(pr = %pr.display_name(), base = %info.head, "staging PR");
        let (method, head, commits_map) = stage(engine, pr, &info.head, &info.repo, &related).await?;
        info!(pr = %pr.display_name(), %method, %head, "staged PR");
        staged.push((pr, head, commits_map));
    }

    for (pr, head, _) in &staged {
        if let Some(working) = heads.get_mut(&pr.repository) {
            working
                .repo
                .set_ref(&format!("refs/heads/tmp.{target}"), head)?;
            working.head.clone_from(head);
        }
    }

    let store = engine.store();
    let ids: Vec<_> = prs.iter().map(|p| p.id).collect();
    let batch = store.create_batch(&target, &ids)?;
    let recorded = staged
        .into_iter()
        .try_for_each(|(pr, _, commits_map)| -> crate::error::Result<()> {
            let mut record = store.get_pr(pr.id)?;
            record.commits_map = commits_map;
            record.batch = Some(batch.id);
            store.write_pr(&record)
        });
    if let Err(e) = recorded {
        if let Err(err) = super::release_batches(store, &[batch.id]) {
            warn!(batch = batch.id, error = %err, "failed to release batch");
        }
        return Err(e.into());
    }
    Ok(batch)
}

async fn stage(
    engine: &Engine,
    pr: &PullRequest,
    base: &str,
    repo: &crate::git::Repo,
    related: &[PullRequest],
) -> Result<(MergeMethod, String, BTreeMap<String, String>), StageError> {
    let remote = engine.remote();
    let live = remote.pull_request(&pr.repository, pr.number).await?;

    let method = pr
        .merge_method
        .or_else(|| (live.commits == 1).then_some(MergeMethod::RebaseFf))
        .ok_or_else(|| unmergeable(pr, "unable to determine merge method"))?;
    if live.commits > MAX_REBASE_COMMITS && method.is_rebase() {
        return Err(unmergeable(pr, "Rebasing 50 commits is too much."));
    }
    if live.commits > MAX_PR_COMMITS as u64 {
        return Err(unmergeable(
            pr,
            format!("Merging PRs of more than {MAX_PR_COMMITS} commits is not supported."),
        ));
    }

    let mut commits = remote.commits(&pr.repository, pr.number).await?;
    if let Some(c) = commits
        .iter()
        .find(|c| c.author.email.is_empty() || c.committer.email.is_empty())
    {
        return Err(unmergeable(
            pr,
            format!(
                "All commits must have author and committer email, missing email on {} indicates the authorship is most likely incorrect.",
                c.sha
            ),
        ));
    }

    let head = commits.last().map_or(live.head_sha.as_str(), |c| c.sha.as_str());
    revalidate(engine, pr, &live, head)?;

    let input = StrategyInput {
        repo,
        pr,
        base,
        related,
        bot: &engine.config.bot_identity(),
    };
    let (new_head, commits_map) = strategy::apply(method, &input, &mut commits)?;
    Ok((method, new_head, commits_map))
}

/// Compare the PR record against GitHub
///
/// On divergence the record is re-synced, loses its approval, and a
/// [`StageError::Mismatch`] is returned so the batch is not staged.
fn revalidate(
    engine: &Engine,
    pr: &PullRequest,
    live: &RemotePullRequest,
    head: &str,
) -> Result<(), StageError> {
    let store = engine.store();
    let mut changes = Vec::new();

    if pr.head != head {
        changes.push(FieldChange {
            field: "head",
            old: pr.head.clone(),
            new: head.to_string(),
        });
    }
    if pr.target != live.base_ref {
        if !engine.config.is_managed(&pr.repository, &live.base_ref) {
            store.delete_pr(pr.id)?;
            return Err(unmergeable(
                pr,
                "While staging, found this PR had been retargeted to an un-managed branch.",
            ));
        }
        changes.push(FieldChange {
            field: "target",
            old: pr.target.clone(),
            new: live.base_ref.clone(),
        });
    }
    let squash = live.commits == 1;
    if pr.squash != squash {
        changes.push(FieldChange {
            field: "squash",
            old: pr.squash.to_string(),
            new: squash.to_string(),
        });
    }
    let message = live.message();
    if pr.message != message {
        changes.push(FieldChange {
            field: "message",
            old: pr.message.clone(),
            new: message.clone(),
        });
    }

    if changes.is_empty() {
        return Ok(());
    }

    let mut record = store.get_pr(pr.id)?;
    record.head = head.to_string();
    record.target = live.base_ref.clone();
    record.squash = squash;
    record.message = message;
    record.reviewed_by = None;
    record.state = PrState::Opened;
    store.write_pr(&record)?;

    Err(StageError::Mismatch {
        pr: pr.id,
        name: pr.display_name(),
        changes,
    })
}

/// Comment explaining a mismatch, with a diff of the re-synced fields
pub fn mismatch_message(changes: &[FieldChange]) -> String {
    let fields: Vec<&str> = changes.iter().map(|c| c.field).collect();
    let mut diff = String::new();
    for change in changes {
        for line in change.old.lines() {
            let _ = writeln!(diff, "-{}: {line}", change.field);
        }
        for line in change.new.lines() {
            let _ = writeln!(diff, "+{}: {line}", change.field);
        }
    }
    format!(
        "We apparently missed updates to this PR and tried to stage it in a state which \
         might not have been approved.\n\n\
         The properties {} were not correctly synchronized and have been updated.\n\n\
         <details><summary>differences</summary>\n\n```diff\n{diff}```\n</details>\n\n\
         Please check and re-approve.",
        fields.join(", ")
    )
}
