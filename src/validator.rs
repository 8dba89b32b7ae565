//! CI aggregation, fast-forward and bisection
//!
//! PR heads are re-validated whenever a status lands on them. The active
//! staging of each branch is polled: success fast-forwards every repository
//! (all or nothing), failure or time-out either splits the staging in two or,
//! for a single batch, puts the culprit PRs in error.

use crate::config::Config;
use crate::engine::Engine;
use crate::error::Result;
use crate::remote::RemoteClient;
use crate::staging::release_batches;
use crate::store::Store;
use crate::types::{
    CiState, Commit, CommitStatus, PrId, PrState, RemoteStatus, Staging, StagingId, StagingState,
};
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Pauses between fast-forward attempts of the repositories after the first
const FF_PAUSES: [Duration; 4] = [
    Duration::from_millis(100),
    Duration::from_millis(300),
    Duration::from_millis(500),
    Duration::from_millis(900),
];

/// Aggregate the `required` contexts of a status map
///
/// Any failed context makes the result a failure, otherwise any missing or
/// pending one keeps it pending. The flag reports whether an explicit
/// `pending` status was seen.
pub fn ci_state(statuses: &BTreeMap<String, CommitStatus>, required: &[&str]) -> (CiState, bool) {
    let mut state = CiState::Success;
    let mut pending_seen = false;
    for context in required {
        match statuses.get(*context).map(|s| s.state) {
            Some(s) if s.is_failed() => return (CiState::Failure, pending_seen),
            Some(crate::types::StatusState::Pending) => {
                pending_seen = true;
                state = CiState::Pending;
            }
            None => state = CiState::Pending,
            Some(_) => {}
        }
    }
    (state, pending_seen)
}

/// Record statuses on the commit cache, returning whether any of them changed
pub fn record_statuses(store: &dyn Store, sha: &str, statuses: Vec<RemoteStatus>) -> Result<bool> {
    let mut commit = store.get_commit(sha)?.unwrap_or_else(|| Commit {
        sha: sha.to_string(),
        statuses: BTreeMap::new(),
        to_check: false,
    });
    let mut changed = false;
    for status in statuses {
        if commit.statuses.get(&status.context) != Some(&status.status) {
            commit.statuses.insert(status.context, status.status);
            changed = true;
        }
    }
    if changed {
        store.write_commit(&commit)?;
    }
    Ok(changed)
}

/// Push back the deadline of the active stagings built on `sha` while one of
/// their required contexts is pending
///
/// Only call this when the statuses of `sha` changed, a context stuck at
/// `pending` must still time out.
pub fn extend_timeout(engine: &Engine, sha: &str) -> Result<()> {
    let store = engine.store();
    for mut staging in
        store.search_stagings(&|s| s.active && s.heads.iter().any(|h| h.head == sha))?
    {
        let (_, pending_seen) = staging_ci(&engine.config, store, &staging)?;
        if pending_seen {
            staging.timeout_limit = Utc::now() + engine.config.ci_timeout();
            debug!(staging = staging.id, timeout_limit = %staging.timeout_limit, "got pending status, extending timeout");
            store.write_staging(&staging)?;
        }
    }
    Ok(())
}

/// Re-validate the PRs of every commit flagged `to_check`
pub fn check_commits(engine: &Engine) -> Result<usize> {
    let store = engine.store();
    let commits = store.commits_to_check()?;
    for commit in &commits {
        let sha = commit.sha.clone();
        for mut pr in store.search_prs(&|p| p.head == sha && !p.state.is_terminal())? {
            let required = engine.config.required_contexts(&pr.repository, &pr.target, false);
            let (ci, _) = ci_state(&commit.statuses, &required);
            let state = match ci {
                CiState::Success => pr.state.validated(),
                CiState::Failure | CiState::Pending => pr.state.invalidated(),
            };
            if state != pr.state {
                info!(pr = %pr.display_name(), from = %pr.state, to = %state, %ci, "PR state changed");
                pr.state = state;
                store.write_pr(&pr)?;
            }
        }
        let mut done = commit.clone();
        done.to_check = false;
        store.write_commit(&done)?;
    }
    Ok(commits.len())
}

/// Aggregate CI state of a staging over every repository's head
fn staging_ci(config: &Config, store: &dyn Store, staging: &Staging) -> Result<(CiState, bool)> {
    let mut state = CiState::Success;
    let mut pending_seen = false;
    for head in &staging.heads {
        let required = config.required_contexts(&head.repository, &staging.target, true);
        let statuses = store
            .get_commit(&head.head)?
            .map(|c| c.statuses)
            .unwrap_or_default();
        let (ci, pending) = ci_state(&statuses, &required);
        pending_seen |= pending;
        match ci {
            CiState::Failure => state = CiState::Failure,
            CiState::Pending if state == CiState::Success => state = CiState::Pending,
            _ => {}
        }
    }
    Ok((state, pending_seen))
}

/// Poll the active staging of `branch` and act on its CI state
///
/// Returns the staging id and final state when the staging ended.
pub async fn check_staging(engine: &Engine, branch: &str) -> Result<Option<(StagingId, StagingState)>> {
    let store = engine.store();
    let Some(mut staging) = store.active_staging(branch)? else {
        return Ok(None);
    };

    let mut changed = false;
    for head in &staging.heads {
        match engine.remote().statuses(&head.repository, &head.head).await {
            Ok(statuses) => changed |= record_statuses(store, &head.head, statuses)?,
            Err(e) => warn!(repository = %head.repository, sha = %head.head, error = %e, "failed to read statuses"),
        }
    }

    let (ci, pending_seen) = staging_ci(&engine.config, store, &staging)?;
    if changed && pending_seen {
        staging.timeout_limit = Utc::now() + engine.config.ci_timeout();
        debug!(branch, staging = staging.id, timeout_limit = %staging.timeout_limit, "got pending status, extending timeout");
    }
    debug!(branch, staging = staging.id, %ci, "staging CI state");

    match ci {
        CiState::Success => {
            fast_forward(engine, &mut staging).await?;
        }
        CiState::Failure => on_failure(engine, &mut staging, false)?,
        CiState::Pending if Utc::now() > staging.timeout_limit => {
            on_failure(engine, &mut staging, true)?;
        }
        CiState::Pending => {
            store.write_staging(&staging)?;
            return Ok(None);
        }
    }
    Ok(Some((staging.id, staging.state)))
}

/// Move every branch to its staged commit, or none of them
async fn fast_forward(engine: &Engine, staging: &mut Staging) -> Result<()> {
    let store = engine.store();
    match safety_dance(engine.remote(), staging).await {
        Ok(()) => {
            info!(branch = %staging.target, staging = staging.id, "staging merged");
            for &batch_id in &staging.batches {
                let mut batch = store.get_batch(batch_id)?;
                for &id in &batch.prs {
                    let mut pr = store.get_pr(id)?;
                    pr.state = PrState::Merged;
                    store.write_pr(&pr)?;
                    let sha = pr.commits_map.get("").map_or("", String::as_str);
                    store.push_feedback(
                        &pr.repository,
                        pr.number,
                        Some(format!("Merged at {sha}")),
                        true,
                    )?;
                }
                batch.active = false;
                store.write_batch(&batch)?;
            }
            staging.state = StagingState::Success;
            staging.active = false;
            store.write_staging(staging)
        }
        Err(e) => {
            warn!(branch = %staging.target, staging = staging.id, error = %e, "fast-forward failed, staging will be rebuilt");
            staging.state = StagingState::FfFailed;
            staging.active = false;
            staging.reason = Some(e.to_string());
            store.write_staging(staging)?;
            release_batches(store, &staging.batches)
        }
    }
}

/// Fast-forward `tmp.<branch>` first to catch branches which moved, then the
/// real branches, reverting the repositories already updated on failure
async fn safety_dance(remote: &dyn RemoteClient, staging: &Staging) -> Result<()> {
    let branch = staging.target.as_str();
    let tmp = format!("tmp.{branch}");

    let mut originals = Vec::with_capacity(staging.heads.len());
    for head in &staging.heads {
        let current = remote.head(&head.repository, branch).await?;
        remote.set_ref(&head.repository, &tmp, &current).await?;
        originals.push(current);
    }
    for head in &staging.heads {
        remote.fast_forward(&head.repository, &tmp, &head.commit).await?;
    }

    let mut updated: Vec<(&str, &str)> = Vec::new();
    for (i, (head, original)) in staging.heads.iter().zip(&originals).enumerate() {
        let mut pauses = (if i == 0 { &[][..] } else { &FF_PAUSES[..] }).iter();
        let result = loop {
            match remote.fast_forward(&head.repository, branch, &head.commit).await {
                Err(e) => match pauses.next() {
                    Some(pause) => {
                        debug!(repository = %head.repository, ?pause, "fast-forward rejected, retrying");
                        tokio::time::sleep(*pause).await;
                    }
                    None => break Err(e),
                },
                Ok(()) => break Ok(()),
            }
        };
        if let Err(e) = result {
            for (repository, sha) in &updated {
                warn!(repository, branch, sha, "reverting fast-forward");
                if let Err(revert) = remote.set_ref(repository, branch, sha).await {
                    error!(repository, branch, error = %revert, "failed to revert branch");
                }
            }
            return Err(e);
        }
        updated.push((head.repository.as_str(), original.as_str()));
    }
    Ok(())
}

/// Split a failed multi-batch staging, or fail the PRs of a single batch
fn on_failure(engine: &Engine, staging: &mut Staging, timed_out: bool) -> Result<()> {
    let store = engine.store();
    let reason = if timed_out {
        format!("timed out (>{} minutes)", engine.config.project.ci_timeout)
    } else {
        "CI failed".to_string()
    };

    if staging.batches.len() > 1 {
        let mid = staging.batches.len() / 2;
        let (head, tail) = staging.batches.split_at(mid);
        let split = store.create_split(&staging.target, vec![head.to_vec(), tail.to_vec()])?;
        info!(
            staging = staging.id,
            split = split.id,
            head = ?head,
            tail = ?tail,
            reason,
            "splitting failed staging"
        );
        staging.state = StagingState::Failure;
        staging.active = false;
        staging.reason = Some(format!("{reason}, split into {head:?} and {tail:?}"));
        return store.write_staging(staging);
    }

    if timed_out {
        return fail(store, staging, &reason, None);
    }

    let prs: Vec<(PrId, String)> = staging
        .batches
        .iter()
        .filter_map(|id| store.get_batch(*id).ok())
        .flat_map(|b| b.prs)
        .filter_map(|id| store.get_pr(id).ok())
        .map(|p| (p.id, p.repository))
        .collect();

    for head in &staging.heads {
        let statuses = store
            .get_commit(&head.head)?
            .map(|c| c.statuses)
            .unwrap_or_default();
        let required = engine
            .config
            .required_contexts(&head.repository, &staging.target, true);
        let Some((context, status)) = required
            .iter()
            .find_map(|c| statuses.get(*c).filter(|s| s.state.is_failed()).map(|s| (*c, s)))
        else {
            continue;
        };

        let culprits: Vec<PrId> = prs
            .iter()
            .filter(|(_, repository)| *repository == head.repository)
            .map(|(id, _)| *id)
            .collect();
        if culprits.is_empty() {
            return fail(store, staging, &format!("{context} on {}", head.head), None);
        }
        let reason = match &status.target_url {
            Some(url) => format!("{context} (view more at {url})"),
            None => context.to_string(),
        };
        return fail(store, staging, &reason, Some(&culprits));
    }

    fail(store, staging, "unknown reason", None)
}

/// Put PRs (all of the staging's by default) in error and end the staging
fn fail(store: &dyn Store, staging: &mut Staging, reason: &str, prs: Option<&[PrId]>) -> Result<()> {
    info!(staging = staging.id, branch = %staging.target, reason, "staging failed");
    let all: Vec<PrId>;
    let prs = if let Some(prs) = prs {
        prs
    } else {
        all = staging
            .batches
            .iter()
            .filter_map(|id| store.get_batch(*id).ok())
            .flat_map(|b| b.prs)
            .collect();
        &all
    };

    for &id in prs {
        let mut pr = store.get_pr(id)?;
        pr.state = PrState::Error;
        store.write_pr(&pr)?;
        store.push_feedback(
            &pr.repository,
            pr.number,
            Some(format!("Staging failed: {reason}")),
            false,
        )?;
    }

    staging.state = StagingState::Failure;
    staging.active = false;
    staging.reason = Some(reason.to_string());
    store.write_staging(staging)?;
    release_batches(store, &staging.batches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StatusState;

    fn statuses(entries: &[(&str, StatusState)]) -> BTreeMap<String, CommitStatus> {
        entries
            .iter()
            .map(|(c, s)| {
                (
                    (*c).to_string(),
                    CommitStatus {
                        state: *s,
                        target_url: None,
                        description: None,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_all_required_success() {
        let s = statuses(&[("ci", StatusState::Success), ("lint", StatusState::Success)]);
        assert_eq!(ci_state(&s, &["ci", "lint"]), (CiState::Success, false));
        // unrequired contexts are ignored
        let s = statuses(&[("ci", StatusState::Success), ("extra", StatusState::Failure)]);
        assert_eq!(ci_state(&s, &["ci"]).0, CiState::Success);
    }

    #[test]
    fn test_missing_or_pending_is_pending() {
        let s = statuses(&[("ci", StatusState::Success)]);
        assert_eq!(ci_state(&s, &["ci", "lint"]), (CiState::Pending, false));
        let s = statuses(&[("ci", StatusState::Pending)]);
        assert_eq!(ci_state(&s, &["ci"]), (CiState::Pending, true));
    }

    #[test]
    fn test_failure_short_circuits() {
        let s = statuses(&[("ci", StatusState::Pending), ("lint", StatusState::Error)]);
        assert_eq!(ci_state(&s, &["lint", "ci"]).0, CiState::Failure);
        assert_eq!(ci_state(&s, &["ci", "lint"]).0, CiState::Failure);
    }

    #[test]
    fn test_no_requirement_is_success() {
        assert_eq!(ci_state(&BTreeMap::new(), &[]).0, CiState::Success);
    }

    #[test]
    fn test_record_statuses_reports_changes() {
        let store = crate::store::MemoryStore::new();
        let pending = || RemoteStatus {
            context: "ci".into(),
            status: CommitStatus {
                state: StatusState::Pending,
                target_url: None,
                description: None,
            },
        };
        assert!(record_statuses(&store, "abc", vec![pending()]).unwrap());
        assert!(!record_statuses(&store, "abc", vec![pending()]).unwrap());

        let mut success = pending();
        success.status.state = StatusState::Success;
        assert!(record_statuses(&store, "abc", vec![success]).unwrap());
        let commit = store.get_commit("abc").unwrap().unwrap();
        assert_eq!(commit.statuses["ci"].state, StatusState::Success);
    }
}
