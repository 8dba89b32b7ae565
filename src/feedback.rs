//! Outbox delivery: queued comments and closes, and label synchronization

use crate::engine::Engine;
use crate::error::Result;
use crate::types::{BatchId, Feedback, PullRequest, TagState};
use std::collections::BTreeSet;
use tracing::{debug, warn};

async fn deliver(engine: &Engine, feedback: &Feedback) -> Result<()> {
    let remote = engine.remote();
    if let Some(message) = &feedback.message {
        remote
            .comment(&feedback.repository, feedback.number, message)
            .await?;
    }
    if feedback.close {
        remote.close(&feedback.repository, feedback.number).await?;
    }
    Ok(())
}

/// Send queued feedback, returning how many entries went out
///
/// Entries which fail stay queued for the next tick.
pub async fn send_feedback(engine: &Engine) -> Result<usize> {
    let store = engine.store();
    let mut sent = 0;
    for feedback in store.pending_feedback()? {
        match deliver(engine, &feedback).await {
            Ok(()) => {
                debug!(repository = %feedback.repository, number = feedback.number, close = feedback.close, "sent feedback");
                store.remove_feedback(feedback.id)?;
                sent += 1;
            }
            Err(e) => warn!(
                repository = %feedback.repository,
                number = feedback.number,
                error = %e,
                "failed to send feedback"
            ),
        }
    }
    Ok(sent)
}

/// Batches of every active staging
fn staged_batches(engine: &Engine) -> Result<BTreeSet<BatchId>> {
    Ok(engine
        .store()
        .search_stagings(&|s| s.active)?
        .into_iter()
        .flat_map(|s| s.batches)
        .collect())
}

/// Tag state a PR should currently display
pub fn current_tags(pr: &PullRequest, staged: &BTreeSet<BatchId>) -> TagState {
    pr.tag_state(pr.batch.is_some_and(|b| staged.contains(&b)))
}

/// Replace the bot-owned labels of PRs whose tag state changed
///
/// Labels the bot does not own are left alone. Returns how many PRs were
/// updated.
pub async fn sync_labels(engine: &Engine) -> Result<usize> {
    let store = engine.store();
    let remote = engine.remote();
    let staged = staged_batches(engine)?;
    let mut updated = 0;

    for mut pr in store.search_prs(&|_| true)? {
        let tags = current_tags(&pr, &staged);
        if pr.synced_tags == Some(tags) {
            continue;
        }

        let current = match remote.labels(&pr.repository, pr.number).await {
            Ok(labels) => labels,
            Err(e) => {
                warn!(pr = %pr.display_name(), error = %e, "failed to read labels");
                continue;
            }
        };
        let mut labels: Vec<String> = current
            .into_iter()
            .filter(|l| !TagState::ALL_LABELS.contains(&l.as_str()))
            .collect();
        labels.extend(tags.labels().into_iter().map(String::from));

        if let Err(e) = remote
            .replace_labels(&pr.repository, pr.number, &labels)
            .await
        {
            warn!(pr = %pr.display_name(), error = %e, "failed to update labels");
            continue;
        }
        debug!(pr = %pr.display_name(), ?tags, "labels updated");
        pr.synced_tags = Some(tags);
        store.write_pr(&pr)?;
        updated += 1;
    }
    Ok(updated)
}
