//! Webhook deliveries: pull request lifecycle, statuses and comments
//!
//! Only the fields the engine uses are deserialized. Signature verification
//! happens upstream, whatever calls [`handle`] trusts the payload.

use crate::commands;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::staging::unstage;
use crate::types::{Commit, CommitStatus, NewPullRequest, PrState, RemotePullRequest, StatusState};
use crate::validator;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct Repository {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct User {
    login: String,
}

#[derive(Debug, Deserialize)]
struct Ref {
    #[serde(rename = "ref")]
    name: String,
    #[serde(default)]
    sha: String,
    #[serde(default)]
    label: String,
}

#[derive(Debug, Deserialize)]
struct PullRequestPayload {
    number: u64,
    title: String,
    body: Option<String>,
    #[serde(default)]
    draft: bool,
    state: String,
    #[serde(default)]
    merged: bool,
    head: Ref,
    base: Ref,
    user: User,
    commits: Option<u64>,
}

impl PullRequestPayload {
    fn message(&self) -> String {
        RemotePullRequest {
            number: self.number,
            title: self.title.clone(),
            body: self.body.clone(),
            base_ref: self.base.name.clone(),
            head_sha: self.head.sha.clone(),
            head_label: self.head.label.clone(),
            commits: self.commits.unwrap_or_default(),
            draft: self.draft,
            open: self.state == "open",
        }
        .message()
    }
}

#[derive(Debug, Deserialize)]
struct PullRequestEvent {
    action: String,
    pull_request: PullRequestPayload,
    repository: Repository,
    sender: User,
    #[serde(default)]
    changes: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StatusEvent {
    sha: String,
    context: String,
    state: StatusState,
    target_url: Option<String>,
    description: Option<String>,
    repository: Repository,
}

#[derive(Debug, Deserialize)]
struct Issue {
    number: u64,
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Comment {
    body: String,
    user: User,
}

#[derive(Debug, Deserialize)]
struct IssueCommentEvent {
    action: String,
    issue: Issue,
    comment: Comment,
    repository: Repository,
}

#[derive(Debug, Deserialize)]
struct Review {
    body: Option<String>,
    user: User,
}

#[derive(Debug, Deserialize)]
struct PrNumber {
    number: u64,
}

#[derive(Debug, Deserialize)]
struct ReviewEvent {
    action: String,
    review: Review,
    pull_request: PrNumber,
    repository: Repository,
}

fn parse<T: for<'de> Deserialize<'de>>(kind: &str, payload: &serde_json::Value) -> Result<T> {
    T::deserialize(payload).map_err(|e| Error::Payload(format!("{kind}: {e}")))
}

/// Process one webhook delivery of type `kind` (the `X-GitHub-Event` header)
///
/// Returns a short description of what was done.
pub async fn handle(engine: &Engine, kind: &str, payload: &serde_json::Value) -> Result<String> {
    debug!(kind, "handling event");
    let outcome = match kind {
        "pull_request" => handle_pr(engine, parse(kind, payload)?).await?,
        "status" => handle_status(engine, parse(kind, payload)?)?,
        "issue_comment" => {
            let event: IssueCommentEvent = parse(kind, payload)?;
            if event.action != "created" || event.issue.pull_request.is_none() {
                return Ok(format!("ignored {} comment", event.action));
            }
            handle_comment(
                engine,
                &event.repository.full_name,
                event.issue.number,
                &event.comment.user.login,
                &event.comment.body,
            )?
        }
        "pull_request_review" => {
            let event: ReviewEvent = parse(kind, payload)?;
            if event.action != "submitted" {
                return Ok(format!("ignored {} review", event.action));
            }
            handle_comment(
                engine,
                &event.repository.full_name,
                event.pull_request.number,
                &event.review.user.login,
                event.review.body.as_deref().unwrap_or_default(),
            )?
        }
        "ping" => "pong".to_string(),
        other => format!("ignored {other} event"),
    };
    info!(kind, outcome, "handled event");
    Ok(outcome)
}

async fn handle_pr(engine: &Engine, event: PullRequestEvent) -> Result<String> {
    let store = engine.store();
    let repository = event.repository.full_name.as_str();
    let payload = &event.pull_request;
    let target = payload.base.name.as_str();
    let existing = store.find_pr(repository, payload.number)?;

    match (event.action.as_str(), existing) {
        ("opened" | "reopened", None) => {
            if !engine.config.is_managed(repository, target) {
                return Ok(format!("ignored PR on unmanaged {repository}:{target}"));
            }
            let commits = match payload.commits {
                Some(n) => n,
                None => engine.remote().pull_request(repository, payload.number).await?.commits,
            };
            let pr = store.create_pr(NewPullRequest {
                repository: repository.to_string(),
                number: payload.number,
                target: target.to_string(),
                author: payload.user.login.clone(),
                head: payload.head.sha.clone(),
                label: payload.head.label.clone(),
                message: payload.message(),
                draft: payload.draft,
                squash: commits == 1,
            })?;
            flag_commit(engine, &pr.head)?;
            if let Some(body) = &payload.body {
                commands::handle_comment(engine, pr.id, &event.sender.login, body)?;
            }
            Ok(format!("tracking {}", pr.display_name()))
        }
        ("opened" | "reopened", Some(mut pr)) => {
            if pr.state == PrState::Closed {
                pr.state = PrState::Opened;
                pr.reviewed_by = None;
            }
            pr.head.clone_from(&payload.head.sha);
            pr.draft = payload.draft;
            store.write_pr(&pr)?;
            flag_commit(engine, &pr.head)?;
            Ok(format!("reopened {}", pr.display_name()))
        }
        (_, None) => Ok(format!("unknown PR {repository}#{}", payload.number)),
        ("synchronize", Some(mut pr)) => {
            if pr.head == payload.head.sha {
                return Ok("head unchanged".to_string());
            }
            info!(pr = %pr.display_name(), from = %pr.head, to = %payload.head.sha, "PR updated");
            pr.head.clone_from(&payload.head.sha);
            if let Some(commits) = payload.commits {
                pr.squash = commits == 1;
            }
            pr.state = match pr.state {
                PrState::Error if pr.reviewed_by.is_some() => PrState::Approved,
                PrState::Error => PrState::Opened,
                other => other.invalidated(),
            };
            let reason = format!("{} updated", pr.display_name());
            unstage(store, &mut pr, &reason)?;
            store.write_pr(&pr)?;
            flag_commit(engine, &pr.head)?;
            Ok(format!("updated {} to {}", pr.display_name(), pr.head))
        }
        ("edited", Some(mut pr)) => {
            if target != pr.target {
                if !engine.config.is_managed(repository, target) {
                    unstage(store, &mut pr, "retargeted to an unmanaged branch")?;
                    store.write_pr(&pr)?;
                    store.delete_pr(pr.id)?;
                    return Ok(format!("forgot {} retargeted to {target}", pr.display_name()));
                }
                let reason = format!("{} retargeted", pr.display_name());
                unstage(store, &mut pr, &reason)?;
                pr.target = target.to_string();
            }
            let message = payload.message();
            if message != pr.message {
                debug!(pr = %pr.display_name(), changes = ?event.changes, "message updated");
                pr.message = message;
            }
            pr.draft = payload.draft;
            store.write_pr(&pr)?;
            Ok(format!("edited {}", pr.display_name()))
        }
        ("closed", Some(mut pr)) => {
            if pr.state == PrState::Merged {
                return Ok(format!("{} already merged", pr.display_name()));
            }
            if payload.merged {
                debug!(pr = %pr.display_name(), "merged outside of the bot");
            }
            pr.state = PrState::Closed;
            let reason = format!("{} closed", pr.display_name());
            unstage(store, &mut pr, &reason)?;
            store.write_pr(&pr)?;
            Ok(format!("closed {}", pr.display_name()))
        }
        ("converted_to_draft", Some(mut pr)) => {
            pr.draft = true;
            let reason = format!("{} converted to draft", pr.display_name());
            unstage(store, &mut pr, &reason)?;
            store.write_pr(&pr)?;
            Ok(format!("{} is a draft", pr.display_name()))
        }
        ("ready_for_review", Some(mut pr)) => {
            pr.draft = false;
            store.write_pr(&pr)?;
            Ok(format!("{} is ready for review", pr.display_name()))
        }
        (action, Some(pr)) => Ok(format!("ignored {action} on {}", pr.display_name())),
    }
}

/// Ask for the PRs on `sha` to be re-validated next tick, if statuses are known
fn flag_commit(engine: &Engine, sha: &str) -> Result<()> {
    let store = engine.store();
    if let Some(mut commit) = store.get_commit(sha)? {
        commit.to_check = true;
        store.write_commit(&commit)?;
    }
    Ok(())
}

fn handle_status(engine: &Engine, event: StatusEvent) -> Result<String> {
    let store = engine.store();
    let mut commit = store.get_commit(&event.sha)?.unwrap_or_else(|| Commit {
        sha: event.sha.clone(),
        statuses: BTreeMap::new(),
        to_check: false,
    });
    let status = CommitStatus {
        state: event.state,
        target_url: event.target_url,
        description: event.description,
    };
    let changed = commit.statuses.get(&event.context) != Some(&status);
    commit.statuses.insert(event.context.clone(), status);
    commit.to_check = true;
    store.write_commit(&commit)?;
    if changed {
        validator::extend_timeout(engine, &event.sha)?;
    }
    Ok(format!(
        "{}:{} {} is {}",
        event.repository.full_name, event.sha, event.context, event.state
    ))
}

fn handle_comment(
    engine: &Engine,
    repository: &str,
    number: u64,
    login: &str,
    body: &str,
) -> Result<String> {
    let Some(pr) = engine.store().find_pr(repository, number)? else {
        return Ok(format!("unknown PR {repository}#{number}"));
    };
    let applied = commands::handle_comment(engine, pr.id, login, body)?;
    Ok(format!("{} command(s) applied to {}", applied.len(), pr.display_name()))
}
