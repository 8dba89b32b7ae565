//! Comment command interpreter
//!
//! Commands are lines addressed to the bot (`robodoo r+ rebase-ff`), each
//! holding whitespace-separated tokens. Who may run what depends on the
//! user's role on the PR.

use crate::engine::Engine;
use crate::error::Result;
use crate::staging::{cancel_staging, unstage};
use crate::types::{MergeMethod, PrState, Priority, PullRequest, Reviewer};
use crate::validator::ci_state;
use regex::Regex;
use std::fmt;
use tracing::{debug, info};

/// A parsed command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `r+` / `review+` (true), `r-` / `review-` (false)
    Review(bool),
    /// `delegate+` (the author, `None`) or `delegate=a,b`
    Delegate(Option<Vec<String>>),
    /// `p=N` / `priority=N`
    Priority(Priority),
    /// `retry`
    Retry,
    /// Merge method selection
    Method(MergeMethod),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Review(true) => f.write_str("review+"),
            Self::Review(false) => f.write_str("review-"),
            Self::Delegate(None) => f.write_str("delegate+"),
            Self::Delegate(Some(users)) => write!(f, "delegate={}", users.join(",")),
            Self::Priority(p) => write!(f, "priority={p}"),
            Self::Retry => f.write_str("retry"),
            Self::Method(m) => write!(f, "{m}"),
        }
    }
}

/// A user's standing on a PR, each role includes the ones below it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    /// Nobody in particular
    None,
    /// PR author
    Author,
    /// Delegated reviewer
    Reviewer,
    /// Project reviewer
    Admin,
}

impl Command {
    /// Role needed to run the command
    pub const fn required_role(&self) -> Role {
        match self {
            Self::Review(false) | Self::Retry => Role::Author,
            Self::Review(true) | Self::Delegate(_) | Self::Method(_) => Role::Reviewer,
            Self::Priority(_) => Role::Admin,
        }
    }
}

/// Parse one token
pub fn parse_token(token: &str) -> Option<Command> {
    let lower = token.to_ascii_lowercase();
    if let Ok(method) = lower.parse::<MergeMethod>() {
        return Some(Command::Method(method));
    }
    if let Some((name, value)) = lower.split_once('=') {
        return match name {
            "p" | "priority" => value
                .parse::<u8>()
                .ok()
                .and_then(|v| Priority::try_from(v).ok())
                .map(Command::Priority),
            "delegate" => {
                let users: Vec<String> = value
                    .split(',')
                    .map(|u| u.trim().trim_start_matches(['@', '#']).to_string())
                    .filter(|u| !u.is_empty())
                    .collect();
                (!users.is_empty()).then_some(Command::Delegate(Some(users)))
            }
            _ => None,
        };
    }
    match lower.as_str() {
        "r+" | "review+" => Some(Command::Review(true)),
        "r-" | "review-" => Some(Command::Review(false)),
        "delegate+" => Some(Command::Delegate(None)),
        "retry" => Some(Command::Retry),
        _ => None,
    }
}

/// Tokens of every line of `body` addressed to `prefix`
pub fn find_commands(prefix: &str, body: &str) -> Vec<String> {
    let pattern = format!(r"(?mi)^[ \t]*[@#]?{}:?[ \t]+(.*)$", regex::escape(prefix));
    let Ok(re) = Regex::new(&pattern) else {
        return Vec::new();
    };
    re.captures_iter(body)
        .flat_map(|caps| {
            caps[1]
                .split_whitespace()
                .map(String::from)
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Role of `login` on `pr`
pub fn role(engine: &Engine, pr: &PullRequest, login: &str) -> Role {
    if engine.config.reviewer(login).is_some() {
        Role::Admin
    } else if pr.delegates.contains(&login.to_lowercase()) {
        Role::Reviewer
    } else if pr.author.eq_ignore_ascii_case(login) {
        Role::Author
    } else {
        Role::None
    }
}

fn feedback(engine: &Engine, pr: &PullRequest, message: String) -> Result<()> {
    engine
        .store()
        .push_feedback(&pr.repository, pr.number, Some(message), false)
}

/// Comment offering the merge methods of a multi-commit PR
pub fn method_selection_message(login: &str) -> String {
    let mut message = format!(
        "@{login} because this PR has multiple commits, I need to know how to merge it:\n\n"
    );
    for method in MergeMethod::ALL {
        message.push_str(&format!("* `{method}` to {}\n", method.description()));
    }
    message
}

/// Run the commands found in `body`, posted by `login`, on the PR with id `pr_id`
///
/// Returns the commands that were applied.
pub fn handle_comment(engine: &Engine, pr_id: u64, login: &str, body: &str) -> Result<Vec<Command>> {
    let store = engine.store();
    let tokens = find_commands(&engine.config.project.github_prefix, body);
    if tokens.is_empty() {
        return Ok(Vec::new());
    }

    let mut pr = store.get_pr(pr_id)?;
    let role = role(engine, &pr, login);
    if role == Role::None {
        debug!(pr = %pr.display_name(), login, "commands from unknown user");
        feedback(engine, &pr, format!("I'm sorry, @{login}. I'm afraid I can't do that."))?;
        return Ok(Vec::new());
    }

    let mut applied = Vec::new();
    for token in tokens {
        let Some(command) = parse_token(&token) else {
            feedback(engine, &pr, format!("Sorry, @{login}. I didn't understand `{token}`."))?;
            continue;
        };
        if role < command.required_role() {
            feedback(engine, &pr, format!("I'm sorry, @{login}. You can't {command}."))?;
            continue;
        }
        if apply(engine, &mut pr, login, &command)? {
            info!(pr = %pr.display_name(), login, %command, "applied command");
            applied.push(command);
        }
    }

    store.write_pr(&pr)?;
    Ok(applied)
}

fn apply(engine: &Engine, pr: &mut PullRequest, login: &str, command: &Command) -> Result<bool> {
    let store = engine.store();
    match command {
        Command::Review(true) => {
            if pr.draft {
                feedback(engine, pr, format!("I'm sorry, @{login}. Draft PRs can not be approved."))?;
                return Ok(false);
            }
            let reviewer = engine.config.reviewer(login);
            if pr.author.eq_ignore_ascii_case(login) && reviewer.is_some_and(|r| !r.self_review) {
                feedback(engine, pr, format!("I'm sorry, @{login}. You can't review+ your own PR."))?;
                return Ok(false);
            }
            pr.reviewed_by = Some(reviewer.map_or_else(
                || Reviewer {
                    login: login.to_string(),
                    name: login.to_string(),
                    email: format!("{login}@users.noreply.github.com"),
                },
                crate::config::ReviewerConfig::to_reviewer,
            ));
            pr.state = pr.state.reviewed();

            let statuses = store
                .get_commit(&pr.head)?
                .map(|c| c.statuses)
                .unwrap_or_default();
            let required = engine.config.required_contexts(&pr.repository, &pr.target, false);
            if ci_state(&statuses, &required).0 == crate::types::CiState::Failure {
                feedback(
                    engine,
                    pr,
                    format!("@{login} you may want to rebuild or fix this PR as it has failed CI."),
                )?;
            }
            if !pr.has_merge_method() && !pr.method_warned {
                feedback(engine, pr, method_selection_message(login))?;
                pr.method_warned = true;
            }
        }
        Command::Review(false) => {
            pr.state = pr.state.unreviewed();
            pr.reviewed_by = None;
            if pr.priority == Priority::Urgent {
                pr.priority = Priority::Pressing;
            }
            unstage(store, pr, &format!("unreviewed (r-) by {login}"))?;
        }
        Command::Delegate(None) => {
            pr.delegates.insert(pr.author.to_lowercase());
        }
        Command::Delegate(Some(users)) => {
            pr.delegates
                .extend(users.iter().map(|u| u.to_lowercase()));
        }
        Command::Priority(priority) => {
            pr.priority = *priority;
            if *priority == Priority::Urgent
                && let Some(mut staging) = store.active_staging(&pr.target)?
            {
                cancel_staging(store, &mut staging, &format!("P=0 on {}", pr.display_name()))?;
                pr.batch = store.get_pr(pr.id)?.batch;
            }
        }
        Command::Retry => {
            if pr.state != PrState::Error {
                feedback(
                    engine,
                    pr,
                    format!("@{login} retry makes no sense when the PR is not in error."),
                )?;
                return Ok(false);
            }
            pr.state = PrState::Ready;
        }
        Command::Method(method) => {
            pr.merge_method = Some(*method);
        }
    }
    Ok(true)
}
