//! The four merge strategies
//!
//! Each strategy records a PR on top of the running head of its repository
//! and returns the new head with the PR's commit mapping (original sha to
//! staged sha, `""` to the PR's contribution to the staging head).

use crate::error::{Error, StageError};
use crate::git::{CommitTree, Repo};
use crate::message::{MessageSource, add_self_references, build_merge_message};
use crate::types::{MergeMethod, PrCommit, PullRequest, Signature};
use std::collections::{BTreeMap, BTreeSet};

/// New head and commit mapping
pub type Staged = (String, BTreeMap<String, String>);

/// What every strategy works with
#[derive(Debug)]
pub struct StrategyInput<'a> {
    /// Local mirror of the PR's repository
    pub repo: &'a Repo,
    /// PR being staged (already revalidated)
    pub pr: &'a PullRequest,
    /// Running head of the repository
    pub base: &'a str,
    /// Other PRs of the batch
    pub related: &'a [PullRequest],
    /// Bot identity
    pub bot: &'a Signature,
}

impl StrategyInput<'_> {
    /// Git failures are the PR's problem, anything else aborts the staging
    fn merge_error(&self, err: Error) -> StageError {
        match err {
            Error::Merge(reason) | Error::Git(reason) => StageError::Merge {
                pr: self.pr.id,
                name: self.pr.display_name(),
                reason,
            },
            other => StageError::Fatal(other),
        }
    }
}

/// Stage `input.pr` with `method`; `commits` are oldest first
pub fn apply(
    method: MergeMethod,
    input: &StrategyInput<'_>,
    commits: &mut [PrCommit],
) -> Result<Staged, StageError> {
    match method {
        MergeMethod::Merge => merge(input, commits),
        MergeMethod::RebaseMerge => rebase_merge(input, commits),
        MergeMethod::RebaseFf => rebase_ff(input, commits),
        MergeMethod::Squash => squash(input, commits),
    }
    .map_err(|e| match e {
        StageError::Fatal(err) => input.merge_error(err),
        other => other,
    })
}

fn squash(input: &StrategyInput<'_>, commits: &[PrCommit]) -> Result<Staged, StageError> {
    let mut message = build_merge_message(input.pr, MessageSource::PullRequest, input.related);

    let authors: BTreeSet<(&str, &str)> = commits
        .iter()
        .map(|c| (c.author.name.as_str(), c.author.email.as_str()))
        .collect();
    let author = if let [(name, email)] = authors.iter().copied().collect::<Vec<_>>().as_slice() {
        Signature::new(*name, *email)
    } else {
        for (name, email) in &authors {
            message
                .headers
                .add_unique("Co-authored-by", &format!("{name} <{email}>"));
        }
        input.bot.clone()
    };

    let committers: BTreeSet<(&str, &str)> = commits
        .iter()
        .map(|c| (c.committer.name.as_str(), c.committer.email.as_str()))
        .collect();
    let committer = match committers.iter().copied().collect::<Vec<_>>().as_slice() {
        [(name, email)] => Signature::new(*name, *email),
        _ => input.bot.clone(),
    };

    let tree = input.repo.merge_tree(input.base, &input.pr.head)?;
    let head = input.repo.commit_tree(&CommitTree {
        tree: &tree,
        parents: vec![input.base],
        message: &message.to_string(),
        author: &author,
        committer: Some(&committer),
    })?;

    let mut map: BTreeMap<String, String> =
        commits.iter().map(|c| (c.sha.clone(), head.clone())).collect();
    map.insert(String::new(), head.clone());
    Ok((head, map))
}

fn rebase_ff(input: &StrategyInput<'_>, commits: &mut [PrCommit]) -> Result<Staged, StageError> {
    let Some((last, rest)) = commits.split_last_mut() else {
        return Err(input.merge_error(Error::Merge("the PR has no commits".into())));
    };
    let message = build_merge_message(input.pr, MessageSource::Commit(&last.message), input.related);
    last.message = message.to_string();
    add_self_references(input.pr, rest);

    let (head, mut map) = input.repo.rebase(input.base, commits)?;
    map.insert(String::new(), head.clone());
    Ok((head, map))
}

fn rebase_merge(input: &StrategyInput<'_>, commits: &mut [PrCommit]) -> Result<Staged, StageError> {
    add_self_references(input.pr, commits);
    let (rebased, mut map) = input.repo.rebase(input.base, commits)?;

    let message = build_merge_message(input.pr, MessageSource::PullRequest, input.related);
    let head = input
        .repo
        .merge(input.base, &rebased, &message.to_string(), input.bot)?;
    map.insert(String::new(), head.clone());
    Ok((head, map))
}

fn merge(input: &StrategyInput<'_>, commits: &[PrCommit]) -> Result<Staged, StageError> {
    let Some(pr_head) = commits.last() else {
        return Err(input.merge_error(Error::Merge("the PR has no commits".into())));
    };
    let mut map: BTreeMap<String, String> = commits
        .iter()
        .map(|c| (c.sha.clone(), c.sha.clone()))
        .collect();

    // a head merging the target into the PR is replicated on top of the
    // running head instead of being merged again
    let own: BTreeSet<&str> = commits.iter().map(|c| c.sha.as_str()).collect();
    let external: Vec<&str> = pr_head
        .parents
        .iter()
        .map(String::as_str)
        .filter(|p| !own.contains(p))
        .collect();

    if pr_head.parents.len() > 1 {
        match external.as_slice() {
            [] => {}
            [base_commit] => {
                let tree = input.repo.merge_tree(input.base, &pr_head.sha)?;
                // running head first so first-parent history follows the branch
                let parents: Vec<&str> = std::iter::once(input.base)
                    .chain(
                        pr_head
                            .parents
                            .iter()
                            .map(String::as_str)
                            .filter(|p| p != base_commit),
                    )
                    .collect();
                let message =
                    build_merge_message(input.pr, MessageSource::Commit(&pr_head.message), input.related);
                let copy = input.repo.commit_tree(&CommitTree {
                    tree: &tree,
                    parents,
                    message: &message.to_string(),
                    author: &pr_head.author,
                    committer: Some(&pr_head.committer),
                })?;
                map.insert(pr_head.sha.clone(), copy.clone());
                map.insert(String::new(), copy.clone());
                return Ok((copy, map));
            }
            many => {
                return Err(StageError::Unmergeable {
                    pr: input.pr.id,
                    name: input.pr.display_name(),
                    reason: format!(
                        "The PR head can only have one parent from the base branch (not part of the PR itself), found {}: {}",
                        many.len(),
                        many.join(", ")
                    ),
                });
            }
        }
    }

    let message = build_merge_message(input.pr, MessageSource::PullRequest, input.related);
    let head = input
        .repo
        .merge(input.base, &input.pr.head, &message.to_string(), input.bot)?;
    map.insert(String::new(), head.clone());
    Ok((head, map))
}
