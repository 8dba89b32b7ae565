//! Shared fixtures: origin repositories, a configured engine and helpers to
//! drive it through webhook payloads
//!
//! These are test utilities - not every helper is used by every test binary.

#![allow(dead_code)]

mod fake_github;

pub use fake_github::FakeGitHub;

use mergebot::config::Config;
use mergebot::engine::Engine;
use mergebot::events;
use mergebot::store::{MemoryStore, Store};
use mergebot::types::{
    CommitStatus, PrCommit, PrState, Priority, PullRequest, RemotePullRequest, RemoteStatus,
    Signature, StatusState,
};
use serde_json::json;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use tempfile::TempDir;

pub const BOT_PREFIX: &str = "bot";
pub const REVIEWER: &str = "alice";
pub const CONTEXT: &str = "ci/build";

/// Run git in `dir`, optionally feeding stdin, and return trimmed stdout
pub fn git(dir: &Path, args: &[&str], stdin: Option<&str>) -> String {
    let mut child = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .env("GIT_AUTHOR_NAME", "Dev")
        .env("GIT_AUTHOR_EMAIL", "dev@example.com")
        .env("GIT_COMMITTER_NAME", "Dev")
        .env("GIT_COMMITTER_EMAIL", "dev@example.com")
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn git");
    if let Some(input) = stdin {
        child
            .stdin
            .take()
            .unwrap()
            .write_all(input.as_bytes())
            .unwrap();
    }
    let output = child.wait_with_output().unwrap();
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Config text for `repositories`, cloning from the origins in `origins`
pub fn config_text(origins: &Path, cache: &Path, repositories: &[&str]) -> String {
    let mut text = format!(
        r#"
[project]
name = "test"
github_prefix = "{BOT_PREFIX}"
github_name = "Bot"
github_email = "bot@example.com"
batch_limit = 8
ci_timeout = 60
git_url = "{}/{{repo}}"
cache_dir = "{}"

[[branches]]
name = "main"

[[reviewers]]
login = "{REVIEWER}"
name = "Alice"
email = "alice@example.com"
"#,
        origins.display(),
        cache.display()
    );
    for repository in repositories {
        text.push_str(&format!(
            "\n[[repositories]]\nname = \"{repository}\"\nrequired_statuses = [\"{CONTEXT}\"]\n"
        ));
    }
    text
}

/// An engine over fresh origin repositories, each with `main` at a root commit
pub struct Harness {
    pub dir: TempDir,
    pub github: Arc<FakeGitHub>,
    pub store: Arc<MemoryStore>,
    pub engine: Engine,
}

impl Harness {
    pub fn new(repositories: &[&str]) -> Self {
        Self::with_batch_limit(repositories, 8)
    }

    /// Like [`Harness::new`], staging at most `limit` batches at once
    pub fn with_batch_limit(repositories: &[&str], limit: usize) -> Self {
        let dir = TempDir::new().unwrap();
        let origins = dir.path().join("origins");
        let cache = dir.path().join("cache");
        for repository in repositories {
            let path = origins.join(repository);
            std::fs::create_dir_all(&path).unwrap();
            git(&path, &["init", "--bare", "--quiet"], None);
        }

        let text = config_text(&origins, &cache, repositories)
            .replace("batch_limit = 8", &format!("batch_limit = {limit}"));
        let config = Config::parse(&text).unwrap();
        let github = Arc::new(FakeGitHub::new(&origins));
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new(Arc::new(config), store.clone(), github.clone(), "token");

        let harness = Self {
            dir,
            github,
            store,
            engine,
        };
        for repository in repositories {
            let root = harness.commit(repository, &[], "README", "hello\n", "initial");
            harness.set_branch(repository, "main", &root);
        }
        harness
    }

    pub fn origin_path(&self, repository: &str) -> PathBuf {
        self.github.root().join(repository)
    }

    /// Bare mirror the engine keeps for `repository`
    pub fn mirror_path(&self, repository: &str) -> PathBuf {
        self.dir.path().join("cache").join(repository)
    }

    /// Tree of the first parent with one file added or replaced
    fn tree(&self, repository: &str, parent: Option<&str>, file: &str, content: &str) -> String {
        let path = self.origin_path(repository);
        let blob = git(&path, &["hash-object", "-w", "--stdin"], Some(content));
        let mut entries: String = match parent {
            Some(parent) => git(&path, &["ls-tree", parent], None)
                .lines()
                .filter(|l| !l.ends_with(&format!("\t{file}")))
                .map(|l| format!("{l}\n"))
                .collect(),
            None => String::new(),
        };
        entries.push_str(&format!("100644 blob {blob}\t{file}\n"));
        git(&path, &["mktree"], Some(&entries))
    }

    /// Create a commit in an origin, adding or replacing one file
    pub fn commit(
        &self,
        repository: &str,
        parents: &[&str],
        file: &str,
        content: &str,
        message: &str,
    ) -> String {
        let tree = self.tree(repository, parents.first().copied(), file, content);
        let mut args = vec!["commit-tree", tree.as_str()];
        for parent in parents {
            args.extend(["-p", parent]);
        }
        git(&self.origin_path(repository), &args, Some(message))
    }

    /// Like [`Harness::commit`], authored and committed by `who`
    pub fn commit_as(
        &self,
        repository: &str,
        parents: &[&str],
        file: &str,
        content: &str,
        message: &str,
        who: &Signature,
    ) -> String {
        let tree = self.tree(repository, parents.first().copied(), file, content);
        let mut raw = format!("tree {tree}\n");
        for parent in parents {
            raw.push_str(&format!("parent {parent}\n"));
        }
        let ident = format!("{} <{}> 1700000000 +0000", who.name, who.email);
        raw.push_str(&format!("author {ident}\ncommitter {ident}\n\n{message}"));
        git(
            &self.origin_path(repository),
            &["hash-object", "-t", "commit", "-w", "--stdin"],
            Some(&raw),
        )
    }

    /// Force a branch of an origin, as a push from outside the bot would
    pub fn set_branch(&self, repository: &str, branch: &str, sha: &str) {
        git(
            &self.origin_path(repository),
            &["update-ref", &format!("refs/heads/{branch}"), sha],
            None,
        );
    }

    pub fn branch(&self, repository: &str, branch: &str) -> String {
        self.github.branch(repository, branch).unwrap()
    }

    /// Full message of a commit in an origin
    pub fn message(&self, repository: &str, sha: &str) -> String {
        git(&self.origin_path(repository), &["log", "-1", "--format=%B", sha], None)
    }

    /// Open PR `number` on `main` with one commit per `(file, content)`, then
    /// deliver the `opened` webhook. Returns the PR's commit shas.
    pub async fn open_pr(
        &self,
        repository: &str,
        number: u64,
        label: &str,
        title: &str,
        files: &[(&str, &str)],
    ) -> Vec<String> {
        let mut parent = self.branch(repository, "main");
        let mut commits = Vec::new();
        for (i, (file, content)) in files.iter().enumerate() {
            let message = format!("{title} part {}\n", i + 1);
            let sha = self.commit(repository, &[&parent], file, content, &message);
            commits.push(PrCommit {
                sha: sha.clone(),
                parents: vec![parent.clone()],
                message,
                author: Signature::new("Dev", "dev@example.com"),
                committer: Signature::new("Dev", "dev@example.com"),
            });
            parent = sha;
        }
        self.open_pr_commits(repository, number, label, title, commits)
            .await
    }

    /// Open PR `number` on `main` whose commits (oldest first) already exist
    /// in the origin, then deliver the `opened` webhook
    pub async fn open_pr_commits(
        &self,
        repository: &str,
        number: u64,
        label: &str,
        title: &str,
        commits: Vec<PrCommit>,
    ) -> Vec<String> {
        let head = commits.last().unwrap().sha.clone();
        git(
            &self.origin_path(repository),
            &["update-ref", &format!("refs/pull/{number}/head"), &head],
            None,
        );

        let remote = RemotePullRequest {
            number,
            title: title.to_string(),
            body: Some(format!("Body of {title}")),
            base_ref: "main".to_string(),
            head_sha: head.clone(),
            head_label: label.to_string(),
            commits: commits.len() as u64,
            draft: false,
            open: true,
        };
        let shas = commits.iter().map(|c| c.sha.clone()).collect();
        self.github.set_pull_request(repository, remote.clone(), commits);

        let payload = pr_payload("opened", repository, &remote, "dev");
        events::handle(&self.engine, "pull_request", &payload)
            .await
            .unwrap();
        shas
    }

    /// Comment on a PR as `login`
    pub async fn comment(&self, repository: &str, number: u64, login: &str, body: &str) -> String {
        let payload = json!({
            "action": "created",
            "issue": { "number": number, "pull_request": {} },
            "comment": { "body": body, "user": { "login": login } },
            "repository": { "full_name": repository },
        });
        events::handle(&self.engine, "issue_comment", &payload)
            .await
            .unwrap()
    }

    /// `r+` from the configured reviewer
    pub async fn approve(&self, repository: &str, number: u64) {
        self.comment(repository, number, REVIEWER, &format!("{BOT_PREFIX} r+"))
            .await;
    }

    /// Deliver a `status` webhook for the required context
    pub async fn status(&self, repository: &str, sha: &str, state: &str) {
        let payload = json!({
            "sha": sha,
            "context": CONTEXT,
            "state": state,
            "target_url": format!("https://ci.example.com/{sha}"),
            "description": null,
            "repository": { "full_name": repository },
        });
        events::handle(&self.engine, "status", &payload)
            .await
            .unwrap();
    }

    /// Open, approve and validate a PR so the next tick stages it
    pub async fn ready_pr(
        &self,
        repository: &str,
        number: u64,
        label: &str,
        files: &[(&str, &str)],
    ) -> PullRequest {
        let shas = self
            .open_pr(repository, number, label, &format!("Change {number}"), files)
            .await;
        self.approve(repository, number).await;
        self.status(repository, shas.last().unwrap(), "success").await;
        self.pr(repository, number)
    }

    /// Report the required context on every head of the active staging
    pub fn staging_ci(&self, state: StatusState) {
        let staging = self.store.active_staging("main").unwrap().unwrap();
        for head in &staging.heads {
            self.github.set_status(
                &head.head,
                RemoteStatus {
                    context: CONTEXT.to_string(),
                    status: CommitStatus {
                        state,
                        target_url: Some(format!("https://ci.example.com/{}", head.repository)),
                        description: None,
                    },
                },
            );
        }
    }

    pub fn pr(&self, repository: &str, number: u64) -> PullRequest {
        self.store.find_pr(repository, number).unwrap().unwrap()
    }
}

/// `pull_request` webhook payload for `pr`
pub fn pr_payload(action: &str, repository: &str, pr: &RemotePullRequest, sender: &str) -> serde_json::Value {
    json!({
        "action": action,
        "pull_request": {
            "number": pr.number,
            "title": pr.title,
            "body": pr.body,
            "draft": pr.draft,
            "state": if pr.open { "open" } else { "closed" },
            "merged": false,
            "head": { "ref": "feature", "sha": pr.head_sha, "label": pr.head_label },
            "base": { "ref": pr.base_ref, "sha": "", "label": "" },
            "user": { "login": "dev" },
            "commits": pr.commits,
        },
        "repository": { "full_name": repository },
        "sender": { "login": sender },
    })
}

/// A PR record for tests which never touch git
pub fn make_pr(id: u64, label: &str, state: PrState, priority: Priority) -> PullRequest {
    PullRequest {
        id,
        repository: "acme/app".into(),
        number: id,
        target: "main".into(),
        author: "dev".into(),
        head: format!("{id:040}"),
        label: label.into(),
        message: format!("Change {id}"),
        draft: false,
        squash: true,
        merge_method: None,
        method_warned: false,
        priority,
        state,
        reviewed_by: None,
        delegates: Default::default(),
        batch: None,
        commits_map: Default::default(),
        synced_tags: None,
    }
}
