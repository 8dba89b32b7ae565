//! Git façade: typed plumbing over the `git` executable
//!
//! Every repository is kept as a bare mirror under the cache directory.
//! Nothing here checks out a working tree: merges and rebases are computed
//! with `merge-tree --write-tree` and recorded with `commit-tree`, so the
//! mirror only ever gains objects and the refs we explicitly move.

use crate::error::{Error, Result};
use crate::types::{PrCommit, Signature};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, trace};

/// Options applied to every invocation, background maintenance must never
/// run while we are building stagings
const CONFIG_OVERRIDES: [&str; 4] = ["-c", "gc.auto=0", "-c", "maintenance.auto=0"];

/// Output of a git invocation
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// Exit code, 1 when killed by a signal
    pub exit_code: i32,
}

impl ExecResult {
    /// Whether git exited with 0
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout and stderr, for error messages
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Cache of bare mirrors, one per repository
#[derive(Debug, Clone)]
pub struct GitCache {
    root: PathBuf,
}

impl GitCache {
    /// Cache rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Open the mirror of `repository`, creating it if needed
    ///
    /// The mirror fetches every branch except our own scratch refs, which are
    /// force-pushed from here and would only churn.
    pub fn get_local(&self, repository: &str, url: &str) -> Result<Repo> {
        let path = self.root.join(repository);
        let repo = Repo::new(&path);
        if !path.join("HEAD").exists() {
            debug!(repository, path = %path.display(), "creating bare mirror");
            fs::create_dir_all(&path)?;
            repo.check(&["init", "--bare", "--quiet"])?;
            repo.check(&["remote", "add", "origin", url])?;
            repo.check(&["config", "remote.origin.fetch", "+refs/heads/*:refs/heads/*"])?;
            repo.check(&["config", "--add", "remote.origin.fetch", "^refs/heads/tmp.*"])?;
            repo.check(&["config", "--add", "remote.origin.fetch", "^refs/heads/staging.*"])?;
        } else {
            repo.check(&["remote", "set-url", "origin", url])?;
        }
        Ok(repo)
    }

    /// Mirrors currently present in the cache
    pub fn cached(&self) -> Result<Vec<Repo>> {
        let mut repos = Vec::new();
        if !self.root.exists() {
            return Ok(repos);
        }
        for owner in fs::read_dir(&self.root)? {
            let owner = owner?.path();
            if !owner.is_dir() {
                continue;
            }
            for name in fs::read_dir(&owner)? {
                let path = name?.path();
                if path.join("HEAD").exists() {
                    repos.push(Repo::new(path));
                }
            }
        }
        repos.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(repos)
    }
}

/// Request for `commit-tree`
#[derive(Debug, Clone)]
pub struct CommitTree<'a> {
    /// Tree sha
    pub tree: &'a str,
    /// Parent shas, in order
    pub parents: Vec<&'a str>,
    /// Full message
    pub message: &'a str,
    /// Author identity
    pub author: &'a Signature,
    /// Committer identity, defaults to the author
    pub committer: Option<&'a Signature>,
}

/// A git repository (usually a bare mirror)
#[derive(Debug, Clone)]
pub struct Repo {
    path: PathBuf,
}

impl Repo {
    /// Repository at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Filesystem location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run git with `args`
    pub fn exec(&self, args: &[&str]) -> Result<ExecResult> {
        self.exec_env(args, &[], None)
    }

    fn exec_env(
        &self,
        args: &[&str],
        env: &[(&str, &str)],
        stdin: Option<&str>,
    ) -> Result<ExecResult> {
        trace!(path = %self.path.display(), ?args, "git");
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(&self.path);
        cmd.args(CONFIG_OVERRIDES);
        cmd.args(args);
        cmd.envs(env.iter().copied());
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Git(format!("failed to spawn git {}: {e}", args.join(" "))))?;
        if let Some(input) = stdin
            && let Some(mut pipe) = child.stdin.take()
        {
            use std::io::Write;
            pipe.write_all(input.as_bytes())?;
        }
        let output = child.wait_with_output()?;

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }

    /// Run git, failing on non-zero exit, and return trimmed stdout
    fn check(&self, args: &[&str]) -> Result<String> {
        let result = self.exec(args)?;
        if !result.success() {
            return Err(Error::Git(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                result.combined_output().trim()
            )));
        }
        Ok(result.stdout.trim().to_string())
    }

    /// Fetch explicit refspecs from `remote`
    pub fn fetch(&self, remote: &str, refspecs: &[String]) -> Result<()> {
        let mut args = vec!["fetch", "--quiet", "--no-tags", remote];
        args.extend(refspecs.iter().map(String::as_str));
        self.check(&args).map(drop)
    }

    /// Push a single refspec to `remote`
    pub fn push(&self, remote: &str, refspec: &str, force: bool) -> Result<()> {
        let mut args = vec!["push", "--quiet"];
        if force {
            args.push("--force");
        }
        args.extend([remote, refspec]);
        self.check(&args).map(drop)
    }

    /// Resolve a revision to a full sha
    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        self.check(&["rev-parse", "--verify", "--quiet", &format!("{rev}^{{commit}}")])
            .map_err(|_| Error::Git(format!("unknown revision {rev}")))
    }

    /// Resolve a revision to its tree
    pub fn tree_of(&self, rev: &str) -> Result<String> {
        self.check(&["rev-parse", &format!("{rev}^{{tree}}")])
    }

    /// Move a local ref
    pub fn set_ref(&self, name: &str, sha: &str) -> Result<()> {
        self.check(&["update-ref", name, sha]).map(drop)
    }

    /// Three-way merge of two commits, returning the resulting tree
    ///
    /// Conflicts are reported as [`Error::Merge`] with git's conflict listing.
    pub fn merge_tree(&self, c1: &str, c2: &str) -> Result<String> {
        let result = self.exec(&["merge-tree", "--write-tree", "--messages", c1, c2])?;
        match result.exit_code {
            0 => Ok(result.stdout.lines().next().unwrap_or_default().to_string()),
            1 => {
                let details: Vec<&str> = result.stdout.lines().skip(1).collect();
                Err(Error::Merge(format!(
                    "conflict merging {c2} into {c1}:\n{}",
                    details.join("\n").trim()
                )))
            }
            _ => Err(Error::Merge(format!(
                "unable to merge {c2} into {c1}: {}",
                result.combined_output().trim()
            ))),
        }
    }

    /// Create a commit object
    pub fn commit_tree(&self, req: &CommitTree<'_>) -> Result<String> {
        let committer = req.committer.unwrap_or(req.author);
        let mut env = vec![
            ("GIT_AUTHOR_NAME", req.author.name.as_str()),
            ("GIT_AUTHOR_EMAIL", req.author.email.as_str()),
            ("GIT_COMMITTER_NAME", committer.name.as_str()),
            ("GIT_COMMITTER_EMAIL", committer.email.as_str()),
            ("TZ", "UTC"),
        ];
        if let Some(date) = &req.author.date {
            env.push(("GIT_AUTHOR_DATE", date));
        }
        if let Some(date) = &committer.date {
            env.push(("GIT_COMMITTER_DATE", date));
        }

        let mut args = vec!["commit-tree", req.tree];
        for parent in &req.parents {
            args.extend(["-p", *parent]);
        }
        args.extend(["-F", "-"]);

        let result = self.exec_env(&args, &env, Some(req.message))?;
        if !result.success() {
            return Err(Error::Git(format!(
                "git commit-tree failed: {}",
                result.combined_output().trim()
            )));
        }
        Ok(result.stdout.trim().to_string())
    }

    /// Replay `commits` (oldest first) on top of `dest`
    ///
    /// Returns the new head and the original to rebased sha mapping. The
    /// series must be linear: each commit's only parent is its predecessor.
    pub fn rebase(
        &self,
        dest: &str,
        commits: &[PrCommit],
    ) -> Result<(String, BTreeMap<String, String>)> {
        let Some(first) = commits.first() else {
            return Err(Error::Merge("nothing to rebase".into()));
        };
        debug!(dest, from = %first.sha, count = commits.len(), "rebasing");

        let mut mapping = BTreeMap::new();
        // merge-tree base chain: each temp commit has the original as second
        // parent so the next merge uses the previous original as merge base
        let mut base = dest.to_string();
        let mut head = dest.to_string();
        let mut expected_parent: Option<&str> = None;

        for original in commits {
            let [parent] = original.parents.as_slice() else {
                return Err(Error::Merge(format!(
                    "commits with multiple parents ({}) can not be rebased",
                    original.sha
                )));
            };
            if let Some(expected) = expected_parent
                && parent != expected
            {
                return Err(Error::Merge(format!(
                    "{} is not a child of {expected}, the series was modified during rebase",
                    original.sha
                )));
            }
            expected_parent = Some(original.sha.as_str());

            let tree = self.merge_tree(&base, &original.sha)?;
            base = self.commit_tree(&CommitTree {
                tree: &tree,
                parents: vec![base.as_str(), original.sha.as_str()],
                message: "temp",
                author: &original.author,
                committer: Some(&original.committer),
            })?;

            let committer = Signature::new(&original.committer.name, &original.committer.email);
            head = self.commit_tree(&CommitTree {
                tree: &tree,
                parents: vec![head.as_str()],
                message: &original.message,
                author: &original.author,
                committer: Some(&committer),
            })?;
            mapping.insert(original.sha.clone(), head.clone());
        }

        Ok((head, mapping))
    }

    /// Merge `c2` into `c1`, producing a two-parent commit
    pub fn merge(&self, c1: &str, c2: &str, message: &str, author: &Signature) -> Result<String> {
        let tree = self.merge_tree(c1, c2)?;
        self.commit_tree(&CommitTree {
            tree: &tree,
            parents: vec![c1, c2],
            message,
            author,
            committer: None,
        })
    }

    /// Aggressive garbage collection
    pub fn gc(&self) -> Result<()> {
        self.check(&["gc", "--aggressive", "--prune=now", "--quiet"])
            .map(drop)
    }
}
