//! GitHub implementation of [`RemoteClient`]

use super::retry::{wait_for, with_backoff};
use super::{MAX_PR_COMMITS, RemoteClient, split_repository, topological_sort};
use crate::error::{Error, Result};
use crate::types::{
    CommitStatus, PrCommit, RemotePullRequest, RemoteStatus, Signature, StatusState,
};
use async_trait::async_trait;
use octocrab::Octocrab;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

const PAGE_SIZE: usize = 100;

#[derive(Deserialize)]
struct RefObject {
    object: RefTarget,
}

#[derive(Deserialize)]
struct RefTarget {
    sha: String,
}

#[derive(Deserialize)]
struct ApiCommit {
    sha: String,
    parents: Vec<ApiParent>,
    commit: ApiCommitData,
}

#[derive(Deserialize)]
struct ApiParent {
    sha: String,
}

#[derive(Deserialize)]
struct ApiCommitData {
    message: String,
    author: Option<ApiSignature>,
    committer: Option<ApiSignature>,
}

#[derive(Deserialize, Default)]
struct ApiSignature {
    #[serde(default)]
    name: String,
    #[serde(default)]
    email: String,
    date: Option<String>,
}

impl From<ApiSignature> for Signature {
    fn from(s: ApiSignature) -> Self {
        Self {
            name: s.name,
            email: s.email,
            date: s.date,
        }
    }
}

impl From<ApiCommit> for PrCommit {
    fn from(c: ApiCommit) -> Self {
        Self {
            sha: c.sha,
            parents: c.parents.into_iter().map(|p| p.sha).collect(),
            message: c.commit.message,
            author: c.commit.author.unwrap_or_default().into(),
            committer: c.commit.committer.unwrap_or_default().into(),
        }
    }
}

#[derive(Deserialize)]
struct CombinedStatus {
    statuses: Vec<ApiStatus>,
}

#[derive(Deserialize)]
struct ApiStatus {
    context: String,
    state: StatusState,
    target_url: Option<String>,
    description: Option<String>,
}

#[derive(Deserialize)]
struct ApiLabel {
    name: String,
}

/// GitHub service using octocrab for PR reads and comments, raw REST for the rest
pub struct GitHubService {
    client: Octocrab,
    /// HTTP client for git data, status and label endpoints
    http_client: Client,
    token: String,
    /// REST endpoint, without trailing slash
    api_url: String,
}

impl GitHubService {
    /// Create a new GitHub service
    pub fn new(token: &str, api_url: &str) -> Result<Self> {
        let api_url = api_url.trim_end_matches('/').to_string();
        let client = Octocrab::builder()
            .personal_token(token.to_string())
            .base_uri(&api_url)
            .map_err(|e| Error::GitHubApi(e.to_string()))?
            .build()
            .map_err(|e| Error::GitHubApi(e.to_string()))?;

        let http_client = Client::builder()
            .user_agent("mergebot")
            .build()
            .map_err(|e| Error::GitHubApi(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            http_client,
            token: token.to_string(),
            api_url,
        })
    }

    fn repo_url(&self, repository: &str, path: &str) -> String {
        format!("{}/repos/{repository}/{path}", self.api_url)
    }

    fn ref_url(&self, repository: &str, branch: &str) -> String {
        let branch = branch
            .split('/')
            .map(|s| urlencoding::encode(s).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        self.repo_url(repository, &format!("git/refs/heads/{branch}"))
    }

    /// Send a request, mapping non-2xx answers to [`Error::GitHubApi`] as
    /// `HTTP <code>: <message>`
    async fn send(&self, method: Method, url: &str, body: Option<&Value>) -> Result<reqwest::Response> {
        let mut request = self
            .http_client
            .request(method.clone(), url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| v.get("message").and_then(Value::as_str).map(String::from))
            .unwrap_or(text);
        debug!(%method, url, status = status.as_u16(), message, "GitHub request failed");
        Err(Error::GitHubApi(format!("HTTP {}: {message}", status.as_u16())))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        with_backoff(url, || async {
            let response = self.send(Method::GET, url, None).await?;
            Ok(response.json::<T>().await?)
        })
        .await
    }

    async fn patch_ref(&self, repository: &str, branch: &str, sha: &str, force: bool) -> Result<()> {
        let url = self.ref_url(repository, branch);
        let body = json!({ "sha": sha, "force": force });
        with_backoff(&url, || async {
            self.send(Method::PATCH, &url, Some(&body)).await.map(drop)
        })
        .await
    }

    /// Wait until GitHub reports `branch` at `sha`, ref updates are eventually
    /// consistent
    async fn confirm_ref(&self, repository: &str, branch: &str, sha: &str) -> Result<bool> {
        let seen = wait_for(sha, || self.head(repository, branch)).await?;
        if seen != sha {
            warn!(repository, branch, expected = sha, seen, "ref update not visible");
        }
        Ok(seen == sha)
    }
}

fn status_of(err: &Error) -> Option<u16> {
    match err {
        Error::GitHubApi(msg) => msg
            .strip_prefix("HTTP ")
            .and_then(|rest| rest.get(..3))
            .and_then(|code| code.parse().ok()),
        _ => None,
    }
}

#[async_trait]
impl RemoteClient for GitHubService {
    async fn head(&self, repository: &str, branch: &str) -> Result<String> {
        let r: RefObject = self.get_json(&self.ref_url(repository, branch)).await?;
        debug!(repository, branch, head = %r.object.sha, "read branch head");
        Ok(r.object.sha)
    }

    async fn pull_request(&self, repository: &str, number: u64) -> Result<RemotePullRequest> {
        let (owner, name) = split_repository(repository)?;
        let pr = self.client.pulls(owner, name).get(number).await?;

        Ok(RemotePullRequest {
            number: pr.number,
            title: pr.title.clone().unwrap_or_default(),
            body: pr.body.clone(),
            base_ref: pr.base.ref_field.clone(),
            head_sha: pr.head.sha.clone(),
            head_label: pr.head.label.clone().unwrap_or_default(),
            commits: pr.commits.unwrap_or(0),
            draft: pr.draft.unwrap_or(false),
            open: matches!(pr.state, Some(octocrab::models::IssueState::Open)),
        })
    }

    async fn commits(&self, repository: &str, number: u64) -> Result<Vec<PrCommit>> {
        let mut commits = Vec::new();
        for page in 1.. {
            let url = self.repo_url(
                repository,
                &format!("pulls/{number}/commits?per_page={PAGE_SIZE}&page={page}"),
            );
            let batch: Vec<ApiCommit> = self.get_json(&url).await?;
            let done = batch.len() < PAGE_SIZE;
            commits.extend(batch.into_iter().map(PrCommit::from));
            if done || commits.len() >= MAX_PR_COMMITS {
                break;
            }
        }
        debug!(repository, number, count = commits.len(), "fetched PR commits");
        Ok(topological_sort(commits))
    }

    async fn statuses(&self, repository: &str, sha: &str) -> Result<Vec<RemoteStatus>> {
        let url = self.repo_url(repository, &format!("commits/{sha}/status?per_page=100"));
        let combined: CombinedStatus = self.get_json(&url).await?;
        Ok(combined
            .statuses
            .into_iter()
            .map(|s| RemoteStatus {
                context: s.context,
                status: CommitStatus {
                    state: s.state,
                    target_url: s.target_url,
                    description: s.description,
                },
            })
            .collect())
    }

    async fn fast_forward(&self, repository: &str, branch: &str, sha: &str) -> Result<()> {
        let rejected = |reason: String| Error::FastForward {
            repository: repository.to_string(),
            branch: branch.to_string(),
            sha: sha.to_string(),
            reason,
        };
        if let Err(e) = self.patch_ref(repository, branch, sha, false).await {
            if status_of(&e) == Some(422) {
                debug!(repository, branch, sha, error = %e, "fast-forward rejected");
            } else {
                warn!(repository, branch, sha, error = %e, "fast-forward failed");
            }
            return Err(rejected(e.to_string()));
        }
        if !self.confirm_ref(repository, branch, sha).await? {
            return Err(rejected("the update did not become visible".to_string()));
        }
        info!(repository, branch, sha, "fast-forwarded");
        Ok(())
    }

    async fn set_ref(&self, repository: &str, branch: &str, sha: &str) -> Result<()> {
        match self.patch_ref(repository, branch, sha, true).await {
            Ok(()) => {}
            Err(e) if matches!(status_of(&e), Some(404 | 422)) => {
                debug!(repository, branch, "ref missing, creating it");
                let url = self.repo_url(repository, "git/refs");
                let body = json!({ "ref": format!("refs/heads/{branch}"), "sha": sha });
                self.send(Method::POST, &url, Some(&body)).await?;
            }
            Err(e) => return Err(e),
        }
        if !self.confirm_ref(repository, branch, sha).await? {
            return Err(Error::GitHubApi(format!(
                "{repository}:{branch} did not update to {sha}"
            )));
        }
        Ok(())
    }

    async fn delete_ref(&self, repository: &str, branch: &str) -> Result<()> {
        let url = self.ref_url(repository, branch);
        match self.send(Method::DELETE, &url, None).await {
            Ok(_) => Ok(()),
            Err(e) if matches!(status_of(&e), Some(404 | 422)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn comment(&self, repository: &str, number: u64, body: &str) -> Result<()> {
        let (owner, name) = split_repository(repository)?;
        debug!(repository, number, "creating PR comment");
        match self.client.issues(owner, name).create_comment(number, body).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let e = Error::from(e);
                if e.to_string().contains("User is blocked") {
                    warn!(repository, number, "author blocked the bot, comment dropped");
                    return Ok(());
                }
                Err(e)
            }
        }
    }

    async fn close(&self, repository: &str, number: u64) -> Result<()> {
        let url = self.repo_url(repository, &format!("pulls/{number}"));
        let body = json!({ "state": "closed" });
        with_backoff(&url, || async {
            self.send(Method::PATCH, &url, Some(&body)).await.map(drop)
        })
        .await
    }

    async fn labels(&self, repository: &str, number: u64) -> Result<Vec<String>> {
        let url = self.repo_url(repository, &format!("issues/{number}/labels?per_page=100"));
        let labels: Vec<ApiLabel> = self.get_json(&url).await?;
        Ok(labels.into_iter().map(|l| l.name).collect())
    }

    async fn replace_labels(
        &self,
        repository: &str,
        number: u64,
        labels: &[String],
    ) -> Result<()> {
        let url = self.repo_url(repository, &format!("issues/{number}/labels"));
        let body = json!({ "labels": labels });
        with_backoff(&url, || async {
            self.send(Method::PUT, &url, Some(&body)).await.map(drop)
        })
        .await
    }
}

impl std::fmt::Debug for GitHubService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubService")
            .field("api_url", &self.api_url)
            .finish_non_exhaustive()
    }
}
