//! GitHub token discovery

use super::AuthSource;
use crate::error::{Error, Result};
use crate::remote::RemoteClient;
use tokio::process::Command;
use tracing::debug;

/// Environment variables checked for a token, in order
pub const TOKEN_VARS: [&str; 3] = ["MERGEBOT_GITHUB_TOKEN", "GITHUB_TOKEN", "GH_TOKEN"];

/// Resolved GitHub credentials
#[derive(Clone)]
pub struct GitHubAuthConfig {
    /// API token
    pub token: String,
    /// Where the token came from
    pub source: AuthSource,
}

impl std::fmt::Debug for GitHubAuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubAuthConfig")
            .field("token", &"<redacted>")
            .field("source", &self.source)
            .finish()
    }
}

fn token_from_env() -> Option<String> {
    TOKEN_VARS.iter().find_map(|var| {
        std::env::var(var)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .inspect(|_| debug!(var, "using token from environment"))
    })
}

async fn token_from_cli() -> Option<String> {
    let output = Command::new("gh").args(["auth", "token"]).output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    let token = String::from_utf8(output.stdout).ok()?.trim().to_string();
    (!token.is_empty()).then_some(token)
}

/// Find a GitHub token, environment first, then `gh auth token`
pub async fn get_github_auth() -> Result<GitHubAuthConfig> {
    if let Some(token) = token_from_env() {
        return Ok(GitHubAuthConfig {
            token,
            source: AuthSource::EnvVar,
        });
    }

    debug!("no token in environment, trying gh auth token");
    token_from_cli()
        .await
        .map(|token| GitHubAuthConfig {
            token,
            source: AuthSource::Cli,
        })
        .ok_or_else(|| {
            Error::Auth(format!(
                "GitHub token not found. Set one of {} or run 'gh auth login'",
                TOKEN_VARS.join(", ")
            ))
        })
}

/// Check that the credentials can read a branch of `repository`
pub async fn test_github_auth(
    remote: &dyn RemoteClient,
    repository: &str,
    branch: &str,
) -> Result<String> {
    remote
        .head(repository, branch)
        .await
        .map_err(|e| Error::Auth(format!("unable to read {repository}:{branch}: {e}")))
}
