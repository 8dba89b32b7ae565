//! Authentication for GitHub
//!
//! Supports environment variables and the `gh` CLI.

mod github;

pub use github::{GitHubAuthConfig, TOKEN_VARS, get_github_auth, test_github_auth};

/// Source of authentication token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthSource {
    /// Token from the `gh` CLI
    Cli,
    /// Token from environment variable
    EnvVar,
}
