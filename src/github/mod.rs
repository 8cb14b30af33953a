pub mod client;
pub mod types;

pub use client::{GithubClient, InstallationClient};
pub use types::{FileChange, FileStatus, PullRequestSnapshot};

use thiserror::Error;

/// User-Agent sent on every GitHub API request.
pub const USER_AGENT: &str = "patchwork-bot";

/// Pinned REST API version.
pub const API_VERSION: &str = "2022-11-28";

#[derive(Debug, Error)]
pub enum GithubError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("GitHub API error: status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("GitHub API request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl GithubError {
    /// An upstream 401 means the installation token was revoked or expired
    /// server-side; the caller should invalidate its cached token.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Api { status: 401, .. })
    }
}
