use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::types::{FileChange, FileStatus, PullRequestSnapshot};
use super::{GithubError, API_VERSION, USER_AGENT};
use crate::auth::{AccessToken, TokenManager};
use crate::commit;
use crate::review::{HostError, PullRequestHost};

const ACCEPT_JSON: &str = "application/vnd.github+json";
const ACCEPT_RAW: &str = "application/vnd.github.raw+json";

/// Page size for the pull-request file listing.
const FILES_PER_PAGE: usize = 100;

/// Thin client over the GitHub REST API. Holds no credentials; every call
/// takes the installation token it should act as.
pub struct GithubClient {
    http: reqwest::Client,
    api_base_url: String,
}

impl GithubClient {
    pub fn new(api_base_url: String) -> Result<Self, GithubError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self { http, api_base_url })
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        token: &AccessToken,
        accept: &str,
    ) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.api_base_url.trim_end_matches('/'), path);
        self.http
            .request(method, url)
            .header("Accept", accept)
            .header("User-Agent", USER_AGENT)
            .header("X-GitHub-Api-Version", API_VERSION)
            .bearer_auth(token.token.expose_secret())
    }

    /// Map a non-success response to the error taxonomy, draining the body
    /// into the error message.
    async fn check(
        response: reqwest::Response,
        what: &str,
    ) -> Result<reqwest::Response, GithubError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::NOT_FOUND {
            Err(GithubError::NotFound(what.to_string()))
        } else {
            Err(GithubError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }

    /// Fetch PR metadata plus the full content of every changed file at the
    /// head commit. A file whose content cannot be fetched stays in the
    /// snapshot with empty content; one unreadable file must not sink the
    /// rest of the review.
    #[instrument(skip(self, token))]
    pub async fn fetch_snapshot(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        token: &AccessToken,
    ) -> Result<PullRequestSnapshot, GithubError> {
        #[derive(Debug, Deserialize)]
        struct User {
            login: String,
        }
        #[derive(Debug, Deserialize)]
        struct Branch {
            #[serde(rename = "ref")]
            ref_name: String,
            sha: String,
        }
        #[derive(Debug, Deserialize)]
        struct PullResponse {
            number: u64,
            title: String,
            body: Option<String>,
            state: String,
            user: User,
            base: Branch,
            head: Branch,
        }
        #[derive(Debug, Deserialize)]
        struct FileEntry {
            filename: String,
            status: String,
            patch: Option<String>,
            #[serde(default)]
            additions: u64,
            #[serde(default)]
            deletions: u64,
        }

        let what = format!("{owner}/{repo}#{number}");
        let path = format!("/repos/{owner}/{repo}/pulls/{number}");
        let response = self.request(Method::GET, &path, token, ACCEPT_JSON).send().await?;
        let metadata: PullResponse = Self::check(response, &what).await?.json().await?;
        debug!(title = %metadata.title, head_sha = %metadata.head.sha, "fetched PR metadata");

        let mut entries: Vec<FileEntry> = Vec::new();
        let mut page = 1;
        loop {
            let path = format!(
                "/repos/{owner}/{repo}/pulls/{number}/files?per_page={FILES_PER_PAGE}&page={page}"
            );
            let response = self.request(Method::GET, &path, token, ACCEPT_JSON).send().await?;
            let batch: Vec<FileEntry> = Self::check(response, &what).await?.json().await?;
            let last_page = batch.len() < FILES_PER_PAGE;
            entries.extend(batch);
            if last_page {
                break;
            }
            page += 1;
        }
        debug!(files = entries.len(), "fetched PR file listing");

        let mut files = Vec::with_capacity(entries.len());
        for entry in entries {
            let status = FileStatus::parse(&entry.status);
            let content = if status == FileStatus::Removed {
                String::new()
            } else {
                match self
                    .file_content(owner, repo, &entry.filename, &metadata.head.sha, token)
                    .await
                {
                    Ok(content) => content,
                    Err(error) => {
                        warn!(file = %entry.filename, %error, "could not fetch file content; keeping file with empty content");
                        String::new()
                    }
                }
            };
            files.push(FileChange {
                filename: entry.filename,
                status,
                content,
                patch: entry.patch,
                additions: entry.additions,
                deletions: entry.deletions,
            });
        }

        Ok(PullRequestSnapshot {
            repo_full_name: format!("{owner}/{repo}"),
            number: metadata.number,
            title: metadata.title,
            body: metadata.body.unwrap_or_default(),
            author: metadata.user.login,
            base_branch: metadata.base.ref_name,
            head_branch: metadata.head.ref_name,
            head_sha: metadata.head.sha,
            state: metadata.state,
            files,
        })
    }

    /// Raw file content at a specific commit, not the diff patch — the
    /// reviewer wants whole-file context.
    async fn file_content(
        &self,
        owner: &str,
        repo: &str,
        file_path: &str,
        ref_sha: &str,
        token: &AccessToken,
    ) -> Result<String, GithubError> {
        let path = format!("/repos/{owner}/{repo}/contents/{file_path}?ref={ref_sha}");
        let response = self.request(Method::GET, &path, token, ACCEPT_RAW).send().await?;
        Ok(Self::check(response, file_path).await?.text().await?)
    }

    /// Post an issue comment on the PR thread.
    #[instrument(skip(self, body, token))]
    pub async fn post_comment(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        body: &str,
        token: &AccessToken,
    ) -> Result<(), GithubError> {
        #[derive(Debug, Serialize)]
        struct CommentRequest<'a> {
            body: &'a str,
        }

        let what = format!("{owner}/{repo}#{number}");
        let path = format!("/repos/{owner}/{repo}/issues/{number}/comments");
        let response = self
            .request(Method::POST, &path, token, ACCEPT_JSON)
            .json(&CommentRequest { body })
            .send()
            .await?;
        Self::check(response, &what).await?;
        debug!("posted PR comment");
        Ok(())
    }

    // Git object-graph primitives, used by the commit builder. Each creates
    // or reads one immutable object; only `update_ref` changes anything an
    // observer can see.

    /// Current tip commit SHA of a branch.
    pub async fn branch_tip(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        token: &AccessToken,
    ) -> Result<String, GithubError> {
        #[derive(Debug, Deserialize)]
        struct RefObject {
            sha: String,
        }
        #[derive(Debug, Deserialize)]
        struct RefResponse {
            object: RefObject,
        }

        let path = format!("/repos/{owner}/{repo}/git/ref/heads/{branch}");
        let response = self.request(Method::GET, &path, token, ACCEPT_JSON).send().await?;
        let payload: RefResponse = Self::check(response, branch).await?.json().await?;
        Ok(payload.object.sha)
    }

    /// Tree SHA of an existing commit object.
    pub async fn commit_tree(
        &self,
        owner: &str,
        repo: &str,
        commit_sha: &str,
        token: &AccessToken,
    ) -> Result<String, GithubError> {
        #[derive(Debug, Deserialize)]
        struct TreeRef {
            sha: String,
        }
        #[derive(Debug, Deserialize)]
        struct CommitResponse {
            tree: TreeRef,
        }

        let path = format!("/repos/{owner}/{repo}/git/commits/{commit_sha}");
        let response = self.request(Method::GET, &path, token, ACCEPT_JSON).send().await?;
        let payload: CommitResponse = Self::check(response, commit_sha).await?.json().await?;
        Ok(payload.tree.sha)
    }

    /// Create a content blob; returns its SHA.
    pub async fn create_blob(
        &self,
        owner: &str,
        repo: &str,
        content: &str,
        token: &AccessToken,
    ) -> Result<String, GithubError> {
        #[derive(Debug, Serialize)]
        struct BlobRequest<'a> {
            content: &'a str,
            encoding: &'a str,
        }
        #[derive(Debug, Deserialize)]
        struct ShaResponse {
            sha: String,
        }

        let path = format!("/repos/{owner}/{repo}/git/blobs");
        let response = self
            .request(Method::POST, &path, token, ACCEPT_JSON)
            .json(&BlobRequest {
                content,
                encoding: "utf-8",
            })
            .send()
            .await?;
        let payload: ShaResponse = Self::check(response, "blob").await?.json().await?;
        Ok(payload.sha)
    }

    /// Create a tree layering the given blobs over `base_tree`. Paths not
    /// listed keep their existing entries — a sparse overlay, not a rewrite.
    pub async fn create_tree(
        &self,
        owner: &str,
        repo: &str,
        base_tree: &str,
        blobs: &BTreeMap<String, String>,
        token: &AccessToken,
    ) -> Result<String, GithubError> {
        #[derive(Debug, Serialize)]
        struct TreeEntry<'a> {
            path: &'a str,
            mode: &'a str,
            #[serde(rename = "type")]
            kind: &'a str,
            sha: &'a str,
        }
        #[derive(Debug, Serialize)]
        struct TreeRequest<'a> {
            base_tree: &'a str,
            tree: Vec<TreeEntry<'a>>,
        }
        #[derive(Debug, Deserialize)]
        struct ShaResponse {
            sha: String,
        }

        let tree = blobs
            .iter()
            .map(|(path, sha)| TreeEntry {
                path,
                mode: "100644",
                kind: "blob",
                sha,
            })
            .collect();
        let path = format!("/repos/{owner}/{repo}/git/trees");
        let response = self
            .request(Method::POST, &path, token, ACCEPT_JSON)
            .json(&TreeRequest { base_tree, tree })
            .send()
            .await?;
        let payload: ShaResponse = Self::check(response, "tree").await?.json().await?;
        Ok(payload.sha)
    }

    /// Create a commit object with a single parent.
    pub async fn create_commit(
        &self,
        owner: &str,
        repo: &str,
        message: &str,
        tree: &str,
        parent: &str,
        token: &AccessToken,
    ) -> Result<String, GithubError> {
        #[derive(Debug, Serialize)]
        struct CommitRequest<'a> {
            message: &'a str,
            tree: &'a str,
            parents: Vec<&'a str>,
        }
        #[derive(Debug, Deserialize)]
        struct ShaResponse {
            sha: String,
        }

        let path = format!("/repos/{owner}/{repo}/git/commits");
        let response = self
            .request(Method::POST, &path, token, ACCEPT_JSON)
            .json(&CommitRequest {
                message,
                tree,
                parents: vec![parent],
            })
            .send()
            .await?;
        let payload: ShaResponse = Self::check(response, "commit").await?.json().await?;
        Ok(payload.sha)
    }

    /// Advance a branch ref, fast-forward only. GitHub answers 422 when the
    /// new commit's parent is no longer the branch tip.
    pub async fn update_ref(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        sha: &str,
        token: &AccessToken,
    ) -> Result<(), GithubError> {
        #[derive(Debug, Serialize)]
        struct RefUpdate<'a> {
            sha: &'a str,
            force: bool,
        }

        let path = format!("/repos/{owner}/{repo}/git/refs/heads/{branch}");
        let response = self
            .request(Method::PATCH, &path, token, ACCEPT_JSON)
            .json(&RefUpdate { sha, force: false })
            .send()
            .await?;
        Self::check(response, branch).await?;
        Ok(())
    }
}

/// A GithubClient bound to one installation: resolves tokens through the
/// manager and invalidates the cached token on upstream 401s.
pub struct InstallationClient {
    client: Arc<GithubClient>,
    tokens: Arc<TokenManager>,
    installation_id: u64,
}

impl InstallationClient {
    pub fn new(client: Arc<GithubClient>, tokens: Arc<TokenManager>, installation_id: u64) -> Self {
        Self {
            client,
            tokens,
            installation_id,
        }
    }

    async fn flag_unauthorized(&self, unauthorized: bool) {
        if unauthorized {
            self.tokens.invalidate(self.installation_id).await;
        }
    }
}

#[async_trait]
impl PullRequestHost for InstallationClient {
    async fn fetch_snapshot(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<PullRequestSnapshot, HostError> {
        let token = self.tokens.get_token(self.installation_id).await?;
        let result = self.client.fetch_snapshot(owner, repo, number, &token).await;
        if let Err(error) = &result {
            self.flag_unauthorized(error.is_unauthorized()).await;
        }
        Ok(result?)
    }

    async fn post_comment(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<(), HostError> {
        let token = self.tokens.get_token(self.installation_id).await?;
        let result = self.client.post_comment(owner, repo, number, body, &token).await;
        if let Err(error) = &result {
            self.flag_unauthorized(error.is_unauthorized()).await;
        }
        Ok(result?)
    }

    async fn push_fix_commit(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        files: &BTreeMap<String, String>,
        message: &str,
    ) -> Result<String, HostError> {
        let token = self.tokens.get_token(self.installation_id).await?;
        let result =
            commit::build_and_push(&self.client, owner, repo, branch, files, message, &token).await;
        if let Err(error) = &result {
            self.flag_unauthorized(error.is_unauthorized()).await;
        }
        Ok(result?)
    }
}
