use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::auth::AccessToken;
use crate::github::{GithubClient, GithubError};

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("Branch '{0}' not found; the pull request may have been merged or closed")]
    BranchNotFound(String),

    #[error("No permission to push to '{0}'; the installation needs write access to contents")]
    Forbidden(String),

    #[error("Branch '{0}' moved while the commit was being built; rebuild against the new tip")]
    NonFastForward(String),

    #[error("Refusing to build a commit from an empty fix set")]
    EmptyFixSet,

    #[error("GitHub API error while building commit: status {status}: {message}")]
    Platform { status: u16, message: String },

    #[error("GitHub API request failed while building commit: {0}")]
    Http(String),
}

impl CommitError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Platform { status: 401, .. })
    }
}

/// Build a multi-file commit from content blobs and advance the branch to
/// it, without a working-tree checkout.
///
/// The steps are strictly ordered and each depends on the previous one:
/// resolve the branch tip, create one blob per file, create a tree layering
/// the blobs over the tip's tree, create a commit whose sole parent is the
/// tip, then fast-forward the ref. Everything before the ref update creates
/// unreferenced immutable objects that are harmless if abandoned; if the
/// ref update fails the branch is untouched and nothing is retried here —
/// the caller must rebuild the whole plan against the new tip.
#[instrument(skip(client, files, message, token), fields(files = files.len()))]
pub async fn build_and_push(
    client: &GithubClient,
    owner: &str,
    repo: &str,
    branch: &str,
    files: &BTreeMap<String, String>,
    message: &str,
    token: &AccessToken,
) -> Result<String, CommitError> {
    if files.is_empty() {
        return Err(CommitError::EmptyFixSet);
    }

    let tip = client
        .branch_tip(owner, repo, branch, token)
        .await
        .map_err(|e| map_ref_read_error(branch, e))?;
    debug!(%tip, "resolved branch tip");

    let base_tree = client
        .commit_tree(owner, repo, &tip, token)
        .await
        .map_err(|e| map_object_error(branch, e))?;

    let mut blobs = BTreeMap::new();
    for (filename, content) in files {
        let sha = client
            .create_blob(owner, repo, content, token)
            .await
            .map_err(|e| map_object_error(branch, e))?;
        debug!(file = %filename, blob = %sha, "created content blob");
        blobs.insert(filename.clone(), sha);
    }

    let tree = client
        .create_tree(owner, repo, &base_tree, &blobs, token)
        .await
        .map_err(|e| map_object_error(branch, e))?;
    debug!(%tree, "created overlay tree");

    let commit = client
        .create_commit(owner, repo, message, &tree, &tip, token)
        .await
        .map_err(|e| map_object_error(branch, e))?;

    client
        .update_ref(owner, repo, branch, &commit, token)
        .await
        .map_err(|e| map_ref_update_error(branch, e))?;

    info!(%commit, branch, "advanced branch to new commit");
    Ok(commit)
}

/// Reading the ref is the one place a 404 means "branch gone", which has
/// its own actionable error.
fn map_ref_read_error(branch: &str, error: GithubError) -> CommitError {
    match error {
        GithubError::NotFound(_) => CommitError::BranchNotFound(branch.to_string()),
        other => map_object_error(branch, other),
    }
}

fn map_object_error(branch: &str, error: GithubError) -> CommitError {
    match error {
        GithubError::Api { status: 403, .. } => CommitError::Forbidden(branch.to_string()),
        GithubError::Api { status, message } => CommitError::Platform { status, message },
        GithubError::NotFound(what) => CommitError::Platform {
            status: 404,
            message: what,
        },
        GithubError::Http(e) => CommitError::Http(e.to_string()),
    }
}

/// GitHub reports a lost fast-forward race as 422 on the ref update; it gets
/// a distinct error so the caller can decide to recompute the plan.
fn map_ref_update_error(branch: &str, error: GithubError) -> CommitError {
    match error {
        GithubError::Api { status: 422, .. } => CommitError::NonFastForward(branch.to_string()),
        other => map_ref_read_error(branch, other),
    }
}
