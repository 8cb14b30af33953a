pub mod backend;
pub mod comment;
pub mod language;

pub use backend::{FileReview, ReviewBackend, ReviewError, ReviewOutcome, SeverityCounts};

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::auth::AuthError;
use crate::commit::CommitError;
use crate::config::ReviewerConfig;
use crate::github::types::PullRequestSnapshot;
use crate::github::GithubError;

/// PR-level failure of a hosted operation. Aborts the task; per-file
/// failures never become one of these.
#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Github(#[from] GithubError),

    #[error(transparent)]
    Commit(#[from] CommitError),
}

/// Everything the task runner needs from the hosting platform, bound to one
/// installation. Keeping this a trait lets tests drive the runner without a
/// network.
#[async_trait]
pub trait PullRequestHost: Send + Sync {
    async fn fetch_snapshot(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<PullRequestSnapshot, HostError>;

    async fn post_comment(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<(), HostError>;

    /// Build and push one commit containing the given files on `branch`;
    /// returns the new commit SHA.
    async fn push_fix_commit(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        files: &BTreeMap<String, String>,
        message: &str,
    ) -> Result<String, HostError>;
}

#[derive(Debug)]
pub struct ReviewReport {
    pub files_reviewed: usize,
    pub comment_posted: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AutofixOutcome {
    /// The PR was closed or merged before the task started; nothing was done.
    PrClosed,
    /// No file needed fixing, or every rewrite came back identical.
    NoChanges,
    /// A fix commit was pushed.
    Committed { sha: String, files: Vec<String> },
}

#[derive(Debug)]
pub struct AutofixReport {
    pub outcome: AutofixOutcome,
    pub files_reviewed: usize,
}

/// Commit message used for autofix pushes.
const AUTOFIX_COMMIT_MESSAGE: &str =
    "🤖 Patchwork autofix: resolve critical and high severity findings";

/// Review every changed file and post one aggregated comment. Posts nothing
/// when no file produced output, to avoid empty noise.
#[instrument(skip(host, backend, options))]
pub async fn review_pr(
    host: &dyn PullRequestHost,
    backend: Arc<dyn ReviewBackend>,
    options: &ReviewerConfig,
    owner: &str,
    repo: &str,
    number: u64,
) -> Result<ReviewReport, HostError> {
    let snapshot = host.fetch_snapshot(owner, repo, number).await?;
    debug!(title = %snapshot.title, head_sha = %snapshot.head_sha, files = snapshot.files.len(), "reviewing snapshot");
    let outcomes = review_files(&snapshot, backend, options).await;

    if outcomes.is_empty() {
        info!("no reviewable files produced output; skipping comment");
        return Ok(ReviewReport {
            files_reviewed: 0,
            comment_posted: false,
        });
    }

    let body = comment::format_review_comment(&outcomes);
    host.post_comment(owner, repo, number, &body).await?;
    info!(files = outcomes.len(), "posted review comment");

    Ok(ReviewReport {
        files_reviewed: outcomes.len(),
        comment_posted: true,
    })
}

/// Review, rewrite flagged files, push one commit to the head branch, and
/// post a summary. A PR found closed at the start is never committed to.
#[instrument(skip(host, backend, options))]
pub async fn autofix_pr(
    host: &dyn PullRequestHost,
    backend: Arc<dyn ReviewBackend>,
    options: &ReviewerConfig,
    owner: &str,
    repo: &str,
    number: u64,
) -> Result<AutofixReport, HostError> {
    let snapshot = host.fetch_snapshot(owner, repo, number).await?;
    debug!(author = %snapshot.author, head_sha = %snapshot.head_sha, "autofix snapshot");
    if !snapshot.is_open() {
        info!(state = %snapshot.state, "pull request is no longer open; skipping autofix");
        return Ok(AutofixReport {
            outcome: AutofixOutcome::PrClosed,
            files_reviewed: 0,
        });
    }

    let outcomes = review_files(&snapshot, backend.clone(), options).await;
    let fixes = build_fix_set(&snapshot, &outcomes, backend.as_ref(), options).await;

    if fixes.is_empty() {
        info!("no fixes survived the no-op filter; skipping commit");
        return Ok(AutofixReport {
            outcome: AutofixOutcome::NoChanges,
            files_reviewed: outcomes.len(),
        });
    }

    let sha = host
        .push_fix_commit(
            owner,
            repo,
            &snapshot.head_branch,
            &fixes,
            AUTOFIX_COMMIT_MESSAGE,
        )
        .await?;
    let files: Vec<String> = fixes.into_keys().collect();

    let body = comment::format_autofix_comment(&files, &sha);
    host.post_comment(owner, repo, number, &body).await?;
    info!(commit = %sha, files = files.len(), "pushed autofix commit");

    Ok(AutofixReport {
        outcome: AutofixOutcome::Committed { sha, files },
        files_reviewed: outcomes.len(),
    })
}

/// Fan reviewable files out to the backend, bounded by the configured
/// concurrency cap. A file that errors is skipped, never fatal to the batch.
/// Results come back sorted by filename since completion order is arbitrary.
async fn review_files(
    snapshot: &PullRequestSnapshot,
    backend: Arc<dyn ReviewBackend>,
    options: &ReviewerConfig,
) -> Vec<ReviewOutcome> {
    let semaphore = Arc::new(Semaphore::new(options.max_concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for file in snapshot.files.iter().filter(|f| f.is_reviewable()) {
        let backend = backend.clone();
        let semaphore = semaphore.clone();
        let filename = file.filename.clone();
        let content = file.content.clone();
        let language = language::detect(&filename, &options.fallback_language);
        let focus_areas = options.focus_areas.clone();

        tasks.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return None;
            };
            match backend.review(&content, &language, &focus_areas).await {
                Ok(review) => Some(ReviewOutcome {
                    filename,
                    counts: review.counts,
                    raw_text: review.raw_text,
                }),
                Err(error) => {
                    warn!(file = %filename, %error, "review failed; skipping file");
                    None
                }
            }
        });
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Some(outcome)) => outcomes.push(outcome),
            Ok(None) => {}
            Err(error) => warn!(%error, "review task aborted"),
        }
    }
    outcomes.sort_by(|a, b| a.filename.cmp(&b.filename));
    outcomes
}

/// Rewrite each file the reviewer flagged critical/high and keep only
/// rewrites that actually change something.
async fn build_fix_set(
    snapshot: &PullRequestSnapshot,
    outcomes: &[ReviewOutcome],
    backend: &dyn ReviewBackend,
    options: &ReviewerConfig,
) -> BTreeMap<String, String> {
    let mut fixes = BTreeMap::new();
    for outcome in outcomes.iter().filter(|o| o.counts.needs_fix()) {
        let Some(file) = snapshot
            .files
            .iter()
            .find(|f| f.filename == outcome.filename)
        else {
            continue;
        };
        let language = language::detect(&file.filename, &options.fallback_language);
        match backend.rewrite(&file.content, &language).await {
            Ok(rewritten) => {
                if let Some(accepted) = accept_rewrite(&file.content, rewritten) {
                    fixes.insert(file.filename.clone(), accepted);
                } else {
                    debug!(file = %file.filename, "rewrite identical to original; dropping");
                }
            }
            Err(error) => {
                warn!(file = %file.filename, %error, "rewrite failed; skipping file");
            }
        }
    }
    fixes
}

/// A rewrite counts as a fix only when it differs from the original after
/// trimming incidental leading/trailing whitespace; identical output would
/// produce a spurious commit.
pub fn accept_rewrite(original: &str, rewritten: String) -> Option<String> {
    if rewritten.trim() == original.trim() {
        None
    } else {
        Some(rewritten)
    }
}
