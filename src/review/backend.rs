use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ReviewerConfig;

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("Review service request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Review service rejected the request: status {status}: {message}")]
    Backend { status: u16, message: String },
}

/// Issue counts per severity bucket for one reviewed file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeverityCounts {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl SeverityCounts {
    pub fn total(&self) -> usize {
        self.critical + self.high + self.medium + self.low
    }

    /// Autofix is warranted only for files with critical or high findings.
    pub fn needs_fix(&self) -> bool {
        self.critical + self.high > 0
    }
}

/// What the reviewer said about a single file. The narrative text is opaque
/// to the engine; only the counts drive decisions.
#[derive(Debug, Clone)]
pub struct FileReview {
    pub counts: SeverityCounts,
    pub raw_text: String,
}

/// Review of one file attributed to its filename, ready for aggregation.
#[derive(Debug, Clone)]
pub struct ReviewOutcome {
    pub filename: String,
    pub counts: SeverityCounts,
    pub raw_text: String,
}

/// The external review/rewrite collaborator. Both operations take whole-file
/// content and a detected language; their textual output is never parsed
/// here beyond deserializing the wire envelope.
#[async_trait]
pub trait ReviewBackend: Send + Sync {
    async fn review(
        &self,
        code: &str,
        language: &str,
        focus_areas: &[String],
    ) -> Result<FileReview, ReviewError>;

    async fn rewrite(&self, code: &str, language: &str) -> Result<String, ReviewError>;
}

/// HTTP implementation talking to the Patchwork review service.
pub struct HttpReviewBackend {
    http: reqwest::Client,
    base_url: String,
}

impl HttpReviewBackend {
    pub fn from_config(config: &ReviewerConfig) -> Result<Self, ReviewError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ReviewError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(ReviewError::Backend {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl ReviewBackend for HttpReviewBackend {
    async fn review(
        &self,
        code: &str,
        language: &str,
        focus_areas: &[String],
    ) -> Result<FileReview, ReviewError> {
        #[derive(Debug, Serialize)]
        struct ReviewRequest<'a> {
            code: &'a str,
            language: &'a str,
            focus_areas: &'a [String],
        }
        #[derive(Debug, Deserialize)]
        struct ReviewResponse {
            #[serde(default)]
            critical: Vec<String>,
            #[serde(default)]
            high: Vec<String>,
            #[serde(default)]
            medium: Vec<String>,
            #[serde(default)]
            low: Vec<String>,
            #[serde(default)]
            raw_review: String,
        }

        let response = self
            .http
            .post(format!("{}/api/review", self.base_url))
            .json(&ReviewRequest {
                code,
                language,
                focus_areas,
            })
            .send()
            .await?;
        let payload: ReviewResponse = Self::check(response).await?.json().await?;

        Ok(FileReview {
            counts: SeverityCounts {
                critical: payload.critical.len(),
                high: payload.high.len(),
                medium: payload.medium.len(),
                low: payload.low.len(),
            },
            raw_text: payload.raw_review,
        })
    }

    async fn rewrite(&self, code: &str, language: &str) -> Result<String, ReviewError> {
        #[derive(Debug, Serialize)]
        struct RewriteRequest<'a> {
            code: &'a str,
            language: &'a str,
        }
        #[derive(Debug, Deserialize)]
        struct RewriteResponse {
            rewritten_code: String,
        }

        let response = self
            .http
            .post(format!("{}/api/rewrite", self.base_url))
            .json(&RewriteRequest { code, language })
            .send()
            .await?;
        let payload: RewriteResponse = Self::check(response).await?.json().await?;
        Ok(payload.rewritten_code)
    }
}
