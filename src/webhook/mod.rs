pub mod types;

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::auth::{signature, TokenManager};
use crate::config::Config;
use crate::github::{GithubClient, InstallationClient};
use crate::review::{self, HostError, ReviewBackend};
use types::EventPayload;

/// Command token that requests a review from a PR body or comment.
pub const REVIEW_COMMAND: &str = "/patchwork review";

/// Command token that requests an autofix. Matched case-sensitively; autofix
/// is never triggered implicitly.
pub const AUTOFIX_COMMAND: &str = "/patchwork autofix";

/// Shared state behind the webhook server.
pub struct AppState {
    pub config: Config,
    pub github: Arc<GithubClient>,
    pub tokens: Arc<TokenManager>,
    pub backend: Arc<dyn ReviewBackend>,
    pub deliveries: DeliveryLog,
}

/// Bounded memory of recently seen delivery ids. The platform delivers at
/// least once; a replayed delivery must not double-post or double-commit.
pub struct DeliveryLog {
    seen: Mutex<(HashSet<String>, VecDeque<String>)>,
    capacity: usize,
}

impl DeliveryLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: Mutex::new((HashSet::new(), VecDeque::new())),
            capacity,
        }
    }

    /// Record the id; returns true when it was already seen.
    pub fn check_and_record(&self, id: &str) -> bool {
        let Ok(mut guard) = self.seen.lock() else {
            return false;
        };
        let (set, order) = &mut *guard;
        if set.contains(id) {
            return true;
        }
        set.insert(id.to_string());
        order.push_back(id.to_string());
        if order.len() > self.capacity {
            if let Some(oldest) = order.pop_front() {
                set.remove(&oldest);
            }
        }
        false
    }
}

/// Outcome of dispatching one verified delivery, returned as the webhook
/// response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchResult {
    Ignored,
    Duplicate,
    Reviewing,
    Autofixing,
    /// Both a review and an autofix were dispatched.
    Processing,
}

/// A routed unit of work with everything needed to run it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub owner: String,
    pub repo: String,
    pub number: u64,
    pub installation_id: u64,
    pub review: bool,
    pub autofix: bool,
}

/// Decide what a verified event should trigger. Pure routing, no I/O.
///
/// Review runs implicitly on `opened` or explicitly via its command token;
/// autofix runs only via its command token. Comments count only on PR
/// threads. Anything else returns None.
pub fn route_event(event_type: &str, payload: &EventPayload) -> Option<Dispatch> {
    match event_type {
        "pull_request" => {
            let action = payload.action.as_deref()?;
            if !matches!(action, "opened" | "reopened" | "synchronize") {
                return None;
            }
            let pr = payload.pull_request.as_ref()?;
            let repository = payload.repository.as_ref()?;
            let installation = payload.installation.as_ref()?;
            let body = pr.body.as_deref().unwrap_or("");

            let review = action == "opened" || body.contains(REVIEW_COMMAND);
            let autofix = body.contains(AUTOFIX_COMMAND);
            if !review && !autofix {
                return None;
            }
            Some(Dispatch {
                owner: repository.owner.login.clone(),
                repo: repository.name.clone(),
                number: pr.number,
                installation_id: installation.id,
                review,
                autofix,
            })
        }
        "issue_comment" => {
            if payload.action.as_deref() != Some("created") {
                return None;
            }
            let issue = payload.issue.as_ref()?;
            issue.pull_request.as_ref()?;
            let comment = payload.comment.as_ref()?;
            let repository = payload.repository.as_ref()?;
            let installation = payload.installation.as_ref()?;

            let review = comment.body.contains(REVIEW_COMMAND);
            let autofix = comment.body.contains(AUTOFIX_COMMAND);
            if !review && !autofix {
                return None;
            }
            Some(Dispatch {
                owner: repository.owner.login.clone(),
                repo: repository.name.clone(),
                number: issue.number,
                installation_id: installation.id,
                review,
                autofix,
            })
        }
        _ => None,
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/github/webhook", post(handle_webhook))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Webhook entry point.
///
/// Synchronous through verification and routing; the dispatched work runs in
/// background tasks so the response goes out independent of reviewer latency
/// or commit construction.
pub async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature_header = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok());
    let secret = state.config.github.webhook_secret.as_deref();
    if !signature::verify(secret, &body, signature_header) {
        warn!("rejected webhook delivery with missing or invalid signature");
        return (StatusCode::UNAUTHORIZED, "signature verification failed").into_response();
    }

    let event_type = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let payload: EventPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(error) => {
            warn!(%error, "unparseable webhook payload");
            return (StatusCode::BAD_REQUEST, "invalid JSON").into_response();
        }
    };

    let delivery = headers
        .get("x-github-delivery")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !delivery.is_empty() && state.deliveries.check_and_record(delivery) {
        info!(delivery, "duplicate webhook delivery; nothing dispatched");
        return Json(DispatchResult::Duplicate).into_response();
    }

    let Some(dispatch) = route_event(event_type, &payload) else {
        return Json(DispatchResult::Ignored).into_response();
    };

    info!(
        event = event_type,
        repo = %format!("{}/{}", dispatch.owner, dispatch.repo),
        number = dispatch.number,
        review = dispatch.review,
        autofix = dispatch.autofix,
        "dispatching webhook"
    );
    let result = spawn_dispatch(&state, dispatch);
    Json(result).into_response()
}

/// Fire the routed tasks and report what was started.
fn spawn_dispatch(state: &Arc<AppState>, dispatch: Dispatch) -> DispatchResult {
    let result = match (dispatch.review, dispatch.autofix) {
        (true, true) => DispatchResult::Processing,
        (true, false) => DispatchResult::Reviewing,
        (false, true) => DispatchResult::Autofixing,
        (false, false) => return DispatchResult::Ignored,
    };

    if dispatch.review {
        let state = state.clone();
        let d = dispatch.clone();
        spawn_task("review", async move {
            let host =
                InstallationClient::new(state.github.clone(), state.tokens.clone(), d.installation_id);
            review::review_pr(
                &host,
                state.backend.clone(),
                &state.config.reviewer,
                &d.owner,
                &d.repo,
                d.number,
            )
            .await
        });
    }

    if dispatch.autofix {
        let state = state.clone();
        let d = dispatch;
        spawn_task("autofix", async move {
            let host =
                InstallationClient::new(state.github.clone(), state.tokens.clone(), d.installation_id);
            review::autofix_pr(
                &host,
                state.backend.clone(),
                &state.config.reviewer,
                &d.owner,
                &d.repo,
                d.number,
            )
            .await
        });
    }

    result
}

/// Run a dispatched task to completion, logging its outcome. Failures stop
/// here — the webhook response has already been sent, and nothing may panic
/// across the task boundary.
fn spawn_task<T, F>(name: &'static str, task: F)
where
    T: std::fmt::Debug + Send + 'static,
    F: std::future::Future<Output = Result<T, HostError>> + Send + 'static,
{
    tokio::spawn(async move {
        match task.await {
            Ok(report) => info!(task = name, ?report, "background task finished"),
            Err(error) => error!(task = name, %error, "background task failed"),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pr_payload(action: &str, body: Option<&str>) -> EventPayload {
        serde_json::from_value(json!({
            "action": action,
            "pull_request": { "number": 42, "body": body },
            "repository": {
                "name": "repo",
                "full_name": "org/repo",
                "owner": { "login": "org" }
            },
            "installation": { "id": 777 }
        }))
        .unwrap()
    }

    fn comment_payload(action: &str, comment_body: &str, on_pr: bool) -> EventPayload {
        let issue = if on_pr {
            json!({ "number": 7, "pull_request": { "url": "https://api.github.com/repos/org/repo/pulls/7" } })
        } else {
            json!({ "number": 7 })
        };
        serde_json::from_value(json!({
            "action": action,
            "comment": { "body": comment_body },
            "issue": issue,
            "repository": {
                "name": "repo",
                "full_name": "org/repo",
                "owner": { "login": "org" }
            },
            "installation": { "id": 777 }
        }))
        .unwrap()
    }

    #[test]
    fn test_opened_pr_triggers_review_only() {
        let dispatch = route_event("pull_request", &pr_payload("opened", Some("A change."))).unwrap();
        assert!(dispatch.review);
        assert!(!dispatch.autofix);
        assert_eq!(dispatch.owner, "org");
        assert_eq!(dispatch.repo, "repo");
        assert_eq!(dispatch.number, 42);
        assert_eq!(dispatch.installation_id, 777);
    }

    #[test]
    fn test_opened_pr_with_autofix_command() {
        let dispatch = route_event(
            "pull_request",
            &pr_payload("opened", Some("Please /patchwork autofix this")),
        )
        .unwrap();
        assert!(dispatch.review);
        assert!(dispatch.autofix);
    }

    #[test]
    fn test_synchronize_without_command_is_ignored() {
        assert!(route_event("pull_request", &pr_payload("synchronize", Some("just commits"))).is_none());
    }

    #[test]
    fn test_synchronize_with_review_command() {
        let dispatch = route_event(
            "pull_request",
            &pr_payload("synchronize", Some("/patchwork review")),
        )
        .unwrap();
        assert!(dispatch.review);
        assert!(!dispatch.autofix);
    }

    #[test]
    fn test_closed_action_is_ignored() {
        assert!(route_event("pull_request", &pr_payload("closed", None)).is_none());
    }

    #[test]
    fn test_commands_are_case_sensitive() {
        assert!(route_event(
            "pull_request",
            &pr_payload("synchronize", Some("/Patchwork Review"))
        )
        .is_none());
    }

    #[test]
    fn test_comment_autofix_command() {
        let dispatch =
            route_event("issue_comment", &comment_payload("created", "/patchwork autofix", true))
                .unwrap();
        assert!(!dispatch.review);
        assert!(dispatch.autofix);
        assert_eq!(dispatch.number, 7);
    }

    #[test]
    fn test_comment_without_command_is_ignored() {
        assert!(route_event(
            "issue_comment",
            &comment_payload("created", "nice work!", true)
        )
        .is_none());
    }

    #[test]
    fn test_comment_on_plain_issue_is_ignored() {
        assert!(route_event(
            "issue_comment",
            &comment_payload("created", "/patchwork review", false)
        )
        .is_none());
    }

    #[test]
    fn test_edited_comment_is_ignored() {
        assert!(route_event(
            "issue_comment",
            &comment_payload("edited", "/patchwork review", true)
        )
        .is_none());
    }

    #[test]
    fn test_unsupported_event_is_ignored() {
        assert!(route_event("push", &pr_payload("opened", None)).is_none());
    }

    #[test]
    fn test_missing_installation_is_ignored() {
        let payload: EventPayload = serde_json::from_value(json!({
            "action": "opened",
            "pull_request": { "number": 42, "body": null },
            "repository": {
                "name": "repo",
                "full_name": "org/repo",
                "owner": { "login": "org" }
            }
        }))
        .unwrap();
        assert!(route_event("pull_request", &payload).is_none());
    }

    #[test]
    fn test_delivery_log_dedupes() {
        let log = DeliveryLog::new(16);
        assert!(!log.check_and_record("d-1"));
        assert!(log.check_and_record("d-1"));
        assert!(!log.check_and_record("d-2"));
    }

    #[test]
    fn test_delivery_log_evicts_oldest() {
        let log = DeliveryLog::new(2);
        assert!(!log.check_and_record("d-1"));
        assert!(!log.check_and_record("d-2"));
        assert!(!log.check_and_record("d-3"));
        // d-1 was evicted and counts as unseen again
        assert!(!log.check_and_record("d-1"));
        // d-3 is still remembered
        assert!(log.check_and_record("d-3"));
    }

    #[test]
    fn test_dispatch_result_wire_format() {
        let body = serde_json::to_string(&DispatchResult::Reviewing).unwrap();
        assert_eq!(body, r#"{"status":"reviewing"}"#);
        let body = serde_json::to_string(&DispatchResult::Ignored).unwrap();
        assert_eq!(body, r#"{"status":"ignored"}"#);
    }
}
