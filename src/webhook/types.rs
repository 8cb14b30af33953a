use serde::Deserialize;

/// Union of the pull_request and issue_comment payload fields the dispatcher
/// reads. Everything is optional; routing decides what a given event needs.
#[derive(Debug, Deserialize)]
pub struct EventPayload {
    pub action: Option<String>,
    pub pull_request: Option<PullRequestEvent>,
    pub repository: Option<Repository>,
    pub installation: Option<Installation>,
    pub comment: Option<Comment>,
    pub issue: Option<Issue>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Installation {
    pub id: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    pub name: String,
    #[allow(dead_code)]
    pub full_name: String,
    pub owner: Account,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestEvent {
    pub number: u64,
    pub body: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Comment {
    pub body: String,
}

/// For issue_comment events. A populated `pull_request` link marks the
/// issue as a PR thread; its number is the PR number.
#[derive(Debug, Clone, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub pull_request: Option<PullRequestLink>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestLink {
    #[allow(dead_code)]
    pub url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_pull_request_event() {
        let payload: EventPayload = serde_json::from_value(json!({
            "action": "opened",
            "pull_request": {
                "number": 42,
                "body": "Adds the thing.\n\n/patchwork autofix"
            },
            "repository": {
                "name": "repo",
                "full_name": "org/repo",
                "owner": { "login": "org" }
            },
            "installation": { "id": 777 }
        }))
        .unwrap();

        assert_eq!(payload.action.as_deref(), Some("opened"));
        let pr = payload.pull_request.unwrap();
        assert_eq!(pr.number, 42);
        assert!(pr.body.unwrap().contains("/patchwork autofix"));
        assert_eq!(payload.installation.unwrap().id, 777);
        assert_eq!(payload.repository.unwrap().owner.login, "org");
    }

    #[test]
    fn test_deserialize_issue_comment_event() {
        let payload: EventPayload = serde_json::from_value(json!({
            "action": "created",
            "comment": { "body": "/patchwork review" },
            "issue": {
                "number": 7,
                "pull_request": {
                    "url": "https://api.github.com/repos/org/repo/pulls/7"
                }
            },
            "repository": {
                "name": "repo",
                "full_name": "org/repo",
                "owner": { "login": "org" }
            },
            "installation": { "id": 777 }
        }))
        .unwrap();

        let issue = payload.issue.unwrap();
        assert_eq!(issue.number, 7);
        assert!(issue.pull_request.is_some());
        assert_eq!(payload.comment.unwrap().body, "/patchwork review");
    }

    #[test]
    fn test_deserialize_tolerates_missing_fields() {
        let payload: EventPayload = serde_json::from_value(json!({
            "action": "created",
            "issue": { "number": 7 }
        }))
        .unwrap();
        assert!(payload.issue.unwrap().pull_request.is_none());
        assert!(payload.installation.is_none());
    }
}
