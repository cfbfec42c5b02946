use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Workflow ids derived from a dedupe key are capped at this length; the
/// orchestrator enforces its own id limits on top.
const MAX_WORKFLOW_ID_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub owner: String,
    pub name: String,
    pub full_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestInfo {
    pub number: u64,
    pub head_sha: String,
    pub head_ref: String,
    pub base_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// Normalized GitHub event, plus the raw payload for the workflow args.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubEventEnvelope {
    pub event: String,
    pub delivery_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installation_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<Repository>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<PullRequestInfo>,
    pub dedupe_key: String,
    pub raw_payload: Value,
}

/// Extract the repository/pull-request shape the platform cares about and
/// build the `<deliveryId>:<headSha>` dedupe key.
pub fn normalize(event: &str, delivery_id: &str, payload: &Value) -> GithubEventEnvelope {
    let repository = payload.get("repository").map(|repo| Repository {
        owner: repo
            .pointer("/owner/login")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        name: repo
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        full_name: repo
            .get("full_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    });

    let pull_request = payload.get("pull_request").map(|pr| PullRequestInfo {
        number: pr.get("number").and_then(Value::as_u64).unwrap_or_default(),
        head_sha: pr
            .pointer("/head/sha")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        head_ref: pr
            .pointer("/head/ref")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        base_ref: pr
            .pointer("/base/ref")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        author: pr
            .pointer("/user/login")
            .and_then(Value::as_str)
            .map(str::to_string),
        labels: pr
            .get("labels")
            .and_then(Value::as_array)
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|l| l.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    });

    let head_sha = pull_request
        .as_ref()
        .map(|pr| pr.head_sha.clone())
        .unwrap_or_default();

    GithubEventEnvelope {
        event: event.to_string(),
        delivery_id: delivery_id.to_string(),
        installation_id: payload.pointer("/installation/id").and_then(Value::as_u64),
        repository,
        pull_request,
        dedupe_key: format!("{delivery_id}:{head_sha}"),
        raw_payload: payload.clone(),
    }
}

/// Deterministic workflow id for a delivery: `github-<slug>-<dedupeKey>`,
/// length-capped. The orchestrator collapses collisions, which is what
/// makes the in-memory dedupe safe to lose.
pub fn workflow_id_for(workflow_slug: &str, dedupe_key: &str) -> String {
    let mut id = format!("github-{workflow_slug}-{dedupe_key}");
    if id.len() > MAX_WORKFLOW_ID_LEN {
        id.truncate(MAX_WORKFLOW_ID_LEN);
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn pr_payload() -> Value {
        json!({
            "action": "opened",
            "installation": {"id": 12345},
            "repository": {
                "name": "studio",
                "full_name": "shipsec/studio",
                "owner": {"login": "shipsec"}
            },
            "pull_request": {
                "number": 42,
                "head": {"sha": "abc123def456", "ref": "feature/scanner"},
                "base": {"ref": "main"},
                "user": {"login": "octocat"},
                "labels": [{"name": "security"}, {"name": "review"}]
            }
        })
    }

    #[test]
    fn normalizes_pull_request_events() {
        let envelope = normalize("pull_request", "D1", &pr_payload());
        assert_eq!(envelope.delivery_id, "D1");
        assert_eq!(envelope.installation_id, Some(12345));

        let repo = envelope.repository.unwrap();
        assert_eq!(repo.owner, "shipsec");
        assert_eq!(repo.full_name, "shipsec/studio");

        let pr = envelope.pull_request.unwrap();
        assert_eq!(pr.number, 42);
        assert_eq!(pr.head_sha, "abc123def456");
        assert_eq!(pr.labels, vec!["security", "review"]);

        assert_eq!(envelope.dedupe_key, "D1:abc123def456");
    }

    #[test]
    fn events_without_a_pull_request_still_get_a_key() {
        let envelope = normalize("push", "D2", &json!({"ref": "refs/heads/main"}));
        assert_eq!(envelope.dedupe_key, "D2:");
        assert!(envelope.pull_request.is_none());
    }

    #[test]
    fn workflow_ids_are_capped_at_64_chars() {
        let id = workflow_id_for("demo", "D1:abc123def456");
        assert_eq!(id, "github-demo-D1:abc123def456");

        let long = workflow_id_for("demo", &format!("D1:{}", "f".repeat(100)));
        assert_eq!(long.len(), 64);
        assert!(long.starts_with("github-demo-D1:"));
    }
}
