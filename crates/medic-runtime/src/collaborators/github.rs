//! GitHub REST implementation of [`StatusApi`].
//!
//! A snapshot is assembled from four endpoints:
//! - `GET /repos/{repo}/pulls/{n}` for merge state, mergeability and head sha
//! - `GET /repos/{repo}/commits/{sha}/check-runs` for CI
//! - `GET /repos/{repo}/commits/{sha}/status` for commit statuses, including
//!   the policy bot's
//! - `GET /repos/{repo}/pulls/{n}/reviews` for approvals
//!
//! The token is held as an [`ApiCredential`] and only exposed when the
//! `Authorization` header is built.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use medic_core::{
    CheckFailure, CheckRollup, CheckStatus, GithubConfig, LiveSnapshot, MergeStatus, Mergeability,
    PolicyFailureKind, PolicyResult, PrRef, ReviewSummary,
};

use super::secrets::ApiCredential;
use super::{CollaboratorError, StatusApi};

/// Environment variable read when the config carries no token.
pub const GITHUB_TOKEN_ENV: &str = "GITHUB_TOKEN";

/// Commit status contexts reported by the policy bot start with this.
const POLICY_CONTEXT_PREFIX: &str = "policy-bot";

pub struct GithubStatusApi {
    credential: ApiCredential,
    base_url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl std::fmt::Debug for GithubStatusApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GithubStatusApi")
            .field("credential", &self.credential)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl GithubStatusApi {
    pub fn new(
        credential: ApiCredential,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, CollaboratorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("automerge-medic/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CollaboratorError::NotConfigured(e.to_string()))?;

        Ok(Self {
            credential,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
            client,
        })
    }

    /// Build from config, falling back to `GITHUB_TOKEN`.
    pub fn from_config(config: &GithubConfig, timeout: Duration) -> Result<Self, CollaboratorError> {
        let credential = ApiCredential::from_config_or_env(
            config.token.as_deref(),
            GITHUB_TOKEN_ENV,
            "GitHub token",
        )?;
        Self::new(credential, config.api_url.clone(), timeout)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, CollaboratorError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(self.credential.expose())
            .header("accept", "application/vnd.github+json")
            .header("x-github-api-version", "2022-11-28")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CollaboratorError::Timeout(self.timeout)
                } else {
                    CollaboratorError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        let rate_limited = status == 429
            || (status == 403 && header("x-ratelimit-remaining").as_deref() == Some("0"));
        if rate_limited {
            let retry_after = header("retry-after")
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(CollaboratorError::RateLimited { retry_after });
        }

        if status == 404 {
            return Err(CollaboratorError::NotFound(path.to_string()));
        }

        if status.is_server_error() {
            return Err(CollaboratorError::Unavailable(format!("{} on {}", status, path)));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::Rejected(format!("{}: {}", status, body)));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| CollaboratorError::Decode(e.to_string()))
    }
}

#[async_trait]
impl StatusApi for GithubStatusApi {
    async fn live_status(&self, pr: &PrRef) -> Result<LiveSnapshot, CollaboratorError> {
        let repo = &pr.repository;
        let pull: PullResponse = self
            .get_json(&format!("/repos/{}/pulls/{}", repo, pr.number))
            .await?;

        let sha = &pull.head.sha;
        let (checks, status, reviews) = futures::try_join!(
            self.get_json::<CheckRunsResponse>(&format!(
                "/repos/{}/commits/{}/check-runs?per_page=100",
                repo, sha
            )),
            self.get_json::<CombinedStatus>(&format!("/repos/{}/commits/{}/status", repo, sha)),
            self.get_json::<Vec<Review>>(&format!(
                "/repos/{}/pulls/{}/reviews?per_page=100",
                repo, pr.number
            )),
        )?;

        Ok(snapshot(&pull, &checks.check_runs, &status.statuses, &reviews))
    }
}

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(Debug, Deserialize)]
struct PullResponse {
    state: String,
    #[serde(default)]
    merged: bool,
    mergeable: Option<bool>,
    mergeable_state: Option<String>,
    head: HeadRef,
    user: Option<User>,
    auto_merge: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct HeadRef {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct User {
    login: String,
}

#[derive(Debug, Deserialize)]
struct CheckRunsResponse {
    #[serde(default)]
    check_runs: Vec<CheckRun>,
}

#[derive(Debug, Deserialize)]
struct CheckRun {
    name: String,
    status: String,
    conclusion: Option<String>,
    output: Option<CheckOutput>,
}

#[derive(Debug, Deserialize)]
struct CheckOutput {
    title: Option<String>,
    summary: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CombinedStatus {
    #[serde(default)]
    statuses: Vec<CommitStatus>,
}

#[derive(Debug, Deserialize)]
struct CommitStatus {
    context: String,
    state: String,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Review {
    state: String,
    user: Option<User>,
}

// =============================================================================
// MAPPING
// =============================================================================

fn is_policy(status: &CommitStatus) -> bool {
    status.context.starts_with(POLICY_CONTEXT_PREFIX)
}

fn is_failed_conclusion(conclusion: &str) -> bool {
    matches!(
        conclusion,
        "failure" | "timed_out" | "cancelled" | "action_required" | "startup_failure"
    )
}

fn check_rollup(runs: &[CheckRun], statuses: &[CommitStatus]) -> CheckRollup {
    let mut failures = Vec::new();
    let mut running = false;

    for run in runs {
        if run.status != "completed" {
            running = true;
            continue;
        }
        let conclusion = run.conclusion.as_deref().unwrap_or("");
        if is_failed_conclusion(conclusion) {
            let summary = run
                .output
                .as_ref()
                .map(|o| {
                    [o.title.as_deref(), o.summary.as_deref()]
                        .into_iter()
                        .flatten()
                        .collect::<Vec<_>>()
                        .join(": ")
                })
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| conclusion.replace('_', " "));
            failures.push(CheckFailure::new(&run.name, summary));
        }
    }

    for status in statuses.iter().filter(|s| !is_policy(s)) {
        match status.state.as_str() {
            "pending" => running = true,
            "failure" | "error" => failures.push(CheckFailure::new(
                &status.context,
                status.description.clone().unwrap_or_default(),
            )),
            _ => {}
        }
    }

    let reported = !runs.is_empty() || statuses.iter().any(|s| !is_policy(s));
    if !failures.is_empty() {
        CheckRollup::failed(failures)
    } else if running {
        CheckRollup::running()
    } else if reported {
        CheckRollup::passed()
    } else {
        CheckRollup {
            status: CheckStatus::Pending,
            failures: Vec::new(),
        }
    }
}

fn policy_failure_kind(description: &str) -> PolicyFailureKind {
    let d = description.to_lowercase();
    let sod_word = d.split(|c: char| !c.is_alphanumeric()).any(|w| w == "sod");
    if sod_word || d.contains("separation of duties") {
        PolicyFailureKind::Sod
    } else if d.contains("foreign commit") || d.contains("unexpected author") || d.contains("commit author") {
        PolicyFailureKind::ForeignCommit
    } else if d.contains("invalid file") || d.contains("disallowed file") || d.contains("forbidden path") {
        PolicyFailureKind::InvalidFile
    } else {
        PolicyFailureKind::Unknown
    }
}

fn policy_result(statuses: &[CommitStatus]) -> PolicyResult {
    let Some(status) = statuses.iter().find(|s| is_policy(s)) else {
        return PolicyResult::Pending;
    };
    let detail = status.description.clone().unwrap_or_default();
    match status.state.as_str() {
        "pending" => PolicyResult::Evaluating,
        "success" => PolicyResult::Passed,
        "error" => PolicyResult::Failed {
            kind: PolicyFailureKind::BotError,
            detail,
        },
        _ => PolicyResult::Failed {
            kind: policy_failure_kind(&detail),
            detail,
        },
    }
}

/// Latest review per reviewer decides; self-approval is an SOD violation.
fn review_summary(reviews: &[Review], author: Option<&str>) -> ReviewSummary {
    let mut latest: BTreeMap<&str, &str> = BTreeMap::new();
    for review in reviews {
        let Some(user) = &review.user else { continue };
        if matches!(review.state.as_str(), "APPROVED" | "CHANGES_REQUESTED" | "DISMISSED") {
            latest.insert(user.login.as_str(), review.state.as_str());
        }
    }

    let approvers: Vec<&str> = latest
        .iter()
        .filter(|(_, state)| **state == "APPROVED")
        .map(|(login, _)| *login)
        .collect();
    let blocked = latest.values().any(|state| *state == "CHANGES_REQUESTED");

    ReviewSummary {
        approved: !approvers.is_empty() && !blocked,
        sod_violation: author.is_some_and(|a| approvers.contains(&a)),
    }
}

fn snapshot(
    pull: &PullResponse,
    runs: &[CheckRun],
    statuses: &[CommitStatus],
    reviews: &[Review],
) -> LiveSnapshot {
    let checks = check_rollup(runs, statuses);
    let policy = policy_result(statuses);
    let reviews = review_summary(reviews, pull.user.as_ref().map(|u| u.login.as_str()));
    let mergeable_state = pull.mergeable_state.as_deref().unwrap_or("unknown");

    let merge = if pull.merged {
        MergeStatus::Merged
    } else if pull.state == "closed" {
        MergeStatus::Closed
    } else if pull.auto_merge.is_some()
        && checks.status == CheckStatus::Passed
        && policy == PolicyResult::Passed
        && reviews.approved
    {
        MergeStatus::Merging
    } else {
        MergeStatus::Open
    };

    let mergeability = match (pull.mergeable, mergeable_state) {
        (_, "dirty") | (Some(false), _) => Mergeability::Conflicting,
        (Some(true), _) => Mergeability::Mergeable,
        (None, _) => Mergeability::Unknown,
    };

    LiveSnapshot {
        checks,
        policy,
        reviews,
        merge,
        mergeability,
        behind_base: mergeable_state == "behind",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pull(value: serde_json::Value) -> PullResponse {
        serde_json::from_value(value).unwrap()
    }

    fn open_pull() -> PullResponse {
        pull(json!({
            "state": "open",
            "merged": false,
            "mergeable": true,
            "mergeable_state": "clean",
            "head": { "sha": "abc123" },
            "user": { "login": "deploy-bot" },
            "auto_merge": null
        }))
    }

    fn runs(value: serde_json::Value) -> Vec<CheckRun> {
        serde_json::from_value::<CheckRunsResponse>(value).unwrap().check_runs
    }

    fn statuses(value: serde_json::Value) -> Vec<CommitStatus> {
        serde_json::from_value::<CombinedStatus>(value).unwrap().statuses
    }

    #[test]
    fn test_failed_check_run_carries_output() {
        let runs = runs(json!({
            "check_runs": [
                { "name": "build", "status": "completed", "conclusion": "success", "output": null },
                { "name": "test", "status": "completed", "conclusion": "timed_out",
                  "output": { "title": "Job timed out", "summary": null } }
            ]
        }));
        let rollup = check_rollup(&runs, &[]);
        assert_eq!(rollup.status, CheckStatus::Failed);
        assert_eq!(rollup.failures, vec![CheckFailure::new("test", "Job timed out")]);
    }

    #[test]
    fn test_in_progress_runs_are_running() {
        let runs = runs(json!({
            "check_runs": [{ "name": "build", "status": "in_progress", "conclusion": null, "output": null }]
        }));
        assert_eq!(check_rollup(&runs, &[]).status, CheckStatus::Running);
        assert_eq!(check_rollup(&[], &[]).status, CheckStatus::Pending);
    }

    #[test]
    fn test_policy_status_is_not_a_check() {
        let statuses = statuses(json!({
            "statuses": [
                { "context": "policy-bot: main", "state": "failure",
                  "description": "Foreign commit by unknown@example.com" }
            ]
        }));
        assert_eq!(check_rollup(&[], &statuses).status, CheckStatus::Pending);
        assert_eq!(
            policy_result(&statuses),
            PolicyResult::Failed {
                kind: PolicyFailureKind::ForeignCommit,
                detail: "Foreign commit by unknown@example.com".to_string(),
            }
        );
    }

    #[test]
    fn test_policy_error_is_bot_error() {
        let statuses = statuses(json!({
            "statuses": [{ "context": "policy-bot: main", "state": "error", "description": null }]
        }));
        assert!(matches!(
            policy_result(&statuses),
            PolicyResult::Failed { kind: PolicyFailureKind::BotError, .. }
        ));
    }

    #[test]
    fn test_latest_review_per_user_wins() {
        let reviews: Vec<Review> = serde_json::from_value(json!([
            { "state": "CHANGES_REQUESTED", "user": { "login": "alice" } },
            { "state": "APPROVED", "user": { "login": "alice" } },
            { "state": "COMMENTED", "user": { "login": "bob" } }
        ]))
        .unwrap();
        let summary = review_summary(&reviews, Some("deploy-bot"));
        assert!(summary.approved);
        assert!(!summary.sod_violation);
    }

    #[test]
    fn test_self_approval_is_sod_violation() {
        let reviews: Vec<Review> = serde_json::from_value(json!([
            { "state": "APPROVED", "user": { "login": "deploy-bot" } }
        ]))
        .unwrap();
        assert!(review_summary(&reviews, Some("deploy-bot")).sod_violation);
    }

    #[test]
    fn test_snapshot_conflict_and_behind() {
        let mut pull = open_pull();
        pull.mergeable = Some(false);
        pull.mergeable_state = Some("dirty".to_string());
        let live = snapshot(&pull, &[], &[], &[]);
        assert_eq!(live.mergeability, Mergeability::Conflicting);

        let mut pull = open_pull();
        pull.mergeable_state = Some("behind".to_string());
        assert!(snapshot(&pull, &[], &[], &[]).behind_base);
    }

    #[test]
    fn test_snapshot_merged() {
        let mut pull = open_pull();
        pull.state = "closed".to_string();
        pull.merged = true;
        let live = snapshot(&pull, &[], &[], &[]);
        assert_eq!(live.merge, MergeStatus::Merged);
    }
}
