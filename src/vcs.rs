//! VCS gateway: branch lifecycle against a local working tree (git
//! subprocess) and PR lifecycle against the GitHub REST API.
//!
//! The split is deliberate: local actions assume a colocated clone of the
//! project repo, provider actions need only a token.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::process::Command;

use crate::errors::VcsError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const SAFE_CONCLUSIONS: [&str; 3] = ["success", "skipped", "neutral"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiStatus {
    Pending,
    Success,
    Failure,
}

impl CiStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PullRequest {
    pub id: i64,
    pub url: String,
    pub number: i64,
}

/// Branch, push, PR, and merge operations needed by the pipeline.
#[async_trait]
pub trait VcsGateway: Send + Sync {
    /// Create and check out `ticket-<ticket_id>` from `origin/<base>`.
    /// Returns the branch name.
    async fn create_branch(&self, ticket_id: &str, base: &str) -> Result<String, VcsError>;

    /// Publish a branch to origin with upstream tracking.
    async fn push(&self, branch: &str) -> Result<(), VcsError>;

    async fn create_pr(
        &self,
        branch: &str,
        title: &str,
        body: &str,
        base: &str,
    ) -> Result<PullRequest, VcsError>;

    async fn ci_status(&self, pr_number: i64) -> Result<CiStatus, VcsError>;

    /// Human-readable summary of every failed check on the PR head.
    async fn failure_logs(&self, pr_number: i64) -> Result<String, VcsError>;

    /// Merge using the rebase strategy.
    async fn merge_pr(&self, pr_number: i64) -> Result<(), VcsError>;

    /// Delete the remote ref. Already-deleted branches are success.
    async fn delete_branch(&self, branch: &str) -> Result<(), VcsError>;
}

/// Resolve a GitHub token from the environment, falling back to the `gh`
/// CLI's stored credentials.
pub async fn resolve_token() -> Option<String> {
    if let Ok(token) = std::env::var("GITHUB_TOKEN") {
        if !token.is_empty() {
            return Some(token);
        }
    }
    let output = Command::new("gh").args(["auth", "token"]).output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!token.is_empty()).then_some(token)
}

pub struct GitHubVcs {
    repo: String,
    token: String,
    repo_path: PathBuf,
    api_base: String,
    client: reqwest::Client,
}

impl GitHubVcs {
    pub fn new(repo: &str, token: &str, repo_path: &Path) -> Self {
        Self::with_api_base(repo, token, repo_path, "https://api.github.com")
    }

    /// Point the gateway at a different API host (tests, GitHub Enterprise).
    pub fn with_api_base(repo: &str, token: &str, repo_path: &Path, api_base: &str) -> Self {
        Self {
            repo: repo.to_string(),
            token: token.to_string(),
            repo_path: repo_path.to_path_buf(),
            api_base: api_base.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn run_git(&self, args: &[&str]) -> Result<String, String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .output()
            .await
            .map_err(|e| format!("failed to run git {}: {e}", args.join(" ")))?;
        if !output.status.success() {
            return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.api_base, path))
            .timeout(HTTP_TIMEOUT)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .header("User-Agent", "vibecc")
    }

    async fn pr_head_sha(&self, pr_number: i64) -> Result<String, VcsError> {
        let resp = self
            .request(Method::GET, &format!("/repos/{}/pulls/{}", self.repo, pr_number))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(VcsError::Pr(format!(
                "failed to get PR {}: {}",
                pr_number,
                resp.status()
            )));
        }
        let detail: PrDetail = resp.json().await?;
        Ok(detail.head.sha)
    }

    async fn check_runs(&self, sha: &str) -> Result<Vec<CheckRun>, VcsError> {
        let resp = self
            .request(
                Method::GET,
                &format!("/repos/{}/commits/{}/check-runs", self.repo, sha),
            )
            .send()
            .await?;
        if !resp.status().is_success() {
            return Ok(Vec::new());
        }
        let runs: CheckRunsResponse = resp.json().await?;
        Ok(runs.check_runs)
    }
}

#[async_trait]
impl VcsGateway for GitHubVcs {
    async fn create_branch(&self, ticket_id: &str, base: &str) -> Result<String, VcsError> {
        let branch_name = format!("ticket-{ticket_id}");
        self.run_git(&["fetch", "origin", base])
            .await
            .map_err(|e| VcsError::Branch(format!("fetch origin {base}: {e}")))?;
        self.run_git(&["checkout", "-b", &branch_name, &format!("origin/{base}")])
            .await
            .map_err(|e| {
                VcsError::Branch(format!("create branch '{branch_name}' from '{base}': {e}"))
            })?;
        Ok(branch_name)
    }

    async fn push(&self, branch: &str) -> Result<(), VcsError> {
        self.run_git(&["push", "-u", "origin", branch])
            .await
            .map_err(|e| VcsError::Push(format!("push branch '{branch}': {e}")))?;
        Ok(())
    }

    async fn create_pr(
        &self,
        branch: &str,
        title: &str,
        body: &str,
        base: &str,
    ) -> Result<PullRequest, VcsError> {
        let resp = self
            .request(Method::POST, &format!("/repos/{}/pulls", self.repo))
            .json(&json!({
                "title": title,
                "body": body,
                "head": branch,
                "base": base,
            }))
            .send()
            .await?;
        if resp.status() != StatusCode::CREATED {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(VcsError::Pr(format!("failed to create PR: {status} - {text}")));
        }
        let pr: PrResponse = resp.json().await?;
        Ok(PullRequest {
            id: pr.id,
            url: pr.html_url,
            number: pr.number,
        })
    }

    async fn ci_status(&self, pr_number: i64) -> Result<CiStatus, VcsError> {
        let sha = self.pr_head_sha(pr_number).await?;

        let resp = self
            .request(
                Method::GET,
                &format!("/repos/{}/commits/{}/status", self.repo, sha),
            )
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(VcsError::Pr(format!(
                "failed to get combined status: {}",
                resp.status()
            )));
        }
        let combined: CombinedStatus = resp.json().await?;
        let checks = self.check_runs(&sha).await?;

        Ok(derive_ci_status(&combined.state, &checks))
    }

    async fn failure_logs(&self, pr_number: i64) -> Result<String, VcsError> {
        let sha = match self.pr_head_sha(pr_number).await {
            Ok(sha) => sha,
            Err(_) => return Ok("Failed to fetch PR details".to_string()),
        };
        let checks = self.check_runs(&sha).await.unwrap_or_default();
        Ok(assemble_failure_logs(&checks))
    }

    async fn merge_pr(&self, pr_number: i64) -> Result<(), VcsError> {
        let resp = self
            .request(
                Method::PUT,
                &format!("/repos/{}/pulls/{}/merge", self.repo, pr_number),
            )
            .json(&json!({ "merge_method": "rebase" }))
            .send()
            .await?;
        if resp.status() != StatusCode::OK {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(VcsError::Merge(format!(
                "failed to merge PR {pr_number}: {status} - {text}"
            )));
        }
        Ok(())
    }

    async fn delete_branch(&self, branch: &str) -> Result<(), VcsError> {
        let resp = self
            .request(
                Method::DELETE,
                &format!("/repos/{}/git/refs/heads/{}", self.repo, branch),
            )
            .send()
            .await?;
        // 204 deleted, 422 already gone: both count as success.
        match resp.status() {
            StatusCode::NO_CONTENT | StatusCode::UNPROCESSABLE_ENTITY => Ok(()),
            status => Err(VcsError::Branch(format!(
                "failed to delete branch '{branch}': {status}"
            ))),
        }
    }
}

// ── Status derivation ─────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct CheckRun {
    pub name: String,
    pub status: String,
    pub conclusion: Option<String>,
    #[serde(default)]
    pub output: CheckOutput,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckOutput {
    pub title: Option<String>,
    pub summary: Option<String>,
}

#[derive(Deserialize)]
struct PrResponse {
    id: i64,
    html_url: String,
    number: i64,
}

#[derive(Deserialize)]
struct PrDetail {
    head: PrHead,
}

#[derive(Deserialize)]
struct PrHead {
    sha: String,
}

#[derive(Deserialize)]
struct CombinedStatus {
    state: String,
}

#[derive(Deserialize)]
struct CheckRunsResponse {
    #[serde(default)]
    check_runs: Vec<CheckRun>,
}

/// Fold the provider's aggregate status and per-check conclusions into one
/// CI verdict. When check runs exist, their conclusions win over the
/// aggregate state.
fn derive_ci_status(aggregate_state: &str, checks: &[CheckRun]) -> CiStatus {
    if !checks.is_empty() {
        if checks.iter().any(|c| c.status != "completed") {
            return CiStatus::Pending;
        }
        let all_safe = checks.iter().all(|c| {
            c.conclusion
                .as_deref()
                .is_some_and(|conclusion| SAFE_CONCLUSIONS.contains(&conclusion))
        });
        return if all_safe {
            CiStatus::Success
        } else {
            CiStatus::Failure
        };
    }
    match aggregate_state {
        "success" => CiStatus::Success,
        "pending" => CiStatus::Pending,
        _ => CiStatus::Failure,
    }
}

/// Build one block per failed check: name, conclusion, and the check output
/// title/summary when present.
fn assemble_failure_logs(checks: &[CheckRun]) -> String {
    let mut failures = Vec::new();
    for check in checks {
        let Some(conclusion) = check.conclusion.as_deref() else {
            continue;
        };
        if SAFE_CONCLUSIONS.contains(&conclusion) {
            continue;
        }
        let mut info = format!("Check '{}' failed with conclusion: {}", check.name, conclusion);
        if let Some(title) = check.output.title.as_deref().filter(|t| !t.is_empty()) {
            info.push_str(&format!("\nTitle: {title}"));
        }
        if let Some(summary) = check.output.summary.as_deref().filter(|s| !s.is_empty()) {
            info.push_str(&format!("\nSummary: {summary}"));
        }
        failures.push(info);
    }
    if failures.is_empty() {
        "CI failed but no specific failure logs found".to_string()
    } else {
        failures.join("\n\n")
    }
}
