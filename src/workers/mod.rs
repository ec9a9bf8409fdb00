//! Workers executed by the orchestrator: the coding worker drives the
//! external code-generation agent, the testing worker pushes the branch and
//! rides CI to a terminal state.

pub mod coder;
pub mod testing;

use std::path::PathBuf;

use async_trait::async_trait;

use crate::errors::VcsError;
use crate::vcs::CiStatus;

pub use coder::AgentCoder;
pub use testing::TestingRunner;

#[derive(Debug, Clone)]
pub struct CodingTask {
    pub ticket_id: String,
    pub ticket_title: String,
    pub ticket_body: String,
    pub repo_path: PathBuf,
    pub branch: String,
    /// Failure context from the previous attempt, if any.
    pub feedback: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CodingResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TestingTask {
    pub ticket_id: String,
    pub ticket_title: String,
    pub branch: String,
    pub base_branch: String,
    pub repo_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct TestingResult {
    pub success: bool,
    pub pr_id: Option<i64>,
    pub pr_url: Option<String>,
    pub ci_status: CiStatus,
    pub failure_logs: Option<String>,
}

/// Apply a patch to the working tree for a ticket. Failures are reported in
/// the result, never as errors.
#[async_trait]
pub trait Coder: Send + Sync {
    async fn execute(&self, task: &CodingTask) -> CodingResult;
}

/// Push the branch, open a PR, and wait for CI. Infrastructure failures
/// (push or PR creation) surface as errors; a CI verdict is a result.
#[async_trait]
pub trait Tester: Send + Sync {
    async fn execute(&self, task: &TestingTask) -> Result<TestingResult, VcsError>;
}
