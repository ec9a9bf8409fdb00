//! Testing worker: push the branch, open a PR, and poll CI until it
//! resolves.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{Tester, TestingResult, TestingTask};
use crate::errors::VcsError;
use crate::vcs::{CiStatus, VcsGateway};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

pub struct TestingRunner {
    vcs: Arc<dyn VcsGateway>,
    poll_interval: Duration,
    /// Give up and treat CI as failed after this many polls. `None` waits
    /// forever.
    max_polls: Option<u32>,
}

impl TestingRunner {
    pub fn new(vcs: Arc<dyn VcsGateway>) -> Self {
        Self {
            vcs,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_polls: None,
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn max_polls(mut self, max_polls: u32) -> Self {
        self.max_polls = Some(max_polls);
        self
    }

    async fn poll_ci(&self, pr_number: i64) -> Result<CiStatus, VcsError> {
        let mut polls = 0u32;
        loop {
            let status = self.vcs.ci_status(pr_number).await?;
            if status != CiStatus::Pending {
                return Ok(status);
            }
            polls += 1;
            if let Some(max) = self.max_polls {
                if polls >= max {
                    tracing::warn!(pr_number, max, "CI poll cap reached, treating as failure");
                    return Ok(CiStatus::Failure);
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl Tester for TestingRunner {
    async fn execute(&self, task: &TestingTask) -> Result<TestingResult, VcsError> {
        tracing::info!(ticket_id = %task.ticket_id, branch = %task.branch, "running testing phase");

        self.vcs.push(&task.branch).await?;

        let pr = self
            .vcs
            .create_pr(
                &task.branch,
                &format!("#{}: {}", task.ticket_id, task.ticket_title),
                &format!("Closes #{}", task.ticket_id),
                &task.base_branch,
            )
            .await?;
        tracing::info!(pr_number = pr.number, url = %pr.url, "created PR");

        let ci_status = self.poll_ci(pr.number).await?;
        tracing::info!(pr_number = pr.number, status = ci_status.as_str(), "CI resolved");

        let failure_logs = if ci_status == CiStatus::Failure {
            Some(self.vcs.failure_logs(pr.number).await.unwrap_or_else(|_| {
                "CI failed but failure logs could not be retrieved".to_string()
            }))
        } else {
            None
        };

        Ok(TestingResult {
            success: ci_status == CiStatus::Success,
            pr_id: Some(pr.number),
            pr_url: Some(pr.url),
            ci_status,
            failure_logs,
        })
    }
}
