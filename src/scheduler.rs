//! Per-project admission control and the worker loop that drives pipelines.
//!
//! One loop per project, started when autopilot starts. Each iteration
//! advances an in-flight pipeline if there is one, otherwise admits a queued
//! pipeline when under the concurrency cap, otherwise pulls fresh tickets
//! from the board. The loop exits when the autopilot flag flips off.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::RuntimeConfig;
use crate::errors::OrchestratorError;
use crate::kanban::{GitHubProjectsBoard, TicketBoard};
use crate::models::{Pipeline, PipelineState, Project};
use crate::orchestrator::{Orchestrator, PipelineDeps};
use crate::store::DbHandle;
use crate::vcs::{GitHubVcs, VcsGateway, resolve_token};
use crate::workers::{AgentCoder, Coder, Tester, TestingRunner};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Result of one admission pass over the kanban queue.
#[derive(Debug)]
pub struct SyncOutcome {
    pub started: Vec<Pipeline>,
    /// Tickets that stayed in the queue column for lack of capacity.
    pub remaining: usize,
}

/// Owned per-project collaborators, built once per worker loop.
pub struct ProjectWorkbench {
    pub vcs: Arc<dyn VcsGateway>,
    pub board: Arc<dyn TicketBoard>,
    pub coder: Arc<dyn Coder>,
    pub tester: Arc<dyn Tester>,
    pub repo_path: PathBuf,
}

impl ProjectWorkbench {
    /// Build the real gateways for a project. Returns the autopilot stop
    /// reason when a prerequisite is missing.
    pub async fn for_project(project: &Project, runtime: &RuntimeConfig) -> Result<Self, String> {
        let token = resolve_token().await.ok_or("no_vcs_token".to_string())?;
        let board_id = project
            .kanban_board_id
            .ok_or("no_kanban_board".to_string())?;

        let vcs = Arc::new(GitHubVcs::new(&project.repo, &token, &runtime.repo_path));
        let board = Arc::new(GitHubProjectsBoard::new(&project.repo, board_id, &token));

        let mut coder = AgentCoder::new();
        if let Some(timeout) = runtime.agent_timeout {
            coder = coder.timeout(timeout);
        }

        let mut tester =
            TestingRunner::new(Arc::clone(&vcs) as Arc<dyn VcsGateway>).poll_interval(runtime.ci_poll_interval);
        if let Some(max_polls) = runtime.ci_max_polls {
            tester = tester.max_polls(max_polls);
        }

        Ok(Self {
            vcs,
            board,
            coder: Arc::new(coder),
            tester: Arc::new(tester),
            repo_path: runtime.repo_path.clone(),
        })
    }

    pub fn deps(&self) -> PipelineDeps<'_> {
        PipelineDeps {
            vcs: &*self.vcs,
            board: &*self.board,
            coder: &*self.coder,
            tester: &*self.tester,
            repo_path: &self.repo_path,
        }
    }
}

pub struct Scheduler {
    db: DbHandle,
    orchestrator: Arc<Orchestrator>,
    max_concurrent: usize,
    poll_interval: Duration,
    /// One worker handle per project; a live handle blocks a second spawn
    /// so a project never has two mutators.
    workers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(db: DbHandle, orchestrator: Arc<Orchestrator>, max_concurrent: usize) -> Self {
        Self {
            db,
            orchestrator,
            max_concurrent,
            poll_interval: DEFAULT_POLL_INTERVAL,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Spawn the worker loop for a project. A no-op while a previous worker
    /// for the same project is still running.
    pub fn launch(self: &Arc<Self>, project: Project, runtime: RuntimeConfig) {
        let mut workers = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handle) = workers.get(&project.id) {
            if !handle.is_finished() {
                tracing::info!(project_id = %project.id, "worker already running");
                return;
            }
        }

        let scheduler = Arc::clone(self);
        let orchestrator = Arc::clone(&self.orchestrator);
        let project_id = project.id.clone();
        let handle = tokio::spawn(async move {
            match ProjectWorkbench::for_project(&project, &runtime).await {
                Ok(bench) => scheduler.run_project_loop(&project.id, &bench.deps()).await,
                Err(reason) => {
                    tracing::error!(project_id = %project.id, reason, "worker prerequisites missing");
                    orchestrator.stop_autopilot(&project.id, &reason);
                }
            }
        });
        workers.insert(project_id, handle);
    }

    /// The per-project loop. Exits at the next step boundary after the
    /// autopilot flag flips off; in-flight worker calls run to completion.
    pub async fn run_project_loop(&self, project_id: &str, deps: &PipelineDeps<'_>) {
        tracing::info!(project_id, "project worker started");
        while self.orchestrator.is_autopilot_running(project_id) {
            if let Err(e) = self.step_once(project_id, deps).await {
                tracing::error!(project_id, error = %e, "scheduler step failed");
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        tracing::info!(project_id, "project worker stopped");
    }

    /// One scheduling decision: advance an in-flight pipeline, admit a
    /// queued one under the cap, or pull fresh tickets from the board.
    async fn step_once(
        &self,
        project_id: &str,
        deps: &PipelineDeps<'_>,
    ) -> Result<(), OrchestratorError> {
        let pipelines = {
            let pid = project_id.to_string();
            self.db
                .call(move |db| db.list_pipelines(Some(&pid), None))
                .await?
        };
        // list_pipelines is newest-first; the loop serves oldest-first.
        let working: Vec<&Pipeline> = pipelines.iter().filter(|p| p.state.is_working()).collect();
        let queued: Vec<&Pipeline> = pipelines
            .iter()
            .filter(|p| p.state == PipelineState::Queued)
            .collect();

        let next = if let Some(pipeline) = working.last() {
            Some(*pipeline)
        } else if !queued.is_empty() && working.len() < self.max_concurrent {
            queued.last().copied()
        } else {
            None
        };

        let Some(pipeline) = next else {
            let outcome = self.sync(project_id, deps.board, deps.vcs).await?;
            if !outcome.started.is_empty() {
                tracing::info!(
                    project_id,
                    started = outcome.started.len(),
                    remaining = outcome.remaining,
                    "admitted tickets"
                );
            }
            return Ok(());
        };

        // The flag may have flipped while we were reading state.
        if !self.orchestrator.is_autopilot_running(project_id) {
            return Ok(());
        }

        tracing::info!(
            project_id,
            pipeline_id = %pipeline.id,
            ticket_id = %pipeline.ticket_id,
            state = pipeline.state.as_str(),
            "processing pipeline"
        );
        self.orchestrator.process_pipeline(&pipeline.id, deps).await
    }

    /// One admission pass: pull tickets from the board's queue column and
    /// start pipelines up to the remaining capacity, moving each started
    /// ticket to `in_progress` (best effort).
    pub async fn sync(
        &self,
        project_id: &str,
        board: &dyn TicketBoard,
        vcs: &dyn VcsGateway,
    ) -> Result<SyncOutcome, OrchestratorError> {
        let (working, queued) = {
            let pid = project_id.to_string();
            self.db
                .call(move |db| Ok((db.count_working(&pid)?, db.count_queued(&pid)?)))
                .await?
        };
        // Queued rows already hold a slot, so they count against capacity.
        let capacity = self
            .max_concurrent
            .saturating_sub((working + queued) as usize);

        let tickets = board.list_tickets("queue").await?;
        let total = tickets.len();
        let mut started = Vec::new();

        for ticket in tickets {
            if started.len() >= capacity {
                break;
            }

            let existing = {
                let pid = project_id.to_string();
                let tid = ticket.id.clone();
                self.db
                    .call(move |db| db.get_pipeline_by_ticket(&pid, &tid))
                    .await?
            };
            if existing.is_some() {
                tracing::debug!(ticket_id = %ticket.id, "ticket already has an active pipeline");
                continue;
            }

            match self.orchestrator.start_pipeline(project_id, &ticket, vcs).await {
                Ok(pipeline) => {
                    if let Err(e) = board.move_ticket(&ticket.id, "in_progress").await {
                        tracing::warn!(ticket_id = %ticket.id, error = %e, "failed to move ticket to in_progress");
                    }
                    started.push(pipeline);
                }
                Err(e) => {
                    tracing::error!(ticket_id = %ticket.id, error = %e, "failed to start pipeline");
                }
            }
        }

        Ok(SyncOutcome {
            remaining: total - started.len(),
            started,
        })
    }
}
