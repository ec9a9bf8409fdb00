//! The pipeline state machine.
//!
//! The orchestrator advances one pipeline one step at a time: it reads the
//! latest row, dispatches on its state, runs the right worker, persists the
//! outcome, and emits events. Terminal pipelines are archived (copied to
//! history, then deleted) and a terminal failure halts the project's
//! autopilot.
//!
//! Per-project worker loops are the only callers of `process_pipeline`, so
//! at most one transition is in flight for a given pipeline at any moment.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;

use crate::errors::OrchestratorError;
use crate::events::{EventBus, LogLevel};
use crate::kanban::{Ticket, TicketBoard};
use crate::models::{AutopilotStatus, Pipeline, PipelineState, PipelineUpdate, Project};
use crate::store::DbHandle;
use crate::vcs::VcsGateway;
use crate::workers::{Coder, CodingTask, Tester, TestingTask};

/// Collaborators needed to advance a pipeline. Constructed per project by
/// the scheduler; the orchestrator itself stays stateless about providers.
pub struct PipelineDeps<'a> {
    pub vcs: &'a dyn VcsGateway,
    pub board: &'a dyn TicketBoard,
    pub coder: &'a dyn Coder,
    pub tester: &'a dyn Tester,
    pub repo_path: &'a Path,
}

pub struct Orchestrator {
    db: DbHandle,
    bus: Arc<EventBus>,
    /// Per-project autopilot flags. Runtime-only by design: autopilot is
    /// off after a restart until an operator starts it again.
    autopilot: DashMap<String, bool>,
}

impl Orchestrator {
    pub fn new(db: DbHandle, bus: Arc<EventBus>) -> Self {
        Self {
            db,
            bus,
            autopilot: DashMap::new(),
        }
    }

    // ── Autopilot control ─────────────────────────────────────────────

    pub fn is_autopilot_running(&self, project_id: &str) -> bool {
        self.autopilot.get(project_id).map(|v| *v).unwrap_or(false)
    }

    pub async fn start_autopilot(&self, project_id: &str) -> Result<(), OrchestratorError> {
        let id = project_id.to_string();
        self.db.call(move |db| db.get_project(&id)).await?;

        self.autopilot.insert(project_id.to_string(), true);
        tracing::info!(project_id, "autopilot started");
        self.bus.autopilot_started(project_id);
        Ok(())
    }

    /// Idempotent: stopping an already stopped project emits another event
    /// but the flag stays false.
    pub fn stop_autopilot(&self, project_id: &str, reason: &str) {
        self.autopilot.insert(project_id.to_string(), false);
        tracing::info!(project_id, reason, "autopilot stopped");
        self.bus.autopilot_stopped(project_id, reason);
    }

    pub async fn autopilot_status(
        &self,
        project_id: &str,
    ) -> Result<AutopilotStatus, OrchestratorError> {
        let id = project_id.to_string();
        let (project, working, queued) = self
            .db
            .call(move |db| {
                let project = db.get_project(&id)?;
                let working = db.count_working(&id)?;
                let queued = db.count_queued(&id)?;
                Ok((project, working, queued))
            })
            .await?;
        Ok(AutopilotStatus {
            project_id: project.id,
            running: self.is_autopilot_running(project_id),
            active_pipelines: working,
            queued_tickets: queued,
        })
    }

    // ── Pipeline lifecycle ────────────────────────────────────────────

    /// Admit a ticket: create its feature branch, persist a queued pipeline
    /// row, and announce it. The scheduler drives it forward from there.
    pub async fn start_pipeline(
        &self,
        project_id: &str,
        ticket: &Ticket,
        vcs: &dyn VcsGateway,
    ) -> Result<Pipeline, OrchestratorError> {
        let id = project_id.to_string();
        let project = self.db.call(move |db| db.get_project(&id)).await?;

        tracing::info!(ticket_id = %ticket.id, "creating branch");
        let branch_name = vcs.create_branch(&ticket.id, &project.base_branch).await?;
        tracing::info!(branch = %branch_name, "created branch");

        let pipeline = {
            let project_id = project_id.to_string();
            let ticket = ticket.clone();
            let branch_name = branch_name.clone();
            self.db
                .call(move |db| {
                    db.create_pipeline(
                        &project_id,
                        &ticket.id,
                        &ticket.title,
                        &branch_name,
                        &ticket.body,
                    )
                })
                .await?
        };

        tracing::info!(pipeline_id = %pipeline.id, ticket_id = %ticket.id, "created pipeline");
        self.bus.pipeline_created(
            &pipeline.id,
            project_id,
            &ticket.id,
            pipeline.state.as_str(),
        );
        self.log_pipeline(
            &pipeline,
            LogLevel::Info,
            &format!("Pipeline created in state {}", pipeline.state.as_str()),
        );

        Ok(pipeline)
    }

    /// Advance a pipeline by exactly one state transition. Call repeatedly
    /// until it reaches a terminal state; terminal pipelines are a no-op.
    pub async fn process_pipeline(
        &self,
        pipeline_id: &str,
        deps: &PipelineDeps<'_>,
    ) -> Result<(), OrchestratorError> {
        let (pipeline, project) = {
            let id = pipeline_id.to_string();
            self.db
                .call(move |db| {
                    let pipeline = db.get_pipeline(&id)?;
                    let project = db.get_project(&pipeline.project_id)?;
                    Ok((pipeline, project))
                })
                .await?
        };

        tracing::info!(pipeline_id, state = pipeline.state.as_str(), "processing pipeline");

        let result = match pipeline.state {
            PipelineState::Queued => self.process_queued(&pipeline, &project).await,
            PipelineState::Coding => self.process_coding(&pipeline, &project, deps).await,
            PipelineState::Testing | PipelineState::Review => {
                self.process_testing(&pipeline, &project, deps).await
            }
            PipelineState::Merged | PipelineState::Failed => {
                tracing::info!(pipeline_id, "pipeline already terminal");
                Ok(())
            }
        };

        if let Err(e) = &result {
            tracing::error!(pipeline_id, error = %e, "error processing pipeline");
            self.log_pipeline(&pipeline, LogLevel::Error, &format!("Processing error: {e}"));
        }
        result
    }

    async fn process_queued(
        &self,
        pipeline: &Pipeline,
        project: &Project,
    ) -> Result<(), OrchestratorError> {
        let previous = pipeline.state;
        self.update(&pipeline.id, PipelineUpdate {
            state: Some(PipelineState::Coding),
            ..Default::default()
        })
        .await?;

        self.bus
            .pipeline_updated(&pipeline.id, &project.id, "coding", previous.as_str());
        self.log_pipeline(pipeline, LogLevel::Info, "Transitioned to coding state");
        Ok(())
    }

    async fn process_coding(
        &self,
        pipeline: &Pipeline,
        project: &Project,
        deps: &PipelineDeps<'_>,
    ) -> Result<(), OrchestratorError> {
        self.log_pipeline(pipeline, LogLevel::Info, "Starting coding phase");

        let task = CodingTask {
            ticket_id: pipeline.ticket_id.clone(),
            ticket_title: pipeline.ticket_title.clone(),
            ticket_body: pipeline.ticket_body.clone(),
            repo_path: deps.repo_path.to_path_buf(),
            branch: pipeline.branch_name.clone(),
            feedback: pipeline.feedback.clone(),
        };

        let result = deps.coder.execute(&task).await;

        if result.success {
            self.log_pipeline(pipeline, LogLevel::Info, "Coding completed successfully");

            let previous = pipeline.state;
            self.update(&pipeline.id, PipelineUpdate {
                state: Some(PipelineState::Testing),
                feedback: Some(None),
                ..Default::default()
            })
            .await?;

            self.bus
                .pipeline_updated(&pipeline.id, &project.id, "testing", previous.as_str());
            self.log_pipeline(pipeline, LogLevel::Info, "Transitioned to testing state");
            Ok(())
        } else {
            let error = result.error.unwrap_or_else(|| "Unknown error".to_string());
            self.handle_coding_failure(pipeline, project, &error).await
        }
    }

    /// Coding failures are not retried: the pipeline fails and the
    /// project's autopilot halts so an operator can look.
    async fn handle_coding_failure(
        &self,
        pipeline: &Pipeline,
        project: &Project,
        error: &str,
    ) -> Result<(), OrchestratorError> {
        self.log_pipeline(pipeline, LogLevel::Error, &format!("Coding failed: {error}"));

        let previous = pipeline.state;
        self.update(&pipeline.id, PipelineUpdate {
            state: Some(PipelineState::Failed),
            feedback: Some(Some(error.to_string())),
            ..Default::default()
        })
        .await?;

        self.bus
            .pipeline_updated(&pipeline.id, &project.id, "failed", previous.as_str());
        self.bus
            .pipeline_completed(&pipeline.id, &project.id, "failed");
        self.archive(&pipeline.id).await?;
        self.log_pipeline(pipeline, LogLevel::Info, "Pipeline completed with failed state");

        self.stop_autopilot(&project.id, "coding_failure");
        Ok(())
    }

    async fn process_testing(
        &self,
        pipeline: &Pipeline,
        project: &Project,
        deps: &PipelineDeps<'_>,
    ) -> Result<(), OrchestratorError> {
        self.log_pipeline(pipeline, LogLevel::Info, "Starting testing phase");

        let task = TestingTask {
            ticket_id: pipeline.ticket_id.clone(),
            ticket_title: pipeline.ticket_title.clone(),
            branch: pipeline.branch_name.clone(),
            base_branch: project.base_branch.clone(),
            repo_path: deps.repo_path.to_path_buf(),
        };

        let result = deps.tester.execute(&task).await?;

        // PR info is persisted whether CI passed or not, so retries and the
        // operator view keep pointing at the same PR.
        self.update(&pipeline.id, PipelineUpdate {
            pr_id: result.pr_id,
            pr_url: result.pr_url.clone(),
            ..Default::default()
        })
        .await?;

        if result.success {
            self.handle_testing_success(pipeline, project, deps).await
        } else {
            let logs = result
                .failure_logs
                .unwrap_or_else(|| "CI failed".to_string());
            self.handle_testing_failure(pipeline, project, &logs).await
        }
    }

    async fn handle_testing_success(
        &self,
        pipeline: &Pipeline,
        project: &Project,
        deps: &PipelineDeps<'_>,
    ) -> Result<(), OrchestratorError> {
        self.log_pipeline(pipeline, LogLevel::Info, "CI passed, merging PR");

        // Re-read to pick up the PR info persisted above.
        let pipeline = {
            let id = pipeline.id.clone();
            self.db.call(move |db| db.get_pipeline(&id)).await?
        };

        if let Some(pr_id) = pipeline.pr_id {
            deps.vcs.merge_pr(pr_id).await?;
            self.log_pipeline(&pipeline, LogLevel::Info, &format!("Merged PR #{pr_id}"));

            deps.vcs.delete_branch(&pipeline.branch_name).await?;
            self.log_pipeline(
                &pipeline,
                LogLevel::Info,
                &format!("Deleted branch {}", pipeline.branch_name),
            );
        }

        deps.board.close_ticket(&pipeline.ticket_id).await?;
        self.log_pipeline(
            &pipeline,
            LogLevel::Info,
            &format!("Closed ticket #{}", pipeline.ticket_id),
        );

        // Best-effort: the ticket may not be on the board anymore.
        if let Err(e) = deps.board.move_ticket(&pipeline.ticket_id, "done").await {
            tracing::warn!(ticket_id = %pipeline.ticket_id, error = %e, "failed to move ticket to done");
        }

        let previous = pipeline.state;
        self.update(&pipeline.id, PipelineUpdate {
            state: Some(PipelineState::Merged),
            ..Default::default()
        })
        .await?;

        self.bus
            .pipeline_updated(&pipeline.id, &project.id, "merged", previous.as_str());
        self.bus
            .pipeline_completed(&pipeline.id, &project.id, "merged");
        self.archive(&pipeline.id).await?;
        self.log_pipeline(&pipeline, LogLevel::Info, "Pipeline completed with merged state");
        Ok(())
    }

    async fn handle_testing_failure(
        &self,
        pipeline: &Pipeline,
        project: &Project,
        failure_logs: &str,
    ) -> Result<(), OrchestratorError> {
        let preview: String = failure_logs.chars().take(200).collect();
        self.log_pipeline(pipeline, LogLevel::Warning, &format!("CI failed: {preview}"));

        let retries = pipeline.retry_count_ci + 1;

        if retries >= project.max_retries_ci {
            self.log_pipeline(
                pipeline,
                LogLevel::Error,
                &format!("Max CI retries ({}) exceeded", project.max_retries_ci),
            );

            let previous = pipeline.state;
            self.update(&pipeline.id, PipelineUpdate {
                state: Some(PipelineState::Failed),
                retry_count_ci: Some(retries),
                feedback: Some(Some(failure_logs.to_string())),
                ..Default::default()
            })
            .await?;

            self.bus
                .pipeline_updated(&pipeline.id, &project.id, "failed", previous.as_str());
            self.bus
                .pipeline_completed(&pipeline.id, &project.id, "failed");
            self.archive(&pipeline.id).await?;
            self.log_pipeline(pipeline, LogLevel::Info, "Pipeline completed with failed state");

            self.stop_autopilot(&project.id, "max_retries");
        } else {
            self.log_pipeline(
                pipeline,
                LogLevel::Info,
                &format!(
                    "Retrying (attempt {}/{})",
                    retries + 1,
                    project.max_retries_ci
                ),
            );

            let previous = pipeline.state;
            self.update(&pipeline.id, PipelineUpdate {
                state: Some(PipelineState::Coding),
                retry_count_ci: Some(retries),
                feedback: Some(Some(failure_logs.to_string())),
                ..Default::default()
            })
            .await?;

            self.bus
                .pipeline_updated(&pipeline.id, &project.id, "coding", previous.as_str());
            self.log_pipeline(
                pipeline,
                LogLevel::Info,
                "Transitioned back to coding state with CI feedback",
            );
        }
        Ok(())
    }

    /// Copy the latest row to history, then delete it. The history row is
    /// keyed by the pipeline id, so recovery after a crash between the two
    /// steps just re-runs the archive.
    async fn archive(&self, pipeline_id: &str) -> Result<(), OrchestratorError> {
        let id = pipeline_id.to_string();
        self.db
            .call(move |db| {
                let latest = db.get_pipeline(&id)?;
                db.save_to_history(&latest)?;
                db.delete_pipeline(&latest.id)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn update(
        &self,
        pipeline_id: &str,
        update: PipelineUpdate,
    ) -> Result<Pipeline, OrchestratorError> {
        let id = pipeline_id.to_string();
        Ok(self
            .db
            .call(move |db| db.update_pipeline(&id, &update))
            .await?)
    }

    fn log_pipeline(&self, pipeline: &Pipeline, level: LogLevel, message: &str) {
        self.bus
            .log(&pipeline.id, &pipeline.project_id, level, message);
    }
}
