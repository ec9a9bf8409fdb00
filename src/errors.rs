//! Typed error hierarchy for the pipeline core.
//!
//! Each subsystem gets its own enum:
//! - `StoreError` — persistence failures and constraint violations
//! - `VcsError` — branch, push, PR, and merge failures
//! - `KanbanError` — ticket board failures
//! - `OrchestratorError` — anything the state machine can surface

use thiserror::Error;

/// Errors from the state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Project '{id}' not found")]
    ProjectNotFound { id: String },

    #[error("Project with repo '{repo}' already exists")]
    ProjectExists { repo: String },

    #[error("Project '{id}' has active pipelines")]
    ProjectHasActivePipelines { id: String },

    #[error("Pipeline '{id}' not found")]
    PipelineNotFound { id: String },

    #[error("Active pipeline already exists for ticket #{ticket_id} in project '{project_id}'")]
    PipelineExists {
        project_id: String,
        ticket_id: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("Store error: {0}")]
    Internal(String),
}

/// Errors from the VCS gateway (local git + PR provider).
#[derive(Debug, Error)]
pub enum VcsError {
    #[error("Branch operation failed: {0}")]
    Branch(String),

    #[error("Push failed: {0}")]
    Push(String),

    #[error("Pull request operation failed: {0}")]
    Pr(String),

    #[error("Merge failed: {0}")]
    Merge(String),

    #[error("VCS request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors from the kanban gateway.
#[derive(Debug, Error)]
pub enum KanbanError {
    #[error("Ticket #{0} not found")]
    TicketNotFound(String),

    #[error("Column '{0}' not found")]
    ColumnNotFound(String),

    #[error("Kanban board not found: {0}")]
    BoardNotFound(String),

    #[error("Kanban API error: {0}")]
    Api(String),

    #[error("Kanban request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors surfaced by the orchestrator and scheduler. External worker
/// failures are policy (retry or archive), not errors; these are the cases
/// where a step could not run at all.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error(transparent)]
    Kanban(#[from] KanbanError),

    #[error("Failed to process pipeline: {0}")]
    Processing(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_messages_carry_ids() {
        let err = StoreError::ProjectNotFound { id: "p-1".into() };
        assert!(err.to_string().contains("p-1"));

        let err = StoreError::PipelineExists {
            project_id: "p-1".into(),
            ticket_id: "42".into(),
        };
        assert!(err.to_string().contains("42"));
        assert!(err.to_string().contains("p-1"));
    }

    #[test]
    fn orchestrator_error_converts_from_store_error() {
        let inner = StoreError::PipelineNotFound { id: "x".into() };
        let err: OrchestratorError = inner.into();
        assert!(matches!(
            err,
            OrchestratorError::Store(StoreError::PipelineNotFound { .. })
        ));
    }

    #[test]
    fn orchestrator_error_converts_from_vcs_error() {
        let err: OrchestratorError = VcsError::Push("rejected".into()).into();
        assert!(matches!(err, OrchestratorError::Vcs(VcsError::Push(_))));
        assert!(err.to_string().contains("rejected"));
    }

    #[test]
    fn all_error_types_implement_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StoreError::LockPoisoned);
        assert_std_error(&VcsError::Merge("conflict".into()));
        assert_std_error(&KanbanError::ColumnNotFound("done".into()));
        assert_std_error(&OrchestratorError::Processing("boom".into()));
    }
}
