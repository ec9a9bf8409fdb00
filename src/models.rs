use serde::{Deserialize, Serialize};

/// The six states a pipeline can occupy. `Review` is reserved: it is handled
/// if encountered but nothing currently transitions into it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Queued,
    Coding,
    Testing,
    Review,
    Merged,
    Failed,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Coding => "coding",
            Self::Testing => "testing",
            Self::Review => "review",
            Self::Merged => "merged",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "queued" => Ok(Self::Queued),
            "coding" => Ok(Self::Coding),
            "testing" => Ok(Self::Testing),
            "review" => Ok(Self::Review),
            "merged" => Ok(Self::Merged),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid pipeline state: {}", s)),
        }
    }

    /// Terminal states are archived and never advanced again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Merged | Self::Failed)
    }

    /// The working set: states that count against `max_concurrent`.
    pub fn is_working(&self) -> bool {
        matches!(self, Self::Coding | Self::Testing | Self::Review)
    }
}

/// States that make up the working set, in dispatch order.
pub const WORKING_STATES: [PipelineState; 3] = [
    PipelineState::Coding,
    PipelineState::Testing,
    PipelineState::Review,
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    /// GitHub repo in "owner/name" format; unique across projects.
    pub repo: String,
    pub base_branch: String,
    /// Kanban board number (GitHub Projects V2), if configured.
    pub kanban_board_id: Option<i64>,
    pub max_retries_ci: u32,
    pub max_retries_review: u32,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields for creating a project. `Default` fills in the usual values so
/// callers only set what they care about.
#[derive(Debug, Clone)]
pub struct NewProject {
    pub name: String,
    pub repo: String,
    pub base_branch: String,
    pub kanban_board_id: Option<i64>,
    pub max_retries_ci: u32,
    pub max_retries_review: u32,
}

impl NewProject {
    pub fn new(name: &str, repo: &str) -> Self {
        Self {
            name: name.to_string(),
            repo: repo.to_string(),
            base_branch: "main".to_string(),
            kanban_board_id: None,
            max_retries_ci: 3,
            max_retries_review: 3,
        }
    }
}

/// Partial update for a project; only `Some` fields are applied.
#[derive(Debug, Clone, Default)]
pub struct ProjectUpdate {
    pub name: Option<String>,
    pub base_branch: Option<String>,
    pub kanban_board_id: Option<i64>,
    pub max_retries_ci: Option<u32>,
    pub max_retries_review: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: String,
    pub project_id: String,
    pub ticket_id: String,
    pub ticket_title: String,
    pub ticket_body: String,
    pub state: PipelineState,
    pub branch_name: String,
    pub pr_id: Option<i64>,
    pub pr_url: Option<String>,
    pub retry_count_ci: u32,
    pub retry_count_review: u32,
    /// Most recent failure context, handed back to the coder on retry.
    pub feedback: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Partial update for a pipeline. `feedback` is tri-state: `None` leaves it
/// untouched, `Some(None)` clears it, `Some(Some(s))` replaces it.
#[derive(Debug, Clone, Default)]
pub struct PipelineUpdate {
    pub state: Option<PipelineState>,
    pub pr_id: Option<i64>,
    pub pr_url: Option<String>,
    pub retry_count_ci: Option<u32>,
    pub retry_count_review: Option<u32>,
    pub feedback: Option<Option<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineHistory {
    pub id: String,
    /// Id of the archived active pipeline; unique, so re-archival after a
    /// crash between the save and the delete is a no-op.
    pub pipeline_id: String,
    pub project_id: String,
    pub ticket_id: String,
    pub ticket_title: String,
    pub final_state: PipelineState,
    pub branch_name: String,
    pub pr_id: Option<i64>,
    pub pr_url: Option<String>,
    pub total_retries_ci: u32,
    pub total_retries_review: u32,
    pub started_at: String,
    pub completed_at: String,
    pub duration_seconds: i64,
}

/// Aggregates over the history table. All zeros when the table is empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryStats {
    pub total_completed: i64,
    pub total_merged: i64,
    pub total_failed: i64,
    pub avg_duration_seconds: f64,
    pub avg_retries_ci: f64,
    pub avg_retries_review: f64,
}

/// Runtime view of a project's autopilot. Derived, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutopilotStatus {
    pub project_id: String,
    pub running: bool,
    pub active_pipelines: i64,
    pub queued_tickets: i64,
}
