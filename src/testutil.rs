//! Test doubles for the gateway and worker traits, shared across the
//! orchestrator, scheduler, and worker tests. Each mock records its calls
//! and can be scripted with canned results.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;

use crate::errors::{KanbanError, VcsError};
use crate::kanban::{Ticket, TicketBoard};
use crate::vcs::{CiStatus, PullRequest, VcsGateway};
use crate::workers::{Coder, CodingResult, CodingTask, Tester, TestingResult, TestingTask};

pub fn ticket(id: &str, title: &str) -> Ticket {
    Ticket {
        id: id.to_string(),
        title: title.to_string(),
        body: format!("Body of {title}"),
        labels: Vec::new(),
    }
}

pub fn testing_success(pr_number: i64) -> TestingResult {
    TestingResult {
        success: true,
        pr_id: Some(pr_number),
        pr_url: Some(format!("https://example.com/pull/{pr_number}")),
        ci_status: CiStatus::Success,
        failure_logs: None,
    }
}

pub fn testing_failure(pr_number: i64, logs: &str) -> TestingResult {
    TestingResult {
        success: false,
        pr_id: Some(pr_number),
        pr_url: Some(format!("https://example.com/pull/{pr_number}")),
        ci_status: CiStatus::Failure,
        failure_logs: Some(logs.to_string()),
    }
}

// ── MockVcs ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockVcs {
    calls: Mutex<Vec<String>>,
    ci_script: Mutex<VecDeque<CiStatus>>,
    failure_logs_text: Mutex<String>,
    push_error: Mutex<Option<String>>,
    branch_error: Mutex<Option<String>>,
    merge_error: Mutex<Option<String>>,
    next_pr_number: AtomicI64,
}

impl MockVcs {
    pub fn new() -> Self {
        Self {
            failure_logs_text: Mutex::new("Test failed: test_foo".to_string()),
            next_pr_number: AtomicI64::new(101),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    pub fn script_ci(&self, statuses: impl IntoIterator<Item = CiStatus>) {
        self.ci_script.lock().unwrap().extend(statuses);
    }

    pub fn set_failure_logs(&self, text: &str) {
        *self.failure_logs_text.lock().unwrap() = text.to_string();
    }

    pub fn fail_push(&self, message: &str) {
        *self.push_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn fail_branch(&self, message: &str) {
        *self.branch_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn fail_merge(&self, message: &str) {
        *self.merge_error.lock().unwrap() = Some(message.to_string());
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl VcsGateway for MockVcs {
    async fn create_branch(&self, ticket_id: &str, base: &str) -> Result<String, VcsError> {
        self.record(format!("create_branch:{ticket_id}:{base}"));
        if let Some(msg) = self.branch_error.lock().unwrap().clone() {
            return Err(VcsError::Branch(msg));
        }
        Ok(format!("ticket-{ticket_id}"))
    }

    async fn push(&self, branch: &str) -> Result<(), VcsError> {
        self.record(format!("push:{branch}"));
        if let Some(msg) = self.push_error.lock().unwrap().clone() {
            return Err(VcsError::Push(msg));
        }
        Ok(())
    }

    async fn create_pr(
        &self,
        branch: &str,
        title: &str,
        body: &str,
        base: &str,
    ) -> Result<PullRequest, VcsError> {
        self.record(format!("create_pr:{branch}:{title}:{body}:{base}"));
        let number = self.next_pr_number.fetch_add(1, Ordering::SeqCst);
        Ok(PullRequest {
            id: 9000 + number,
            url: format!("https://example.com/pull/{number}"),
            number,
        })
    }

    async fn ci_status(&self, pr_number: i64) -> Result<CiStatus, VcsError> {
        self.record(format!("ci_status:{pr_number}"));
        Ok(self
            .ci_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(CiStatus::Success))
    }

    async fn failure_logs(&self, pr_number: i64) -> Result<String, VcsError> {
        self.record(format!("failure_logs:{pr_number}"));
        Ok(self.failure_logs_text.lock().unwrap().clone())
    }

    async fn merge_pr(&self, pr_number: i64) -> Result<(), VcsError> {
        self.record(format!("merge_pr:{pr_number}"));
        if let Some(msg) = self.merge_error.lock().unwrap().clone() {
            return Err(VcsError::Merge(msg));
        }
        Ok(())
    }

    async fn delete_branch(&self, branch: &str) -> Result<(), VcsError> {
        self.record(format!("delete_branch:{branch}"));
        Ok(())
    }
}

// ── MockBoard ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockBoard {
    queue: Mutex<Vec<Ticket>>,
    moved: Mutex<Vec<(String, String)>>,
    closed: Mutex<Vec<String>>,
    fail_move: Mutex<bool>,
}

impl MockBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue(tickets: Vec<Ticket>) -> Self {
        Self {
            queue: Mutex::new(tickets),
            ..Default::default()
        }
    }

    pub fn moved(&self) -> Vec<(String, String)> {
        self.moved.lock().unwrap().clone()
    }

    pub fn closed(&self) -> Vec<String> {
        self.closed.lock().unwrap().clone()
    }

    pub fn queued(&self) -> Vec<Ticket> {
        self.queue.lock().unwrap().clone()
    }

    pub fn set_fail_move(&self, fail: bool) {
        *self.fail_move.lock().unwrap() = fail;
    }
}

#[async_trait]
impl TicketBoard for MockBoard {
    async fn list_tickets(&self, column: &str) -> Result<Vec<Ticket>, KanbanError> {
        if column == "queue" {
            Ok(self.queue.lock().unwrap().clone())
        } else {
            Ok(Vec::new())
        }
    }

    async fn get_ticket(&self, ticket_id: &str) -> Result<Ticket, KanbanError> {
        self.queue
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.id == ticket_id)
            .cloned()
            .ok_or_else(|| KanbanError::TicketNotFound(ticket_id.to_string()))
    }

    async fn move_ticket(&self, ticket_id: &str, column: &str) -> Result<(), KanbanError> {
        if *self.fail_move.lock().unwrap() {
            return Err(KanbanError::Api("move rejected".to_string()));
        }
        self.moved
            .lock()
            .unwrap()
            .push((ticket_id.to_string(), column.to_string()));
        // Moving out of the queue removes the ticket from that column.
        if column != "queue" {
            self.queue.lock().unwrap().retain(|t| t.id != ticket_id);
        }
        Ok(())
    }

    async fn close_ticket(&self, ticket_id: &str) -> Result<(), KanbanError> {
        self.closed.lock().unwrap().push(ticket_id.to_string());
        Ok(())
    }
}

// ── MockCoder ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockCoder {
    results: Mutex<VecDeque<CodingResult>>,
    tasks: Mutex<Vec<CodingTask>>,
}

impl MockCoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, results: impl IntoIterator<Item = CodingResult>) {
        self.results.lock().unwrap().extend(results);
    }

    pub fn script_failure(&self, error: &str) {
        self.script([CodingResult {
            success: false,
            output: String::new(),
            error: Some(error.to_string()),
        }]);
    }

    pub fn tasks(&self) -> Vec<CodingTask> {
        self.tasks.lock().unwrap().clone()
    }
}

#[async_trait]
impl Coder for MockCoder {
    async fn execute(&self, task: &CodingTask) -> CodingResult {
        self.tasks.lock().unwrap().push(task.clone());
        self.results.lock().unwrap().pop_front().unwrap_or(CodingResult {
            success: true,
            output: "done".to_string(),
            error: None,
        })
    }
}

// ── MockTester ────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockTester {
    results: Mutex<VecDeque<TestingResult>>,
    fail_next: Mutex<Option<String>>,
    tasks: Mutex<Vec<TestingTask>>,
}

impl MockTester {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, results: impl IntoIterator<Item = TestingResult>) {
        self.results.lock().unwrap().extend(results);
    }

    pub fn fail_next(&self, message: &str) {
        *self.fail_next.lock().unwrap() = Some(message.to_string());
    }

    pub fn tasks(&self) -> Vec<TestingTask> {
        self.tasks.lock().unwrap().clone()
    }
}

#[async_trait]
impl Tester for MockTester {
    async fn execute(&self, task: &TestingTask) -> Result<TestingResult, VcsError> {
        self.tasks.lock().unwrap().push(task.clone());
        if let Some(msg) = self.fail_next.lock().unwrap().take() {
            return Err(VcsError::Push(msg));
        }
        Ok(self
            .results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| testing_success(101)))
    }
}
