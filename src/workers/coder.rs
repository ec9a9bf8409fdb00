//! Coding worker: invokes the external code-generation agent as a
//! subprocess against the project working tree.

use std::io::ErrorKind;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{Coder, CodingResult, CodingTask};

/// Runs the agent CLI (`claude` by default, overridable via
/// `VIBECC_AGENT_CMD`) with a prompt built from the ticket. Exit status zero
/// means the working tree was modified successfully; non-zero exit,
/// timeout, missing binary, and spawn failures all map to a failed result
/// with a descriptive error.
pub struct AgentCoder {
    command: String,
    timeout: Option<Duration>,
}

impl AgentCoder {
    pub fn new() -> Self {
        let command = std::env::var("VIBECC_AGENT_CMD").unwrap_or_else(|_| "claude".to_string());
        Self::with_command(command)
    }

    pub fn with_command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the agent prompt from the ticket, with the previous failure
    /// under its own heading so the agent treats it as context to fix.
    pub fn build_prompt(&self, task: &CodingTask) -> String {
        let mut prompt = format!(
            "# Ticket #{}: {}\n\n{}\n",
            task.ticket_id, task.ticket_title, task.ticket_body
        );
        if let Some(feedback) = &task.feedback {
            prompt.push_str(&format!(
                "\n## Previous CI Feedback\n\nThe last attempt failed. Address this feedback:\n\n{feedback}\n"
            ));
        }
        prompt.push_str(&format!(
            "\nComplete this ticket. Modify the working tree on branch {} so the project builds and its tests pass.\n",
            task.branch
        ));
        prompt
    }

    fn failure(error: String) -> CodingResult {
        CodingResult {
            success: false,
            output: String::new(),
            error: Some(error),
        }
    }
}

impl Default for AgentCoder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Coder for AgentCoder {
    async fn execute(&self, task: &CodingTask) -> CodingResult {
        let prompt = self.build_prompt(task);
        tracing::info!(ticket_id = %task.ticket_id, branch = %task.branch, "running coding agent");

        let mut cmd = Command::new(&self.command);
        cmd.args(["-p", &prompt, "--yes"])
            .current_dir(&task.repo_path)
            .kill_on_drop(true);

        let result = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, cmd.output()).await {
                Ok(result) => result,
                Err(_) => {
                    return Self::failure(format!(
                        "agent timed out after {}s",
                        timeout.as_secs()
                    ));
                }
            },
            None => cmd.output().await,
        };

        let output = match result {
            Ok(output) => output,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Self::failure(format!("agent command '{}' not found", self.command));
            }
            Err(e) => return Self::failure(format!("failed to run agent: {e}")),
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            CodingResult {
                success: true,
                output: combined,
                error: None,
            }
        } else {
            let code = output.status.code().unwrap_or(-1);
            CodingResult {
                success: false,
                output: combined,
                error: Some(format!("agent exited with code {code}")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn task() -> CodingTask {
        CodingTask {
            ticket_id: "42".to_string(),
            ticket_title: "Add user authentication".to_string(),
            ticket_body: "Implement login/logout with JWT tokens.".to_string(),
            repo_path: PathBuf::from("."),
            branch: "ticket-42".to_string(),
            feedback: None,
        }
    }

    fn task_with_feedback() -> CodingTask {
        CodingTask {
            feedback: Some("Test failed: test_login_success - AssertionError".to_string()),
            ..task()
        }
    }

    #[test]
    fn test_prompt_embeds_ticket_fields() {
        let coder = AgentCoder::with_command("claude");
        let task = task();
        let prompt = coder.build_prompt(&task);

        assert!(prompt.contains("#42"));
        assert!(prompt.contains(&task.ticket_title));
        assert!(prompt.contains(&task.ticket_body));
        assert!(prompt.contains("Complete this ticket"));
    }

    #[test]
    fn test_prompt_includes_feedback_section() {
        let coder = AgentCoder::with_command("claude");
        let task = task_with_feedback();
        let prompt = coder.build_prompt(&task);

        assert!(prompt.contains("Previous CI Feedback"));
        assert!(prompt.contains(task.feedback.as_deref().unwrap()));
    }

    #[test]
    fn test_prompt_has_no_feedback_section_without_feedback() {
        let coder = AgentCoder::with_command("claude");
        let prompt = coder.build_prompt(&task());
        assert!(!prompt.contains("Previous CI Feedback"));
    }

    #[test]
    fn test_default_timeout_is_none() {
        let coder = AgentCoder::with_command("claude");
        assert!(coder.timeout.is_none());
    }

    #[test]
    fn test_custom_timeout() {
        let coder = AgentCoder::with_command("claude").timeout(Duration::from_secs(60));
        assert_eq!(coder.timeout, Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_execute_success_on_exit_zero() {
        // `echo` accepts the arguments and prints them, exiting zero.
        let coder = AgentCoder::with_command("echo");
        let result = coder.execute(&task()).await;

        assert!(result.success);
        assert!(result.error.is_none());
        assert!(result.output.contains("Complete this ticket"));
    }

    #[tokio::test]
    async fn test_execute_failure_on_nonzero_exit() {
        let coder = AgentCoder::with_command("false");
        let result = coder.execute(&task()).await;

        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.contains("exited with code 1"), "got: {error}");
    }

    #[tokio::test]
    async fn test_execute_missing_binary() {
        let coder = AgentCoder::with_command("vibecc-no-such-agent-binary");
        let result = coder.execute(&task()).await;

        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.contains("not found"), "got: {error}");
        assert!(error.contains("vibecc-no-such-agent-binary"));
    }

    #[tokio::test]
    async fn test_execute_timeout() {
        let coder =
            AgentCoder::with_command("sleep").timeout(Duration::from_millis(50));
        // `sleep -p <prompt> --yes` is invalid, but on some systems it may
        // still hang; either outcome must be a failed result, and a hang
        // must be cut off by the timeout.
        let result = coder.execute(&task()).await;
        assert!(!result.success);
        assert!(result.error.is_some());
    }
}
