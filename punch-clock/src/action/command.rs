//! Punch action backed by an external program.
//!
//! The automation itself (browser, login, screenshots) lives outside this
//! crate. The program is invoked once per attempt and its exit status is
//! mapped onto an [`ActionOutcome`].

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{Action, ActionDetail, ActionOutcome, ErrorKind, PunchKind};

/// Placeholder substituted with the punch kind in arguments and paths.
const ACTION_PLACEHOLDER: &str = "{action}";

/// Number of stderr lines kept in failure messages.
const STDERR_TAIL_LINES: usize = 5;

pub struct CommandAction {
    kind: PunchKind,
    program: String,
    args: Vec<String>,
    timeout: Duration,
    terminal_exit_codes: Vec<i32>,
    attachment_path: Option<String>,
}

impl CommandAction {
    pub fn new(kind: PunchKind, program: impl Into<String>) -> Self {
        Self {
            kind,
            program: program.into(),
            args: Vec::new(),
            timeout: Duration::from_secs(300),
            terminal_exit_codes: vec![2],
            attachment_path: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_terminal_exit_codes(mut self, codes: Vec<i32>) -> Self {
        self.terminal_exit_codes = codes;
        self
    }

    pub fn with_attachment_path(mut self, template: Option<String>) -> Self {
        self.attachment_path = template;
        self
    }

    fn expand(&self, template: &str) -> String {
        template.replace(ACTION_PLACEHOLDER, self.kind.as_str())
    }

    fn attachment(&self) -> Option<PathBuf> {
        let path = PathBuf::from(self.expand(self.attachment_path.as_deref()?));
        if path.is_file() {
            Some(path)
        } else {
            debug!(path = %path.display(), "No attachment produced");
            None
        }
    }
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().rev().map(str::trim).find(|l| !l.is_empty())
}

fn tail(text: &str, lines: usize) -> String {
    let collected: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    collected[collected.len().saturating_sub(lines)..].join("\n")
}

#[async_trait]
impl Action for CommandAction {
    async fn run(&self) -> ActionOutcome {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(self.args.iter().map(|a| self.expand(a)))
            .env("PUNCH_ACTION", self.kind.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ActionOutcome::failure(
                    ErrorKind::InvalidConfig,
                    format!("failed to start '{}': {}", self.program, e),
                );
            }
        };

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return ActionOutcome::failure(ErrorKind::Unknown, format!("wait failed: {e}"));
            }
            Err(_) => {
                warn!(program = %self.program, timeout = ?self.timeout, "Punch command timed out");
                return ActionOutcome::failure(
                    ErrorKind::Timeout,
                    format!("'{}' timed out after {:?}", self.program, self.timeout),
                );
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        match output.status.code() {
            Some(0) => {
                let message = last_line(&stdout)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{} completed", self.kind.label()));
                let mut detail = ActionDetail::new(message);
                detail.attachment = self.attachment();
                ActionOutcome::Success(detail)
            }
            Some(code) if self.terminal_exit_codes.contains(&code) => ActionOutcome::failure(
                ErrorKind::InvalidConfig,
                format!("exit code {code}: {}", tail(&stderr, STDERR_TAIL_LINES)),
            ),
            code => {
                let message = tail(&stderr, STDERR_TAIL_LINES);
                let kind = match ErrorKind::classify(&message) {
                    ErrorKind::Unknown => ErrorKind::Remote,
                    kind => kind,
                };
                let status = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                ActionOutcome::failure(kind, format!("exit {status}: {message}"))
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(kind: PunchKind, script: &str) -> CommandAction {
        CommandAction::new(kind, "sh").with_args(vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn test_success_uses_last_stdout_line() {
        let action = shell(PunchKind::ClockIn, "echo starting; echo punched {action}");
        let outcome = action.run().await;
        assert_eq!(outcome, ActionOutcome::success("punched clock_in"));
    }

    #[tokio::test]
    async fn test_terminal_exit_code() {
        let action = shell(PunchKind::ClockOut, "echo bad credentials >&2; exit 2");
        let outcome = action.run().await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::InvalidConfig));
        assert!(outcome.message().contains("bad credentials"));
    }

    #[tokio::test]
    async fn test_other_exit_code_is_retryable() {
        let action = shell(PunchKind::ClockIn, "echo connection refused >&2; exit 1");
        assert_eq!(action.run().await.error_kind(), Some(ErrorKind::Network));

        let action = shell(PunchKind::ClockIn, "echo page broke >&2; exit 1");
        assert_eq!(action.run().await.error_kind(), Some(ErrorKind::Remote));
    }

    #[tokio::test]
    async fn test_timeout() {
        let action =
            shell(PunchKind::ClockIn, "sleep 5").with_timeout(Duration::from_millis(100));
        assert_eq!(action.run().await.error_kind(), Some(ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn test_missing_program_is_terminal() {
        let action = CommandAction::new(PunchKind::ClockIn, "/nonexistent/punch-bot");
        assert_eq!(
            action.run().await.error_kind(),
            Some(ErrorKind::InvalidConfig)
        );
    }

    #[tokio::test]
    async fn test_attachment_is_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("{action}.png");
        let expected = dir.path().join("clock_in.png");
        let script = format!("touch '{}'", expected.display());

        let action = shell(PunchKind::ClockIn, &script)
            .with_attachment_path(Some(template.display().to_string()));
        match action.run().await {
            ActionOutcome::Success(detail) => assert_eq!(detail.attachment, Some(expected)),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
