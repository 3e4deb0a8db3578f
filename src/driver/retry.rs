//! Exit-code interpretation and bounded retry around a [`CommandRunner`].

use super::command::{CommandRunner, OutputStream};
use crate::error::{Error, Result};
use std::sync::Arc;
use std::time::Duration;

/// Attempts made for a retryable command.
pub const RETRY_ATTEMPTS: u32 = 3;

/// Delay between attempts.
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Exit code VeertuManage returns when it runs but a program it needs is
/// missing.
pub const MISSING_DEPENDENCY_EXIT_CODE: i32 = 126;

/// Per-call execution options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOptions {
    /// Retry on failure. Only set this for commands that are safe to repeat.
    pub retryable: bool,
}

impl ExecOptions {
    /// Options for a command that may be retried.
    pub fn retryable() -> Self {
        Self { retryable: true }
    }
}

/// Runs VeertuManage and turns failures into typed errors.
///
/// - exit code 0 is success
/// - exit code 126 is [`Error::ToolNotFound`] and never retried
/// - any other non-zero code is ignored if the runner was interrupted
/// - otherwise it is [`Error::ToolExecution`], retried if requested
#[derive(Clone)]
pub struct RetryExecutor {
    runner: Arc<dyn CommandRunner>,
    attempts: u32,
    delay: Duration,
}

impl RetryExecutor {
    /// Wrap a runner with the default retry policy.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            attempts: RETRY_ATTEMPTS,
            delay: RETRY_DELAY,
        }
    }

    /// Override the delay between attempts.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Execute a command and return its stdout.
    pub fn execute(&self, args: &[String], opts: ExecOptions) -> Result<String> {
        self.execute_streaming(args, opts, None)
    }

    /// Execute a command, streaming output chunks to `on_output`.
    pub fn execute_streaming(
        &self,
        args: &[String],
        opts: ExecOptions,
        mut on_output: Option<&mut dyn FnMut(OutputStream, &str)>,
    ) -> Result<String> {
        let attempts = if opts.retryable { self.attempts } else { 1 };
        let mut attempt = 1;

        loop {
            // Reborrow for this attempt only.
            let cb: Option<&mut dyn FnMut(OutputStream, &str)> = match on_output {
                Some(ref mut f) => Some(&mut **f),
                None => None,
            };
            match self.execute_once(args, cb) {
                Ok(stdout) => return Ok(stdout),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    tracing::warn!(
                        attempt,
                        max_attempts = attempts,
                        ?args,
                        error = %e,
                        "VeertuManage failed, retrying"
                    );
                    std::thread::sleep(self.delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn execute_once(
        &self,
        args: &[String],
        on_output: Option<&mut dyn FnMut(OutputStream, &str)>,
    ) -> Result<String> {
        let output = self.runner.run(args, on_output)?;

        if output.exit_code != 0 {
            if output.exit_code == MISSING_DEPENDENCY_EXIT_CODE {
                return Err(Error::ToolNotFound);
            }
            if self.runner.interrupted() {
                tracing::info!(
                    exit_code = output.exit_code,
                    "exit code != 0, but interrupted; ignoring"
                );
            } else {
                return Err(Error::tool_execution(args, output.stdout, output.stderr));
            }
        }

        Ok(output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::command::CommandOutput;
    use crate::driver::testing::{args, ScriptedRunner};

    fn executor(runner: &Arc<ScriptedRunner>) -> RetryExecutor {
        RetryExecutor::new(runner.clone()).with_delay(Duration::ZERO)
    }

    #[test]
    fn test_success_returns_stdout() {
        let runner = ScriptedRunner::new();
        runner.push(CommandOutput::success("hello"));

        let out = executor(&runner)
            .execute(&args(&["list"]), ExecOptions::default())
            .unwrap();
        assert_eq!(out, "hello");
        assert_eq!(runner.call_count(), 1);
    }

    #[test]
    fn test_retryable_succeeds_on_third_attempt() {
        let runner = ScriptedRunner::new();
        runner.push(CommandOutput::failure(1, "driver not loaded"));
        runner.push(CommandOutput::failure(1, "driver not loaded"));
        runner.push(CommandOutput::success("ok"));

        let out = executor(&runner)
            .execute(&args(&["list"]), ExecOptions::retryable())
            .unwrap();
        assert_eq!(out, "ok");
        assert_eq!(runner.call_count(), 3);
    }

    #[test]
    fn test_retryable_gives_up_after_three_attempts() {
        let runner = ScriptedRunner::new();
        for _ in 0..4 {
            runner.push(CommandOutput::failure(1, "still broken"));
        }

        let err = executor(&runner)
            .execute(&args(&["list"]), ExecOptions::retryable())
            .unwrap_err();
        assert!(matches!(err, Error::ToolExecution { .. }));
        assert_eq!(runner.call_count(), 3);
    }

    #[test]
    fn test_non_retryable_fails_immediately() {
        let runner = ScriptedRunner::new();
        runner.push(CommandOutput::failure(1, "boom"));
        runner.push(CommandOutput::success("never reached"));

        let err = executor(&runner)
            .execute(&args(&["start", "vm"]), ExecOptions::default())
            .unwrap_err();
        match err {
            Error::ToolExecution { command, stderr, .. } => {
                assert!(command.contains("start"));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(runner.call_count(), 1);
    }

    #[test]
    fn test_missing_dependency_is_tool_not_found_and_not_retried() {
        let runner = ScriptedRunner::new();
        runner.push(CommandOutput::failure(MISSING_DEPENDENCY_EXIT_CODE, ""));
        runner.push(CommandOutput::success("never reached"));

        let err = executor(&runner)
            .execute(&args(&["list"]), ExecOptions::retryable())
            .unwrap_err();
        assert!(matches!(err, Error::ToolNotFound));
        assert_eq!(runner.call_count(), 1);
    }

    #[test]
    fn test_interrupted_failure_is_not_an_error() {
        let runner = ScriptedRunner::new();
        runner.set_interrupted(true);
        runner.push(CommandOutput {
            exit_code: 130,
            stdout: "partial".to_string(),
            stderr: "interrupted".to_string(),
        });

        let out = executor(&runner)
            .execute(&args(&["export", "vm"]), ExecOptions::default())
            .unwrap();
        assert_eq!(out, "partial");
    }

    #[test]
    fn test_streaming_callback_sees_output() {
        let runner = ScriptedRunner::new();
        runner.push(CommandOutput::success("10%\n50%\n"));

        let mut seen = String::new();
        let mut cb = |_: OutputStream, chunk: &str| seen.push_str(chunk);
        executor(&runner)
            .execute_streaming(&args(&["export"]), ExecOptions::default(), Some(&mut cb))
            .unwrap();
        assert_eq!(seen, "10%\n50%\n");
    }

    #[test]
    fn test_streaming_callback_sees_every_attempt() {
        let runner = ScriptedRunner::new();
        runner.push(CommandOutput {
            exit_code: 1,
            stdout: "10%\n".to_string(),
            stderr: String::new(),
        });
        runner.push(CommandOutput::success("100%\n"));

        let mut seen = Vec::new();
        let mut cb = |_: OutputStream, chunk: &str| seen.push(chunk.to_string());
        let out = executor(&runner)
            .execute_streaming(&args(&["list"]), ExecOptions::retryable(), Some(&mut cb))
            .unwrap();

        assert_eq!(out, "100%\n");
        assert_eq!(seen, vec!["10%\n", "100%\n"]);
    }
}
