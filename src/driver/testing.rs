//! Scripted VeertuManage stand-in for unit tests.

use super::command::{CommandOutput, CommandRunner, OutputStream};
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Build an owned argument vector.
pub fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Wrap a JSON body in the `{status, body}` envelope.
pub fn envelope(status: &str, body: serde_json::Value) -> String {
    serde_json::json!({ "status": status, "body": body }).to_string()
}

/// Returns queued outputs in order and records every call.
///
/// Once the queue is empty every call succeeds with empty stdout.
#[derive(Default)]
pub struct ScriptedRunner {
    responses: Mutex<VecDeque<CommandOutput>>,
    calls: Mutex<Vec<Vec<String>>>,
    interrupted: AtomicBool,
}

impl ScriptedRunner {
    /// An empty script.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue the output of the next call.
    pub fn push(&self, output: CommandOutput) {
        self.responses.lock().push_back(output);
    }

    /// Queue a successful call printing `stdout`.
    pub fn push_ok(&self, stdout: impl Into<String>) {
        self.push(CommandOutput::success(stdout));
    }

    /// Set what [`CommandRunner::interrupted`] reports.
    pub fn set_interrupted(&self, value: bool) {
        self.interrupted.store(value, Ordering::SeqCst);
    }

    /// Arguments of every call so far, oldest first.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().clone()
    }

    /// Number of calls so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Calls whose arguments contain `word`.
    pub fn calls_with(&self, word: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|c| c.iter().any(|a| a == word))
            .collect()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(
        &self,
        args: &[String],
        on_output: Option<&mut dyn FnMut(OutputStream, &str)>,
    ) -> Result<CommandOutput> {
        self.calls.lock().push(args.to_vec());
        let output = self.responses.lock().pop_front().unwrap_or_default();

        if let Some(cb) = on_output {
            if !output.stdout.is_empty() {
                cb(OutputStream::Stdout, &output.stdout);
            }
            if !output.stderr.is_empty() {
                cb(OutputStream::Stderr, &output.stderr);
            }
        }

        Ok(output)
    }

    fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}
