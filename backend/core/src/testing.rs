//! Scripted command runner for tests across the workspace.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::command::{CommandOutput, CommandRunner, CommandSpec};
use crate::error::CageError;

enum Scripted {
    Output(CommandOutput),
    Timeout,
}

/// Replays canned outputs keyed by full command line. The last scripted
/// response for a command repeats once the queue is drained; unscripted
/// commands fail as if the tool were not installed.
#[derive(Default)]
pub struct FakeRunner {
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub command_line: String,
    pub stdin: Option<Vec<u8>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, command_line: &str, status: i32, stdout: &str, stderr: &str) -> &Self {
        self.push(
            command_line,
            Scripted::Output(CommandOutput {
                status,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            }),
        );
        self
    }

    pub fn ok(&self, command_line: &str, stdout: &str) -> &Self {
        self.on(command_line, 0, stdout, "")
    }

    pub fn timeout(&self, command_line: &str) -> &Self {
        self.push(command_line, Scripted::Timeout);
        self
    }

    fn push(&self, command_line: &str, response: Scripted) {
        self.scripts
            .lock()
            .unwrap()
            .entry(command_line.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.command_line).collect()
    }

    pub fn count(&self, command_line: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.command_line == command_line)
            .count()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CageError> {
        let line = spec.command_line();
        self.calls.lock().unwrap().push(RecordedCall {
            command_line: line.clone(),
            stdin: spec.stdin.clone(),
        });

        let mut scripts = self.scripts.lock().unwrap();
        let Some(queue) = scripts.get_mut(&line) else {
            return Err(CageError::Spawn {
                program: spec.program.clone(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        };
        let response = if queue.len() > 1 { queue.pop_front() } else { queue.front().map(clone_scripted) };
        match response {
            Some(Scripted::Output(out)) => Ok(out),
            Some(Scripted::Timeout) => Err(CageError::CommandTimeout {
                program: spec.program.clone(),
                timeout_ms: spec.timeout.as_millis() as u64,
            }),
            None => Err(CageError::Spawn {
                program: spec.program.clone(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            }),
        }
    }
}

fn clone_scripted(s: &Scripted) -> Scripted {
    match s {
        Scripted::Output(out) => Scripted::Output(out.clone()),
        Scripted::Timeout => Scripted::Timeout,
    }
}
