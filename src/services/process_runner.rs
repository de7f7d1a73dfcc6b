use crate::utils::error::Result;
use std::process::{Command, Stdio};
use std::sync::Mutex;

/// How the child's standard streams are wired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioMode {
    /// Share the caller's terminal (interactive shell, rsync progress)
    Inherit,
    /// Capture stdout, pass stderr through
    Capture,
}

/// A native tool invocation: program, argv and stdio wiring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub stdio: StdioMode,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdio: StdioMode::Inherit,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdio(mut self, stdio: StdioMode) -> Self {
        self.stdio = stdio;
        self
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Result of a finished invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code; `None` when the child was killed by a signal
    pub status: Option<i32>,
    /// Captured stdout (empty unless `StdioMode::Capture`)
    pub stdout: Vec<u8>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Runs native tools (`ssh`, `ssh-keyscan`, `rsync`, `scp`) to completion
pub trait ProcessRunner: Send + Sync {
    /// Spawn and wait. `Err` only when the program could not be started.
    fn run(&self, invocation: &Invocation) -> Result<ProcessOutput>;
}

/// Runs invocations with `std::process::Command`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessRunner;

impl ProcessRunner for SystemProcessRunner {
    fn run(&self, invocation: &Invocation) -> Result<ProcessOutput> {
        tracing::debug!("Running: {}", invocation.command_line());

        let mut command = Command::new(&invocation.program);
        command.args(&invocation.args);

        match invocation.stdio {
            StdioMode::Inherit => {
                let status = command
                    .stdin(Stdio::inherit())
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit())
                    .status()?;
                Ok(ProcessOutput {
                    status: status.code(),
                    stdout: Vec::new(),
                })
            }
            StdioMode::Capture => {
                let output = command
                    .stdin(Stdio::null())
                    .stderr(Stdio::inherit())
                    .output()?;
                Ok(ProcessOutput {
                    status: output.status.code(),
                    stdout: output.stdout,
                })
            }
        }
    }
}

/// Records invocations and answers with a scripted output instead of spawning.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    invocations: Mutex<Vec<Invocation>>,
    responses: Mutex<Vec<ProcessOutput>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the output for the next `run`. With nothing queued, runs succeed with no output.
    pub fn push_response(&self, output: ProcessOutput) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push(output);
        }
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations
            .lock()
            .map(|invocations| invocations.clone())
            .unwrap_or_default()
    }
}

impl ProcessRunner for RecordingRunner {
    fn run(&self, invocation: &Invocation) -> Result<ProcessOutput> {
        if let Ok(mut invocations) = self.invocations.lock() {
            invocations.push(invocation.clone());
        }
        let next = self.responses.lock().ok().and_then(|mut responses| {
            if responses.is_empty() {
                None
            } else {
                Some(responses.remove(0))
            }
        });
        Ok(next.unwrap_or(ProcessOutput {
            status: Some(0),
            stdout: Vec::new(),
        }))
    }
}
