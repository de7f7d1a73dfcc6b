use serde::{Deserialize, Serialize};

/// One row of the OS process table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    /// Full argument vector, program first
    pub argv: Vec<String>,
}

impl ProcessEntry {
    pub fn new<I, S>(pid: u32, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            pid,
            argv: argv.into_iter().map(Into::into).collect(),
        }
    }

    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }

    /// File name of the executable, e.g. `ssh` for `/usr/bin/ssh`
    pub fn program_name(&self) -> &str {
        self.argv
            .first()
            .map(|program| program.rsplit('/').next().unwrap_or(program))
            .unwrap_or("")
    }
}
