use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DgxError {
    #[error("Invalid connection profile: {0}")]
    InvalidProfile(String),

    #[error("Failed to read SSH key {}: {source}", .path.display())]
    KeyRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse SSH key {}: {reason}", .path.display())]
    KeyParse { path: PathBuf, reason: String },

    #[error("Connection to {addr} timed out after {seconds}s")]
    DialTimeout { addr: String, seconds: u64 },

    #[error("Host key for {addr} does not match known_hosts ({reason})")]
    UntrustedHost { addr: String, reason: String },

    #[error("Connection to {host} aborted: host key not trusted")]
    ConnectionAborted { host: String },

    #[error("Failed to connect to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    #[error("Authentication as {user} on {addr} failed: {reason}")]
    AuthenticationFailed {
        user: String,
        addr: String,
        reason: String,
    },

    #[error("Failed to scan host key of {host}: {reason}")]
    HostKeyScan { host: String, reason: String },

    #[error("Failed to open session on {addr}: {reason}")]
    Session { addr: String, reason: String },

    #[error("Command `{command}` failed: {}", describe_status(*.status))]
    RemoteCommand {
        command: String,
        status: Option<u32>,
        output: String,
    },

    #[error("Failed to create tunnel on local port {local_port}: {reason}")]
    TunnelCreate { local_port: u16, reason: String },

    #[error("No process with PID {0}")]
    ProcessNotFound(u32),

    #[error("Failed to signal process {pid}: {reason}")]
    Signal { pid: u32, reason: String },

    #[error("Failed to probe local port {port}: {reason}")]
    PortProbe { port: u16, reason: String },

    #[error("Failed to list processes: {0}")]
    ProcessList(String),

    #[error("{tool} failed: {}", describe_exit(*.status))]
    Transfer { tool: String, status: Option<i32> },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Playbook error: {0}")]
    Playbook(String),

    #[error("Invalid environment variable: {0}")]
    EnvVar(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DgxError>;

fn describe_status(status: Option<u32>) -> String {
    match status {
        Some(code) => format!("exited with status {}", code),
        None => "terminated without an exit status".to_string(),
    }
}

fn describe_exit(status: Option<i32>) -> String {
    match status {
        Some(code) => format!("exited with status {}", code),
        None => "killed by a signal".to_string(),
    }
}

impl DgxError {
    /// Operator-facing message. Remote command failures include the captured output.
    pub fn user_message(&self) -> String {
        match self {
            Self::RemoteCommand { output, .. } if !output.trim().is_empty() => {
                format!("{}\n{}", self, output.trim_end())
            }
            Self::KeyRead { .. } | Self::KeyParse { .. } => {
                format!("{}\nCheck `identity_file` with `dgx config show`.", self)
            }
            Self::ConnectionAborted { .. } => {
                format!("{}\nRe-run and accept the host key to continue.", self)
            }
            _ => self.to_string(),
        }
    }
}
