use crate::utils::error::{DgxError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Fully resolved connection settings for the remote host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionProfile {
    /// Remote host name or address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Remote user
    pub user: String,

    /// Private key used for authentication
    #[serde(default = "default_identity_file")]
    pub identity_file: PathBuf,
}

fn default_ssh_port() -> u16 {
    22
}

/// `~/.ssh/id_ed25519`
pub fn default_identity_file() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".ssh").join("id_ed25519"))
        .unwrap_or_else(|| PathBuf::from(".ssh/id_ed25519"))
}

impl ConnectionProfile {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_ssh_port(),
            user: user.into(),
            identity_file: default_identity_file(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = path.into();
        self
    }

    /// Checked before any network operation or process spawn.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(DgxError::InvalidProfile("host is empty".to_string()));
        }
        if self.user.trim().is_empty() {
            return Err(DgxError::InvalidProfile("user is empty".to_string()));
        }
        if self.port == 0 {
            return Err(DgxError::InvalidProfile("port must be 1-65535".to_string()));
        }
        Ok(())
    }

    /// `host:port`, used to dial and in error messages
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `user@host`, the destination argument for native tools
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    pub fn display_name(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }
}
