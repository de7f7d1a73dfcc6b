use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A local port forwarded to `remote_host:remote_port` as seen from the SSH server.
///
/// Descriptors are snapshots. `pid` comes from the process table at the time the
/// descriptor was built and is never stored anywhere else. A descriptor returned by
/// `create` and one returned by a later `list` for the same local port may name
/// different processes if the OS reused the port in between.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelDescriptor {
    /// Local port the forwarding process listens on
    pub local_port: u16,
    /// Target host, resolved on the remote side
    #[serde(default = "default_remote_host")]
    pub remote_host: String,
    /// Target port on the remote side
    pub remote_port: u16,
    /// Forwarding process, when the OS confirmed it
    #[serde(default)]
    pub pid: Option<u32>,
    /// When this program spawned the tunnel; unknown for discovered tunnels
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

pub fn default_remote_host() -> String {
    "localhost".to_string()
}

impl TunnelDescriptor {
    pub fn new(local_port: u16, remote_port: u16) -> Self {
        Self {
            local_port,
            remote_host: default_remote_host(),
            remote_port,
            pid: None,
            created_at: None,
        }
    }

    pub fn with_remote_host(mut self, remote_host: impl Into<String>) -> Self {
        self.remote_host = remote_host.into();
        self
    }

    /// `local:host:remote`, the argument to ssh's `-L`
    pub fn forward_spec(&self) -> String {
        format!("{}:{}:{}", self.local_port, self.remote_host, self.remote_port)
    }

    /// Parse a `local:host:remote` spec. Anything else is rejected.
    pub fn parse_forward_spec(spec: &str) -> Option<Self> {
        let parts: Vec<&str> = spec.split(':').collect();
        if parts.len() != 3 || parts[1].is_empty() {
            return None;
        }
        let local_port = parts[0].parse::<u16>().ok().filter(|p| *p > 0)?;
        let remote_port = parts[2].parse::<u16>().ok().filter(|p| *p > 0)?;
        Some(Self::new(local_port, remote_port).with_remote_host(parts[1]))
    }

    pub fn description(&self) -> String {
        format!(
            "localhost:{} → {}:{}",
            self.local_port, self.remote_host, self.remote_port
        )
    }
}

/// A named tunnel kept in the config file, e.g. `jupyter` = 8888 → 8888
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelPreset {
    pub name: String,
    pub local_port: u16,
    pub remote_port: u16,
    #[serde(default = "default_remote_host")]
    pub remote_host: String,
    #[serde(default)]
    pub description: String,
}

impl TunnelPreset {
    pub fn new(name: impl Into<String>, local_port: u16, remote_port: u16) -> Self {
        Self {
            name: name.into(),
            local_port,
            remote_port,
            remote_host: default_remote_host(),
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn descriptor(&self) -> TunnelDescriptor {
        TunnelDescriptor::new(self.local_port, self.remote_port)
            .with_remote_host(self.remote_host.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_defaults() {
        let tunnel = TunnelDescriptor::new(8000, 8001);
        assert_eq!(tunnel.remote_host, "localhost");
        assert!(tunnel.pid.is_none());
        assert!(tunnel.created_at.is_none());
        assert_eq!(tunnel.forward_spec(), "8000:localhost:8001");
        assert_eq!(tunnel.description(), "localhost:8000 → localhost:8001");
    }

    #[test]
    fn test_parse_forward_spec() {
        let tunnel = TunnelDescriptor::parse_forward_spec("8888:127.0.0.1:8889").unwrap();
        assert_eq!(tunnel.local_port, 8888);
        assert_eq!(tunnel.remote_host, "127.0.0.1");
        assert_eq!(tunnel.remote_port, 8889);
    }

    #[test]
    fn test_parse_forward_spec_rejects_other_shapes() {
        assert!(TunnelDescriptor::parse_forward_spec("8888:8889").is_none());
        assert!(TunnelDescriptor::parse_forward_spec("0.0.0.0:8888:localhost:8889").is_none());
        assert!(TunnelDescriptor::parse_forward_spec("abc:localhost:80").is_none());
        assert!(TunnelDescriptor::parse_forward_spec("80::80").is_none());
        assert!(TunnelDescriptor::parse_forward_spec("0:localhost:80").is_none());
    }

    #[test]
    fn test_preset_descriptor() {
        let preset = TunnelPreset::new("jupyter", 8888, 8888).with_description("notebooks");
        let tunnel = preset.descriptor();
        assert_eq!(tunnel.forward_spec(), "8888:localhost:8888");
    }
}
