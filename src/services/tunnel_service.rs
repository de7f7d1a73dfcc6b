use crate::models::{ConnectionProfile, ProcessEntry, TunnelDescriptor};
use crate::services::process_inspector::{ProcessInspector, SystemProcessInspector};
use crate::services::process_runner::{Invocation, ProcessRunner, StdioMode, SystemProcessRunner};
use crate::services::ssh_service::SshSession;
use crate::utils::error::{DgxError, Result};
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Ports probed by `find_available_port`, starting port included
pub const PORT_SEARCH_WINDOW: u16 = 100;

/// Outcome of `kill_all`. Per-tunnel failures never abort the batch.
#[derive(Debug, Default)]
pub struct KillAllReport {
    pub terminated: Vec<u32>,
    pub failed: Vec<(u32, DgxError)>,
}

impl KillAllReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Creates, lists and terminates background `ssh -L` processes.
///
/// There is no registry: the process table is the only record of which tunnels
/// exist. Every query goes through the `ProcessInspector`.
pub struct TunnelManager {
    profile: ConnectionProfile,
    inspector: Arc<dyn ProcessInspector>,
    runner: Arc<dyn ProcessRunner>,
}

impl TunnelManager {
    pub fn new(profile: ConnectionProfile) -> Self {
        Self::with_backends(
            profile,
            Arc::new(SystemProcessInspector::new()),
            Arc::new(SystemProcessRunner),
        )
    }

    pub fn with_backends(
        profile: ConnectionProfile,
        inspector: Arc<dyn ProcessInspector>,
        runner: Arc<dyn ProcessRunner>,
    ) -> Self {
        Self {
            profile,
            inspector,
            runner,
        }
    }

    pub fn profile(&self) -> &ConnectionProfile {
        &self.profile
    }

    /// `false` when nothing is bound. Errors only if the probe itself fails.
    pub fn is_port_in_use(&self, port: u16) -> Result<bool> {
        self.inspector.port_bound(port)
    }

    /// The `ssh` invocation for a pure forward that backgrounds itself
    pub fn forward_invocation(&self, tunnel: &TunnelDescriptor) -> Invocation {
        Invocation::new("ssh")
            .args(["-N", "-f"])
            .args(["-o", "ExitOnForwardFailure=yes"])
            .arg("-i")
            .arg(self.profile.identity_file.display().to_string())
            .args(["-p".to_string(), self.profile.port.to_string()])
            .args(["-L".to_string(), tunnel.forward_spec()])
            .arg(self.profile.destination())
            .stdio(StdioMode::Inherit)
    }

    /// Spawn a background forward for `tunnel`.
    ///
    /// Success means `ssh` forked into the background. The returned descriptor
    /// carries the PID only if the port owner could be found right after.
    pub fn create(&self, tunnel: &TunnelDescriptor) -> Result<TunnelDescriptor> {
        self.profile.validate()?;

        if self.is_port_in_use(tunnel.local_port)? {
            return Err(DgxError::TunnelCreate {
                local_port: tunnel.local_port,
                reason: "port already in use".to_string(),
            });
        }

        let invocation = self.forward_invocation(tunnel);
        tracing::info!(
            "Creating tunnel {} via {}",
            tunnel.description(),
            self.profile.display_name()
        );

        let output = self
            .runner
            .run(&invocation)
            .map_err(|e| DgxError::TunnelCreate {
                local_port: tunnel.local_port,
                reason: format!("failed to start ssh: {}", e),
            })?;

        if !output.success() {
            return Err(DgxError::TunnelCreate {
                local_port: tunnel.local_port,
                reason: match output.status {
                    Some(code) => format!("ssh exited with status {}", code),
                    None => "ssh was killed by a signal".to_string(),
                },
            });
        }

        let mut created = tunnel.clone();
        created.created_at = Some(Utc::now());
        created.pid = match self.inspector.port_owner(tunnel.local_port) {
            Ok(Some(pid)) => Some(pid),
            Ok(None) => {
                tracing::warn!(
                    "Could not find tunnel PID: nothing listening on port {} yet",
                    tunnel.local_port
                );
                None
            }
            Err(e) => {
                tracing::warn!("Could not find tunnel PID: {}", e);
                None
            }
        };

        tracing::info!(
            "Tunnel created: {} (PID: {})",
            created.description(),
            created
                .pid
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        );
        Ok(created)
    }

    /// Live tunnels to the configured host, re-derived from the process table.
    pub fn list(&self) -> Result<Vec<TunnelDescriptor>> {
        let processes = self.inspector.list_processes()?;
        let tunnels: Vec<TunnelDescriptor> = processes
            .iter()
            .filter_map(|entry| parse_tunnel(entry, &self.profile.host))
            .collect();

        tracing::debug!(
            "Found {} tunnel(s) to {} among {} processes",
            tunnels.len(),
            self.profile.host,
            processes.len()
        );
        Ok(tunnels)
    }

    /// Send SIGTERM to `pid`. The PID is not checked against `list`.
    pub fn kill(&self, pid: u32) -> Result<()> {
        self.inspector.terminate(pid)?;
        tracing::info!("Tunnel (PID {}) terminated", pid);
        Ok(())
    }

    /// Terminate every tunnel `list` reports. Fails only if listing fails.
    pub fn kill_all(&self) -> Result<KillAllReport> {
        let mut report = KillAllReport::default();

        for tunnel in self.list()? {
            let Some(pid) = tunnel.pid else {
                continue;
            };
            match self.kill(pid) {
                Ok(()) => report.terminated.push(pid),
                Err(e) => {
                    tracing::warn!("Failed to kill tunnel {}: {}", pid, e);
                    report.failed.push((pid, e));
                }
            }
        }

        Ok(report)
    }

    /// First free port in `start..start + PORT_SEARCH_WINDOW`, or `None`.
    /// A port whose probe fails counts as occupied.
    pub fn find_available_port(&self, start: u16) -> Option<u16> {
        let start = start.max(1);
        let end = start.saturating_add(PORT_SEARCH_WINDOW - 1);

        for port in start..=end {
            match self.is_port_in_use(port) {
                Ok(false) => return Some(port),
                Ok(true) => {}
                Err(e) => tracing::warn!("Skipping port {}: {}", port, e),
            }
        }
        None
    }
}

/// Match one process against the configured host.
///
/// The program must look like ssh, its argv must carry `-L` with a
/// `local:host:remote` spec, and `host` must appear somewhere in the command
/// line. The host check is a plain substring match, so an unrelated process that
/// mentions the same string in another argument also matches.
pub fn parse_tunnel(entry: &ProcessEntry, host: &str) -> Option<TunnelDescriptor> {
    if host.is_empty() || !entry.program_name().contains("ssh") {
        return None;
    }
    if !entry.command_line().contains(host) {
        return None;
    }

    let mut tunnel = local_forward_specs(&entry.argv)
        .find_map(TunnelDescriptor::parse_forward_spec)?;
    tunnel.pid = Some(entry.pid);
    Some(tunnel)
}

/// Arguments given to `-L`, in the forms `-L spec`, `-Lspec` and clustered
/// flags ending in `L` such as `-fNL spec`.
fn local_forward_specs(argv: &[String]) -> impl Iterator<Item = &str> {
    argv.iter().enumerate().skip(1).filter_map(move |(i, arg)| {
        let flags = arg.strip_prefix('-').filter(|rest| !rest.starts_with('-'))?;
        if let Some(attached) = flags.strip_prefix('L').filter(|spec| !spec.is_empty()) {
            return Some(attached);
        }
        if flags.ends_with('L') && flags.chars().all(|c| c.is_ascii_alphabetic()) {
            return argv.get(i + 1).map(String::as_str);
        }
        None
    })
}

/// Handle for an in-process forward listener
pub struct ForwardHandle {
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    task: Option<JoinHandle<()>>,
}

impl ForwardHandle {
    /// Stop accepting. Connections already forwarded run until either side closes.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::info!("Stopped forward on local port {}", self.local_port);
        }
    }
}

impl Drop for ForwardHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Forward `127.0.0.1:local_port` to `remote_host:remote_port` over an existing
/// transport, without a native ssh process.
pub async fn start_local_forward(
    session: Arc<Mutex<SshSession>>,
    local_port: u16,
    remote_host: &str,
    remote_port: u16,
) -> Result<ForwardHandle> {
    let bind_addr = format!("127.0.0.1:{}", local_port);
    let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
        let reason = if e.kind() == std::io::ErrorKind::AddrInUse {
            "port already in use".to_string()
        } else {
            format!("failed to bind {}: {}", bind_addr, e)
        };
        DgxError::TunnelCreate { local_port, reason }
    })?;
    // Port 0 asks the OS for a free port
    let local_port = listener.local_addr().map(|a| a.port()).unwrap_or(local_port);

    tracing::info!(
        "Forwarding 127.0.0.1:{} → {}:{}",
        local_port,
        remote_host,
        remote_port
    );

    let target_host = remote_host.to_string();
    let task = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    tracing::debug!("Accepted connection from {}", peer_addr);
                    let session = session.clone();
                    let target_host = target_host.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            forward_connection(session, stream, peer_addr, &target_host, remote_port)
                                .await
                        {
                            tracing::error!("Forward error for {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Accept error on port {}: {}", local_port, e);
                    break;
                }
            }
        }
    });

    Ok(ForwardHandle {
        local_port,
        remote_host: remote_host.to_string(),
        remote_port,
        task: Some(task),
    })
}

async fn forward_connection(
    session: Arc<Mutex<SshSession>>,
    stream: TcpStream,
    peer_addr: SocketAddr,
    remote_host: &str,
    remote_port: u16,
) -> Result<()> {
    let session_guard = session.lock().await;
    let channel = session_guard
        .channel_open_direct_tcpip(
            remote_host,
            remote_port as u32,
            peer_addr.ip().to_string(),
            peer_addr.port() as u32,
        )
        .await
        .map_err(|e| DgxError::Session {
            addr: format!("{}:{}", remote_host, remote_port),
            reason: e.to_string(),
        })?;
    drop(session_guard);

    let (mut remote_read, mut remote_write) = tokio::io::split(channel.into_stream());
    let (mut local_read, mut local_write) = stream.into_split();

    let mut upstream =
        tokio::spawn(async move { tokio::io::copy(&mut local_read, &mut remote_write).await });
    let mut downstream =
        tokio::spawn(async move { tokio::io::copy(&mut remote_read, &mut local_write).await });

    // Whichever direction ends first tears the connection down
    tokio::select! {
        result = &mut upstream => {
            downstream.abort();
            tracing::debug!("{} closed (local side): {:?}", peer_addr, result);
        }
        result = &mut downstream => {
            upstream.abort();
            tracing::debug!("{} closed (remote side): {:?}", peer_addr, result);
        }
    }

    Ok(())
}
