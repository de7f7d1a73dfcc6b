use crate::models::ProcessEntry;
use crate::utils::error::{DgxError, Result};
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::process::{Command, Stdio};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

/// Read-through view of OS process and socket state.
///
/// This is the only OS-specific seam of the tunnel manager. Everything it reports
/// is a snapshot taken at call time.
pub trait ProcessInspector: Send + Sync {
    /// Every process with its full argument vector
    fn list_processes(&self) -> Result<Vec<ProcessEntry>>;

    /// PID of the process listening on local TCP `port`, if any
    fn port_owner(&self, port: u16) -> Result<Option<u32>>;

    /// Whether anything is bound to local TCP `port`, owner known or not
    fn port_bound(&self, port: u16) -> Result<bool> {
        Ok(self.port_owner(port)?.is_some())
    }

    /// Send SIGTERM to `pid`
    fn terminate(&self, pid: u32) -> Result<()>;
}

/// Process table via `sysinfo`, socket ownership via `lsof`, signals via `nix`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessInspector;

impl SystemProcessInspector {
    pub fn new() -> Self {
        Self
    }

    fn lsof_listener(port: u16) -> Result<Option<u32>> {
        let output = Command::new("lsof")
            .args(["-nP", "-t", &format!("-iTCP:{}", port), "-sTCP:LISTEN"])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .map_err(|e| DgxError::PortProbe {
                port,
                reason: format!("lsof: {}", e),
            })?;

        // lsof exits 1 with no output when nothing matches
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_lsof_pids(&stdout).into_iter().next())
    }

    fn bind_available(port: u16) -> bool {
        TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).is_ok()
    }
}

impl ProcessInspector for SystemProcessInspector {
    fn list_processes(&self) -> Result<Vec<ProcessEntry>> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(DgxError::ProcessList(
                "process inspection is not supported on this platform".to_string(),
            ));
        }

        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new().with_cmd(UpdateKind::Always),
        );

        let mut entries: Vec<ProcessEntry> = system
            .processes()
            .iter()
            .filter(|(_, process)| process.thread_kind().is_none())
            .map(|(pid, process)| {
                ProcessEntry::new(
                    pid.as_u32(),
                    process
                        .cmd()
                        .iter()
                        .map(|arg| arg.to_string_lossy().into_owned()),
                )
            })
            .filter(|entry| !entry.argv.is_empty())
            .collect();

        // Our own process is always visible, so an empty table means no access
        if entries.is_empty() {
            return Err(DgxError::ProcessList(
                "no process command lines are readable".to_string(),
            ));
        }

        entries.sort_by_key(|entry| entry.pid);
        tracing::debug!("Process table snapshot: {} processes", entries.len());
        Ok(entries)
    }

    fn port_owner(&self, port: u16) -> Result<Option<u32>> {
        Self::lsof_listener(port)
    }

    fn port_bound(&self, port: u16) -> Result<bool> {
        match Self::lsof_listener(port) {
            Ok(Some(_)) => Ok(true),
            // lsof only sees our own sockets without root
            Ok(None) => Ok(!Self::bind_available(port)),
            Err(e) => {
                tracing::debug!("{}; falling back to a bind probe", e);
                Ok(!Self::bind_available(port))
            }
        }
    }

    #[cfg(unix)]
    fn terminate(&self, pid: u32) -> Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        // 0 and negative values address process groups, never a single tunnel
        let raw = i32::try_from(pid)
            .ok()
            .filter(|raw| *raw > 0)
            .ok_or(DgxError::ProcessNotFound(pid))?;

        match kill(Pid::from_raw(raw), Signal::SIGTERM) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(DgxError::ProcessNotFound(pid)),
            Err(e) => Err(DgxError::Signal {
                pid,
                reason: e.desc().to_string(),
            }),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self, pid: u32) -> Result<()> {
        let sys_pid = sysinfo::Pid::from_u32(pid);
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);

        let process = system
            .process(sys_pid)
            .ok_or(DgxError::ProcessNotFound(pid))?;
        if process.kill() {
            Ok(())
        } else {
            Err(DgxError::Signal {
                pid,
                reason: "termination request was rejected".to_string(),
            })
        }
    }
}

/// PIDs printed by `lsof -t`, one per line
pub fn parse_lsof_pids(output: &str) -> Vec<u32> {
    output
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lsof_pids() {
        assert_eq!(parse_lsof_pids("1234\n5678\n"), vec![1234, 5678]);
        assert_eq!(parse_lsof_pids(""), Vec::<u32>::new());
        assert_eq!(parse_lsof_pids("  42 \ngarbage\n"), vec![42]);
    }

    #[test]
    fn test_list_processes_includes_self() {
        let entries = SystemProcessInspector::new().list_processes().unwrap();
        let me = std::process::id();
        assert!(entries.iter().any(|entry| entry.pid == me));
    }

    #[test]
    fn test_port_bound_sees_own_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(SystemProcessInspector::new().port_bound(port).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_terminate_rejects_process_groups() {
        let inspector = SystemProcessInspector::new();
        assert!(matches!(
            inspector.terminate(0),
            Err(DgxError::ProcessNotFound(0))
        ));
        assert!(matches!(
            inspector.terminate(u32::MAX),
            Err(DgxError::ProcessNotFound(_))
        ));
    }
}
