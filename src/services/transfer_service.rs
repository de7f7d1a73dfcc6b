use crate::models::ConnectionProfile;
use crate::services::process_runner::{Invocation, ProcessRunner, StdioMode};
use crate::utils::error::{DgxError, Result};

/// Path prefix standing for `user@host:` in transfer arguments
pub const REMOTE_ALIAS: &str = "dgx:";

/// File transfer through the native `rsync` and `scp` tools
pub struct TransferService<'a> {
    profile: &'a ConnectionProfile,
    runner: &'a dyn ProcessRunner,
}

impl<'a> TransferService<'a> {
    pub fn new(profile: &'a ConnectionProfile, runner: &'a dyn ProcessRunner) -> Self {
        Self { profile, runner }
    }

    /// Replace a leading `dgx:` with `user@host:`
    pub fn expand_remote_path(&self, path: &str) -> String {
        match path.strip_prefix(REMOTE_ALIAS) {
            Some(rest) => format!("{}:{}", self.profile.destination(), rest),
            None => path.to_string(),
        }
    }

    pub fn rsync_invocation(&self, source: &str, dest: &str, delete: bool) -> Invocation {
        let ssh = format!(
            "ssh -i {} -p {}",
            self.profile.identity_file.display(),
            self.profile.port
        );
        let mut invocation = Invocation::new("rsync")
            .args(["-avz", "--progress", "-e"])
            .arg(ssh);
        if delete {
            invocation = invocation.arg("--delete");
        }
        invocation
            .arg(self.expand_remote_path(source))
            .arg(self.expand_remote_path(dest))
            .stdio(StdioMode::Inherit)
    }

    pub fn scp_invocation(&self, source: &str, dest: &str) -> Invocation {
        Invocation::new("scp")
            .arg("-i")
            .arg(self.profile.identity_file.display().to_string())
            .args(["-P".to_string(), self.profile.port.to_string()])
            .arg("-r")
            .arg(self.expand_remote_path(source))
            .arg(self.expand_remote_path(dest))
            .stdio(StdioMode::Inherit)
    }

    pub fn sync(&self, source: &str, dest: &str, delete: bool) -> Result<()> {
        self.run("rsync", &self.rsync_invocation(source, dest, delete))
    }

    pub fn copy(&self, source: &str, dest: &str) -> Result<()> {
        self.run("scp", &self.scp_invocation(source, dest))
    }

    fn run(&self, tool: &str, invocation: &Invocation) -> Result<()> {
        self.profile.validate()?;
        tracing::info!("{}", invocation.command_line());

        let output = self.runner.run(invocation)?;
        if output.success() {
            Ok(())
        } else {
            Err(DgxError::Transfer {
                tool: tool.to_string(),
                status: output.status,
            })
        }
    }
}
