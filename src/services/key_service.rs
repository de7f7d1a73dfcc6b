use crate::models::ConnectionProfile;
use crate::services::process_runner::{Invocation, ProcessRunner, StdioMode};
use crate::utils::error::{DgxError, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Helpers for installing the profile's public key on the remote host
pub struct KeyService;

impl KeyService {
    /// `<identity_file>.pub`
    pub fn public_key_path(profile: &ConnectionProfile) -> PathBuf {
        let mut path = profile.identity_file.clone().into_os_string();
        path.push(".pub");
        PathBuf::from(path)
    }

    pub fn read_public_key(profile: &ConnectionProfile) -> Result<String> {
        let path = Self::public_key_path(profile);
        fs::read_to_string(&path)
            .map(|key| key.trim().to_string())
            .map_err(|source| DgxError::KeyRead { path, source })
    }

    /// Private keys readable by group or others are refused by OpenSSH
    pub fn has_loose_permissions(key_path: &Path) -> Result<bool> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let metadata = fs::metadata(key_path).map_err(|source| DgxError::KeyRead {
                path: key_path.to_path_buf(),
                source,
            })?;
            Ok(metadata.permissions().mode() & 0o077 != 0)
        }
        #[cfg(not(unix))]
        {
            let _ = key_path;
            Ok(false)
        }
    }

    /// `ssh-copy-id -i <pub> -p <port> user@host`, interactive for the password
    pub fn copy_id_invocation(profile: &ConnectionProfile) -> Invocation {
        Invocation::new("ssh-copy-id")
            .arg("-i")
            .arg(Self::public_key_path(profile).display().to_string())
            .args(["-p".to_string(), profile.port.to_string()])
            .arg(profile.destination())
            .stdio(StdioMode::Inherit)
    }

    pub fn copy_id(profile: &ConnectionProfile, runner: &dyn ProcessRunner) -> Result<()> {
        profile.validate()?;
        let output = runner.run(&Self::copy_id_invocation(profile))?;
        if output.success() {
            tracing::info!("Installed public key on {}", profile.display_name());
            Ok(())
        } else {
            Err(DgxError::Transfer {
                tool: "ssh-copy-id".to_string(),
                status: output.status,
            })
        }
    }
}
