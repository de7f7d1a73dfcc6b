//! Host trust gate: verification against `known_hosts` and trust-on-first-use.

use crate::services::process_runner::{Invocation, StdioMode};
use crate::utils::error::{DgxError, Result};
use russh::keys::PublicKey;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Result of checking a server key against the trust store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyVerdict {
    /// Key matches an entry for this host
    Trusted,
    /// No entry for this host (first contact)
    Unknown { fingerprint: String },
    /// An entry exists but holds a different key
    Changed { line: usize, fingerprint: String },
    /// The store could not be consulted
    Unreadable { reason: String },
    /// Verification disabled because no store was available
    Insecure { fingerprint: String },
}

/// Line-oriented host key file, appended to only after explicit consent
#[derive(Debug, Clone)]
pub struct TrustStore {
    path: PathBuf,
}

impl TrustStore {
    /// `~/.ssh/known_hosts`
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".ssh").join("known_hosts"))
    }

    /// Open an existing, readable store. A missing file is an error here;
    /// the session client degrades to insecure mode on it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        fs::File::open(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check `key` for `host:port`. Hashed entries (`ssh-keyscan -H`) are supported.
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerdict {
        let fingerprint = fingerprint(key);
        match russh::keys::check_known_hosts_path(host, port, key, &self.path) {
            Ok(true) => HostKeyVerdict::Trusted,
            Ok(false) => HostKeyVerdict::Unknown { fingerprint },
            Err(russh::keys::Error::KeyChanged { line }) => {
                HostKeyVerdict::Changed { line, fingerprint }
            }
            Err(e) => HostKeyVerdict::Unreadable {
                reason: e.to_string(),
            },
        }
    }

    /// Append raw `known_hosts` lines, creating the file with mode 0600 if needed
    pub fn append(&self, entries: &str) -> Result<()> {
        let mut options = OpenOptions::new();
        options.append(true).create(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&self.path)?;
        file.write_all(entries.as_bytes())?;
        if !entries.ends_with('\n') {
            file.write_all(b"\n")?;
        }

        tracing::info!("Added host key entries to {}", self.path.display());
        Ok(())
    }
}

/// SHA256 fingerprint in OpenSSH notation
pub fn fingerprint(key: &PublicKey) -> String {
    use russh::keys::ssh_key::HashAlg;
    key.fingerprint(HashAlg::Sha256).to_string()
}

/// `ssh-keyscan -H [-p port] host`, stdout captured
pub fn keyscan_invocation(host: &str, port: u16) -> Invocation {
    let mut invocation = Invocation::new("ssh-keyscan").arg("-H");
    if port != 22 {
        invocation = invocation.args(["-p".to_string(), port.to_string()]);
    }
    invocation.arg(host).stdio(StdioMode::Capture)
}

/// Asks the operator whether to trust an unknown host key
pub trait HostKeyConfirmer: Send + Sync {
    fn confirm(&self, prompt: &str) -> bool;
}

/// Terminal prompt; defaults to yes, a failed prompt counts as no
#[derive(Debug, Default, Clone, Copy)]
pub struct DialoguerConfirmer;

impl HostKeyConfirmer for DialoguerConfirmer {
    fn confirm(&self, prompt: &str) -> bool {
        dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(true)
            .interact()
            .unwrap_or(false)
    }
}

/// Same answer every time, for tests and non-interactive callers
#[derive(Debug, Clone, Copy)]
pub struct FixedAnswer(pub bool);

impl HostKeyConfirmer for FixedAnswer {
    fn confirm(&self, prompt: &str) -> bool {
        tracing::debug!("Answering {:?} to: {}", self.0, prompt);
        self.0
    }
}

impl HostKeyVerdict {
    /// Error for a connection refused because of this verdict, if it refuses one
    pub fn rejection(&self, addr: &str, store: &Path) -> Option<DgxError> {
        match self {
            Self::Changed { line, fingerprint } => Some(DgxError::UntrustedHost {
                addr: addr.to_string(),
                reason: format!(
                    "server offered {}, {} line {} holds a different key",
                    fingerprint,
                    store.display(),
                    line
                ),
            }),
            Self::Unreadable { reason } => Some(DgxError::UntrustedHost {
                addr: addr.to_string(),
                reason: format!("cannot check {}: {}", store.display(), reason),
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const KEY_A: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAICuEz9HxkuL1bXDacl+5mRFFZI2idkfAr2ZtHx5lvKeQ";
    const KEY_B: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIBjUpQjjrn8t6zuiUTC27zeaOD7aSas8L+RF0r3lBivJ";

    fn public_key(line: &str) -> PublicKey {
        PublicKey::from_openssh(line).unwrap()
    }

    fn store_with(contents: &str) -> (TrustStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("known_hosts");
        fs::write(&path, contents).unwrap();
        (TrustStore::open(&path).unwrap(), dir)
    }

    #[test]
    fn test_open_missing_store_fails() {
        let dir = TempDir::new().unwrap();
        assert!(TrustStore::open(dir.path().join("known_hosts")).is_err());
    }

    #[test]
    fn test_verify_trusted_unknown_changed() {
        let (store, _dir) = store_with(&format!("dgx.local {}\n", KEY_A));

        assert_eq!(
            store.verify("dgx.local", 22, &public_key(KEY_A)),
            HostKeyVerdict::Trusted
        );
        assert!(matches!(
            store.verify("other.local", 22, &public_key(KEY_A)),
            HostKeyVerdict::Unknown { .. }
        ));
        assert!(matches!(
            store.verify("dgx.local", 22, &public_key(KEY_B)),
            HostKeyVerdict::Changed { .. }
        ));
    }

    #[test]
    fn test_verify_non_default_port() {
        let (store, _dir) = store_with(&format!("[dgx.local]:2222 {}\n", KEY_A));
        assert_eq!(
            store.verify("dgx.local", 2222, &public_key(KEY_A)),
            HostKeyVerdict::Trusted
        );
    }

    #[test]
    fn test_append_then_verify() {
        let (store, _dir) = store_with("");
        store.append(&format!("dgx.local {}", KEY_A)).unwrap();
        store.append(&format!("gpu.local {}\n", KEY_B)).unwrap();

        let contents = fs::read_to_string(store.path()).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert_eq!(
            store.verify("gpu.local", 22, &public_key(KEY_B)),
            HostKeyVerdict::Trusted
        );
    }

    #[test]
    fn test_fingerprint_format() {
        assert_eq!(
            fingerprint(&public_key(KEY_A)),
            "SHA256:TuFJONTm9Dcecykre3hd162mMIYyLHWbJW/zhUMBLjk"
        );
    }

    #[test]
    fn test_keyscan_invocation() {
        assert_eq!(
            keyscan_invocation("dgx.local", 22).args,
            vec!["-H", "dgx.local"]
        );
        let scan = keyscan_invocation("dgx.local", 2222);
        assert_eq!(scan.args, vec!["-H", "-p", "2222", "dgx.local"]);
        assert_eq!(scan.stdio, StdioMode::Capture);
    }

    #[test]
    fn test_rejection() {
        let path = Path::new("/home/me/.ssh/known_hosts");
        let changed = HostKeyVerdict::Changed {
            line: 3,
            fingerprint: "SHA256:x".to_string(),
        };
        let err = changed.rejection("dgx:22", path).unwrap();
        assert!(matches!(err, DgxError::UntrustedHost { .. }));
        assert!(err.to_string().contains("line 3"));

        assert!(HostKeyVerdict::Trusted.rejection("dgx:22", path).is_none());
    }
}
