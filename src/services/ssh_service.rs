use crate::models::ConnectionProfile;
use crate::services::known_hosts::{
    self, DialoguerConfirmer, HostKeyConfirmer, HostKeyVerdict, TrustStore,
};
use crate::services::process_runner::{Invocation, ProcessRunner, StdioMode, SystemProcessRunner};
use crate::services::tunnel_service::{self, ForwardHandle};
use crate::utils::error::{DgxError, Result};
use async_trait::async_trait;
use russh::client::{self, AuthResult, Handle, Msg};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, ChannelMsg, Disconnect};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// SSH client session handle
pub type SshSession = Handle<SshClientHandler>;

/// Upper bound for TCP connect, key exchange and authentication
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// One authenticated transport to the configured host.
///
/// The transport is opened lazily by `execute` or `forward_port` and kept until
/// `close`. A client runs one command at a time; `execute` takes `&mut self`.
pub struct SessionClient {
    profile: ConnectionProfile,
    known_hosts_path: Option<PathBuf>,
    confirmer: Arc<dyn HostKeyConfirmer>,
    runner: Arc<dyn ProcessRunner>,
    dial_timeout: Duration,
    session: Option<Arc<Mutex<SshSession>>>,
}

/// Runs one shell command on the host and returns its output.
///
/// `SessionClient` is the production implementation; services that only
/// need command output take this trait so they can be driven by a script.
#[async_trait]
pub trait RemoteExecutor: Send {
    async fn execute(&mut self, command: &str) -> Result<String>;
}

/// Why a single dial attempt failed
enum DialFailure {
    /// Host key absent from the store; eligible for trust-on-first-use
    UnknownHost { fingerprint: String },
    Fatal(DgxError),
}

impl SessionClient {
    pub fn new(profile: ConnectionProfile) -> Self {
        Self {
            profile,
            known_hosts_path: TrustStore::default_path(),
            confirmer: Arc::new(DialoguerConfirmer),
            runner: Arc::new(SystemProcessRunner),
            dial_timeout: DIAL_TIMEOUT,
            session: None,
        }
    }

    pub fn with_known_hosts(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts_path = Some(path.into());
        self
    }

    pub fn with_confirmer(mut self, confirmer: Arc<dyn HostKeyConfirmer>) -> Self {
        self.confirmer = confirmer;
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn profile(&self) -> &ConnectionProfile {
        &self.profile
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Open the transport and keep it for later commands
    pub async fn connect(&mut self) -> Result<()> {
        let session = self.open_transport().await?;
        self.session = Some(Arc::new(Mutex::new(session)));
        Ok(())
    }

    /// Disconnect if connected. Calling it again, or before `connect`, does nothing.
    pub async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            let handle = session.lock().await;
            if let Err(e) = handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
            {
                tracing::debug!("Disconnect from {} failed: {}", self.profile.address(), e);
            }
            tracing::info!("Disconnected from {}", self.profile.address());
        }
    }

    /// Run `command` remotely and return stdout and stderr interleaved as received.
    ///
    /// A non-zero exit status is an error carrying the captured output. If a
    /// transport kept from an earlier call cannot open a channel, the client
    /// reconnects once. A transport opened by this call is not retried.
    pub async fn execute(&mut self, command: &str) -> Result<String> {
        let had_session = self.session.is_some();
        let session = self.ensure_session().await?;

        let channel = match Self::open_channel(&session).await {
            Ok(channel) => channel,
            Err(e) if !had_session => {
                return Err(DgxError::Session {
                    addr: self.profile.address(),
                    reason: e.to_string(),
                });
            }
            Err(e) => {
                tracing::warn!(
                    "Session to {} is stale ({}), reconnecting once",
                    self.profile.address(),
                    e
                );
                self.close().await;
                self.connect().await?;
                let session = self.ensure_session().await?;
                Self::open_channel(&session)
                    .await
                    .map_err(|e| DgxError::Session {
                        addr: self.profile.address(),
                        reason: e.to_string(),
                    })?
            }
        };

        self.run_on_channel(channel, command).await
    }

    /// Hand the terminal to the native `ssh` client and wait for it to exit.
    ///
    /// Returns the exit code, or `None` if `ssh` was killed by a signal.
    pub fn interactive_shell(&self) -> Result<Option<i32>> {
        self.profile.validate()?;
        let output = self.runner.run(&self.shell_invocation())?;
        Ok(output.status)
    }

    /// `ssh -i <key> -p <port> user@host` with inherited stdio
    pub fn shell_invocation(&self) -> Invocation {
        Invocation::new("ssh")
            .arg("-i")
            .arg(self.profile.identity_file.display().to_string())
            .args(["-p".to_string(), self.profile.port.to_string()])
            .arg(self.profile.destination())
            .stdio(StdioMode::Inherit)
    }

    /// Time a full connect and disconnect on a fresh transport.
    /// The client's own session, if any, is left alone.
    pub async fn check_connection(&self) -> Result<Duration> {
        let start = Instant::now();
        let session = self.open_transport().await?;
        let latency = start.elapsed();

        if let Err(e) = session
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            tracing::debug!("Disconnect after connection check failed: {}", e);
        }
        Ok(latency)
    }

    /// Forward `127.0.0.1:local_port` to `remote_host:remote_port` over this
    /// client's transport. The forward stops when the handle is dropped.
    pub async fn forward_port(
        &mut self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<ForwardHandle> {
        let session = self.ensure_session().await?;
        tunnel_service::start_local_forward(session, local_port, remote_host, remote_port).await
    }

    async fn ensure_session(&mut self) -> Result<Arc<Mutex<SshSession>>> {
        if self.session.is_none() {
            self.connect().await?;
        }
        self.session.clone().ok_or_else(|| DgxError::Session {
            addr: self.profile.address(),
            reason: "no session after connect".to_string(),
        })
    }

    async fn open_channel(
        session: &Arc<Mutex<SshSession>>,
    ) -> std::result::Result<Channel<Msg>, russh::Error> {
        session.lock().await.channel_open_session().await
    }

    async fn run_on_channel(&self, mut channel: Channel<Msg>, command: &str) -> Result<String> {
        tracing::debug!("Executing on {}: {}", self.profile.address(), command);

        channel
            .exec(true, command)
            .await
            .map_err(|e| DgxError::Session {
                addr: self.profile.address(),
                reason: format!("exec request failed: {}", e),
            })?;

        let mut output = Vec::new();
        let mut exit_status = None;

        // Exit status may arrive before the last data; drain until the channel closes
        while let Some(message) = channel.wait().await {
            match message {
                ChannelMsg::Data { ref data } => output.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, .. } => output.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status: status } => exit_status = Some(status),
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        let output = String::from_utf8_lossy(&output).into_owned();
        match exit_status {
            Some(0) => Ok(output),
            status => Err(DgxError::RemoteCommand {
                command: command.to_string(),
                status,
                output,
            }),
        }
    }

    /// Load the key, then dial and authenticate, with trust-on-first-use
    /// between two attempts
    async fn open_transport(&self) -> Result<SshSession> {
        self.profile.validate()?;
        let key = Arc::new(load_private_key(&self.profile.identity_file).await?);
        let store = self.resolve_trust_store();

        match self.establish(store.as_ref(), &key).await {
            Ok(session) => Ok(session),
            Err(DialFailure::UnknownHost { fingerprint }) => {
                // Only reachable with a store; insecure mode accepts every key
                let store = store.ok_or_else(|| DgxError::UntrustedHost {
                    addr: self.profile.address(),
                    reason: "no known_hosts file".to_string(),
                })?;
                self.trust_on_first_use(&store, &fingerprint)?;
                self.establish(Some(&store), &key)
                    .await
                    .map_err(|failure| match failure {
                        DialFailure::Fatal(e) => e,
                        DialFailure::UnknownHost { .. } => DgxError::UntrustedHost {
                            addr: self.profile.address(),
                            reason: "host key still unknown after adding it".to_string(),
                        },
                    })
            }
            Err(DialFailure::Fatal(e)) => Err(e),
        }
    }

    /// One connect plus authentication, bounded as a whole by the dial timeout
    async fn establish(
        &self,
        store: Option<&TrustStore>,
        key: &Arc<PrivateKey>,
    ) -> std::result::Result<SshSession, DialFailure> {
        let attempt = async {
            let mut session = self.dial(store).await?;
            self.authenticate(&mut session, key.clone())
                .await
                .map_err(DialFailure::Fatal)?;
            Ok::<_, DialFailure>(session)
        };

        tokio::time::timeout(self.dial_timeout, attempt)
            .await
            .unwrap_or_else(|_| {
                Err(DialFailure::Fatal(DgxError::DialTimeout {
                    addr: self.profile.address(),
                    seconds: self.dial_timeout.as_secs().max(1),
                }))
            })
    }

    fn resolve_trust_store(&self) -> Option<TrustStore> {
        let opened = self
            .known_hosts_path
            .as_ref()
            .map(|path| (path, TrustStore::open(path)));

        match opened {
            Some((_, Ok(store))) => Some(store),
            Some((path, Err(e))) => {
                tracing::warn!(
                    "Cannot read {} ({}); using insecure host key verification",
                    path.display(),
                    e
                );
                None
            }
            None => {
                tracing::warn!("No known_hosts location; using insecure host key verification");
                None
            }
        }
    }

    async fn dial(&self, store: Option<&TrustStore>) -> std::result::Result<SshSession, DialFailure> {
        let addr = self.profile.address();
        let handler = match store {
            Some(store) => SshClientHandler::verifying(store.clone(), &self.profile.host, self.profile.port),
            None => SshClientHandler::insecure(),
        };
        let verdict = handler.verdict.clone();

        let config = client::Config {
            inactivity_timeout: Some(Duration::from_secs(300)),
            ..<client::Config as Default>::default()
        };

        tracing::info!("Connecting to {} as {}", addr, self.profile.user);
        let attempt = client::connect(
            Arc::new(config),
            (self.profile.host.as_str(), self.profile.port),
            handler,
        )
        .await;

        match attempt {
            Ok(session) => Ok(session),
            Err(e) => {
                let verdict = verdict.lock().ok().and_then(|mut v| v.take());
                match verdict {
                    Some(HostKeyVerdict::Unknown { fingerprint }) => {
                        Err(DialFailure::UnknownHost { fingerprint })
                    }
                    Some(other) => {
                        let store_path = store.map(|s| s.path().to_path_buf()).unwrap_or_default();
                        Err(DialFailure::Fatal(
                            other
                                .rejection(&addr, &store_path)
                                .unwrap_or(DgxError::ConnectionFailed {
                                    addr,
                                    reason: e.to_string(),
                                }),
                        ))
                    }
                    None => Err(DialFailure::Fatal(DgxError::ConnectionFailed {
                        addr,
                        reason: e.to_string(),
                    })),
                }
            }
        }
    }

    /// Ask, scan, append. Declining is terminal.
    fn trust_on_first_use(&self, store: &TrustStore, fingerprint: &str) -> Result<()> {
        let host = &self.profile.host;
        tracing::warn!(
            "Host key for {} not found in {}; this is normal for first-time connections",
            host,
            store.path().display()
        );

        let prompt = format!(
            "Add host key {} for {} to {}?",
            fingerprint,
            host,
            store.path().display()
        );
        if !self.confirmer.confirm(&prompt) {
            return Err(DgxError::ConnectionAborted { host: host.clone() });
        }

        let scan = self
            .runner
            .run(&known_hosts::keyscan_invocation(host, self.profile.port))
            .map_err(|e| DgxError::HostKeyScan {
                host: host.clone(),
                reason: e.to_string(),
            })?;
        let entries = scan.stdout_lossy();
        if !scan.success() || entries.trim().is_empty() {
            return Err(DgxError::HostKeyScan {
                host: host.clone(),
                reason: "ssh-keyscan returned no keys".to_string(),
            });
        }

        store.append(&entries)?;
        tracing::info!("Host key added. Retrying connection...");
        Ok(())
    }

    async fn authenticate(&self, session: &mut SshSession, key: Arc<PrivateKey>) -> Result<()> {
        let key_with_alg = PrivateKeyWithHashAlg::new(key, None);
        let auth_failed = |reason: String| DgxError::AuthenticationFailed {
            user: self.profile.user.clone(),
            addr: self.profile.address(),
            reason,
        };

        let auth_res = session
            .authenticate_publickey(&self.profile.user, key_with_alg)
            .await
            .map_err(|e| auth_failed(e.to_string()))?;

        if !matches!(auth_res, AuthResult::Success) {
            return Err(auth_failed("public key rejected".to_string()));
        }

        tracing::info!("Authenticated to {} with public key", self.profile.address());
        Ok(())
    }
}

#[async_trait]
impl RemoteExecutor for SessionClient {
    async fn execute(&mut self, command: &str) -> Result<String> {
        SessionClient::execute(self, command).await
    }
}

/// Read and parse an unencrypted OpenSSH private key
pub async fn load_private_key(path: &std::path::Path) -> Result<PrivateKey> {
    let key_data = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| DgxError::KeyRead {
            path: path.to_path_buf(),
            source,
        })?;

    let key = PrivateKey::from_openssh(key_data.trim()).map_err(|e| DgxError::KeyParse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    if key.is_encrypted() {
        return Err(DgxError::KeyParse {
            path: path.to_path_buf(),
            reason: "key is passphrase-protected".to_string(),
        });
    }
    Ok(key)
}

/// russh handler that consults the trust store and records its verdict
#[derive(Clone)]
pub struct SshClientHandler {
    trust: Option<(TrustStore, String, u16)>,
    verdict: Arc<std::sync::Mutex<Option<HostKeyVerdict>>>,
}

impl SshClientHandler {
    fn verifying(store: TrustStore, host: &str, port: u16) -> Self {
        Self {
            trust: Some((store, host.to_string(), port)),
            verdict: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    fn insecure() -> Self {
        Self {
            trust: None,
            verdict: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    fn judge(&self, key: &PublicKey) -> HostKeyVerdict {
        match &self.trust {
            Some((store, host, port)) => store.verify(host, *port, key),
            None => HostKeyVerdict::Insecure {
                fingerprint: known_hosts::fingerprint(key),
            },
        }
    }
}

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl std::future::Future<Output = std::result::Result<bool, Self::Error>> + Send {
        let verdict = self.judge(server_public_key);
        let accepted = match &verdict {
            HostKeyVerdict::Trusted => {
                tracing::debug!("Server key verified");
                true
            }
            HostKeyVerdict::Insecure { fingerprint } => {
                tracing::warn!(
                    "Accepting server key {} without verification (insecure)",
                    fingerprint
                );
                true
            }
            HostKeyVerdict::Changed { fingerprint, .. } => {
                tracing::error!("Server key mismatch! Received: {}", fingerprint);
                false
            }
            HostKeyVerdict::Unknown { .. } | HostKeyVerdict::Unreadable { .. } => false,
        };

        if let Ok(mut slot) = self.verdict.lock() {
            *slot = Some(verdict);
        }
        async move { Ok(accepted) }
    }
}
