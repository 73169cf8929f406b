//! Remote shell capability: file push and command execution on an
//! instance, used for the odd host-level task the container daemon
//! cannot do (sysctl reload, sidecar config upload, image import).
//!
//! Each call opens a fresh connection; nothing here holds sessions
//! across awaits, so the orchestrator can drop a host at any time.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use russh::client;
use russh::ChannelMsg;
use russh_keys::key;
use snafu::{ResultExt, Snafu};
use tracing::debug;

/// Errors from remote shell interactions
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum ShellError {
    #[snafu(display("Failed to load ssh key from {:?}", path))]
    LoadKey {
        path: PathBuf,
        source: russh_keys::Error,
    },
    #[snafu(display("Failed to connect to {}", host))]
    Connect { host: String, source: russh::Error },
    #[snafu(display("Host {} rejected the ssh key", host))]
    AuthRejected { host: String },
    #[snafu(display("Failed to run '{}' on {}", command, host))]
    Exec {
        host: String,
        command: String,
        source: russh::Error,
    },
    #[snafu(display("Command '{}' on {} returned no exit status", command, host))]
    NoExitStatus { host: String, command: String },
}

/// Output of one remote command
#[derive(Debug, Clone)]
pub struct ExecOutput {
    /// Remote exit status
    pub status: u32,
    /// Collected stdout/stderr
    pub stdout: String,
}

impl ExecOutput {
    /// Whether the remote command exited zero
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Capability to push files to and run commands on an instance
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run `command` on `host`, collecting output and exit status
    async fn exec(&self, host: &str, command: &str) -> Result<ExecOutput, ShellError>;

    /// Write `bytes` to `remote_path` on `host`, creating parent
    /// directories
    async fn upload(&self, host: &str, bytes: &[u8], remote_path: &str)
        -> Result<(), ShellError>;
}

/// Handler accepting any server key: instances are freshly booted
/// machines we created seconds ago, there is no known-hosts state.
struct AcceptingHandler;

#[async_trait]
impl client::Handler for AcceptingHandler {
    type Error = russh::Error;

    async fn check_server_key(
        self,
        _server_public_key: &key::PublicKey,
    ) -> Result<(Self, bool), Self::Error> {
        Ok((self, true))
    }
}

/// SSH-backed [`RemoteShell`]
pub struct SshShell {
    user: String,
    keyfile: PathBuf,
    config: Arc<client::Config>,
}

impl SshShell {
    /// New shell authenticating as `user` with the key at `keyfile`
    pub fn new(user: impl Into<String>, keyfile: impl Into<PathBuf>) -> Self {
        Self {
            user: user.into(),
            keyfile: keyfile.into(),
            config: Arc::new(client::Config::default()),
        }
    }

    async fn session(&self, host: &str) -> Result<client::Handle<AcceptingHandler>, ShellError> {
        let keypair = russh_keys::load_secret_key(&self.keyfile, None).context(LoadKey {
            path: self.keyfile.clone(),
        })?;
        let mut handle = client::connect(self.config.clone(), (host, 22), AcceptingHandler)
            .await
            .context(Connect { host })?;
        let authenticated = handle
            .authenticate_publickey(self.user.as_str(), Arc::new(keypair))
            .await
            .context(Connect { host })?;
        if !authenticated {
            return AuthRejected { host }.fail();
        }
        Ok(handle)
    }

    async fn run(
        &self,
        host: &str,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, ShellError> {
        let mut handle = self.session(host).await?;
        let mut channel = handle.channel_open_session().await.context(Exec {
            host,
            command,
        })?;
        channel.exec(true, command).await.context(Exec {
            host,
            command,
        })?;
        if let Some(bytes) = stdin {
            channel.data(bytes).await.context(Exec {
                host,
                command,
            })?;
            channel.eof().await.context(Exec {
                host,
                command,
            })?;
        }

        let mut stdout = Vec::new();
        let mut status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, .. } => stdout.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
                _ => {}
            }
        }

        let status = match status {
            Some(status) => status,
            None => return NoExitStatus { host, command }.fail(),
        };
        debug!("{}: '{}' exited {}", host, command, status);
        Ok(ExecOutput {
            status,
            stdout: String::from_utf8_lossy(&stdout).to_string(),
        })
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn exec(&self, host: &str, command: &str) -> Result<ExecOutput, ShellError> {
        self.run(host, command, None).await
    }

    async fn upload(
        &self,
        host: &str,
        bytes: &[u8],
        remote_path: &str,
    ) -> Result<(), ShellError> {
        let command = format!(
            "mkdir -p \"$(dirname '{}')\" && cat > '{}'",
            remote_path, remote_path
        );
        let _ = self.run(host, &command, Some(bytes)).await?;
        Ok(())
    }
}
