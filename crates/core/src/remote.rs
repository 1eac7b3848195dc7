//! Remote command channel to endpoint hosts
//!
//! Peer configuration lives on the WireGuard host, reached over SSH.
//! `SshChannel` keeps one multiplexed master connection per endpoint:
//! opened lazily on first use, reused across commands, reopened
//! transparently when the mux socket drops. Every call runs under a
//! timeout.
//!
//! Channel-level failures (cannot reach the host, timeout) surface as
//! `RemoteConnect`/`Timeout`; a command that ran but exited non-zero
//! is returned to the caller as a `CommandOutput` to interpret.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use wgvault_common::{Endpoint, Error, Result, WireguardConfig};

/// Output of one remote command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Executes shell commands on an endpoint host.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Run a command, establishing the channel first if needed.
    async fn exec(&self, command: &str) -> Result<CommandOutput>;

    /// Tear down the channel. Subsequent `exec` calls reopen it.
    async fn close(&self);
}

/// SSH-backed channel with a lazily opened ControlMaster connection.
pub struct SshChannel {
    host: String,
    user: String,
    key_path: String,
    control_path: PathBuf,
    connect_timeout: Duration,
    command_timeout: Duration,
    /// Guards master lifecycle; true once a master is believed open.
    opened: Mutex<bool>,
}

impl SshChannel {
    pub fn new(endpoint: &Endpoint, config: &WireguardConfig) -> Self {
        let control_path =
            std::env::temp_dir().join(format!("wgvault-ssh-{}.sock", endpoint.id));
        Self {
            host: endpoint.ssh_host.clone(),
            user: endpoint.ssh_user.clone(),
            key_path: endpoint.ssh_key_path.clone(),
            control_path,
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            command_timeout: Duration::from_secs(config.command_timeout_secs),
            opened: Mutex::new(false),
        }
    }

    fn base_args(&self) -> Vec<String> {
        vec![
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            "StrictHostKeyChecking=accept-new".into(),
            "-o".into(),
            format!("ControlPath={}", self.control_path.display()),
            "-i".into(),
            self.key_path.clone(),
            format!("{}@{}", self.user, self.host),
        ]
    }

    /// Open the master connection if it is not already up.
    async fn ensure_open(&self) -> Result<()> {
        let mut opened = self.opened.lock().await;
        if *opened {
            return Ok(());
        }

        let mut args = vec![
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            "ControlPersist=600".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs()),
            "-fN".to_string(),
        ];
        args.extend(self.base_args());

        debug!("Opening SSH channel to {}@{}", self.user, self.host);
        let output = tokio::time::timeout(
            self.connect_timeout + Duration::from_secs(5),
            Command::new("ssh")
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output(),
        )
        .await
        .map_err(|_| Error::Timeout {
            seconds: self.connect_timeout.as_secs(),
        })?
        .map_err(|e| Error::RemoteConnect(format!("failed to spawn ssh: {}", e)))?;

        if !output.status.success() {
            return Err(Error::RemoteConnect(format!(
                "{}@{}: {}",
                self.user,
                self.host,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        *opened = true;
        Ok(())
    }

    async fn run(&self, command: &str) -> Result<CommandOutput> {
        let mut args = self.base_args();
        args.push(command.to_string());

        let output = tokio::time::timeout(
            self.command_timeout,
            Command::new("ssh")
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output(),
        )
        .await
        .map_err(|_| Error::Timeout {
            seconds: self.command_timeout.as_secs(),
        })?
        .map_err(|e| Error::RemoteConnect(format!("failed to spawn ssh: {}", e)))?;

        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl CommandChannel for SshChannel {
    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        self.ensure_open().await?;
        let output = self.run(command).await?;

        // ssh reserves 255 for client/connection failure, e.g. a dead
        // mux socket. Reopen once and retry before giving up.
        if output.code == 255 {
            warn!(
                "SSH channel to {} dropped, reopening: {}",
                self.host,
                output.stderr.trim()
            );
            *self.opened.lock().await = false;
            self.ensure_open().await?;
            let retried = self.run(command).await?;
            if retried.code == 255 {
                return Err(Error::RemoteConnect(format!(
                    "{}@{}: {}",
                    self.user,
                    self.host,
                    retried.stderr.trim()
                )));
            }
            return Ok(retried);
        }

        Ok(output)
    }

    async fn close(&self) {
        let mut opened = self.opened.lock().await;
        if !*opened {
            return;
        }
        let mut args = vec!["-O".to_string(), "exit".to_string()];
        args.extend(self.base_args());
        // Best effort; a failed exit just leaves an orphaned master.
        if let Err(e) = Command::new("ssh")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            warn!("Failed to close SSH channel to {}: {}", self.host, e);
        }
        *opened = false;
    }
}
