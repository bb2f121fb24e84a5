//! SSH transport built on the system `ssh` binary.
//!
//! One attempt holds one multiplexed master connection (`ControlMaster`);
//! every phase command runs over it. When the target has a credential, a
//! private `ssh-agent` is started for the session and the key is fed to
//! `ssh-add -` over stdin, so it never touches disk. The agent, the master
//! and the socket directory all die with the session.

use super::{LineSink, RemoteConnector, RemoteSession, Stream};
use crate::config::TargetConfig;
use crate::error::{KeelError, Result};
use crate::secrets::ResolvedSecret;
use async_trait::async_trait;
use regex::Regex;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info};

const SOCKET_POLL: Duration = Duration::from_millis(50);

fn address_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9.\-:\[\]]+$").expect("static regex"))
}

fn user_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z_][a-z0-9_\-]{0,31}$").expect("static regex"))
}

pub fn validate_address(address: &str) -> Result<()> {
    if address.is_empty() || address.starts_with('-') || !address_re().is_match(address) {
        return Err(KeelError::InvalidRemoteArgument(address.to_string()));
    }
    Ok(())
}

fn validate_user(user: &str) -> Result<()> {
    if !user_re().is_match(user) {
        return Err(KeelError::InvalidRemoteArgument(user.to_string()));
    }
    Ok(())
}

fn failed(target: &str, reason: impl Into<String>) -> KeelError {
    KeelError::ConnectionFailed {
        target: target.to_string(),
        reason: reason.into(),
    }
}

/// Last non-empty line of captured stderr, for error reasons.
fn last_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("no diagnostic output")
        .trim()
        .to_string()
}

// ---------------------------------------------------------------------------
// Argument construction
// ---------------------------------------------------------------------------

/// Options shared by the master and every multiplexed command.
#[derive(Debug, Clone)]
struct SshArgs {
    user: String,
    port: u16,
    address: String,
    known_hosts: Option<String>,
    control: PathBuf,
}

impl SshArgs {
    fn common(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            "StrictHostKeyChecking=yes".into(),
        ];
        if let Some(kh) = &self.known_hosts {
            args.push("-o".into());
            args.push(format!("UserKnownHostsFile={kh}").into());
        }
        args.push("-S".into());
        args.push(self.control.clone().into_os_string());
        args.push("-p".into());
        args.push(self.port.to_string().into());
        args.push("-l".into());
        args.push(self.user.clone().into());
        args
    }

    fn master(&self) -> Vec<OsString> {
        let mut args = vec!["-M".into(), "-N".into()];
        args.extend(self.common());
        args.push("--".into());
        args.push(self.address.clone().into());
        args
    }

    /// The remote side joins argv with spaces and hands it to a shell; every
    /// element has already been restricted to shell-inert characters.
    fn command(&self, argv: &[String]) -> Vec<OsString> {
        let mut args = vec!["-o".into(), "ControlMaster=no".into()];
        args.extend(self.common());
        args.push("--".into());
        args.push(self.address.clone().into());
        args.extend(argv.iter().map(OsString::from));
        args
    }

    fn exit(&self) -> Vec<OsString> {
        let mut args = vec!["-O".into(), "exit".into()];
        args.extend(self.common());
        args.push("--".into());
        args.push(self.address.clone().into());
        args
    }
}

// ---------------------------------------------------------------------------
// SshConnector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct SshConnector;

impl SshConnector {
    pub fn new() -> Self {
        Self
    }
}

async fn wait_for_socket(path: &Path, child: &mut Child, target: &str, what: &str) -> Result<()> {
    loop {
        if path.exists() {
            return Ok(());
        }
        if let Some(status) = child.try_wait()? {
            let mut stderr = Vec::new();
            if let Some(mut err) = child.stderr.take() {
                use tokio::io::AsyncReadExt;
                let _ = err.read_to_end(&mut stderr).await;
            }
            return Err(failed(
                target,
                format!("{what} exited ({status}): {}", last_line(&stderr)),
            ));
        }
        tokio::time::sleep(SOCKET_POLL).await;
    }
}

async fn start_agent(dir: &Path, target: &str) -> Result<(Child, PathBuf)> {
    let bin = which::which("ssh-agent").map_err(|_| failed(target, "ssh-agent not found"))?;
    let sock = dir.join("agent.sock");
    let mut child = Command::new(bin)
        .arg("-D")
        .arg("-a")
        .arg(&sock)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;
    wait_for_socket(&sock, &mut child, target, "ssh-agent").await?;
    Ok((child, sock))
}

async fn add_key(sock: &Path, credential: &ResolvedSecret, target: &str) -> Result<()> {
    let bin = which::which("ssh-add").map_err(|_| failed(target, "ssh-add not found"))?;
    let mut child = Command::new(bin)
        .arg("-q")
        .arg("-")
        .env("SSH_AUTH_SOCK", sock)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(credential.expose().as_bytes()).await?;
        if !credential.expose().ends_with('\n') {
            stdin.write_all(b"\n").await?;
        }
        stdin.shutdown().await?;
    }
    let status = child.wait().await?;
    if !status.success() {
        return Err(failed(target, "credential rejected by ssh-add"));
    }
    debug!(target_host = target, secret = credential.name(), "credential loaded into session agent");
    Ok(())
}

#[async_trait]
impl RemoteConnector for SshConnector {
    async fn connect(
        &self,
        target_name: &str,
        target: &TargetConfig,
        credential: Option<&ResolvedSecret>,
    ) -> Result<Box<dyn RemoteSession>> {
        validate_address(&target.address)?;
        validate_user(&target.user)?;
        let ssh = which::which("ssh").map_err(|_| failed(target_name, "ssh binary not found"))?;
        let dir = tempfile::Builder::new().prefix("keel-ssh-").tempdir()?;

        let (agent, auth_sock) = match credential {
            Some(cred) => {
                let (child, sock) = start_agent(dir.path(), target_name).await?;
                add_key(&sock, cred, target_name).await?;
                (Some(child), Some(sock))
            }
            None => (None, None),
        };

        let args = SshArgs {
            user: target.user.clone(),
            port: target.port,
            address: target.address.clone(),
            known_hosts: target.known_hosts.clone(),
            control: dir.path().join("control.sock"),
        };

        let mut master = Command::new(&ssh);
        master
            .args(args.master())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(sock) = &auth_sock {
            master.env("SSH_AUTH_SOCK", sock);
        }
        let mut master = master.spawn()?;
        wait_for_socket(&args.control, &mut master, target_name, "ssh").await?;
        info!(target_host = target_name, address = %target.address, "ssh master connected");

        Ok(Box::new(SshSession {
            target: target_name.to_string(),
            ssh,
            args,
            master: Some(master),
            agent,
            _dir: dir,
        }))
    }
}

// ---------------------------------------------------------------------------
// SshSession
// ---------------------------------------------------------------------------

pub struct SshSession {
    target: String,
    ssh: PathBuf,
    args: SshArgs,
    master: Option<Child>,
    agent: Option<Child>,
    _dir: TempDir,
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn run(
        &mut self,
        argv: &[String],
        stdin: Option<&[u8]>,
        sink: &mut dyn LineSink,
    ) -> Result<i32> {
        let mut child = Command::new(&self.ssh)
            .args(self.args.command(argv))
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let writer = match (stdin, child.stdin.take()) {
            (Some(bytes), Some(mut pipe)) => {
                let bytes = bytes.to_vec();
                Some(tokio::spawn(async move {
                    pipe.write_all(&bytes).await?;
                    pipe.shutdown().await
                }))
            }
            _ => None,
        };

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| failed(&self.target, "stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| failed(&self.target, "stderr not captured"))?;
        let mut out = BufReader::new(stdout).lines();
        let mut err = BufReader::new(stderr).lines();
        let (mut out_done, mut err_done) = (false, false);

        while !(out_done && err_done) {
            tokio::select! {
                line = out.next_line(), if !out_done => match line? {
                    Some(l) => sink.line(Stream::Stdout, &l),
                    None => out_done = true,
                },
                line = err.next_line(), if !err_done => match line? {
                    Some(l) => sink.line(Stream::Stderr, &l),
                    None => err_done = true,
                },
            }
        }

        if let Some(writer) = writer {
            // The remote side may exit before reading everything.
            if let Ok(Err(e)) = writer.await {
                debug!(target_host = %self.target, error = %e, "stdin writer stopped early");
            }
        }

        let status = child.wait().await?;
        match status.code() {
            Some(255) => Err(failed(&self.target, "ssh exited with status 255")),
            Some(code) => Ok(code),
            None => Err(failed(&self.target, "ssh terminated by signal")),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut master) = self.master.take() {
            let _ = Command::new(&self.ssh)
                .args(self.args.exit())
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            let _ = master.kill().await;
        }
        if let Some(mut agent) = self.agent.take() {
            let _ = agent.kill().await;
        }
        debug!(target_host = %self.target, "ssh session closed");
        Ok(())
    }
}
