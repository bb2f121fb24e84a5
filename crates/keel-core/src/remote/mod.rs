//! Remote phase execution.
//!
//! A target only ever runs the closed [`RemoteCommand`] set, rendered to a
//! fixed argv for the host's deploy agent. Every parameter is a validated
//! opaque reference (a digest or a bundle id), never free text. All output
//! goes through the attempt's [`RedactionFilter`] before anything else sees it.

pub mod redact;
pub mod ssh;

pub use redact::RedactionFilter;
pub use ssh::SshConnector;

use crate::bundle::EncryptedBundle;
use crate::config::{TargetConfig, TimeoutsConfig};
use crate::error::{KeelError, Result};
use crate::publish::Digest;
use crate::secrets::ResolvedSecret;
use crate::types::Phase;
use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCommand {
    /// Fetch the artifact and store the encrypted bundle read from stdin.
    Stage { digest: Digest, bundle_id: Uuid },
    Activate { digest: Digest, bundle_id: Uuid },
    /// Exit 0 when the active version is healthy.
    Probe,
    /// Print the active digest as the last stdout line.
    ReportVersion,
    Restore { digest: Digest },
    /// Stop the service; used when there is nothing to restore.
    Deactivate,
}

fn safe_arg_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9:._\-/]+$").expect("valid regex"))
}

fn validate_arg(arg: &str) -> Result<()> {
    if arg.is_empty() || arg.len() > 256 || !safe_arg_re().is_match(arg) {
        return Err(KeelError::InvalidRemoteArgument(arg.to_string()));
    }
    Ok(())
}

/// The agent path must be absolute and made of safe characters only.
pub fn validate_agent_path(path: &str) -> Result<()> {
    validate_arg(path)?;
    if !path.starts_with('/') || path.split('/').any(|seg| seg == "..") {
        return Err(KeelError::InvalidRemoteArgument(path.to_string()));
    }
    Ok(())
}

impl RemoteCommand {
    pub fn verb(&self) -> &'static str {
        match self {
            RemoteCommand::Stage { .. } => "stage",
            RemoteCommand::Activate { .. } => "activate",
            RemoteCommand::Probe => "probe",
            RemoteCommand::ReportVersion => "report-version",
            RemoteCommand::Restore { .. } => "restore",
            RemoteCommand::Deactivate => "deactivate",
        }
    }

    /// Whether the encrypted bundle is streamed on stdin.
    pub fn takes_bundle(&self) -> bool {
        matches!(self, RemoteCommand::Stage { .. })
    }

    /// Arguments for the deploy agent, excluding the agent path itself.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec![self.verb().to_string()];
        match self {
            RemoteCommand::Stage { digest, bundle_id }
            | RemoteCommand::Activate { digest, bundle_id } => {
                argv.push("--digest".into());
                argv.push(digest.to_string());
                argv.push("--bundle".into());
                argv.push(bundle_id.to_string());
            }
            RemoteCommand::Restore { digest } => {
                argv.push("--digest".into());
                argv.push(digest.to_string());
            }
            RemoteCommand::Probe | RemoteCommand::ReportVersion | RemoteCommand::Deactivate => {}
        }
        argv
    }

    /// Full argv `[agent, verb, args...]`, every element validated.
    pub fn render(&self, agent: &str) -> Result<Vec<String>> {
        validate_agent_path(agent)?;
        let mut argv = vec![agent.to_string()];
        for arg in self.argv() {
            validate_arg(&arg)?;
            argv.push(arg);
        }
        Ok(argv)
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

/// The fixed command list one phase runs, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSequence {
    pub phase: Phase,
    pub commands: Vec<RemoteCommand>,
}

impl CommandSequence {
    pub fn transfer(digest: &Digest, bundle_id: Uuid) -> Self {
        Self {
            phase: Phase::Transfer,
            commands: vec![RemoteCommand::Stage {
                digest: digest.clone(),
                bundle_id,
            }],
        }
    }

    pub fn activate(digest: &Digest, bundle_id: Uuid) -> Self {
        Self {
            phase: Phase::Activate,
            commands: vec![RemoteCommand::Activate {
                digest: digest.clone(),
                bundle_id,
            }],
        }
    }

    pub fn verify() -> Self {
        Self {
            phase: Phase::Verify,
            commands: vec![RemoteCommand::Probe, RemoteCommand::ReportVersion],
        }
    }

    /// Restore the known-good version, or deactivate when there was none.
    pub fn rollback(known_good: Option<&Digest>) -> Self {
        let command = match known_good {
            Some(digest) => RemoteCommand::Restore {
                digest: digest.clone(),
            },
            None => RemoteCommand::Deactivate,
        };
        Self {
            phase: Phase::Rollback,
            commands: vec![command],
        }
    }
}

// ---------------------------------------------------------------------------
// Session traits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Receives raw output lines as a command runs.
pub trait LineSink: Send {
    fn line(&mut self, stream: Stream, text: &str);
}

/// One authenticated connection to a target.
#[async_trait]
pub trait RemoteSession: Send {
    /// Run `argv` on the host, feeding `stdin` if given. Returns the exit code.
    async fn run(
        &mut self,
        argv: &[String],
        stdin: Option<&[u8]>,
        sink: &mut dyn LineSink,
    ) -> Result<i32>;

    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(
        &self,
        target_name: &str,
        target: &TargetConfig,
        credential: Option<&ResolvedSecret>,
    ) -> Result<Box<dyn RemoteSession>>;
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputLine {
    pub stream: Stream,
    pub text: String,
}

/// Redacted output of one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub command: String,
    pub exit_code: i32,
    pub lines: Vec<OutputLine>,
}

impl CommandOutput {
    pub fn last_stdout(&self) -> Option<&str> {
        self.lines
            .iter()
            .rev()
            .find(|l| l.stream == Stream::Stdout && !l.text.trim().is_empty())
            .map(|l| l.text.trim())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub phase: Phase,
    pub outputs: Vec<CommandOutput>,
}

impl ExecutionResult {
    /// The digest printed by `report-version`, if this phase ran it.
    pub fn reported_version(&self) -> Option<Digest> {
        self.outputs
            .iter()
            .rev()
            .find(|o| o.command == RemoteCommand::ReportVersion.verb())
            .and_then(CommandOutput::last_stdout)
            .and_then(|s| s.parse().ok())
    }
}

struct Collector<'a> {
    redactor: &'a RedactionFilter,
    target: &'a str,
    command: &'static str,
    lines: Vec<OutputLine>,
}

impl LineSink for Collector<'_> {
    fn line(&mut self, stream: Stream, text: &str) {
        let text = self.redactor.redact(text);
        debug!(target_host = self.target, command = self.command, ?stream, "{text}");
        self.lines.push(OutputLine { stream, text });
    }
}

// ---------------------------------------------------------------------------
// RemoteExecutor
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RemoteExecutor {
    connector: Arc<dyn RemoteConnector>,
    timeouts: TimeoutsConfig,
}

impl RemoteExecutor {
    pub fn new(connector: Arc<dyn RemoteConnector>, timeouts: TimeoutsConfig) -> Self {
        Self {
            connector,
            timeouts,
        }
    }

    /// Open the attempt's single session. `redactor` must already know every
    /// secret resolved for the attempt, the credential included.
    pub async fn open(
        &self,
        target_name: &str,
        target: &TargetConfig,
        credential: Option<&ResolvedSecret>,
        redactor: RedactionFilter,
    ) -> Result<ExecutorSession> {
        validate_agent_path(&target.agent)?;
        let limit = self.timeouts.connect();
        let connect = self.connector.connect(target_name, target, credential);
        let session = match tokio::time::timeout(limit, connect).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => return Err(scrub(&redactor, e)),
            Err(_) => {
                return Err(KeelError::ConnectionFailed {
                    target: target_name.to_string(),
                    reason: format!("no session after {}s", limit.as_secs()),
                })
            }
        };
        info!(target_host = target_name, "remote session open");
        Ok(ExecutorSession {
            session,
            target: target_name.to_string(),
            agent: target.agent.clone(),
            redactor,
            timeouts: self.timeouts.clone(),
        })
    }
}

/// Rewrite free-text error reasons through the redaction filter.
fn scrub(redactor: &RedactionFilter, err: KeelError) -> KeelError {
    match err {
        KeelError::ConnectionFailed { target, reason } => KeelError::ConnectionFailed {
            target,
            reason: redactor.redact(&reason),
        },
        KeelError::SecretStoreUnreachable { backend, reason } => {
            KeelError::SecretStoreUnreachable {
                backend,
                reason: redactor.redact(&reason),
            }
        }
        KeelError::Store(reason) => KeelError::Store(redactor.redact(&reason)),
        other => other,
    }
}

pub struct ExecutorSession {
    session: Box<dyn RemoteSession>,
    target: String,
    agent: String,
    redactor: RedactionFilter,
    timeouts: TimeoutsConfig,
}

impl ExecutorSession {
    pub fn redactor(&self) -> &RedactionFilter {
        &self.redactor
    }

    /// Run every command of `seq` in order, stopping at the first failure.
    /// `bundle` is required when the sequence stages.
    pub async fn execute(
        &mut self,
        seq: &CommandSequence,
        bundle: Option<&EncryptedBundle>,
    ) -> Result<ExecutionResult> {
        let limit = self.timeouts.for_phase(seq.phase);
        let mut outputs = Vec::with_capacity(seq.commands.len());

        for command in &seq.commands {
            let argv = command.render(&self.agent)?;
            let stdin = if command.takes_bundle() {
                let bundle = bundle.ok_or_else(|| {
                    KeelError::InvalidRequest(format!("{} requires a sealed bundle", command))
                })?;
                Some(bundle.to_wire()?)
            } else {
                None
            };

            let mut sink = Collector {
                redactor: &self.redactor,
                target: &self.target,
                command: command.verb(),
                lines: Vec::new(),
            };
            debug!(target_host = %self.target, phase = %seq.phase, command = command.verb(), "running");
            let run = self.session.run(&argv, stdin.as_deref(), &mut sink);
            let exit_code = match tokio::time::timeout(limit, run).await {
                Ok(Ok(code)) => code,
                Ok(Err(e)) => return Err(scrub(&self.redactor, e)),
                Err(_) => {
                    warn!(target_host = %self.target, phase = %seq.phase, "command timed out");
                    return Err(KeelError::Timeout {
                        phase: seq.phase,
                        seconds: limit.as_secs(),
                    });
                }
            };
            let lines = sink.lines;
            if exit_code != 0 {
                return Err(KeelError::CommandFailed {
                    phase: seq.phase,
                    command: command.verb().to_string(),
                    exit_code,
                });
            }
            outputs.push(CommandOutput {
                command: command.verb().to_string(),
                exit_code,
                lines,
            });
        }

        Ok(ExecutionResult {
            phase: seq.phase,
            outputs,
        })
    }

    pub async fn close(mut self) -> Result<()> {
        let redactor = self.redactor.clone();
        self.session.close().await.map_err(|e| scrub(&redactor, e))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn digest() -> Digest {
        Digest::of_bytes(b"artifact")
    }

    #[derive(Default)]
    struct Log {
        argvs: Vec<Vec<String>>,
        stdins: Vec<Option<Vec<u8>>>,
    }

    struct Echo {
        log: Arc<Mutex<Log>>,
        reply: Vec<(Stream, String)>,
        exit_code: i32,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl RemoteSession for Echo {
        async fn run(
            &mut self,
            argv: &[String],
            stdin: Option<&[u8]>,
            sink: &mut dyn LineSink,
        ) -> Result<i32> {
            {
                let mut log = self.log.lock().unwrap();
                log.argvs.push(argv.to_vec());
                log.stdins.push(stdin.map(<[u8]>::to_vec));
            }
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            for (stream, text) in &self.reply {
                sink.line(*stream, text);
            }
            Ok(self.exit_code)
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn session(echo: Echo) -> ExecutorSession {
        session_with(echo, RedactionFilter::default(), TimeoutsConfig::default())
    }

    fn session_with(echo: Echo, redactor: RedactionFilter, timeouts: TimeoutsConfig) -> ExecutorSession {
        ExecutorSession {
            session: Box::new(echo),
            target: "host-1".into(),
            agent: "/usr/local/bin/keel-agent".into(),
            redactor,
            timeouts,
        }
    }

    fn echo(log: &Arc<Mutex<Log>>, reply: Vec<(Stream, &str)>, exit_code: i32) -> Echo {
        Echo {
            log: Arc::clone(log),
            reply: reply.into_iter().map(|(s, t)| (s, t.to_string())).collect(),
            exit_code,
            delay: None,
        }
    }

    #[test]
    fn argv_is_fixed_per_command() {
        let id = Uuid::nil();
        let argv = RemoteCommand::Stage {
            digest: digest(),
            bundle_id: id,
        }
        .render("/opt/agent")
        .unwrap();
        assert_eq!(
            argv,
            vec![
                "/opt/agent".to_string(),
                "stage".into(),
                "--digest".into(),
                digest().to_string(),
                "--bundle".into(),
                id.to_string(),
            ]
        );
        assert_eq!(
            RemoteCommand::ReportVersion.render("/opt/agent").unwrap(),
            vec!["/opt/agent".to_string(), "report-version".into()]
        );
    }

    #[test]
    fn agent_path_must_be_absolute_and_plain() {
        assert!(validate_agent_path("/usr/local/bin/keel-agent").is_ok());
        for bad in ["agent", "/bin/sh -c", "/opt/$(id)", "/opt/../bin/sh", ""] {
            assert!(
                matches!(validate_agent_path(bad), Err(KeelError::InvalidRemoteArgument(_))),
                "{bad} accepted"
            );
        }
    }

    #[test]
    fn rollback_without_known_good_deactivates() {
        assert_eq!(
            CommandSequence::rollback(None).commands,
            vec![RemoteCommand::Deactivate]
        );
        assert_eq!(
            CommandSequence::rollback(Some(&digest())).commands,
            vec![RemoteCommand::Restore { digest: digest() }]
        );
    }

    #[tokio::test]
    async fn stage_streams_bundle_on_stdin() {
        use crate::bundle::{bundle, BundleKey};
        use crate::secrets::{SecretLocator, SecretSet};

        let log = Arc::new(Mutex::new(Log::default()));
        let mut s = session(echo(&log, vec![], 0));
        let sealed = bundle(
            Default::default(),
            SecretSet::default(),
            SecretLocator::new("env", "KEY"),
        )
        .unwrap()
        .seal(&BundleKey::generate())
        .unwrap();

        let seq = CommandSequence::transfer(&digest(), sealed.bundle_id);
        s.execute(&seq, Some(&sealed)).await.unwrap();

        let log = log.lock().unwrap();
        let sent = log.stdins[0].as_ref().unwrap();
        assert_eq!(EncryptedBundle::from_wire(sent).unwrap(), sealed);
    }

    #[tokio::test]
    async fn stage_without_bundle_is_rejected() {
        let log = Arc::new(Mutex::new(Log::default()));
        let mut s = session(echo(&log, vec![], 0));
        let err = s
            .execute(&CommandSequence::transfer(&digest(), Uuid::nil()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, KeelError::InvalidRequest(_)));
        assert!(log.lock().unwrap().argvs.is_empty());
    }

    #[tokio::test]
    async fn nonzero_exit_is_command_failed() {
        let log = Arc::new(Mutex::new(Log::default()));
        let mut s = session(echo(&log, vec![], 7));
        let err = s
            .execute(&CommandSequence::activate(&digest(), Uuid::nil()), None)
            .await
            .unwrap_err();
        match err {
            KeelError::CommandFailed {
                phase,
                command,
                exit_code,
            } => {
                assert_eq!(phase, Phase::Activate);
                assert_eq!(command, "activate");
                assert_eq!(exit_code, 7);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn output_is_redacted_and_version_parsed() {
        let log = Arc::new(Mutex::new(Log::default()));
        let line = digest().to_string();
        let reply = vec![
            (Stream::Stderr, "token=hunter2"),
            (Stream::Stdout, line.as_str()),
        ];
        let mut s = session_with(
            echo(&log, reply, 0),
            RedactionFilter::new(["hunter2"]),
            TimeoutsConfig::default(),
        );
        let result = s.execute(&CommandSequence::verify(), None).await.unwrap();
        assert_eq!(result.outputs.len(), 2);
        assert_eq!(result.outputs[0].lines[0].text, "token=[REDACTED]");
        assert_eq!(result.reported_version(), Some(digest()));
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let log = Arc::new(Mutex::new(Log::default()));
        let mut slow = echo(&log, vec![], 0);
        slow.delay = Some(Duration::from_secs(5));
        let timeouts = TimeoutsConfig {
            verify_seconds: 1,
            ..TimeoutsConfig::default()
        };
        let mut s = session_with(slow, RedactionFilter::default(), timeouts);
        let err = s.execute(&CommandSequence::verify(), None).await.unwrap_err();
        assert!(matches!(
            err,
            KeelError::Timeout {
                phase: Phase::Verify,
                seconds: 1
            }
        ));
    }

    #[test]
    fn connection_errors_are_scrubbed() {
        let redactor = RedactionFilter::new(["s3cret"]);
        let err = scrub(
            &redactor,
            KeelError::ConnectionFailed {
                target: "host-1".into(),
                reason: "bad key s3cret".into(),
            },
        );
        assert!(!err.to_string().contains("s3cret"));
    }
}
