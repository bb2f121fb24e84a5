//! Secrets kept in age-encrypted env files.
//!
//! Layout (under `secrets.envs_dir`, default `.keel/secrets/`):
//!   production.age   KEY=VALUE lines, encrypted to the team's recipients
//!   staging.age
//!
//! Locator path syntax is `<env>#<KEY>`, e.g. `age:production#DB_PASSWORD`.
//! Plaintext is read from the child's stdout straight into zeroizing memory
//! and never touches the filesystem. A child that outlives the configured
//! limit (a passphrase prompt, a hung plugin) is killed and reported as
//! unreachable.

use super::store::SecretStore;
use crate::error::{KeelError, Result};
use crate::paths;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use zeroize::Zeroizing;

const DEFAULT_LIMIT: Duration = Duration::from_secs(30);
const EXIT_POLL: Duration = Duration::from_millis(20);

pub struct AgeEnvStore {
    envs_dir: PathBuf,
    identity: Option<PathBuf>,
    limit: Duration,
}

fn age_bin() -> Result<PathBuf> {
    which::which("age").map_err(|_| KeelError::AgeNotInstalled)
}

/// Resolve the default identity path (private key for decryption).
/// Tries `~/.ssh/id_ed25519`, then `~/.ssh/id_rsa`.
pub(crate) fn default_identity() -> Option<PathBuf> {
    let home = home::home_dir()?;
    let candidates = [
        home.join(".ssh").join("id_ed25519"),
        home.join(".ssh").join("id_rsa"),
    ];
    candidates.into_iter().find(|p| p.exists())
}

fn unreachable(reason: impl Into<String>) -> KeelError {
    KeelError::SecretStoreUnreachable {
        backend: "age".to_string(),
        reason: reason.into(),
    }
}

fn split_path(path: &str) -> Result<(&str, &str)> {
    let (env, key) = path
        .split_once('#')
        .ok_or_else(|| KeelError::InvalidLocator(format!("age:{path}")))?;
    paths::validate_name(env)?;
    if key.is_empty() {
        return Err(KeelError::InvalidLocator(format!("age:{path}")));
    }
    Ok((env, key))
}

/// Find `key` in KEY=VALUE content. Comments and blank lines are skipped;
/// one pair of surrounding quotes is stripped from the value.
fn lookup(content: &str, key: &str) -> Option<Zeroizing<String>> {
    content
        .lines()
        .filter(|l| !l.starts_with('#') && !l.trim().is_empty())
        .filter_map(|l| l.split_once('='))
        .find(|(k, _)| k.trim() == key)
        .map(|(_, v)| {
            let v = v.trim();
            let v = v
                .strip_prefix('"')
                .and_then(|s| s.strip_suffix('"'))
                .unwrap_or(v);
            Zeroizing::new(v.to_string())
        })
}

impl AgeEnvStore {
    pub fn new(envs_dir: impl Into<PathBuf>, identity: Option<PathBuf>) -> Self {
        Self {
            envs_dir: envs_dir.into(),
            identity,
            limit: DEFAULT_LIMIT,
        }
    }

    /// Kill `age` if one decryption takes longer than `limit`.
    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.limit = limit;
        self
    }

    /// Decrypt one env file. `Ok(None)` when the env does not exist.
    fn decrypt_env(&self, env: &str) -> Result<Option<Zeroizing<String>>> {
        let env_path = paths::age_env_file(&self.envs_dir, env);
        if !env_path.exists() {
            return Ok(None);
        }
        let identity = self
            .identity
            .as_deref()
            .ok_or_else(|| unreachable("no identity configured: set secrets.identity"))?;
        let mut cmd = Command::new(age_bin().map_err(|e| unreachable(e.to_string()))?);
        cmd.arg("--decrypt")
            .arg("--identity")
            .arg(identity)
            .arg(&env_path);
        run_bounded(cmd, self.limit).map(Some)
    }
}

/// Run `cmd` and collect its stdout as text, killing it after `limit`.
/// Both pipes are drained on their own threads so a chatty child cannot
/// block on a full pipe while we wait for it.
fn run_bounded(mut cmd: Command, limit: Duration) -> Result<Zeroizing<String>> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| unreachable(e.to_string()))?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| unreachable("stdout not captured"))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| unreachable("stderr not captured"))?;
    let out_reader = std::thread::spawn(move || {
        let mut buf = Zeroizing::new(Vec::new());
        stdout.read_to_end(&mut *buf).map(|_| buf)
    });
    let err_reader = std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf);
        buf
    });

    let deadline = Instant::now() + limit;
    let status = loop {
        if let Some(status) = child.try_wait().map_err(|e| unreachable(e.to_string()))? {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(unreachable(format!(
                "age did not finish within {}s",
                limit.as_secs()
            )));
        }
        std::thread::sleep(EXIT_POLL);
    };

    let plaintext = out_reader
        .join()
        .map_err(|_| unreachable("stdout reader panicked"))?
        .map_err(|e| unreachable(e.to_string()))?;
    if !status.success() {
        let stderr = err_reader.join().unwrap_or_default();
        return Err(unreachable(
            String::from_utf8_lossy(&stderr).trim().to_string(),
        ));
    }
    let text =
        std::str::from_utf8(&plaintext).map_err(|_| unreachable("plaintext is not utf-8"))?;
    Ok(Zeroizing::new(text.to_string()))
}

impl SecretStore for AgeEnvStore {
    fn backend(&self) -> &str {
        "age"
    }

    fn get(&self, path: &str) -> Result<Option<Zeroizing<String>>> {
        let mut values = self.get_many(&[path])?;
        Ok(values.pop().flatten())
    }

    /// Decrypts each env file at most once per call.
    fn get_many(&self, paths: &[&str]) -> Result<Vec<Option<Zeroizing<String>>>> {
        let split: Vec<(&str, &str)> = paths
            .iter()
            .map(|p| split_path(p))
            .collect::<Result<_>>()?;

        let mut envs: BTreeMap<&str, Option<Zeroizing<String>>> = BTreeMap::new();
        for &(env, _) in &split {
            if !envs.contains_key(env) {
                envs.insert(env, self.decrypt_env(env)?);
            }
        }

        Ok(split
            .iter()
            .map(|(env, key)| {
                envs.get(env)
                    .and_then(|content| content.as_ref())
                    .and_then(|content| lookup(content, key))
            })
            .collect())
    }
}
