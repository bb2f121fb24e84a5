use crate::error::{KeelError, Result};
use crate::machine::approval::parse_public_key;
use crate::paths;
use crate::secrets::{validate_secret_name, SecretLocator, SecretRef};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

impl ConfigWarning {
    fn warning(message: String) -> Self {
        Self {
            level: WarnLevel::Warning,
            message,
        }
    }

    fn error(message: String) -> Self {
        Self {
            level: WarnLevel::Error,
            message,
        }
    }
}

// ---------------------------------------------------------------------------
// ProjectConfig / RegistryConfig / SecretsConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Name recorded in every `ArtifactReference`.
    #[serde(default = "default_registry_name")]
    pub name: String,
    /// Root of the filesystem registry, relative to the project root.
    #[serde(default = "default_registry_path")]
    pub path: String,
}

fn default_registry_name() -> String {
    "local".to_string()
}

fn default_registry_path() -> String {
    paths::REGISTRY_DIR.to_string()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            name: default_registry_name(),
            path: default_registry_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// age identity used to decrypt env files. Defaults to `~/.ssh/id_ed25519`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    #[serde(default = "default_envs_dir")]
    pub envs_dir: String,
}

fn default_envs_dir() -> String {
    paths::SECRETS_DIR.to_string()
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            identity: None,
            envs_dir: default_envs_dir(),
        }
    }
}

// ---------------------------------------------------------------------------
// TargetConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub address: String,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Reference to the SSH private key. Resolved per attempt, never read from disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<SecretLocator>,
    /// Path of the deploy agent on the host. Every phase command is an argv for it.
    #[serde(default = "default_agent")]
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts: Option<String>,
}

fn default_user() -> String {
    "deploy".to_string()
}

fn default_port() -> u16 {
    22
}

fn default_agent() -> String {
    "/usr/local/bin/keel-agent".to_string()
}

impl TargetConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            user: default_user(),
            port: default_port(),
            credential: None,
            agent: default_agent(),
            known_hosts: None,
        }
    }
}

// ---------------------------------------------------------------------------
// BundleConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleConfig {
    /// Reference to the 32-byte bundle key. Hosts hold the same key under the
    /// same reference, so only the reference travels with the ciphertext.
    #[serde(default = "default_encryption_key")]
    pub encryption_key: SecretLocator,
    #[serde(rename = "static", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub static_fields: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<SecretRef>,
}

fn default_encryption_key() -> SecretLocator {
    SecretLocator::new("env", "KEEL_BUNDLE_KEY")
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            encryption_key: default_encryption_key(),
            static_fields: BTreeMap::new(),
            secrets: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// ApprovalsConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApproverConfig {
    pub id: String,
    /// Base64 ed25519 public key.
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalsConfig {
    #[serde(default = "default_ttl")]
    pub ttl_seconds: u64,
    #[serde(default = "default_clock_skew")]
    pub max_clock_skew_seconds: u64,
    #[serde(default)]
    pub approvers: Vec<ApproverConfig>,
}

fn default_ttl() -> u64 {
    3600
}

fn default_clock_skew() -> u64 {
    60
}

impl Default for ApprovalsConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl(),
            max_clock_skew_seconds: default_clock_skew(),
            approvers: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// TimeoutsConfig / ProbeConfig / AuditConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_connect")]
    pub connect_seconds: u64,
    #[serde(default = "default_publish")]
    pub publish_seconds: u64,
    /// Bounds one secret resolution, including any `age` child process.
    #[serde(default = "default_secrets")]
    pub secrets_seconds: u64,
    #[serde(default = "default_phase")]
    pub transfer_seconds: u64,
    #[serde(default = "default_phase")]
    pub activate_seconds: u64,
    #[serde(default = "default_verify")]
    pub verify_seconds: u64,
    #[serde(default = "default_phase")]
    pub rollback_seconds: u64,
}

fn default_connect() -> u64 {
    15
}

fn default_publish() -> u64 {
    120
}

fn default_secrets() -> u64 {
    30
}

fn default_phase() -> u64 {
    300
}

fn default_verify() -> u64 {
    30
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            connect_seconds: default_connect(),
            publish_seconds: default_publish(),
            secrets_seconds: default_secrets(),
            transfer_seconds: default_phase(),
            activate_seconds: default_phase(),
            verify_seconds: default_verify(),
            rollback_seconds: default_phase(),
        }
    }
}

impl TimeoutsConfig {
    /// Per-command timeout for a phase. `verify` bounds each probe, not the whole loop.
    pub fn for_phase(&self, phase: crate::types::Phase) -> Duration {
        use crate::types::Phase;
        let secs = match phase {
            Phase::Transfer => self.transfer_seconds,
            Phase::Activate => self.activate_seconds,
            Phase::Verify => self.verify_seconds,
            Phase::Rollback => self.rollback_seconds,
        };
        Duration::from_secs(secs)
    }

    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_seconds)
    }

    pub fn publish(&self) -> Duration {
        Duration::from_secs(self.publish_seconds)
    }

    pub fn secrets(&self) -> Duration {
        Duration::from_secs(self.secrets_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

fn default_probe_attempts() -> u32 {
    5
}

fn default_initial_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    16_000
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_probe_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

fn default_write_retries() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    50
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            write_retries: default_write_retries(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    pub project: ProjectConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub targets: BTreeMap<String, TargetConfig>,
    #[serde(default)]
    pub bundle: BundleConfig,
    #[serde(default)]
    pub approvals: ApprovalsConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

fn default_version() -> u32 {
    1
}

impl Config {
    pub fn new(project_name: impl Into<String>) -> Self {
        Self {
            version: 1,
            project: ProjectConfig {
                name: project_name.into(),
                description: None,
            },
            registry: RegistryConfig::default(),
            secrets: SecretsConfig::default(),
            targets: BTreeMap::new(),
            bundle: BundleConfig::default(),
            approvals: ApprovalsConfig::default(),
            timeouts: TimeoutsConfig::default(),
            probe: ProbeConfig::default(),
            audit: AuditConfig::default(),
        }
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(KeelError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn target(&self, name: &str) -> Result<&TargetConfig> {
        self.targets
            .get(name)
            .ok_or_else(|| KeelError::UnknownTarget(name.to_string()))
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        for (name, target) in &self.targets {
            if paths::validate_name(name).is_err() {
                warnings.push(ConfigWarning::error(format!(
                    "target name '{name}' is invalid"
                )));
            }
            if target.address.trim().is_empty() {
                warnings.push(ConfigWarning::error(format!(
                    "target '{name}' has an empty address"
                )));
            }
            if target.credential.is_none() {
                warnings.push(ConfigWarning::warning(format!(
                    "target '{name}' has no credential; ssh will fall back to its default identity"
                )));
            }
        }

        let mut seen = BTreeSet::new();
        for secret in &self.bundle.secrets {
            if validate_secret_name(&secret.name).is_err() {
                warnings.push(ConfigWarning::error(format!(
                    "bundle secret name '{}' is invalid",
                    secret.name
                )));
            }
            if !seen.insert(secret.name.as_str()) {
                warnings.push(ConfigWarning::error(format!(
                    "bundle secret '{}' is declared more than once",
                    secret.name
                )));
            }
            if self.bundle.static_fields.contains_key(&secret.name) {
                warnings.push(ConfigWarning::error(format!(
                    "'{}' is both a static field and a secret",
                    secret.name
                )));
            }
        }

        if self.approvals.approvers.is_empty() {
            warnings.push(ConfigWarning::warning(
                "no approvers configured; no deployment can pass the approval gate".to_string(),
            ));
        }
        for approver in &self.approvals.approvers {
            if paths::validate_name(&approver.id).is_err() {
                warnings.push(ConfigWarning::error(format!(
                    "approver id '{}' is invalid",
                    approver.id
                )));
            }
            if parse_public_key(&approver.public_key).is_err() {
                warnings.push(ConfigWarning::error(format!(
                    "approver '{}' has a malformed public key",
                    approver.id
                )));
            }
        }
        if self.approvals.ttl_seconds == 0 {
            warnings.push(ConfigWarning::error(
                "approvals.ttl_seconds must be greater than zero".to_string(),
            ));
        }

        let t = &self.timeouts;
        for (label, secs) in [
            ("connect", t.connect_seconds),
            ("publish", t.publish_seconds),
            ("secrets", t.secrets_seconds),
            ("transfer", t.transfer_seconds),
            ("activate", t.activate_seconds),
            ("verify", t.verify_seconds),
            ("rollback", t.rollback_seconds),
        ] {
            if secs == 0 {
                warnings.push(ConfigWarning::error(format!(
                    "timeouts.{label}_seconds must be greater than zero"
                )));
            }
        }

        if self.probe.max_attempts == 0 {
            warnings.push(ConfigWarning::error(
                "probe.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.probe.initial_delay_ms > self.probe.max_delay_ms {
            warnings.push(ConfigWarning::error(format!(
                "probe.initial_delay_ms ({}) exceeds probe.max_delay_ms ({})",
                self.probe.initial_delay_ms, self.probe.max_delay_ms
            )));
        }
        if self.audit.write_retries > 20 {
            warnings.push(ConfigWarning::warning(format!(
                "audit.write_retries={} (>20 is unusual)",
                self.audit.write_retries
            )));
        }

        warnings
    }

    pub fn has_errors(&self) -> bool {
        self.validate().iter().any(|w| w.level == WarnLevel::Error)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
