//! Secret references and their per-attempt materialization.
//!
//! A `SecretRef` names a secret and says where it lives (`<backend>:<path>`).
//! `SecretMaterializer::resolve` turns a slice of refs into a `SecretSet`
//! of `ResolvedSecret`s that live only in zeroizing memory. Values have no
//! `Serialize` or `Display` impl and a redacted `Debug`, so they cannot reach
//! a log line, an audit record or the database by accident.

mod age;
mod store;

pub use age::AgeEnvStore;
pub use store::{EnvStore, MemoryStore, SecretStore};

use crate::config::Config;
use crate::error::{KeelError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::debug;
use zeroize::Zeroizing;

// ---------------------------------------------------------------------------
// SecretLocator / SecretRef
// ---------------------------------------------------------------------------

/// Where a secret lives: `<backend>:<path>`, e.g. `age:production#DB_PASSWORD`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SecretLocator {
    backend: String,
    path: String,
}

static BACKEND_RE: OnceLock<Regex> = OnceLock::new();
static SECRET_NAME_RE: OnceLock<Regex> = OnceLock::new();

fn backend_re() -> &'static Regex {
    BACKEND_RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9]*$").expect("static regex"))
}

fn secret_name_re() -> &'static Regex {
    SECRET_NAME_RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.\-]*$").expect("static regex"))
}

/// Secret names become env-style keys inside the bundle.
pub fn validate_secret_name(name: &str) -> Result<()> {
    if name.len() > 128 || !secret_name_re().is_match(name) {
        return Err(KeelError::InvalidName(name.to_string()));
    }
    Ok(())
}

impl SecretLocator {
    pub fn new(backend: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            path: path.into(),
        }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for SecretLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.backend, self.path)
    }
}

impl FromStr for SecretLocator {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self> {
        let (backend, path) = s
            .split_once(':')
            .ok_or_else(|| KeelError::InvalidLocator(s.to_string()))?;
        if !backend_re().is_match(backend) || path.trim().is_empty() {
            return Err(KeelError::InvalidLocator(s.to_string()));
        }
        Ok(Self::new(backend, path))
    }
}

impl TryFrom<String> for SecretLocator {
    type Error = KeelError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<SecretLocator> for String {
    fn from(l: SecretLocator) -> Self {
        l.to_string()
    }
}

/// A named reference to a secret. Never carries a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    pub name: String,
    pub from: SecretLocator,
}

impl SecretRef {
    pub fn new(name: impl Into<String>, from: SecretLocator) -> Self {
        Self {
            name: name.into(),
            from,
        }
    }
}

// ---------------------------------------------------------------------------
// ResolvedSecret / SecretSet
// ---------------------------------------------------------------------------

struct LiveToken(Arc<AtomicUsize>);

impl LiveToken {
    fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for LiveToken {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A secret value scoped to a single attempt. Zeroized on drop.
pub struct ResolvedSecret {
    name: String,
    value: Zeroizing<String>,
    _live: LiveToken,
}

impl ResolvedSecret {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The plaintext. Callers must not copy it into anything that outlives the attempt.
    pub fn expose(&self) -> &str {
        &self.value
    }
}

impl fmt::Debug for ResolvedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedSecret")
            .field("name", &self.name)
            .field("value", &"[REDACTED]")
            .finish()
    }
}

/// All secrets resolved for one attempt, keyed by name.
#[derive(Debug, Default)]
pub struct SecretSet {
    secrets: BTreeMap<String, ResolvedSecret>,
}

impl SecretSet {
    pub fn get(&self, name: &str) -> Option<&ResolvedSecret> {
        self.secrets.get(name)
    }

    /// Move one secret out of the set (e.g. the SSH credential).
    pub fn take(&mut self, name: &str) -> Option<ResolvedSecret> {
        self.secrets.remove(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.secrets.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResolvedSecret> {
        self.secrets.values()
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    pub fn merge(&mut self, other: SecretSet) {
        self.secrets.extend(other.secrets);
    }
}

// ---------------------------------------------------------------------------
// SecretMaterializer
// ---------------------------------------------------------------------------

/// Outcome of a name-only resolution check (`keel secrets check`).
#[derive(Debug, Clone, Serialize)]
pub struct SecretCheck {
    pub name: String,
    pub locator: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct SecretMaterializer {
    stores: BTreeMap<String, Arc<dyn SecretStore>>,
    live: Arc<AtomicUsize>,
}

impl Default for SecretMaterializer {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretMaterializer {
    pub fn new() -> Self {
        Self {
            stores: BTreeMap::new(),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn SecretStore>) -> Self {
        self.register(store);
        self
    }

    pub fn register(&mut self, store: Arc<dyn SecretStore>) {
        self.stores.insert(store.backend().to_string(), store);
    }

    /// The `env` and `age` backends configured for a project.
    pub fn from_config(root: &Path, config: &Config) -> Result<Self> {
        let envs_dir = crate::paths::resolve_configured(root, &config.secrets.envs_dir)?;
        let identity = match &config.secrets.identity {
            Some(p) => Some(crate::paths::resolve_configured(root, p)?),
            None => age::default_identity(),
        };
        Ok(Self::new()
            .with_store(Arc::new(EnvStore))
            .with_store(Arc::new(
                AgeEnvStore::new(envs_dir, identity).with_timeout(config.timeouts.secrets()),
            )))
    }

    /// Number of `ResolvedSecret`s from this materializer currently alive.
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn store(&self, backend: &str) -> Result<&Arc<dyn SecretStore>> {
        self.stores
            .get(backend)
            .ok_or_else(|| KeelError::UnknownSecretBackend(backend.to_string()))
    }

    /// Reject refs that could never resolve, without touching any backend.
    pub fn check_refs(&self, refs: &[SecretRef]) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for r in refs {
            validate_secret_name(&r.name)?;
            if !seen.insert(r.name.as_str()) {
                return Err(KeelError::InvalidRequest(format!(
                    "secret '{}' referenced more than once",
                    r.name
                )));
            }
            self.store(r.from.backend())?;
        }
        Ok(())
    }

    /// Resolve every ref or none. On any failure the values already fetched
    /// are dropped (and zeroized) before the error is returned.
    pub fn resolve(&self, refs: &[SecretRef]) -> Result<SecretSet> {
        self.check_refs(refs)?;

        let mut by_backend: BTreeMap<&str, Vec<&SecretRef>> = BTreeMap::new();
        for r in refs {
            by_backend.entry(r.from.backend()).or_default().push(r);
        }

        let mut set = SecretSet::default();
        for (backend, group) in by_backend {
            let store = self.store(backend)?;
            let paths: Vec<&str> = group.iter().map(|r| r.from.path()).collect();
            let values = store.get_many(&paths)?;
            for (r, value) in group.into_iter().zip(values) {
                let value = value.ok_or_else(|| KeelError::SecretUnavailable {
                    name: r.name.clone(),
                })?;
                debug!(secret = %r.name, backend, "resolved secret");
                set.secrets.insert(
                    r.name.clone(),
                    ResolvedSecret {
                        name: r.name.clone(),
                        value,
                        _live: LiveToken::acquire(&self.live),
                    },
                );
            }
        }
        Ok(set)
    }

    /// Resolve each ref on its own and report which ones work. Values are
    /// dropped immediately.
    pub fn check(&self, refs: &[SecretRef]) -> Vec<SecretCheck> {
        refs.iter()
            .map(|r| {
                let outcome = self.resolve(std::slice::from_ref(r)).map(drop);
                SecretCheck {
                    name: r.name.clone(),
                    locator: r.from.to_string(),
                    ok: outcome.is_ok(),
                    error: outcome.err().map(|e| e.to_string()),
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(s: &str) -> SecretLocator {
        s.parse().unwrap()
    }

    fn materializer() -> (SecretMaterializer, Arc<MemoryStore>) {
        let mem = Arc::new(MemoryStore::new());
        mem.insert("db", "hunter2");
        mem.insert("api", "tok-123");
        let m = SecretMaterializer::new().with_store(mem.clone());
        (m, mem)
    }

    #[test]
    fn locator_parse_and_display() {
        let l = loc("age:production#DB_PASSWORD");
        assert_eq!(l.backend(), "age");
        assert_eq!(l.path(), "production#DB_PASSWORD");
        assert_eq!(l.to_string(), "age:production#DB_PASSWORD");
        assert!("nocolon".parse::<SecretLocator>().is_err());
        assert!("Bad:path".parse::<SecretLocator>().is_err());
        assert!("env:".parse::<SecretLocator>().is_err());
    }

    #[test]
    fn locator_serde_as_string() {
        let r = SecretRef::new("DB", loc("env:DB"));
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, r#"{"name":"DB","from":"env:DB"}"#);
    }

    #[test]
    fn resolve_all_and_count_live() {
        let (m, _) = materializer();
        let refs = vec![
            SecretRef::new("DB_PASSWORD", loc("memory:db")),
            SecretRef::new("API_TOKEN", loc("memory:api")),
        ];
        let set = m.resolve(&refs).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.get("DB_PASSWORD").unwrap().expose(), "hunter2");
        assert_eq!(m.live_count(), 2);
        drop(set);
        assert_eq!(m.live_count(), 0);
    }

    #[test]
    fn resolve_is_all_or_nothing() {
        let (m, _) = materializer();
        let refs = vec![
            SecretRef::new("DB_PASSWORD", loc("memory:db")),
            SecretRef::new("MISSING", loc("memory:nope")),
        ];
        let err = m.resolve(&refs).unwrap_err();
        assert!(matches!(err, KeelError::SecretUnavailable { ref name } if name == "MISSING"));
        assert_eq!(m.live_count(), 0);
    }

    #[test]
    fn unreachable_store_reports_backend() {
        let (m, mem) = materializer();
        mem.set_unreachable(true);
        let err = m
            .resolve(&[SecretRef::new("DB_PASSWORD", loc("memory:db"))])
            .unwrap_err();
        assert!(matches!(err, KeelError::SecretStoreUnreachable { ref backend, .. } if backend == "memory"));
    }

    #[test]
    fn unknown_backend_rejected_before_lookup() {
        let (m, _) = materializer();
        let err = m
            .resolve(&[SecretRef::new("X", loc("vault:x"))])
            .unwrap_err();
        assert!(matches!(err, KeelError::UnknownSecretBackend(_)));
    }

    #[test]
    fn duplicate_names_rejected() {
        let (m, _) = materializer();
        let refs = vec![
            SecretRef::new("DB", loc("memory:db")),
            SecretRef::new("DB", loc("memory:api")),
        ];
        assert!(matches!(
            m.resolve(&refs),
            Err(KeelError::InvalidRequest(_))
        ));
    }

    #[test]
    fn debug_never_prints_value() {
        let (m, _) = materializer();
        let set = m
            .resolve(&[SecretRef::new("DB_PASSWORD", loc("memory:db"))])
            .unwrap();
        let dbg = format!("{set:?}");
        assert!(dbg.contains("DB_PASSWORD"));
        assert!(!dbg.contains("hunter2"));
    }

    #[test]
    fn check_reports_names_only() {
        let (m, _) = materializer();
        let checks = m.check(&[
            SecretRef::new("DB_PASSWORD", loc("memory:db")),
            SecretRef::new("GONE", loc("memory:gone")),
        ]);
        assert!(checks[0].ok);
        assert!(!checks[1].ok);
        let json = serde_json::to_string(&checks).unwrap();
        assert!(!json.contains("hunter2"));
        assert_eq!(m.live_count(), 0);
    }
}
