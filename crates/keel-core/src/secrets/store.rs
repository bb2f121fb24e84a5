use crate::error::{KeelError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use zeroize::Zeroizing;

/// A resolve-by-name secret backend. There is deliberately no way to list values.
///
/// `Ok(None)` means the backend answered and the secret does not exist;
/// `Err(SecretStoreUnreachable)` means the backend could not be asked.
pub trait SecretStore: Send + Sync {
    /// Scheme this store answers for in a `SecretLocator`.
    fn backend(&self) -> &str;

    fn get(&self, path: &str) -> Result<Option<Zeroizing<String>>>;

    /// Batched lookup. Backends with an expensive unlock step override this.
    fn get_many(&self, paths: &[&str]) -> Result<Vec<Option<Zeroizing<String>>>> {
        paths.iter().map(|p| self.get(p)).collect()
    }
}

/// Process environment variables (`env:NAME`).
#[derive(Debug, Default)]
pub struct EnvStore;

impl SecretStore for EnvStore {
    fn backend(&self) -> &str {
        "env"
    }

    fn get(&self, path: &str) -> Result<Option<Zeroizing<String>>> {
        match std::env::var(path) {
            Ok(v) => Ok(Some(Zeroizing::new(v))),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(std::env::VarError::NotUnicode(_)) => Err(KeelError::SecretStoreUnreachable {
                backend: "env".to_string(),
                reason: format!("{path} is not valid unicode"),
            }),
        }
    }
}

/// In-memory store (`memory:path`) for tests and embedding.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Zeroizing<String>>>,
    unreachable: AtomicBool,
    delay_ms: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<String>, value: impl Into<String>) {
        if let Ok(mut values) = self.values.lock() {
            values.insert(path.into(), Zeroizing::new(value.into()));
        }
    }

    pub fn remove(&self, path: &str) {
        if let Ok(mut values) = self.values.lock() {
            values.remove(path);
        }
    }

    /// Simulate an outage: every lookup fails with `SecretStoreUnreachable`.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Simulate a slow backend: every lookup blocks for `delay` first.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis().try_into().unwrap_or(u64::MAX), Ordering::SeqCst);
    }
}

impl SecretStore for MemoryStore {
    fn backend(&self) -> &str {
        "memory"
    }

    fn get(&self, path: &str) -> Result<Option<Zeroizing<String>>> {
        let unreachable = || KeelError::SecretStoreUnreachable {
            backend: "memory".to_string(),
            reason: "store offline".to_string(),
        };
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(unreachable());
        }
        let values = self.values.lock().map_err(|_| unreachable())?;
        Ok(values.get(path).cloned())
    }
}
