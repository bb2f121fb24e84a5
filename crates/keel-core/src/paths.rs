use crate::error::{KeelError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const KEEL_DIR: &str = ".keel";
pub const CONFIG_FILE: &str = ".keel/config.yaml";
pub const DB_FILE: &str = ".keel/keel.db";
pub const SECRETS_DIR: &str = ".keel/secrets";
pub const REGISTRY_DIR: &str = ".keel/registry";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn keel_dir(root: &Path) -> PathBuf {
    root.join(KEEL_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn db_path(root: &Path) -> PathBuf {
    root.join(DB_FILE)
}

pub fn secrets_dir(root: &Path) -> PathBuf {
    root.join(SECRETS_DIR)
}

pub fn registry_dir(root: &Path) -> PathBuf {
    root.join(REGISTRY_DIR)
}

/// Encrypted env file for `env` inside `dir` (`<dir>/<env>.age`).
pub fn age_env_file(dir: &Path, env: &str) -> PathBuf {
    dir.join(format!("{env}.age"))
}

/// Resolve a configured path: absolute paths stay, `~/` expands to home,
/// everything else is relative to the project root.
pub fn resolve_configured(root: &Path, configured: &str) -> Result<PathBuf> {
    if let Some(rest) = configured.strip_prefix("~/") {
        let home = home::home_dir().ok_or(KeelError::HomeNotFound)?;
        return Ok(home.join(rest));
    }
    let p = Path::new(configured);
    if p.is_absolute() {
        Ok(p.to_path_buf())
    } else {
        Ok(root.join(p))
    }
}

// ---------------------------------------------------------------------------
// Name validation
// ---------------------------------------------------------------------------

static NAME_RE: OnceLock<Regex> = OnceLock::new();

fn name_re() -> &'static Regex {
    NAME_RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9][a-z0-9.\-]*[a-z0-9]$|^[a-z0-9]$").expect("static regex")
    })
}

/// Target, repository, env and approver names share one grammar so they can be
/// used verbatim as file names, table keys and remote argv elements.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 || !name_re().is_match(name) {
        return Err(KeelError::InvalidName(name.to_string()));
    }
    Ok(())
}

static ACTOR_RE: OnceLock<Regex> = OnceLock::new();

/// Actors (requesters, approvers) are recorded in the audit log verbatim.
pub fn validate_actor(actor: &str) -> Result<()> {
    let re = ACTOR_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.@\-]{1,64}$").expect("static regex"));
    if !re.is_match(actor) {
        return Err(KeelError::InvalidRequest(format!("invalid actor '{actor}'")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names() {
        for name in ["host-1", "a", "web.prod-2", "x1"] {
            validate_name(name).unwrap_or_else(|_| panic!("expected valid: {name}"));
        }
    }

    #[test]
    fn invalid_names() {
        for name in [
            "",
            "-starts-with-dash",
            "ends-with-dot.",
            "has spaces",
            "UPPER",
            "a_b",
            "semi;colon",
            "$(whoami)",
        ] {
            assert!(validate_name(name).is_err(), "expected invalid: {name}");
        }
        assert!(validate_name(&"a".repeat(65)).is_err());
    }

    #[test]
    fn actors() {
        assert!(validate_actor("alice@example.com").is_ok());
        assert!(validate_actor("ci_bot-2").is_ok());
        assert!(validate_actor("").is_err());
        assert!(validate_actor("bob smith").is_err());
        assert!(validate_actor("x\ny").is_err());
    }

    #[test]
    fn path_helpers() {
        let root = Path::new("/tmp/proj");
        assert_eq!(
            config_path(root),
            PathBuf::from("/tmp/proj/.keel/config.yaml")
        );
        assert_eq!(db_path(root), PathBuf::from("/tmp/proj/.keel/keel.db"));
        assert_eq!(
            age_env_file(&secrets_dir(root), "production"),
            PathBuf::from("/tmp/proj/.keel/secrets/production.age")
        );
    }

    #[test]
    fn resolve_configured_relative_and_absolute() {
        let root = Path::new("/tmp/proj");
        assert_eq!(
            resolve_configured(root, "keys/id.txt").unwrap(),
            PathBuf::from("/tmp/proj/keys/id.txt")
        );
        assert_eq!(
            resolve_configured(root, "/etc/keel/id.txt").unwrap(),
            PathBuf::from("/etc/keel/id.txt")
        );
    }
}
