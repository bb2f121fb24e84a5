use anyhow::Context;
use keel_core::{config::Config, io, paths};
use std::path::Path;

/// Entries keel adds to the project's `.gitignore`.
const GITIGNORE_ENTRIES: &[&str] = &[".keel/keel.db", ".keel/registry/", "*.approval-key"];

pub fn run(root: &Path) -> anyhow::Result<()> {
    let project_name = project_name(root);

    println!("Initializing keel in: {}", root.display());

    for dir in [paths::KEEL_DIR, paths::SECRETS_DIR, paths::REGISTRY_DIR] {
        let p = root.join(dir);
        io::ensure_dir(&p).with_context(|| format!("failed to create {}", p.display()))?;
    }

    if paths::config_path(root).exists() {
        println!("  exists:  {}", paths::CONFIG_FILE);
    } else {
        Config::new(&project_name)
            .save(root)
            .context("failed to write config.yaml")?;
        println!("  created: {}", paths::CONFIG_FILE);
    }

    for entry in GITIGNORE_ENTRIES {
        io::ensure_gitignore_entry(root, entry).context("failed to update .gitignore")?;
    }

    println!("\nNext steps:");
    println!("  1. Add targets and bundle secrets to {}", paths::CONFIG_FILE);
    println!("  2. keel approval keygen --out <name>.approval-key   (register the printed public key)");
    println!("  3. keel secrets check");
    println!("  4. keel deploy <target> --artifact <file>");
    Ok(())
}

/// Directory name folded into the shared name grammar; `project` if nothing survives.
fn project_name(root: &Path) -> String {
    let raw = root
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let folded: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '-' })
        .collect();
    let trimmed = folded.trim_matches(|c: char| c == '-' || c == '.');
    if paths::validate_name(trimmed).is_ok() {
        trimmed.to_string()
    } else {
        "project".to_string()
    }
}
