use crate::output::{print_json, print_table};
use clap::Subcommand;
use keel_core::secrets::SecretRef;
use std::path::Path;

#[derive(Subcommand, Debug)]
pub enum SecretsSubcommand {
    /// Resolve every configured secret reference once and report which work
    Check {
        /// Only check secrets used by this target
        #[arg(long)]
        target: Option<String>,
    },
}

pub fn run(root: &Path, subcmd: SecretsSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        SecretsSubcommand::Check { target } => check(root, target.as_deref(), json),
    }
}

/// Values are resolved and dropped immediately; only names and locators are printed.
fn check(root: &Path, target: Option<&str>, json: bool) -> anyhow::Result<()> {
    let machine = super::open_machine(root)?;
    let config = machine.config();

    if let Some(want) = target {
        config.target(want)?;
    }

    let mut refs: Vec<SecretRef> = config.bundle.secrets.clone();
    refs.push(SecretRef::new(
        "bundle-key",
        config.bundle.encryption_key.clone(),
    ));
    for (name, t) in &config.targets {
        if target.is_some_and(|want| want != name) {
            continue;
        }
        if let Some(credential) = &t.credential {
            refs.push(SecretRef::new(format!("credential.{name}"), credential.clone()));
        }
    }
    let results = machine.materializer().check(&refs);
    let failed = results.iter().filter(|r| !r.ok).count();

    if json {
        print_json(&results)?;
    } else {
        let rows = results
            .iter()
            .map(|r| {
                vec![
                    r.name.clone(),
                    r.locator.clone(),
                    if r.ok { "ok".to_string() } else { "FAILED".to_string() },
                    r.error.clone().unwrap_or_default(),
                ]
            })
            .collect();
        print_table(&["NAME", "LOCATOR", "STATUS", "ERROR"], rows);
    }

    if failed > 0 {
        anyhow::bail!("{failed} secret reference(s) did not resolve");
    }
    Ok(())
}
