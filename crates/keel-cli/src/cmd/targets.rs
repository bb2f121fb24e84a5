use crate::output::{print_json, print_table};
use clap::Subcommand;
use keel_core::publish::Digest;
use std::path::Path;

#[derive(Subcommand, Debug)]
pub enum TargetsSubcommand {
    /// Release a host left degraded by a failed rollback, after checking it by hand
    #[command(disable_version_flag = true)]
    Repair {
        /// Target name
        name: String,
        /// Digest now running on the host, as confirmed by the operator
        #[arg(long, required_unless_present = "none", conflicts_with = "none")]
        version: Option<String>,
        /// Nothing is active on the host
        #[arg(long)]
        none: bool,
        /// Repairing operator
        #[arg(long = "as", env = "KEEL_ACTOR")]
        actor: Option<String>,
    },
}

pub fn run(root: &Path, subcmd: Option<TargetsSubcommand>, json: bool) -> anyhow::Result<()> {
    match subcmd {
        None => list(root, json),
        Some(TargetsSubcommand::Repair {
            name,
            version,
            none: _,
            actor,
        }) => repair(root, &name, version.as_deref(), actor, json),
    }
}

fn repair(
    root: &Path,
    name: &str,
    version: Option<&str>,
    actor: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let version = version.map(str::parse::<Digest>).transpose()?;
    let machine = super::open_machine(root)?;
    let actor = super::actor(actor);
    let record = super::runtime()?.block_on(machine.repair_target(name, version, &actor))?;
    if json {
        return print_json(&record);
    }
    let version = record
        .current_version
        .as_ref()
        .map_or_else(|| "nothing active".to_string(), ToString::to_string);
    println!("Target {name} repaired by {actor}: {version}");
    Ok(())
}

/// Configured targets joined with what the store knows about them.
fn list(root: &Path, json: bool) -> anyhow::Result<()> {
    let machine = super::open_machine(root)?;
    let records = machine.targets()?;
    let rows: Vec<serde_json::Value> = machine
        .config()
        .targets
        .iter()
        .map(|(name, cfg)| {
            let record = records.iter().find(|r| &r.host == name);
            serde_json::json!({
                "name": name,
                "address": cfg.address,
                "current_version": record.and_then(|r| r.current_version.as_ref()),
                "claimed_by": record.and_then(|r| r.claimed_by),
                "degraded_by": record.and_then(|r| r.degraded_by),
            })
        })
        .collect();

    if json {
        return print_json(&rows);
    }
    let cell = |v: &serde_json::Value| match v {
        serde_json::Value::Null => "-".to_string(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let table = rows
        .iter()
        .map(|r| {
            ["name", "address", "current_version", "claimed_by", "degraded_by"]
                .iter()
                .map(|k| cell(&r[*k]))
                .collect()
        })
        .collect();
    print_table(&["NAME", "ADDRESS", "VERSION", "CLAIMED BY", "DEGRADED BY"], table);
    Ok(())
}
