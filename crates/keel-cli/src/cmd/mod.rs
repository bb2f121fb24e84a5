pub mod approval;
pub mod approve;
pub mod audit;
pub mod cancel;
pub mod config;
pub mod deploy;
pub mod init;
pub mod list;
pub mod recover;
pub mod secrets;
pub mod serve;
pub mod status;
pub mod targets;

use anyhow::Context;
use keel_core::machine::DeploymentStateMachine;
use std::path::Path;

/// Open the project's state machine (config, database, secret backends).
pub(crate) fn open_machine(root: &Path) -> anyhow::Result<DeploymentStateMachine> {
    DeploymentStateMachine::from_project(root)
        .with_context(|| format!("failed to open keel project at {}", root.display()))
}

/// Actor recorded in the audit trail: `--as`, then `KEEL_ACTOR`, then `$USER`.
pub(crate) fn actor(explicit: Option<String>) -> String {
    explicit
        .or_else(|| std::env::var("USER").ok())
        .filter(|a| !a.is_empty())
        .unwrap_or_else(|| "operator".to_string())
}

pub(crate) fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("failed to start async runtime")
}
