use crate::output::{print_attempt, print_json};
use anyhow::Context;
use keel_core::machine::ApprovalEvent;
use std::io::Read;
use std::path::Path;

/// Submit a signed approval and drive the attempt to a terminal state.
pub fn run(root: &Path, id: u64, event_path: &Path, json: bool) -> anyhow::Result<i32> {
    let event = read_event(event_path)?;
    let machine = super::open_machine(root)?;
    let attempt = super::runtime()?.block_on(machine.submit_approval(id, event))?;

    if json {
        print_json(&attempt)?;
    } else {
        print_attempt(&attempt);
    }
    Ok(attempt.state.exit_code())
}

/// Read an `ApprovalEvent` from a JSON file, or stdin for `-`.
pub(crate) fn read_event(path: &Path) -> anyhow::Result<ApprovalEvent> {
    let raw = if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read approval from stdin")?;
        buf
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("failed to read approval {}", path.display()))?
    };
    serde_json::from_str(&raw).context("approval is not a valid ApprovalEvent")
}
