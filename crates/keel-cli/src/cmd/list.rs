use crate::output::{print_json, print_table, short_digest, timestamp};
use keel_core::types::AttemptState;
use std::path::Path;

pub fn run(
    root: &Path,
    target: Option<&str>,
    state: Option<AttemptState>,
    json: bool,
) -> anyhow::Result<()> {
    let machine = super::open_machine(root)?;
    let attempts: Vec<_> = machine
        .list()?
        .into_iter()
        .filter(|a| target.map_or(true, |t| a.target == t))
        .filter(|a| state.map_or(true, |s| a.state == s))
        .collect();

    if json {
        return print_json(&attempts);
    }
    if attempts.is_empty() {
        println!("No deployment attempts.");
        return Ok(());
    }
    let rows = attempts
        .iter()
        .map(|a| {
            vec![
                a.id.to_string(),
                a.target.clone(),
                a.state.to_string(),
                short_digest(a),
                a.requested_by.clone(),
                timestamp(&a.updated_at),
            ]
        })
        .collect();
    print_table(&["ID", "TARGET", "STATE", "DIGEST", "REQUESTED BY", "UPDATED"], rows);
    Ok(())
}
