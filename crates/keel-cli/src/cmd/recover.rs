use crate::output::{print_json, print_table};
use std::path::Path;

pub fn run(root: &Path, older_than_minutes: u64, json: bool) -> anyhow::Result<()> {
    let machine = super::open_machine(root)?;
    let max_age = chrono::Duration::minutes(older_than_minutes as i64);
    let settled = super::runtime()?.block_on(machine.recover(max_age))?;

    if json {
        return print_json(&settled);
    }
    if settled.is_empty() {
        println!("Nothing to recover.");
        return Ok(());
    }
    let rows = settled
        .iter()
        .map(|a| vec![a.id.to_string(), a.target.clone(), a.state.to_string()])
        .collect();
    print_table(&["ID", "TARGET", "STATE"], rows);
    Ok(())
}
