use crate::output::{print_attempt, print_json};
use std::path::Path;

pub fn run(root: &Path, id: u64, json: bool) -> anyhow::Result<i32> {
    let machine = super::open_machine(root)?;
    let attempt = machine.status(id)?;
    if json {
        print_json(&attempt)?;
    } else {
        print_attempt(&attempt);
        for h in &attempt.history {
            println!(
                "    {}  {:<16}  {}",
                crate::output::timestamp(&h.at),
                h.state.as_str(),
                h.actor
            );
        }
    }
    Ok(attempt.state.exit_code())
}
