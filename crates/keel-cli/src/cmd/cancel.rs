use crate::output::{print_attempt, print_json};
use std::path::Path;

pub fn run(root: &Path, id: u64, actor: Option<String>, json: bool) -> anyhow::Result<i32> {
    let machine = super::open_machine(root)?;
    let actor = super::actor(actor);
    let attempt = super::runtime()?.block_on(machine.cancel(id, &actor))?;
    if json {
        print_json(&attempt)?;
    } else {
        print_attempt(&attempt);
    }
    Ok(attempt.state.exit_code())
}
