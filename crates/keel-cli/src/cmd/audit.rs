use crate::output::{print_json, print_table, timestamp};
use std::path::Path;

pub fn run(root: &Path, id: Option<u64>, verify: bool, json: bool) -> anyhow::Result<()> {
    if id.is_none() && !verify {
        anyhow::bail!("give an attempt id, --verify, or both");
    }
    let machine = super::open_machine(root)?;

    // Verify first so a broken chain is reported before any records are shown.
    let verified = if verify {
        Some(machine.verify_audit()?)
    } else {
        None
    };
    let records = match id {
        Some(id) => Some(machine.audit(id)?),
        None => None,
    };

    if json {
        return print_json(&serde_json::json!({
            "records": records,
            "verified": verified,
        }));
    }

    if let Some(records) = &records {
        let rows = records
            .iter()
            .map(|r| {
                Ok(vec![
                    r.sequence_no.to_string(),
                    r.from_state.to_string(),
                    r.to_state.to_string(),
                    r.actor.clone(),
                    timestamp(&r.timestamp),
                    serde_json::to_string(&r.detail)?,
                ])
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        print_table(&["SEQ", "FROM", "TO", "ACTOR", "TIME", "DETAIL"], rows);
    }
    if let Some(n) = verified {
        println!("Audit chain verified: {n} record(s).");
    }
    Ok(())
}
