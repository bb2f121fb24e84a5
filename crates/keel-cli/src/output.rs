use chrono::{DateTime, SecondsFormat, Utc};
use keel_core::machine::DeploymentAttempt;
use serde::Serialize;

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{json}");
    Ok(())
}

pub fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let line = |cells: Vec<String>| {
        let padded: Vec<String> = cells
            .iter()
            .enumerate()
            .map(|(i, cell)| {
                let w = widths.get(i).copied().unwrap_or(0);
                format!("{cell:w$}")
            })
            .collect();
        println!("{}", padded.join("  ").trim_end());
    };

    line(headers.iter().map(|h| h.to_string()).collect());
    line(widths.iter().map(|&w| "-".repeat(w)).collect());
    for row in rows {
        line(row);
    }
}

pub fn timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Short digest for tables: `sha256:0123456789ab`.
pub fn short_digest(attempt: &DeploymentAttempt) -> String {
    match attempt.digest() {
        Some(d) => format!("sha256:{}", &d.hex()[..12]),
        None => "-".to_string(),
    }
}

/// Human-readable block for one attempt.
pub fn print_attempt(attempt: &DeploymentAttempt) {
    println!("Attempt {}", attempt.id);
    println!("  target:       {}", attempt.target);
    println!("  state:        {}", attempt.state);
    match &attempt.artifact {
        Some(a) => println!("  artifact:     {a}"),
        None => println!("  artifact:     -"),
    }
    println!("  fingerprint:  {}", attempt.bundle_fingerprint.as_str());
    println!("  requested by: {}", attempt.requested_by);
    println!("  started:      {}", timestamp(&attempt.started_at));
    println!("  updated:      {}", timestamp(&attempt.updated_at));
    if let Some(approval) = &attempt.approval {
        println!(
            "  approved by:  {} at {}",
            approval.approver_id,
            timestamp(&approval.accepted_at)
        );
    }
    if let Some(kg) = &attempt.known_good {
        match &kg.version {
            Some(v) => println!("  known good:   {v}"),
            None => println!("  known good:   none (first deployment)"),
        }
    }
    if let Some(outcome) = &attempt.outcome {
        let mut line = outcome.failure.as_str().to_string();
        if let Some(phase) = outcome.phase {
            line.push_str(&format!(" during {phase}"));
        }
        if let Some(code) = outcome.exit_code {
            line.push_str(&format!(" (exit {code})"));
        }
        println!("  failure:      {line}");
    }
}
