use crate::output::print_json;
use anyhow::Context;
use chrono::Utc;
use clap::Subcommand;
use keel_core::io;
use keel_core::machine::approval::{
    encode_public_key, encode_signing_key, generate_signing_key, parse_signing_key,
};
use keel_core::machine::ApprovalEvent;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

#[derive(Subcommand, Debug)]
pub enum ApprovalSubcommand {
    /// Generate an approver key pair; prints the public key for config
    Keygen {
        /// Where to write the private key
        #[arg(long)]
        out: PathBuf,
        /// Overwrite an existing key file
        #[arg(long)]
        force: bool,
    },

    /// Sign an approval for one attempt
    Sign {
        /// Attempt id being approved
        attempt_id: u64,
        /// Approver id as registered in config
        #[arg(long)]
        approver: String,
        /// Private key file written by `keel approval keygen`
        #[arg(long)]
        key: PathBuf,
        /// Write the event here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

pub fn run(subcmd: ApprovalSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ApprovalSubcommand::Keygen { out, force } => keygen(&out, force, json),
        ApprovalSubcommand::Sign {
            attempt_id,
            approver,
            key,
            out,
        } => sign(attempt_id, &approver, &key, out.as_deref()),
    }
}

fn keygen(out: &Path, force: bool, json: bool) -> anyhow::Result<()> {
    if out.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", out.display());
    }
    let key = generate_signing_key();
    let encoded = encode_signing_key(&key);
    // NamedTempFile creates the file owner-only before the key is written.
    io::atomic_write(out, encoded.as_bytes())
        .with_context(|| format!("failed to write {}", out.display()))?;
    let public_key = encode_public_key(&key.verifying_key());

    if json {
        print_json(&serde_json::json!({
            "key_file": out.display().to_string(),
            "public_key": public_key,
        }))?;
    } else {
        println!("Wrote private key to {}", out.display());
        println!("Register the approver in .keel/config.yaml:");
        println!("  approvals:");
        println!("    approvers:");
        println!("      - id: <approver-id>");
        println!("        public_key: {public_key}");
    }
    Ok(())
}

fn sign(attempt_id: u64, approver: &str, key_path: &Path, out: Option<&Path>) -> anyhow::Result<()> {
    let raw = Zeroizing::new(
        std::fs::read_to_string(key_path)
            .with_context(|| format!("failed to read key {}", key_path.display()))?,
    );
    let key = parse_signing_key(&raw)?;
    let event = ApprovalEvent::sign(&key, attempt_id, approver, Utc::now());

    match out {
        Some(path) => {
            let data = serde_json::to_vec_pretty(&event)?;
            io::atomic_write(path, &data)
                .with_context(|| format!("failed to write {}", path.display()))?;
            eprintln!("Wrote approval for attempt {attempt_id} to {}", path.display());
        }
        None => print_json(&event)?,
    }
    Ok(())
}
