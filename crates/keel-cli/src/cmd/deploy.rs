use crate::output::{print_attempt, print_json};
use anyhow::Context;
use clap::Args;
use keel_core::machine::DeployRequest;
use keel_core::publish::{ArtifactSource, BuildOutput, Digest};
use keel_core::types::AttemptState;
use std::path::{Path, PathBuf};

#[derive(Args, Debug)]
pub struct DeployArgs {
    /// Target host name from config
    pub target: String,

    /// Build output to publish and pin
    #[arg(long, conflicts_with = "digest")]
    pub artifact: Option<PathBuf>,

    /// Already-published digest to pin (sha256:<hex>)
    #[arg(long, conflicts_with = "tag")]
    pub digest: Option<String>,

    /// Tag to apply to --artifact, or to resolve once when used alone
    #[arg(long)]
    pub tag: Option<String>,

    /// Registry repository (default: project name)
    #[arg(long)]
    pub repository: Option<String>,

    /// Requesting operator
    #[arg(long = "as", env = "KEEL_ACTOR")]
    pub actor: Option<String>,
}

pub fn run(root: &Path, args: DeployArgs, json: bool) -> anyhow::Result<i32> {
    let machine = super::open_machine(root)?;
    let repository = args
        .repository
        .clone()
        .unwrap_or_else(|| machine.config().project.name.clone());
    let source = source(&args, repository)?;
    let request = DeployRequest {
        target: args.target.clone(),
        source,
        requested_by: super::actor(args.actor),
    };

    let attempt = super::runtime()?.block_on(machine.request(request))?;

    if json {
        print_json(&attempt)?;
    } else {
        print_attempt(&attempt);
        if attempt.state == AttemptState::PendingApproval {
            println!(
                "\nAwaiting approval. An approver runs:\n  keel approval sign {} --approver <id> --key <key-file> --out approval.json\nthen:\n  keel approve {} --event approval.json",
                attempt.id, attempt.id
            );
        }
    }
    Ok(attempt.state.exit_code())
}

fn source(args: &DeployArgs, repository: String) -> anyhow::Result<ArtifactSource> {
    if let Some(path) = &args.artifact {
        let blob = std::fs::read(path)
            .with_context(|| format!("failed to read artifact {}", path.display()))?;
        return Ok(ArtifactSource::Build(BuildOutput {
            repository,
            tag: args.tag.clone(),
            blob,
        }));
    }
    if let Some(digest) = &args.digest {
        let digest: Digest = digest.parse()?;
        return Ok(ArtifactSource::Digest { repository, digest });
    }
    if let Some(tag) = &args.tag {
        return Ok(ArtifactSource::Tag {
            repository,
            tag: tag.clone(),
        });
    }
    anyhow::bail!("name an artifact with --artifact, --digest or --tag")
}
