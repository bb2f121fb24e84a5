use clap::{Parser, Subcommand};
use keel_cli::cmd::{
    self, approval::ApprovalSubcommand, config::ConfigSubcommand, deploy::DeployArgs,
    secrets::SecretsSubcommand, targets::TargetsSubcommand,
};
use keel_cli::root;
use keel_core::types::AttemptState;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "keel",
    about = "Approval-gated deployments: publish, approve, transfer, verify, roll back",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .keel/ or .git/)
    #[arg(long, global = true, env = "KEEL_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize keel in the current project
    Init,

    /// Request a deployment; stops at the approval gate
    Deploy(DeployArgs),

    /// Submit a signed approval and run the deployment
    Approve {
        /// Attempt id
        id: u64,
        /// ApprovalEvent JSON file (`-` for stdin)
        #[arg(long)]
        event: PathBuf,
    },

    /// Approver key management and signing
    Approval {
        #[command(subcommand)]
        subcommand: ApprovalSubcommand,
    },

    /// Show one attempt
    Status {
        /// Attempt id
        id: u64,
    },

    /// List attempts, newest first
    List {
        #[arg(long)]
        target: Option<String>,
        #[arg(long)]
        state: Option<AttemptState>,
    },

    /// Cancel an attempt that has not reached its target yet
    Cancel {
        /// Attempt id
        id: u64,
        /// Cancelling operator
        #[arg(long = "as", env = "KEEL_ACTOR")]
        actor: Option<String>,
    },

    /// Show an attempt's audit trail and/or verify the whole hash chain
    Audit {
        /// Attempt id
        id: Option<u64>,
        #[arg(long)]
        verify: bool,
    },

    /// Show configured targets and their running versions
    Targets {
        #[command(subcommand)]
        subcommand: Option<TargetsSubcommand>,
    },

    /// Check secret references
    Secrets {
        #[command(subcommand)]
        subcommand: SecretsSubcommand,
    },

    /// Inspect and validate .keel/config.yaml
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Settle attempts interrupted by a crash
    Recover {
        /// Only touch attempts idle for at least this long
        #[arg(long, default_value = "0")]
        older_than_minutes: u64,
    },

    /// Run the HTTP API
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        #[arg(long, default_value = "7070")]
        port: u16,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve { .. }
        | Commands::Deploy(_)
        | Commands::Approve { .. }
        | Commands::Recover { .. }
        | Commands::Targets {
            subcommand: Some(_),
        } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());
    let json = cli.json;

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root).map(|()| 0),
        Commands::Deploy(args) => cmd::deploy::run(&root, args, json),
        Commands::Approve { id, event } => cmd::approve::run(&root, id, &event, json),
        Commands::Approval { subcommand } => cmd::approval::run(subcommand, json).map(|()| 0),
        Commands::Status { id } => cmd::status::run(&root, id, json),
        Commands::List { target, state } => {
            cmd::list::run(&root, target.as_deref(), state, json).map(|()| 0)
        }
        Commands::Cancel { id, actor } => cmd::cancel::run(&root, id, actor, json),
        Commands::Audit { id, verify } => cmd::audit::run(&root, id, verify, json).map(|()| 0),
        Commands::Targets { subcommand } => cmd::targets::run(&root, subcommand, json).map(|()| 0),
        Commands::Secrets { subcommand } => cmd::secrets::run(&root, subcommand, json).map(|()| 0),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, json).map(|()| 0),
        Commands::Recover { older_than_minutes } => {
            cmd::recover::run(&root, older_than_minutes, json).map(|()| 0)
        }
        Commands::Serve { bind, port } => cmd::serve::run(&root, &bind, port).map(|()| 0),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}
