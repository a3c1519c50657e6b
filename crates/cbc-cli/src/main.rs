mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{config::ConfigSubcommand, runs::RunsSubcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "cbc",
    about = "Compliance broker consumer: submit configuration changes for evaluation and publish the verdict",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .cbc/)
    #[arg(long, global = true, env = "CBC_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .cbc/ with a default config
    Init {
        /// Evaluation endpoint invoke URL
        #[arg(long)]
        invoke_url: Option<String>,

        /// Keep objects and compliance records on the local filesystem
        #[arg(long)]
        local: bool,
    },

    /// Show or validate the configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Print the workflow state machine as JSON
    Definition,

    /// Start a run for a trigger event read from a file (or - for stdin)
    Submit {
        file: PathBuf,

        /// Drive the run to completion in this process
        #[arg(long)]
        wait: bool,
    },

    /// Advance due runs until interrupted
    Worker {
        /// Run a single tick and exit
        #[arg(long)]
        once: bool,
    },

    /// Inspect runs
    Runs {
        #[command(subcommand)]
        subcommand: RunsSubcommand,
    },

    /// Serve the HTTP API with a background worker
    Serve {
        /// Port to listen on (0 = OS-assigned)
        #[arg(long, default_value = "8080")]
        port: u16,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Worker { .. } | Commands::Serve { .. } => tracing::Level::INFO,
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

    let result = match cli.command {
        Commands::Init { invoke_url, local } => cmd::init::run(&root, invoke_url.as_deref(), local),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
        Commands::Definition => cmd::definition::run(&root),
        Commands::Submit { file, wait } => cmd::submit::run(&root, &file, wait, cli.json),
        Commands::Worker { once } => cmd::worker::run(&root, once, cli.json),
        Commands::Runs { subcommand } => cmd::runs::run(&root, subcommand, cli.json),
        Commands::Serve { port } => cmd::serve::run(&root, port),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
