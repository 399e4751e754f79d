//! Pipeline control binary.
//!
//! Subcommands map to the pipeline's entry points: the full DAG run, a
//! single backend-variant conformance round, the scheduled fuzz campaign,
//! and the standalone policy gates.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use broker_conformance::{
    BackendVariant, DockerRuntime, Pipeline, PipelineConfig, conformance_round, logging,
};

#[derive(Parser)]
#[command(name = "conformance-ctl")]
#[command(about = "Cross-backend conformance and fuzz-regression pipeline")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// -v for debug, -vv for trace
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Workspace of the client library under test
    #[arg(long, default_value = ".", global = true)]
    client_dir: PathBuf,

    /// Root of the keyed cache stores
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Where external artifacts land
    #[arg(long, global = true)]
    artifacts_dir: Option<PathBuf>,

    /// Branch contributing to the dependency-cache key
    #[arg(long, default_value = "main", global = true)]
    branch: String,

    /// Webhook for failure notifications
    #[arg(long, global = true)]
    webhook: Option<String>,

    /// Where to write the structured JSON report
    #[arg(long, global = true)]
    output: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full job DAG
    Run {
        /// Enable live-topology cases
        #[arg(long)]
        integration: bool,

        /// Broker nodes per topology
        #[arg(long, default_value = "3")]
        nodes: usize,

        /// Interposition gateway bind address (0 port for ephemeral)
        #[arg(long)]
        proxy: Option<SocketAddr>,
    },

    /// Run one backend variant's conformance round
    Conformance {
        #[arg(long, value_enum)]
        backend: BackendVariant,

        #[arg(long)]
        integration: bool,

        #[arg(long, default_value = "3")]
        nodes: usize,

        #[arg(long)]
        proxy: Option<SocketAddr>,

        /// Skip the unreachable placeholder in the address list
        #[arg(long)]
        no_placeholder: bool,
    },

    /// Run the scheduled fuzz campaign
    Fuzz {
        /// Iteration budget per target
        #[arg(long, default_value = "100000")]
        runs: u64,

        /// Registered targets, in processing order
        #[arg(long)]
        target: Vec<String>,
    },

    /// Run the policy gates only
    Check,
}

fn base_config(cli: &Cli) -> PipelineConfig {
    let mut config = PipelineConfig {
        client_dir: cli.client_dir.clone(),
        branch: cli.branch.clone(),
        webhook_url: cli.webhook.clone(),
        verbosity: cli.verbose,
        ..PipelineConfig::default()
    };
    if let Some(dir) = &cli.cache_dir {
        config.cache_dir = dir.clone();
    }
    if let Some(dir) = &cli.artifacts_dir {
        config.artifacts_dir = dir.clone();
    }
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let exit_code = match &cli.command {
        Commands::Run {
            integration,
            nodes,
            proxy,
        } => {
            let mut config = base_config(&cli);
            config.integration = *integration;
            config.node_count = *nodes;
            config.proxy_bind = *proxy;
            let pipeline = Pipeline::new(config).context("invalid configuration")?;

            let report = pipeline.run().await?;
            if let Some(path) = &cli.output {
                report.write_json(path)?;
            }
            println!("{report}");
            report.exit_code()
        }

        Commands::Conformance {
            backend,
            integration,
            nodes,
            proxy,
            no_placeholder,
        } => {
            let mut config = base_config(&cli);
            config.backend = *backend;
            config.integration = *integration;
            config.node_count = *nodes;
            config.proxy_bind = *proxy;
            config.placeholder_first = !no_placeholder;
            config.validate().context("invalid configuration")?;

            let report =
                conformance_round(DockerRuntime, &config, *backend, config.base_port).await?;
            println!("{report}");
            i32::from(!report.all_passed())
        }

        Commands::Fuzz { runs, target } => {
            let mut config = base_config(&cli);
            config.fuzz.runs = *runs;
            if !target.is_empty() {
                config.fuzz.targets = target.clone();
            }
            let pipeline = Pipeline::new(config).context("invalid configuration")?;

            let report = pipeline.run_fuzz_campaign().await?;
            println!("{report}");
            i32::from(!report.passed)
        }

        Commands::Check => {
            let config = base_config(&cli);
            let mut failed = 0;
            for check in broker_conformance::POLICY_CHECKS {
                match check.run(&config.client_dir).await {
                    Ok(()) => info!(check = check.name, "gate passed"),
                    Err(e) => {
                        eprintln!("{e}");
                        failed += 1;
                    }
                }
            }
            i32::from(failed > 0)
        }
    };

    std::process::exit(exit_code);
}
