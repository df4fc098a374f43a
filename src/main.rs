//! Volley - ephemeral fleet provisioning and deployment

use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use volley::orchestrator::{Orchestrator, RunConfig};
use volley::provider::{create_provider, ProviderKind};
use volley::topology::Topology;

/// Volley - provision an isolated fleet, deploy to it, tear it down
#[derive(Parser, Debug)]
#[command(name = "volley", version, about, long_about = None)]
struct Cli {
    /// Path to the topology file
    config: PathBuf,

    /// Path to the playbook; the generated connectivity artifacts land in
    /// its parent directory
    #[arg(short = 'p', long, default_value = "./deploy/playbook.yml")]
    playbook: PathBuf,

    /// Deployment name, used to tag every created resource
    #[arg(short = 'd', long, default_value = "volley")]
    deployment: String,

    /// Topology parameter as KEY:VALUE, repeatable
    #[arg(short = 's', long = "set", value_name = "KEY:VALUE")]
    set: Vec<String>,

    /// Validate provider requests without creating anything
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Pause for input after the playbook, before teardown
    #[arg(long)]
    wait: bool,

    /// Cloud provider backend
    #[arg(long, default_value = "aws")]
    provider: ProviderKind,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut parameters = HashMap::new();
    for pair in &cli.set {
        let (key, value) = pair
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("invalid parameter {pair:?}, expected KEY:VALUE"))?;
        parameters.insert(key.to_string(), value.to_string());
    }

    let source = tokio::fs::read_to_string(&cli.config)
        .await
        .map_err(|e| anyhow::anyhow!("failed to read topology file {:?}: {}", cli.config, e))?;
    let topology = Topology::load(&source, &parameters)?;

    let provider = create_provider(cli.provider)?;
    let orchestrator = Orchestrator::new(
        provider,
        RunConfig {
            deployment: cli.deployment,
            playbook: cli.playbook,
            dry_run: cli.dry_run,
            wait_before_teardown: cli.wait,
        },
    );

    let code = orchestrator.run(topology).await?;
    std::process::exit(code);
}
