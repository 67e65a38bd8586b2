use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use stagehand_master::{relay, Master, MasterConfig};

#[derive(Parser, Debug)]
#[command(name = "stagehandd", version, about = "Stagehand test orchestration master")]
struct Args {
    /// Path to the master configuration file
    #[arg(short, long, env = "STAGEHAND_CONFIG", default_value = "stagehand.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = MasterConfig::load(&args.config)?;
    stagehand_master::test_log::ensure_log_directory(&config.log_directory)?;

    info!(
        "Starting Stagehand master on http://{}{} ({} scenarios)",
        config.listen_addr(),
        config.endpoints_prefix,
        config.scenarios.len()
    );

    let master = Arc::new(Master::new(config));
    relay::serve(master).await
}
