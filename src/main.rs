//! stylecam CLI - runs the frame pipeline from a TOML config.

use std::path::PathBuf;

use clap::Parser;
use stylecam::start_runtime;

#[derive(Debug, Parser)]
#[command(name = "stylecam-cli", version, about = "Real-time style-transfer frame pipeline")]
struct Args {
    /// Path to the TOML configuration.
    #[arg(short, long, default_value = "stylecam.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    start_runtime(&args.config).await?;
    Ok(())
}
