use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "mcp-bridge-gateway",
    version,
    about = "Aggregation gateway for Model Context Protocol backends"
)]
pub struct Cli {
    /// Path to the gateway configuration file.
    #[arg(short, long, default_value = "config/gateway.yaml")]
    pub config: PathBuf,

    /// Validate the configuration and exit without starting any backend.
    #[arg(long)]
    pub check_config: bool,
}
