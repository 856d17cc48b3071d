use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    about = "Scripted multi-user world core serving a local session",
    version
)]
pub struct Args {
    /// Directory containing world.toml and the object scripts
    /// (default: demos/meadow)
    #[arg(long)]
    pub world_root: Option<PathBuf>,

    /// Optional TOML config file; command-line flags win over it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Object id the interactive session attaches to
    #[arg(long)]
    pub avatar: Option<String>,

    /// Wall-clock budget for one script execution, in milliseconds
    #[arg(long)]
    pub script_timeout_ms: Option<u64>,
}
