use std::path::PathBuf;

use tracing::Level;

#[derive(Debug, Clone, clap::Parser)]
#[command(about = "Account and job usage statistics for a Slurm cluster")]
pub struct Args {
    /// TOML settings file. Every key can also be set as `PORTAL__<SECTION>__<KEY>`.
    #[arg(long, short)]
    pub config: Option<PathBuf>,
    #[arg(long, default_value_t = Level::INFO)]
    pub log_level: Level,
}
