use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "qrund",
    author,
    version = gpuq::core::version(),
    about = "GPU job runner daemon: pulls jobs from the shared queue and runs them on this host's GPUs",
    styles = gpuq::utils::STYLES
)]
pub struct QRunD {
    /// MySQL server host
    #[arg(long)]
    pub host: Option<String>,

    /// MySQL user
    #[arg(long)]
    pub user: Option<String>,

    /// MySQL password
    #[arg(long)]
    pub password: Option<String>,

    /// MySQL database name
    #[arg(long)]
    pub database: Option<String>,

    /// GPU indices this runner may hand to jobs, e.g. "0,1,2" (default: all)
    #[arg(long)]
    pub gpus: Option<String>,

    /// A GPU counts as free when its used-memory fraction is at or below this
    #[arg(long)]
    pub max_gpu_memory_used: Option<f64>,

    /// Root directory for per-execution workspaces
    #[arg(long)]
    pub temp_dir_root: Option<PathBuf>,

    /// Finished workspaces are moved here
    #[arg(long)]
    pub trash_dir_root: Option<PathBuf>,

    /// Shared git clone cache
    #[arg(long)]
    pub repo_cache_dir: Option<PathBuf>,

    /// Maximum number of jobs running at once on this host
    #[arg(long)]
    pub max_parallel: Option<usize>,

    /// Labels offered against jobs' required_labels
    #[arg(long, num_args = 1..)]
    pub labels: Vec<String>,

    /// Runner name registered in the queue (default: hostname)
    #[arg(long)]
    pub name: Option<String>,

    /// Run headless, without the terminal UI
    #[arg(long)]
    pub no_tui: bool,

    /// The configuration file to use
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}
