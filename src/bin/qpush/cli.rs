use clap::Parser;
use std::path::PathBuf;

/// Flags are typed with a `+` prefix on the command line (`++repo-url`,
/// `+n`); main rewrites them to the standard form before parsing so command
/// tokens starting with `-` never collide with the submitter's own flags.
#[derive(Debug, Parser)]
#[command(
    name = "qpush",
    author,
    version = gpuq::core::version(),
    about = "Push a job onto the shared GPU job queue",
    styles = gpuq::utils::STYLES
)]
pub struct QPush {
    /// Command executed inside the prepared workspace (folded into one
    /// value by the argv rewrite)
    #[arg(long, required = true)]
    pub command: String,

    /// Git repository to clone
    #[arg(long, required = true)]
    pub repo_url: String,

    /// Commit the working tree is pinned to
    #[arg(long, required = true)]
    pub commit_hash: String,

    /// Higher runs earlier
    #[arg(long, default_value_t = 5)]
    pub priority: i32,

    /// Only runners offering all of these labels may take the job
    #[arg(long)]
    pub labels: Vec<String>,

    /// Number of GPUs the job needs
    #[arg(long, default_value_t = 1)]
    pub num_gpu: i32,

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

    /// Print the command instead of pushing it
    #[arg(short = 'n', long)]
    pub no_push: bool,

    /// The configuration file to use
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}
