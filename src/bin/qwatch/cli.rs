use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "qwatch",
    author,
    version = gpuq::core::version(),
    about = "Watch the job queue for failures and post them to a webhook",
    styles = gpuq::utils::STYLES
)]
pub struct QWatch {
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

    /// Incoming-webhook URL (default: $SLACK_WEBHOOK_URL)
    #[arg(long)]
    pub slack_api_url: Option<String>,

    /// The configuration file to use
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}
