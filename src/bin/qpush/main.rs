use anyhow::{Context, Result};
use clap::Parser;
use gpuq::config::load_config;
use gpuq::core::model::{join_list, JobStatus, NewJob};
use gpuq::core::store::Store;
use gpuq::utils::rewrite_plus_args;

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    let argv = rewrite_plus_args(std::env::args());
    let args = cli::QPush::parse_from(argv);

    tracing_subscriber::fmt()
        .with_max_level(args.verbose)
        .init();

    let command = args.command;
    if args.no_push {
        println!("{}", command);
        return Ok(());
    }

    let mut config = load_config(args.config.as_ref())?;
    if let Some(host) = args.host {
        config.db.host = host;
    }
    if let Some(user) = args.user {
        config.db.user = user;
    }
    if let Some(password) = args.password {
        config.db.password = password;
    }
    if let Some(database) = args.database {
        config.db.database = database;
    }

    let store = Store::connect(&config.db, config.timezone()?)
        .await
        .context("Failed to connect to the job store")?;

    let job = store
        .create_job(NewJob {
            repo_url: args.repo_url,
            commit_hash: args.commit_hash,
            status: JobStatus::Queue,
            command,
            priority: args.priority,
            num_gpu: args.num_gpu,
            required_labels: join_list(&args.labels),
            executor: "python_venv".to_string(),
            ..Default::default()
        })
        .await
        .context("Failed to push job")?;

    println!(
        "Pushed job {} (priority {}, num_gpu {}): {}",
        job.id, job.priority, job.num_gpu, job.command
    );
    Ok(())
}
