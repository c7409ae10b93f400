use anyhow::{Context, Result};
use clap::Parser;
use gpuq::config::load_config;
use gpuq::core::executor::BackendRegistry;
use gpuq::core::get_data_dir;
use gpuq::core::gpu::{GpuLedger, NvmlProbe};
use gpuq::core::manager::ExecutorManager;
use gpuq::core::store::Store;
use gpuq::display::{NullScreen, PagedScreen, Screen};
use gpuq::shutdown::{spawn_ctrl_c_watcher, ShutdownFlag};
use gpuq::utils::parse_gpu_indices;
use std::collections::BTreeSet;
use std::sync::Arc;

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::QRunD::parse();

    let mut config = load_config(args.config.as_ref())?;

    // CLI flags override config file values
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
    if let Some(spec) = &args.gpus {
        config.runner.gpus = Some(parse_gpu_indices(spec)?);
    }
    if let Some(threshold) = args.max_gpu_memory_used {
        config.runner.max_gpu_memory_used = threshold;
    }
    if let Some(path) = args.temp_dir_root {
        config.runner.temp_dir_root = path;
    }
    if let Some(path) = args.trash_dir_root {
        config.runner.trash_dir_root = path;
    }
    if let Some(path) = args.repo_cache_dir {
        config.runner.repo_cache_dir = path;
    }
    if let Some(max_parallel) = args.max_parallel {
        config.runner.max_parallel = max_parallel;
    }
    if !args.labels.is_empty() {
        config.runner.labels = args.labels.clone();
    }
    let tz = config.timezone()?;

    // While the TUI owns the terminal, logs go to a rolling file instead.
    let _log_guard = if args.no_tui {
        tracing_subscriber::fmt()
            .with_max_level(args.verbose)
            .init();
        None
    } else {
        let log_dir = get_data_dir()?.join("logs");
        std::fs::create_dir_all(&log_dir)?;
        let appender = tracing_appender::rolling::daily(log_dir, "qrund.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_writer(writer)
            .with_ansi(false)
            .with_max_level(args.verbose)
            .init();
        Some(guard)
    };

    let store = Arc::new(
        Store::connect(&config.db, tz)
            .await
            .context("Failed to connect to the job store")?,
    );
    let probe = NvmlProbe::new(config.runner.max_gpu_memory_used);
    let ledger = Arc::new(GpuLedger::new(&config.gpu, Box::new(probe)));
    let registry = Arc::new(BackendRegistry::builtin());

    let shutdown = ShutdownFlag::new();
    let _ctrl_c = spawn_ctrl_c_watcher(shutdown.clone());

    let screen: Arc<dyn Screen> = if args.no_tui {
        Arc::new(NullScreen::new())
    } else {
        Arc::new(PagedScreen::new(shutdown.clone())?)
    };

    let name = match args.name {
        Some(name) => name,
        None => hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "runner".to_string()),
    };
    let gpus: BTreeSet<u32> = config
        .runner
        .gpus
        .clone()
        .unwrap_or_default()
        .into_iter()
        .collect();
    let labels = config.runner.labels.clone();

    let mut manager = ExecutorManager::new(
        store,
        ledger,
        registry,
        screen,
        shutdown,
        &config.runner,
        name,
        gpus,
        labels,
    );
    manager.run().await
}
