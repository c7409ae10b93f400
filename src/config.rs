use crate::core::get_config_dir;
use chrono_tz::Tz;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Deserialize, Debug, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub gpu: GpuConfig,
    /// Timezone for the ISO-8601 timestamps written to the database
    /// (e.g., "Asia/Tokyo", "UTC"). If not set, uses the local timezone.
    /// All processes sharing one queue should agree on this.
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub notify: NotifyConfig,
}

impl Config {
    pub fn timezone(&self) -> anyhow::Result<Option<Tz>> {
        match &self.timezone {
            Some(name) => name
                .parse::<Tz>()
                .map(Some)
                .map_err(|e| anyhow::anyhow!("Invalid timezone {:?}: {}", name, e)),
            None => Ok(None),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_user")]
    pub user: String,
    #[serde(default = "default_db_user")]
    pub password: String,
    #[serde(default = "default_db_name")]
    pub database: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RunnerConfig {
    #[serde(default = "default_temp_dir_root")]
    pub temp_dir_root: PathBuf,
    #[serde(default = "default_trash_dir_root")]
    pub trash_dir_root: PathBuf,
    #[serde(default = "default_repo_cache_dir")]
    pub repo_cache_dir: PathBuf,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// GPU indices this runner may hand to jobs (None = decided by the
    /// runner row / all GPUs).
    #[serde(default)]
    pub gpus: Option<Vec<u32>>,
    #[serde(default)]
    pub labels: Vec<String>,
    /// A GPU counts as free when its used-memory fraction is at or below
    /// this threshold.
    #[serde(default = "default_max_gpu_memory_used")]
    pub max_gpu_memory_used: f64,
}

#[derive(Deserialize, Debug, Clone)]
pub struct GpuConfig {
    #[serde(default = "default_gpu_lock_file")]
    pub lock_file: PathBuf,
    #[serde(default = "default_gpu_ledger_file")]
    pub ledger_file: PathBuf,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct NotifyConfig {
    /// Incoming-webhook URL the failure notifier posts to.
    #[serde(default)]
    pub slack_api_url: Option<String>,
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_db_user() -> String {
    "jobmanager".to_string()
}

fn default_db_name() -> String {
    "jobmanage".to_string()
}

fn home_subdir(rest: &str) -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".gpuq")
        .join(rest)
}

fn default_temp_dir_root() -> PathBuf {
    home_subdir("tmp")
}

fn default_trash_dir_root() -> PathBuf {
    home_subdir("trash")
}

fn default_repo_cache_dir() -> PathBuf {
    home_subdir("repo")
}

fn default_max_parallel() -> usize {
    10
}

fn default_max_gpu_memory_used() -> f64 {
    0.001
}

fn default_gpu_lock_file() -> PathBuf {
    home_subdir("gpu.lock")
}

fn default_gpu_ledger_file() -> PathBuf {
    home_subdir("gpu-ledger.json")
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: default_db_host(),
            user: default_db_user(),
            password: default_db_user(),
            database: default_db_name(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            temp_dir_root: default_temp_dir_root(),
            trash_dir_root: default_trash_dir_root(),
            repo_cache_dir: default_repo_cache_dir(),
            max_parallel: default_max_parallel(),
            gpus: None,
            labels: Vec::new(),
            max_gpu_memory_used: default_max_gpu_memory_used(),
        }
    }
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            lock_file: default_gpu_lock_file(),
            ledger_file: default_gpu_ledger_file(),
        }
    }
}

pub fn load_config(config_path: Option<&PathBuf>) -> Result<Config, config::ConfigError> {
    let mut config_vec = vec![];

    // User-provided config file
    if let Some(config_path) = config_path {
        if config_path.exists() {
            config_vec.push(config_path.clone());
        } else {
            eprintln!("Warning: Config file {config_path:?} not found.");
        }
    }

    // Default config file
    if let Ok(default_config_path) = get_config_dir().map(|d| d.join("gpuq.toml")) {
        if default_config_path.exists() {
            config_vec.push(default_config_path);
        }
    }

    let settings = config::Config::builder();
    let settings = config_vec.iter().fold(settings, |s, path| {
        s.add_source(config::File::from(path.as_path()))
    });

    settings
        .add_source(
            config::Environment::with_prefix("GPUQ")
                .separator("_")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("runner.labels"),
        )
        .build()?
        .try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let config = Config::default();
        assert_eq!(config.db.host, "localhost");
        assert_eq!(config.runner.max_parallel, 10);
        assert!(config.runner.labels.is_empty());
        assert!(config.timezone().unwrap().is_none());
    }

    #[test]
    fn timezone_parses_or_errors() {
        let config = Config {
            timezone: Some("Asia/Tokyo".to_string()),
            ..Default::default()
        };
        assert!(config.timezone().unwrap().is_some());

        let config = Config {
            timezone: Some("Not/AZone".to_string()),
            ..Default::default()
        };
        assert!(config.timezone().is_err());
    }
}
