use crate::core::executors::{python_venv::PythonVenvBackend, shell::ShellBackend};
use crate::core::model::Job;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

pub const DEFAULT_BACKEND: &str = "python_venv";

/// Everything a backend needs to turn a job into a running subprocess.
#[derive(Debug, Clone)]
pub struct BackendContext {
    pub job: Job,
    /// Per-execution workspace; the clone lives in `<workspace>/src`.
    pub workspace: PathBuf,
    pub temp_root: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

impl BackendContext {
    pub fn src_dir(&self) -> PathBuf {
        self.workspace.join("src")
    }
}

/// Strategy that prepares an environment for a job and runs its command.
///
/// `prepare` may perform heavy cacheable setup and may serialise per repo;
/// it must be safe to run concurrently for unrelated repos. `cleanup` runs
/// after `execute` regardless of its outcome. `kill` requests cooperative
/// termination; the subprocess's actual exit is observed by `execute`.
#[async_trait]
pub trait ExecutorBackend: Send + Sync {
    async fn prepare(&self, ctx: &BackendContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    async fn execute(&self, ctx: &BackendContext) -> Result<()>;

    async fn cleanup(&self, ctx: &BackendContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    fn kill(&self);
}

pub type BackendFactory = fn() -> Arc<dyn ExecutorBackend>;

/// Name-keyed backend registry. `job.executor` selects the backend; the
/// empty string selects [`DEFAULT_BACKEND`]. New backends register a factory
/// here without the scheduler or worker changing.
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(DEFAULT_BACKEND, || Arc::new(PythonVenvBackend::new()));
        registry.register("shell", || Arc::new(ShellBackend::new()));
        registry
    }

    pub fn register(&mut self, name: &str, factory: BackendFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn create(&self, name: &str) -> Result<Arc<dyn ExecutorBackend>> {
        let name = if name.is_empty() { DEFAULT_BACKEND } else { name };
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("unknown executor backend: {}", name))?;
        Ok(factory())
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_name_selects_the_default_backend() {
        let registry = BackendRegistry::builtin();
        assert!(registry.create("").is_ok());
        assert!(registry.create("python_venv").is_ok());
        assert!(registry.create("shell").is_ok());
    }

    #[test]
    fn unknown_backend_is_an_error() {
        let registry = BackendRegistry::builtin();
        assert!(registry.create("spark").is_err());
    }
}
