use crate::core::executor::{BackendContext, ExecutorBackend};
use crate::core::executors::{spawn_shell, wait_checked, wait_with_kill};
use crate::core::gitrepo;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Default backend: materialises a per-repository virtualenv under
/// `<temp_root>/python_venv/<repo slug>` and runs the job's command with the
/// venv activated.
///
/// The venv is shared across executions of the same repository, so `prepare`
/// serialises per repo (the same lock map the clone path uses); unrelated
/// repos prepare concurrently.
pub struct PythonVenvBackend {
    kill_flag: AtomicBool,
    venv_dir: Mutex<Option<PathBuf>>,
}

impl PythonVenvBackend {
    pub fn new() -> Self {
        Self {
            kill_flag: AtomicBool::new(false),
            venv_dir: Mutex::new(None),
        }
    }
}

impl Default for PythonVenvBackend {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn activate_and_run(venv_dir: &std::path::Path, command: &str) -> String {
    format!(". {}/venv/bin/activate; {}", venv_dir.display(), command)
}

#[async_trait]
impl ExecutorBackend for PythonVenvBackend {
    async fn prepare(&self, ctx: &BackendContext) -> Result<()> {
        let slug = gitrepo::url_to_dir(&ctx.job.repo_url)?;
        let venv_dir = ctx.temp_root.join("python_venv").join(&slug);
        let lock = gitrepo::repo_lock(&slug);

        {
            let _guard = lock.lock().await;
            tokio::fs::create_dir_all(&venv_dir)
                .await
                .with_context(|| format!("Failed to create venv dir {:?}", venv_dir))?;

            let create = "python -m venv venv";
            let child = spawn_shell(create, &venv_dir, ctx, &[])?;
            wait_checked(child, create).await?;

            let install = format!(
                ". ./venv/bin/activate; pip install -r {}/requirements.txt",
                ctx.src_dir().display()
            );
            let child = spawn_shell(&install, &venv_dir, ctx, &[])?;
            wait_checked(child, &install).await?;
        }

        *self.venv_dir.lock().unwrap_or_else(|p| p.into_inner()) = Some(venv_dir);
        Ok(())
    }

    async fn execute(&self, ctx: &BackendContext) -> Result<()> {
        let venv_dir = self
            .venv_dir
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .context("execute called before prepare")?;
        let command = activate_and_run(&venv_dir, &ctx.job.command);
        let envs = [("CUDA_VISIBLE_DEVICES", ctx.job.gpu_ids.clone())];
        let child = spawn_shell(&command, &ctx.src_dir(), ctx, &envs)?;
        wait_with_kill(child, &command, &self.kill_flag).await
    }

    fn kill(&self) {
        self.kill_flag.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_activates_the_venv_first() {
        let command = activate_and_run(std::path::Path::new("/tmp/venvs/foo"), "python train.py");
        assert_eq!(
            command,
            ". /tmp/venvs/foo/venv/bin/activate; python train.py"
        );
    }
}
