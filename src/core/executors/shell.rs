use crate::core::executor::{BackendContext, ExecutorBackend};
use crate::core::executors::{spawn_shell, wait_with_kill};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};

/// Runs the job's command straight through the shell in `<workspace>/src`,
/// with no environment setup. Same execute and kill contract as the default
/// backend.
pub struct ShellBackend {
    kill_flag: AtomicBool,
}

impl ShellBackend {
    pub fn new() -> Self {
        Self {
            kill_flag: AtomicBool::new(false),
        }
    }
}

impl Default for ShellBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutorBackend for ShellBackend {
    async fn execute(&self, ctx: &BackendContext) -> Result<()> {
        let envs = [("CUDA_VISIBLE_DEVICES", ctx.job.gpu_ids.clone())];
        let child = spawn_shell(&ctx.job.command, &ctx.src_dir(), ctx, &envs)?;
        wait_with_kill(child, &ctx.job.command, &self.kill_flag).await
    }

    fn kill(&self) {
        self.kill_flag.store(true, Ordering::SeqCst);
    }
}
