pub mod python_venv;
pub mod shell;

use crate::core::executor::BackendContext;
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::process::{Child, Command};

/// How often a backend checks the subprocess and its kill flag.
pub(crate) const WAIT_POLL: Duration = Duration::from_secs(10);
/// Grace period after SIGINT before polling resumes.
pub(crate) const KILL_GRACE: Duration = Duration::from_secs(20);

/// Spawn `command` through the shell in its own process group, with stdio
/// appended to the workspace capture files.
pub(crate) fn spawn_shell(
    command: &str,
    cwd: &Path,
    ctx: &BackendContext,
    envs: &[(&str, String)],
) -> Result<Child> {
    let stdout = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&ctx.stdout_path)
        .with_context(|| format!("Failed to open {:?}", ctx.stdout_path))?;
    let stderr = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&ctx.stderr_path)
        .with_context(|| format!("Failed to open {:?}", ctx.stderr_path))?;

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));
    for (key, value) in envs {
        cmd.env(key, value);
    }
    // Own process group, so SIGINT reaches the whole command tree.
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }
    cmd.spawn()
        .with_context(|| format!("Failed to spawn command: {}", command))
}

/// Wait for a setup command; non-zero exit is an error.
pub(crate) async fn wait_checked(mut child: Child, command: &str) -> Result<()> {
    let status = child
        .wait()
        .await
        .with_context(|| format!("Failed to wait for command: {}", command))?;
    if !status.success() {
        anyhow::bail!("command failed ({}): {}", status, command);
    }
    Ok(())
}

/// Wait for the user command, polling the kill flag every [`WAIT_POLL`].
///
/// When the flag is set, SIGINT goes to the process group and polling
/// resumes after [`KILL_GRACE`]; the subprocess's actual exit is what ends
/// the wait, so a command that ignores SIGINT keeps getting it.
pub(crate) async fn wait_with_kill(
    mut child: Child,
    command: &str,
    kill_flag: &AtomicBool,
) -> Result<()> {
    let pid = child
        .id()
        .map(|id| id as i32)
        .context("subprocess has no pid")?;
    loop {
        match tokio::time::timeout(WAIT_POLL, child.wait()).await {
            Ok(status) => {
                let status =
                    status.with_context(|| format!("Failed to wait for command: {}", command))?;
                if !status.success() {
                    anyhow::bail!("command failed ({}): {}", status, command);
                }
                return Ok(());
            }
            Err(_) => {
                if kill_flag.load(Ordering::SeqCst) {
                    unsafe {
                        libc::kill(-pid, libc::SIGINT);
                    }
                    tokio::time::sleep(KILL_GRACE).await;
                }
            }
        }
    }
}
