use crate::core::executor::{BackendContext, BackendRegistry, ExecutorBackend};
use crate::core::gitrepo;
use crate::core::model::{Job, JobPatch};
use crate::core::store::Store;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

/// Owns one job execution: workspace, clone, backend lifecycle, stdio
/// capture, and the final diagnostic. Posts the job id onto the completion
/// sink exactly once, whatever happens.
pub struct ExecutionWorker;

struct WorkerShared {
    should_resume: AtomicBool,
    finished: AtomicBool,
    result: Mutex<Option<String>>,
    backend: Mutex<Option<Arc<dyn ExecutorBackend>>>,
    io_paths: OnceLock<(PathBuf, PathBuf)>,
}

/// Scheduler-side view of a running worker.
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<WorkerShared>,
}

impl WorkerHandle {
    /// Request termination. `resume = true` marks the job for requeue instead
    /// of Fail; the backend is signalled if it is already running.
    pub fn kill(&self, resume: bool) {
        self.shared.should_resume.store(resume, Ordering::SeqCst);
        let backend = self
            .shared
            .backend
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        if let Some(backend) = backend {
            backend.kill();
        }
    }

    pub fn should_resume(&self) -> bool {
        self.shared.should_resume.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> bool {
        self.shared.finished.load(Ordering::SeqCst)
    }

    /// Final diagnostic; `None` means success. Meaningful once the job id has
    /// arrived on the completion sink.
    pub fn result(&self) -> Option<String> {
        self.shared
            .result
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Live view of the captured stdio for display. Best effort: the files
    /// are being written concurrently and reads may be torn.
    pub fn render(&self) -> String {
        if self.finished() {
            return String::new();
        }
        let Some((stdout_path, stderr_path)) = self.shared.io_paths.get() else {
            return String::new();
        };
        format!(
            "[Standard Error]\n{}\n\n[Standard Out]\n{}",
            read_lossy(stderr_path),
            read_lossy(stdout_path)
        )
    }
}

impl ExecutionWorker {
    /// Start executing `job` on a fresh task and return its handle.
    pub fn spawn(
        store: Arc<Store>,
        registry: Arc<BackendRegistry>,
        job: Job,
        finish_tx: UnboundedSender<i32>,
        temp_root: PathBuf,
        repo_cache_dir: PathBuf,
        trash_root: PathBuf,
    ) -> WorkerHandle {
        let shared = Arc::new(WorkerShared {
            should_resume: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            result: Mutex::new(None),
            backend: Mutex::new(None),
            io_paths: OnceLock::new(),
        });
        let handle = WorkerHandle {
            shared: shared.clone(),
        };

        tokio::spawn(async move {
            let workspace = temp_root.join(Uuid::new_v4().to_string());
            let result = Self::drive(
                &shared,
                &store,
                &registry,
                &job,
                &workspace,
                &temp_root,
                &repo_cache_dir,
            )
            .await;

            shared.finished.store(true, Ordering::SeqCst);
            if let Err(e) = move_to_trash(&workspace, &trash_root) {
                tracing::warn!("Failed to move workspace {:?} to trash: {e:#}", workspace);
            }
            *shared.result.lock().unwrap_or_else(|p| p.into_inner()) = result;
            if finish_tx.send(job.id).is_err() {
                tracing::warn!("Completion sink closed before job {} finished", job.id);
            }
        });

        handle
    }

    /// Returns `None` on success, or the diagnostic for the job's `message`.
    async fn drive(
        shared: &Arc<WorkerShared>,
        store: &Store,
        registry: &BackendRegistry,
        job: &Job,
        workspace: &Path,
        temp_root: &Path,
        repo_cache_dir: &Path,
    ) -> Option<String> {
        let mut execute_error: Option<anyhow::Error> = None;

        let outcome: Result<()> = async {
            tokio::fs::create_dir_all(workspace)
                .await
                .with_context(|| format!("Failed to create workspace {:?}", workspace))?;
            let stdout_path = workspace.join("stdout.txt");
            let stderr_path = workspace.join("stderr.txt");
            tokio::fs::File::create(&stdout_path).await?;
            tokio::fs::File::create(&stderr_path).await?;
            let _ = shared
                .io_paths
                .set((stdout_path.clone(), stderr_path.clone()));

            let run_id = workspace
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            store
                .update_job(
                    job.id,
                    JobPatch {
                        run_id: Some(run_id),
                        ..Default::default()
                    },
                )
                .await?;

            let backend = registry.create(&job.executor)?;
            *shared.backend.lock().unwrap_or_else(|p| p.into_inner()) = Some(backend.clone());

            gitrepo::clone_repository(
                &job.repo_url,
                &job.commit_hash,
                &workspace.join("src"),
                repo_cache_dir,
                "working",
            )
            .await?;

            let ctx = BackendContext {
                job: job.clone(),
                workspace: workspace.to_path_buf(),
                temp_root: temp_root.to_path_buf(),
                stdout_path,
                stderr_path,
            };
            backend.prepare(&ctx).await?;
            let executed = backend.execute(&ctx).await;
            let cleaned = backend.cleanup(&ctx).await;
            if let Err(e) = executed {
                execute_error = Some(e);
            }
            cleaned?;
            Ok(())
        }
        .await;

        let other_error = outcome.err();
        if execute_error.is_none() && other_error.is_none() {
            return None;
        }
        let stderr = shared
            .io_paths
            .get()
            .map(|(_, stderr_path)| read_lossy(stderr_path))
            .unwrap_or_default();
        Some(compose_diagnostic(
            &stderr,
            execute_error.as_ref().map(|e| format!("{e:#}")).as_deref(),
            other_error.as_ref().map(|e| format!("{e:#}")).as_deref(),
        ))
    }
}

fn read_lossy(path: &Path) -> String {
    std::fs::read(path)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

/// Diagnostic written into the job's `message` on failure: the captured
/// stderr plus whichever error stages fired.
pub(crate) fn compose_diagnostic(
    stderr: &str,
    execute_error: Option<&str>,
    other_error: Option<&str>,
) -> String {
    let mut out = String::from("[stderr]\n");
    out.push_str(stderr);
    if let Some(e) = execute_error {
        out.push_str("\n\n[execute error message]\n");
        out.push_str(e);
    }
    if let Some(e) = other_error {
        out.push_str("\n\n[other error message]\n");
        out.push_str(e);
    }
    out
}

/// Hand the workspace to the trash root; rename first, copy across
/// filesystems as a fallback.
pub(crate) fn move_to_trash(workspace: &Path, trash_root: &Path) -> std::io::Result<()> {
    if !workspace.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(trash_root)?;
    let dest = trash_root.join(workspace.file_name().unwrap_or_default());
    match std::fs::rename(workspace, &dest) {
        Ok(()) => Ok(()),
        Err(_) => {
            copy_tree(workspace, &dest)?;
            std::fs::remove_dir_all(workspace)
        }
    }
}

fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_for_execute_failure() {
        let diag = compose_diagnostic("boom\n", Some("command failed (exit status: 1)"), None);
        assert!(diag.starts_with("[stderr]\nboom\n"));
        assert!(diag.contains("[execute error message]\ncommand failed"));
        assert!(!diag.contains("[other error message]"));
    }

    #[test]
    fn diagnostic_for_pre_execute_failure() {
        let diag = compose_diagnostic("", None, Some("git clone into cache failed"));
        assert!(diag.starts_with("[stderr]\n"));
        assert!(diag.contains("[other error message]\ngit clone into cache failed"));
        assert!(!diag.contains("[execute error message]"));
    }

    #[test]
    fn diagnostic_with_both_stages() {
        let diag = compose_diagnostic("tail", Some("exec"), Some("cleanup"));
        let exec_at = diag.find("[execute error message]").unwrap();
        let other_at = diag.find("[other error message]").unwrap();
        assert!(exec_at < other_at);
    }

    #[test]
    fn workspace_lands_in_the_trash_root() {
        let temp = tempfile::tempdir().unwrap();
        let workspace = temp.path().join("ws-1");
        std::fs::create_dir_all(workspace.join("src")).unwrap();
        std::fs::write(workspace.join("stdout.txt"), "hi").unwrap();
        let trash = temp.path().join("trash");

        move_to_trash(&workspace, &trash).unwrap();

        assert!(!workspace.exists());
        assert_eq!(
            std::fs::read_to_string(trash.join("ws-1").join("stdout.txt")).unwrap(),
            "hi"
        );
    }

    #[test]
    fn trashing_a_missing_workspace_is_a_noop() {
        let temp = tempfile::tempdir().unwrap();
        let trash = temp.path().join("trash");
        move_to_trash(&temp.path().join("nope"), &trash).unwrap();
        assert!(!trash.exists());
    }
}
