use crate::config::RunnerConfig;
use crate::core::executor::BackendRegistry;
use crate::core::gpu::GpuLedger;
use crate::core::model::{
    join_list, split_list, Job, JobPatch, JobStatus, NewRunner, Runner, RunnerStatus,
};
use crate::core::store::{Store, StoreError};
use crate::core::worker::{ExecutionWorker, WorkerHandle};
use crate::display::{PageId, Screen};
use crate::shutdown::ShutdownFlag;
use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

/// The ledger TTL is a safety net for crashed runners; the manager releases
/// explicitly on every reap path, so it is generous.
const RESERVE_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 10);
const REAP_BATCH: usize = 100;
const HISTORY_LIMIT: usize = 30;
const IDLE_SLEEP: Duration = Duration::from_secs(10);
const DISPATCH_SLEEP: Duration = Duration::from_secs(1);
const RENDER_FRAME: Duration = Duration::from_millis(100);

struct ActiveExecutor {
    job: Job,
    handle: WorkerHandle,
    page: PageId,
}

/// The scheduler loop for one runner host.
///
/// Composes the shared job queue, the host-local GPU ledger, a bounded pool
/// of subprocess-owning workers, and the paged display. One tick: reap
/// completions, probe active jobs, heartbeat the runner row, then either
/// drain (interrupt / remote stop) or admit one job.
pub struct ExecutorManager {
    store: Arc<Store>,
    ledger: Arc<GpuLedger>,
    registry: Arc<BackendRegistry>,
    screen: Arc<dyn Screen>,
    shutdown: ShutdownFlag,
    temp_dir_root: PathBuf,
    trash_dir_root: PathBuf,
    repo_cache_dir: PathBuf,
    max_parallel: usize,
    name: String,
    labels: Vec<String>,
    available_gpu_ids: BTreeSet<u32>,
    active: BTreeMap<i32, ActiveExecutor>,
    finish_tx: mpsc::UnboundedSender<i32>,
    finish_rx: mpsc::UnboundedReceiver<i32>,
    runner: Option<Runner>,
    finished_history: VecDeque<Job>,
    top_state: Arc<RwLock<String>>,
}

impl ExecutorManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        ledger: Arc<GpuLedger>,
        registry: Arc<BackendRegistry>,
        screen: Arc<dyn Screen>,
        shutdown: ShutdownFlag,
        config: &RunnerConfig,
        name: String,
        available_gpu_ids: BTreeSet<u32>,
        labels: Vec<String>,
    ) -> Self {
        let (finish_tx, finish_rx) = mpsc::unbounded_channel();
        Self {
            store,
            ledger,
            registry,
            screen,
            shutdown,
            temp_dir_root: config.temp_dir_root.clone(),
            trash_dir_root: config.trash_dir_root.clone(),
            repo_cache_dir: config.repo_cache_dir.clone(),
            max_parallel: config.max_parallel,
            name,
            labels,
            available_gpu_ids,
            active: BTreeMap::new(),
            finish_tx,
            finish_rx,
            runner: None,
            finished_history: VecDeque::new(),
            top_state: Arc::new(RwLock::new(String::new())),
        }
    }

    /// Register the runner row, run ticks until the operator interrupt has
    /// arrived and every worker has drained, then deregister.
    pub async fn run(&mut self) -> Result<()> {
        let runner = self
            .store
            .create_runner(NewRunner {
                name: self.name.clone(),
                gpu_ids: join_ids(self.available_gpu_ids.iter()),
                labels: join_list(&self.labels),
                status: RunnerStatus::Running,
            })
            .await
            .context("Failed to register runner")?;
        tracing::info!("Runner {:?} registered as id {}", runner.name, runner.id);
        self.runner = Some(runner);

        let top_state = self.top_state.clone();
        self.screen.set_top_page(Box::new(move || {
            top_state
                .read()
                .unwrap_or_else(|p| p.into_inner())
                .clone()
        }));

        loop {
            if self.shutdown.is_set() && self.active.is_empty() {
                break;
            }
            if let Err(e) = self.tick().await {
                tracing::warn!("Tick failed, retrying next tick: {e:#}");
                self.render_sleep(IDLE_SLEEP).await;
            }
        }

        if let Some(runner) = self.runner.take() {
            self.store
                .remove_runner(runner.id)
                .await
                .context("Failed to deregister runner")?;
            tracing::info!("Runner {:?} deregistered", runner.name);
        }
        Ok(())
    }

    async fn tick(&mut self) -> Result<()> {
        let mut sleep_time = IDLE_SLEEP;
        self.reap_finished().await?;
        self.probe_active().await?;
        self.sync_runner().await?;

        let stopped = matches!(
            self.runner.as_ref().map(|r| r.status),
            Some(RunnerStatus::Stop)
        );
        if self.shutdown.is_set() || stopped {
            self.kill_active(true);
        } else if self.active.len() < self.max_parallel {
            if let Some(job) = self.admit_one().await? {
                self.start_job(job);
                sleep_time = DISPATCH_SLEEP;
            }
        }
        self.refresh_top_page();
        self.render_sleep(sleep_time).await;
        Ok(())
    }

    /// Drain up to [`REAP_BATCH`] completions from the workers.
    async fn reap_finished(&mut self) -> Result<()> {
        for _ in 0..REAP_BATCH {
            let id = match self.finish_rx.try_recv() {
                Ok(id) => id,
                Err(_) => break,
            };
            if let Err(e) = self.reap_one(id).await {
                // Put the completion back so the next tick retries it.
                let _ = self.finish_tx.send(id);
                return Err(e);
            }
        }
        Ok(())
    }

    async fn reap_one(&mut self, id: i32) -> Result<()> {
        let Some((gpus, resume, result)) = self
            .active
            .get(&id)
            .map(|a| (a.job.gpu_id_list(), a.handle.should_resume(), a.handle.result()))
        else {
            return Ok(());
        };

        if !gpus.is_empty() {
            self.ledger.release(&gpus)?;
        }

        // Re-read before the terminal write; the row may be gone entirely.
        match self.store.job(id).await {
            Ok(_) => {
                let job = self
                    .store
                    .update_job(id, completion_patch(result, resume))
                    .await?;
                tracing::info!("Job {} reaped as {}", id, job.status);
                push_history(&mut self.finished_history, job);
            }
            Err(StoreError::NotFound { .. }) => {
                tracing::warn!("Job {} row disappeared before reap", id);
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(active) = self.active.remove(&id) {
            self.screen.delete_page(active.page);
        }
        Ok(())
    }

    /// Heartbeat every active job's row and honor remote status changes.
    async fn probe_active(&mut self) -> Result<()> {
        let ids: Vec<i32> = self.active.keys().copied().collect();
        for id in ids {
            match self.store.touch_job(id).await {
                Ok(job) => {
                    let killed = job.status != JobStatus::Running;
                    if let Some(active) = self.active.get_mut(&id) {
                        if killed {
                            tracing::info!("Job {} became {} remotely; killing", id, job.status);
                            active.handle.kill(false);
                        }
                        active.job = job;
                    }
                    if let Some(active) = self.active.get(&id) {
                        self.screen.refresh_page(active.page);
                    }
                }
                Err(StoreError::NotFound { .. }) => {
                    if let Some(active) = self.active.get(&id) {
                        tracing::warn!("Job {} row disappeared while running; killing", id);
                        active.handle.kill(false);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Heartbeat the runner row and adopt its operator-controlled fields.
    async fn sync_runner(&mut self) -> Result<()> {
        let Some(current) = &self.runner else {
            return Ok(());
        };
        let runner = self.store.touch_runner(current.id).await?;
        if runner.gpu_ids.trim().is_empty() {
            self.available_gpu_ids.clear();
        } else {
            match parse_id_set(&runner.gpu_ids) {
                Ok(ids) => self.available_gpu_ids = ids,
                // Keep the previous set when the row holds garbage.
                Err(_) => {
                    tracing::warn!("Ignoring unparseable runner gpu_ids {:?}", runner.gpu_ids)
                }
            }
        }
        self.labels = split_list(&runner.labels);
        self.runner = Some(runner);
        Ok(())
    }

    fn kill_active(&self, resume: bool) {
        for active in self.active.values() {
            active.handle.kill(resume);
        }
    }

    /// Reserve all currently free GPUs, pop one job that fits, keep its share
    /// of the reservation and hand the rest back. On any failure everything
    /// speculatively reserved is returned to the ledger.
    async fn admit_one(&mut self) -> Result<Option<Job>> {
        let free = self
            .ledger
            .try_reserve(&self.available_gpu_ids, RESERVE_TTL, None)?;
        let popped = self.store.pop_next_job(free.len(), &self.labels).await;

        let (needed, surplus) = match &popped {
            Ok(Some(job)) => carve(&free, job.num_gpu.max(0) as usize),
            _ => (Vec::new(), free),
        };
        self.ledger.release(&surplus)?;

        let job = match popped {
            Ok(Some(job)) => job,
            Ok(None) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let claimed = self
            .store
            .update_job(
                job.id,
                JobPatch {
                    gpu_ids: Some(join_ids(needed.iter())),
                    host: Some(self.name.clone()),
                    ..Default::default()
                },
            )
            .await;
        match claimed {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                self.ledger.release(&needed)?;
                Err(e.into())
            }
        }
    }

    fn start_job(&mut self, job: Job) {
        tracing::info!(
            "Starting job {} (gpus: {:?}, executor: {:?})",
            job.id,
            job.gpu_ids,
            job.executor
        );
        let handle = ExecutionWorker::spawn(
            self.store.clone(),
            self.registry.clone(),
            job.clone(),
            self.finish_tx.clone(),
            self.temp_dir_root.clone(),
            self.repo_cache_dir.clone(),
            self.trash_dir_root.clone(),
        );
        let render_handle = handle.clone();
        let page = self.screen.add_page(Box::new(move || render_handle.render()));
        self.active.insert(job.id, ActiveExecutor { job, handle, page });
    }

    fn refresh_top_page(&self) {
        let running: Vec<&Job> = self.active.values().map(|a| &a.job).collect();
        let content = render_top_page(
            self.shutdown.is_set(),
            &self.labels,
            &self.available_gpu_ids,
            &running,
            &self.finished_history,
        );
        *self.top_state.write().unwrap_or_else(|p| p.into_inner()) = content;
        self.screen.mark_top_dirty();
    }

    /// Sleep in short frames so the display stays live; wake early the
    /// moment the operator interrupt flips.
    async fn render_sleep(&self, duration: Duration) {
        let was_set = self.shutdown.is_set();
        let frames = (duration.as_millis() / RENDER_FRAME.as_millis()).max(1);
        for _ in 0..frames {
            if let Err(e) = self.screen.render() {
                tracing::warn!("Render failed: {e:#}");
            }
            tokio::time::sleep(RENDER_FRAME).await;
            if self.shutdown.is_set() && !was_set {
                break;
            }
        }
    }
}

/// Terminal transition for a reaped job: Finish on success, Queue when the
/// kill asked for resume, Fail otherwise.
fn completion_patch(result: Option<String>, resume: bool) -> JobPatch {
    match result {
        None => JobPatch {
            status: Some(JobStatus::Finish),
            message: Some(String::new()),
            ..Default::default()
        },
        Some(message) if resume => JobPatch {
            status: Some(JobStatus::Queue),
            message: Some(message),
            ..Default::default()
        },
        Some(message) => JobPatch {
            status: Some(JobStatus::Fail),
            message: Some(message),
            ..Default::default()
        },
    }
}

/// First `n` reserved indices stay with the job, the rest go back.
fn carve(free: &[u32], n: usize) -> (Vec<u32>, Vec<u32>) {
    let n = n.min(free.len());
    (free[..n].to_vec(), free[n..].to_vec())
}

/// Keep only the most recent [`HISTORY_LIMIT`] terminal jobs for display.
fn push_history(history: &mut VecDeque<Job>, job: Job) {
    history.push_back(job);
    while history.len() > HISTORY_LIMIT {
        history.pop_front();
    }
}

fn parse_id_set(joined: &str) -> Result<BTreeSet<u32>> {
    split_list(joined)
        .iter()
        .map(|s| {
            s.parse::<u32>()
                .with_context(|| format!("bad gpu index {:?}", s))
        })
        .collect()
}

fn join_ids<'a>(ids: impl Iterator<Item = &'a u32>) -> String {
    ids.map(u32::to_string).collect::<Vec<_>>().join(",")
}

fn render_top_page(
    draining: bool,
    labels: &[String],
    gpus: &BTreeSet<u32>,
    running: &[&Job],
    finished: &VecDeque<Job>,
) -> String {
    let status = if draining {
        format!(
            "Interrupt received. Killing all {} executors. Please wait.",
            running.len()
        )
    } else {
        format!("{} executors are running.", running.len())
    };
    let labels = format!("labels: {}", labels.join(", "));
    let gpus = format!("GPUs: {}", join_ids(gpus.iter()).replace(',', ", "));
    let format_job = |job: &Job| format!("* {} {}", job.status, job.command);
    let running = running
        .iter()
        .map(|j| format_job(j))
        .collect::<Vec<_>>()
        .join("\n\n");
    let finished = finished
        .iter()
        .map(format_job)
        .collect::<Vec<_>>()
        .join("\n\n");
    format!(
        "\n:::GPU Job Runner:::\n\n{status}\n{labels}\n{gpus}\n\n\
         [Running Jobs]\n\n{running}\n\n\n[Finished Jobs]\n\n{finished}\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: i32, status: JobStatus, command: &str) -> Job {
        Job {
            id,
            repo_url: String::new(),
            commit_hash: String::new(),
            status,
            command: command.to_string(),
            message: String::new(),
            priority: 5,
            num_gpu: 1,
            required_labels: String::new(),
            executor: String::new(),
            gpu_ids: String::new(),
            host: String::new(),
            run_id: String::new(),
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn carve_splits_needed_and_surplus() {
        assert_eq!(carve(&[0, 1, 2, 3], 2), (vec![0, 1], vec![2, 3]));
        assert_eq!(carve(&[0, 1], 0), (vec![], vec![0, 1]));
        assert_eq!(carve(&[0], 1), (vec![0], vec![]));
    }

    #[test]
    fn completion_patch_success() {
        let patch = completion_patch(None, false);
        assert_eq!(patch.status, Some(JobStatus::Finish));
        assert_eq!(patch.message.as_deref(), Some(""));
    }

    #[test]
    fn completion_patch_resume_requeues() {
        let patch = completion_patch(Some("killed".to_string()), true);
        assert_eq!(patch.status, Some(JobStatus::Queue));
        assert_eq!(patch.message.as_deref(), Some("killed"));
    }

    #[test]
    fn completion_patch_failure() {
        let patch = completion_patch(Some("boom".to_string()), false);
        assert_eq!(patch.status, Some(JobStatus::Fail));
        assert_eq!(patch.message.as_deref(), Some("boom"));
    }

    #[test]
    fn parse_id_set_is_strict() {
        assert_eq!(
            parse_id_set("0,2").unwrap(),
            [0, 2].into_iter().collect::<BTreeSet<u32>>()
        );
        assert!(parse_id_set("0,x").is_err());
    }

    #[test]
    fn top_page_lists_running_and_finished() {
        let running_job = job(1, JobStatus::Running, "python train.py");
        let finished: VecDeque<Job> = vec![job(2, JobStatus::Finish, "echo hi")].into();
        let gpus: BTreeSet<u32> = [0, 1].into_iter().collect();
        let content = render_top_page(
            false,
            &["gpu".to_string()],
            &gpus,
            &[&running_job],
            &finished,
        );
        assert!(content.contains("1 executors are running."));
        assert!(content.contains("labels: gpu"));
        assert!(content.contains("GPUs: 0, 1"));
        assert!(content.contains("* Running python train.py"));
        assert!(content.contains("* Finish echo hi"));
    }

    #[test]
    fn history_keeps_only_the_most_recent_jobs() {
        let mut history = VecDeque::new();
        for id in 0..40 {
            push_history(&mut history, job(id, JobStatus::Finish, "echo"));
        }
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history.front().unwrap().id, 10);
        assert_eq!(history.back().unwrap().id, 39);
    }

    #[test]
    fn top_page_announces_draining() {
        let content = render_top_page(true, &[], &BTreeSet::new(), &[], &VecDeque::new());
        assert!(content.contains("Interrupt received. Killing all 0 executors."));
    }
}
