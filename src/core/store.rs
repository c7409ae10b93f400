use crate::config::DbConfig;
use crate::core::model::{
    labels_satisfied, Job, JobPatch, JobStatus, NewJob, NewRunner, Runner, RunnerPatch,
};
use crate::core::now_iso;
use chrono_tz::Tz;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::{ConnectOptions, Connection, QueryBuilder};
use std::fmt;
use tokio::sync::Mutex;

#[derive(Debug)]
pub enum StoreError {
    NotFound { table: &'static str, id: i32 },
    Sql(sqlx::Error),
}

impl std::error::Error for StoreError {}
impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound { table, id } => write!(f, "no row {} in {}", id, table),
            StoreError::Sql(e) => write!(f, "database error: {}", e),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Sql(e)
    }
}

const CREATE_JOBS: &str = "CREATE TABLE IF NOT EXISTS jobs (\
    id int NOT NULL AUTO_INCREMENT,\
    repo_url varchar(1024),\
    commit_hash varchar(255),\
    status varchar(16),\
    command LONGTEXT,\
    message LONGTEXT,\
    priority int,\
    num_gpu int,\
    required_labels varchar(255),\
    executor varchar(255),\
    gpu_ids varchar(255),\
    host varchar(255),\
    run_id varchar(255),\
    created_at varchar(64),\
    updated_at varchar(64),\
    PRIMARY KEY (id))";

const CREATE_RUNNERS: &str = "CREATE TABLE IF NOT EXISTS runners (\
    id int NOT NULL AUTO_INCREMENT,\
    name varchar(255),\
    gpu_ids varchar(255),\
    labels varchar(255),\
    status varchar(16),\
    created_at varchar(64),\
    updated_at varchar(64),\
    PRIMARY KEY (id))";

/// Shared job queue and runner registry over one MySQL connection.
///
/// Every operation holds the store's mutex for its whole duration, so store
/// calls from the scheduler and its workers are serialised. Claim atomicity
/// across hosts does not depend on this; it rests on the row locks taken by
/// [`Store::pop_next_job`].
pub struct Store {
    conn: Mutex<MySqlConnection>,
    tz: Option<Tz>,
}

impl Store {
    pub async fn connect(db: &DbConfig, tz: Option<Tz>) -> Result<Self, StoreError> {
        let opts = MySqlConnectOptions::new()
            .host(&db.host)
            .username(&db.user)
            .password(&db.password)
            .database(&db.database);
        let mut conn = opts.connect().await?;
        sqlx::query(CREATE_JOBS).execute(&mut conn).await?;
        sqlx::query(CREATE_RUNNERS).execute(&mut conn).await?;
        Ok(Self {
            conn: Mutex::new(conn),
            tz,
        })
    }

    fn now(&self) -> String {
        now_iso(self.tz)
    }

    pub async fn create_job(&self, job: NewJob) -> Result<Job, StoreError> {
        let mut conn = self.conn.lock().await;
        let now = self.now();
        let result = sqlx::query(
            "INSERT INTO jobs (repo_url, commit_hash, status, command, message, priority, \
             num_gpu, required_labels, executor, gpu_ids, host, run_id, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.repo_url)
        .bind(&job.commit_hash)
        .bind(job.status.to_string())
        .bind(&job.command)
        .bind(&job.message)
        .bind(job.priority)
        .bind(job.num_gpu)
        .bind(&job.required_labels)
        .bind(&job.executor)
        .bind(&job.gpu_ids)
        .bind(&job.host)
        .bind(&job.run_id)
        .bind(&now)
        .bind(&now)
        .execute(&mut *conn)
        .await?;
        let id = result.last_insert_id() as i32;
        Self::fetch_job(&mut conn, id).await
    }

    pub async fn job(&self, id: i32) -> Result<Job, StoreError> {
        let mut conn = self.conn.lock().await;
        Self::fetch_job(&mut conn, id).await
    }

    async fn fetch_job(conn: &mut MySqlConnection, id: i32) -> Result<Job, StoreError> {
        sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ? LIMIT 1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or(StoreError::NotFound { table: "jobs", id })
    }

    /// Write the `Some` fields of `patch` and refresh `updated_at`; returns
    /// the row as it stands afterwards.
    pub async fn update_job(&self, id: i32, patch: JobPatch) -> Result<Job, StoreError> {
        let mut conn = self.conn.lock().await;
        let now = self.now();
        let mut qb: QueryBuilder<sqlx::MySql> = QueryBuilder::new("UPDATE jobs SET ");
        {
            let mut set = qb.separated(", ");
            if let Some(v) = &patch.repo_url {
                set.push("repo_url = ").push_bind_unseparated(v);
            }
            if let Some(v) = &patch.commit_hash {
                set.push("commit_hash = ").push_bind_unseparated(v);
            }
            if let Some(v) = patch.status {
                set.push("status = ").push_bind_unseparated(v.to_string());
            }
            if let Some(v) = &patch.command {
                set.push("command = ").push_bind_unseparated(v);
            }
            if let Some(v) = &patch.message {
                set.push("message = ").push_bind_unseparated(v);
            }
            if let Some(v) = patch.priority {
                set.push("priority = ").push_bind_unseparated(v);
            }
            if let Some(v) = patch.num_gpu {
                set.push("num_gpu = ").push_bind_unseparated(v);
            }
            if let Some(v) = &patch.required_labels {
                set.push("required_labels = ").push_bind_unseparated(v);
            }
            if let Some(v) = &patch.executor {
                set.push("executor = ").push_bind_unseparated(v);
            }
            if let Some(v) = &patch.gpu_ids {
                set.push("gpu_ids = ").push_bind_unseparated(v);
            }
            if let Some(v) = &patch.host {
                set.push("host = ").push_bind_unseparated(v);
            }
            if let Some(v) = &patch.run_id {
                set.push("run_id = ").push_bind_unseparated(v);
            }
            set.push("updated_at = ").push_bind_unseparated(&now);
        }
        qb.push(" WHERE id = ").push_bind(id);
        qb.build().execute(&mut *conn).await?;
        Self::fetch_job(&mut conn, id).await
    }

    /// Bump `updated_at` only. Serves as the liveness signal that separates a
    /// still-executing job from one whose runner has died.
    pub async fn touch_job(&self, id: i32) -> Result<Job, StoreError> {
        let mut conn = self.conn.lock().await;
        let now = self.now();
        sqlx::query("UPDATE jobs SET updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Self::fetch_job(&mut conn, id).await
    }

    pub async fn failed_jobs_since(&self, since: &str) -> Result<Vec<Job>, StoreError> {
        let mut conn = self.conn.lock().await;
        let rows = sqlx::query_as::<_, Job>(
            "SELECT * FROM jobs WHERE status = ? AND updated_at > ?",
        )
        .bind(JobStatus::Fail.to_string())
        .bind(since)
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows)
    }

    /// Atomically claim the next runnable job for this host.
    ///
    /// Two phases inside one transaction:
    /// 1. Peek the top Queue job by `(priority desc, num_gpu desc)` without
    ///    locking. If nothing is queued, or even the top job needs more GPUs
    ///    than `max_gpu_available`, there is nothing to lock.
    /// 2. Re-read every fitting Queue job `FOR UPDATE`, ordered by
    ///    `(priority desc, created_at asc)`, and flip the first one whose
    ///    required labels are a subset of `labels` to Running.
    ///
    /// Between the two reads another runner may drain the queue; the scan
    /// then claims nothing and this tick schedules nothing.
    pub async fn pop_next_job(
        &self,
        max_gpu_available: usize,
        labels: &[String],
    ) -> Result<Option<Job>, StoreError> {
        let mut conn = self.conn.lock().await;
        let now = self.now();
        let mut tx = conn.begin().await?;

        let top = sqlx::query_as::<_, Job>(
            "SELECT * FROM jobs WHERE status = ? ORDER BY priority DESC, num_gpu DESC LIMIT 1",
        )
        .bind(JobStatus::Queue.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        let candidates = match top {
            Some(job) if job.num_gpu as usize <= max_gpu_available => {
                sqlx::query_as::<_, Job>(
                    "SELECT * FROM jobs WHERE status = ? AND num_gpu <= ? \
                     ORDER BY priority DESC, created_at ASC FOR UPDATE",
                )
                .bind(JobStatus::Queue.to_string())
                .bind(max_gpu_available as i64)
                .fetch_all(&mut *tx)
                .await?
            }
            _ => Vec::new(),
        };

        let mut claimed = None;
        for mut job in candidates {
            if !labels_satisfied(&job.required_labels, labels) {
                continue;
            }
            sqlx::query("UPDATE jobs SET status = ?, updated_at = ? WHERE id = ?")
                .bind(JobStatus::Running.to_string())
                .bind(&now)
                .bind(job.id)
                .execute(&mut *tx)
                .await?;
            job.status = JobStatus::Running;
            job.updated_at = now.clone();
            claimed = Some(job);
            break;
        }

        tx.commit().await?;
        Ok(claimed)
    }

    pub async fn create_runner(&self, runner: NewRunner) -> Result<Runner, StoreError> {
        let mut conn = self.conn.lock().await;
        let now = self.now();
        let result = sqlx::query(
            "INSERT INTO runners (name, gpu_ids, labels, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&runner.name)
        .bind(&runner.gpu_ids)
        .bind(&runner.labels)
        .bind(runner.status.to_string())
        .bind(&now)
        .bind(&now)
        .execute(&mut *conn)
        .await?;
        let id = result.last_insert_id() as i32;
        Self::fetch_runner(&mut conn, id).await
    }

    pub async fn runner(&self, id: i32) -> Result<Runner, StoreError> {
        let mut conn = self.conn.lock().await;
        Self::fetch_runner(&mut conn, id).await
    }

    async fn fetch_runner(conn: &mut MySqlConnection, id: i32) -> Result<Runner, StoreError> {
        sqlx::query_as::<_, Runner>("SELECT * FROM runners WHERE id = ? LIMIT 1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or(StoreError::NotFound {
                table: "runners",
                id,
            })
    }

    pub async fn update_runner(&self, id: i32, patch: RunnerPatch) -> Result<Runner, StoreError> {
        let mut conn = self.conn.lock().await;
        let now = self.now();
        let mut qb: QueryBuilder<sqlx::MySql> = QueryBuilder::new("UPDATE runners SET ");
        {
            let mut set = qb.separated(", ");
            if let Some(v) = &patch.name {
                set.push("name = ").push_bind_unseparated(v);
            }
            if let Some(v) = &patch.gpu_ids {
                set.push("gpu_ids = ").push_bind_unseparated(v);
            }
            if let Some(v) = &patch.labels {
                set.push("labels = ").push_bind_unseparated(v);
            }
            if let Some(v) = patch.status {
                set.push("status = ").push_bind_unseparated(v.to_string());
            }
            set.push("updated_at = ").push_bind_unseparated(&now);
        }
        qb.push(" WHERE id = ").push_bind(id);
        qb.build().execute(&mut *conn).await?;
        Self::fetch_runner(&mut conn, id).await
    }

    pub async fn touch_runner(&self, id: i32) -> Result<Runner, StoreError> {
        let mut conn = self.conn.lock().await;
        let now = self.now();
        sqlx::query("UPDATE runners SET updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Self::fetch_runner(&mut conn, id).await
    }

    pub async fn remove_runner(&self, id: i32) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        sqlx::query("DELETE FROM runners WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}
