use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use strum::{Display, EnumString};

/// Lifecycle of a job row. The database stores the literal variant name.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
pub enum JobStatus {
    Queue,
    Running,
    Finish,
    Fail,
    Cancel,
    Stop,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Finish | JobStatus::Fail | JobStatus::Cancel | JobStatus::Stop
        )
    }
}

impl TryFrom<String> for JobStatus {
    type Error = strum::ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
pub enum RunnerStatus {
    Running,
    Stop,
}

impl TryFrom<String> for RunnerStatus {
    type Error = strum::ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One row of the `jobs` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub id: i32,
    pub repo_url: String,
    pub commit_hash: String,
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    pub command: String,
    pub message: String,
    pub priority: i32,
    pub num_gpu: i32,
    pub required_labels: String,
    pub executor: String,
    pub gpu_ids: String,
    pub host: String,
    pub run_id: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Job {
    /// GPU indices reserved for this job, as written by the scheduler.
    pub fn gpu_id_list(&self) -> Vec<u32> {
        split_list(&self.gpu_ids)
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect()
    }
}

/// One row of the `runners` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Runner {
    pub id: i32,
    pub name: String,
    pub gpu_ids: String,
    pub labels: String,
    #[sqlx(try_from = "String")]
    pub status: RunnerStatus,
    pub created_at: String,
    pub updated_at: String,
}

/// Insertion shape for `jobs`; the store assigns `id` and the timestamps.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub repo_url: String,
    pub commit_hash: String,
    pub status: JobStatus,
    pub command: String,
    pub message: String,
    pub priority: i32,
    pub num_gpu: i32,
    pub required_labels: String,
    pub executor: String,
    pub gpu_ids: String,
    pub host: String,
    pub run_id: String,
}

impl Default for NewJob {
    fn default() -> Self {
        Self {
            repo_url: String::new(),
            commit_hash: String::new(),
            status: JobStatus::Queue,
            command: String::new(),
            message: String::new(),
            priority: 10,
            num_gpu: 1,
            required_labels: String::new(),
            executor: String::new(),
            gpu_ids: String::new(),
            host: String::new(),
            run_id: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewRunner {
    pub name: String,
    pub gpu_ids: String,
    pub labels: String,
    pub status: RunnerStatus,
}

/// Partial update of a job row. Only `Some` fields are written; `updated_at`
/// is refreshed on every update regardless.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub repo_url: Option<String>,
    pub commit_hash: Option<String>,
    pub status: Option<JobStatus>,
    pub command: Option<String>,
    pub message: Option<String>,
    pub priority: Option<i32>,
    pub num_gpu: Option<i32>,
    pub required_labels: Option<String>,
    pub executor: Option<String>,
    pub gpu_ids: Option<String>,
    pub host: Option<String>,
    pub run_id: Option<String>,
}

impl JobPatch {
    pub fn is_empty(&self) -> bool {
        self.repo_url.is_none()
            && self.commit_hash.is_none()
            && self.status.is_none()
            && self.command.is_none()
            && self.message.is_none()
            && self.priority.is_none()
            && self.num_gpu.is_none()
            && self.required_labels.is_none()
            && self.executor.is_none()
            && self.gpu_ids.is_none()
            && self.host.is_none()
            && self.run_id.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunnerPatch {
    pub name: Option<String>,
    pub gpu_ids: Option<String>,
    pub labels: Option<String>,
    pub status: Option<RunnerStatus>,
}

/// Split a comma-joined list, dropping empty segments so `""` means "none".
pub fn split_list(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn join_list<S: AsRef<str>>(items: &[S]) -> String {
    items
        .iter()
        .map(|s| s.as_ref())
        .collect::<Vec<_>>()
        .join(",")
}

/// A runner may take a job iff the job's required labels are a subset of the
/// labels the runner offers.
pub fn labels_satisfied(required: &str, offered: &[String]) -> bool {
    let offered: HashSet<&str> = offered.iter().map(String::as_str).collect();
    split_list(required).iter().all(|l| offered.contains(l.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for status in [
            JobStatus::Queue,
            JobStatus::Running,
            JobStatus::Finish,
            JobStatus::Fail,
            JobStatus::Cancel,
            JobStatus::Stop,
        ] {
            let parsed = JobStatus::try_from(status.to_string()).unwrap();
            assert_eq!(parsed, status);
        }
        assert_eq!(JobStatus::Queue.to_string(), "Queue");
        assert!(JobStatus::try_from("queue".to_string()).is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Queue.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Finish.is_terminal());
        assert!(JobStatus::Fail.is_terminal());
        assert!(JobStatus::Cancel.is_terminal());
        assert!(JobStatus::Stop.is_terminal());
    }

    #[test]
    fn split_list_drops_empty_segments() {
        assert_eq!(split_list(""), Vec::<String>::new());
        assert_eq!(split_list("a,b"), vec!["a", "b"]);
        assert_eq!(split_list("a,,b,"), vec!["a", "b"]);
        assert_eq!(split_list(" a , b "), vec!["a", "b"]);
    }

    #[test]
    fn join_then_split_is_identity_for_clean_items() {
        let items = vec!["0".to_string(), "2".to_string(), "5".to_string()];
        assert_eq!(split_list(&join_list(&items)), items);
    }

    #[test]
    fn label_subset() {
        let offered = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert!(labels_satisfied("", &offered));
        assert!(labels_satisfied("a", &offered));
        assert!(labels_satisfied("a,b", &offered));
        assert!(!labels_satisfied("a,d", &offered));
        assert!(!labels_satisfied("d", &[]));
        assert!(labels_satisfied("", &[]));
    }

    #[test]
    fn gpu_id_list_parses_reserved_indices() {
        let job = Job {
            id: 1,
            repo_url: String::new(),
            commit_hash: String::new(),
            status: JobStatus::Running,
            command: String::new(),
            message: String::new(),
            priority: 5,
            num_gpu: 2,
            required_labels: String::new(),
            executor: String::new(),
            gpu_ids: "0,3".to_string(),
            host: "h".to_string(),
            run_id: String::new(),
            created_at: String::new(),
            updated_at: String::new(),
        };
        assert_eq!(job.gpu_id_list(), vec![0, 3]);
    }
}
