use anyhow::{Context, Result};
use clap::Parser;
use gpuq::config::load_config;
use gpuq::core::model::Job;
use gpuq::core::now_iso;
use gpuq::core::store::Store;
use serde_json::json;
use std::time::Duration;

mod cli;

const POLL_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::QWatch::parse();

    tracing_subscriber::fmt()
        .with_max_level(args.verbose)
        .init();

    let mut config = load_config(args.config.as_ref())?;
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

    let webhook_url = args
        .slack_api_url
        .or_else(|| std::env::var("SLACK_WEBHOOK_URL").ok())
        .or_else(|| config.notify.slack_api_url.clone())
        .context("No webhook URL; pass --slack-api-url or set SLACK_WEBHOOK_URL")?;

    let tz = config.timezone()?;
    let store = Store::connect(&config.db, tz)
        .await
        .context("Failed to connect to the job store")?;
    let client = reqwest::Client::builder()
        .user_agent(format!("gpuq/{}/qwatch", gpuq::core::version()))
        .build()
        .context("Failed to build HTTP client")?;

    let mut last = now_iso(tz);
    let mut interval = tokio::time::interval(POLL_INTERVAL);
    loop {
        interval.tick().await;
        let now = now_iso(tz);
        match store.failed_jobs_since(&last).await {
            Ok(jobs) => {
                for job in jobs {
                    tracing::info!("Job {} failed on {:?}; notifying", job.id, job.host);
                    if let Err(e) = post_failure(&client, &webhook_url, &job).await {
                        tracing::warn!("Webhook delivery failed for job {}: {e:#}", job.id);
                    }
                }
                last = now;
            }
            // Keep the watermark so a flaky poll cannot swallow failures.
            Err(e) => tracing::warn!("Failed to poll for failed jobs: {e:#}"),
        }
    }
}

async fn post_failure(client: &reqwest::Client, url: &str, job: &Job) -> Result<()> {
    let response = client
        .post(url)
        .json(&failure_payload(job))
        .send()
        .await
        .context("Failed to send webhook request")?;
    response
        .error_for_status()
        .context("Webhook endpoint rejected the payload")?;
    Ok(())
}

fn failure_payload(job: &Job) -> serde_json::Value {
    json!({
        "text": "A job failed :ghost:",
        "attachments": [
            {
                "title": "host",
                "text": job.host,
            },
            {
                "title": "command",
                "text": format!("```\n{}\n```", job.command),
                "mrkdwn_in": ["text"],
            },
            {
                "title": "error",
                "text": format!("```\n{}\n```", job.message),
                "mrkdwn_in": ["text"],
                "color": "danger",
            },
        ],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuq::core::model::JobStatus;

    #[test]
    fn payload_carries_host_command_and_error() {
        let job = Job {
            id: 7,
            repo_url: String::new(),
            commit_hash: String::new(),
            status: JobStatus::Fail,
            command: "python train.py".to_string(),
            message: "[stderr]\nboom".to_string(),
            priority: 5,
            num_gpu: 1,
            required_labels: String::new(),
            executor: String::new(),
            gpu_ids: String::new(),
            host: "node-1".to_string(),
            run_id: String::new(),
            created_at: String::new(),
            updated_at: String::new(),
        };
        let payload = failure_payload(&job);
        assert_eq!(payload["attachments"][0]["text"], "node-1");
        assert!(payload["attachments"][1]["text"]
            .as_str()
            .unwrap()
            .contains("python train.py"));
        assert!(payload["attachments"][2]["text"]
            .as_str()
            .unwrap()
            .contains("boom"));
    }
}
