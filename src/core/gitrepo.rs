use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::process::Command;

static REPO_LOCKS: OnceLock<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>> = OnceLock::new();

/// In-process mutex keyed on the repository slug. Shared with the backends so
/// clone and per-repo environment setup for the same repository serialise.
pub fn repo_lock(key: &str) -> Arc<tokio::sync::Mutex<()>> {
    let locks = REPO_LOCKS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut locks = locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    locks
        .entry(key.to_string())
        .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
        .clone()
}

/// Map a repository URL to its cache-relative directory.
///
/// `git@github.com:user/foo.git` → `github.com/user/foo.git`
/// `https://github.com/user/foo.git` → `github.com/user/foo.git`
/// `ssh://git@host:port/user/foo.git` → `host/port/user/foo.git`
pub fn url_to_dir(repo_url: &str) -> Result<String> {
    for prefix in ["git@", "ssh://git@", "http://", "https://"] {
        if let Some(rest) = repo_url.strip_prefix(prefix) {
            return Ok(rest.replace(':', "/").replace("..", "__"));
        }
    }
    anyhow::bail!("unknown repo_url format: {}", repo_url)
}

/// Clone `repo_url` at `commit_hash` into `dest_dir` through a shared cache.
///
/// The cache under `<cache_dir>/<slug>` is cloned once and pulled on reuse;
/// the working copy is cloned from the cache and gets a local `branch`
/// checked out at `commit_hash` with the tree reset to it.
pub async fn clone_repository(
    repo_url: &str,
    commit_hash: &str,
    dest_dir: &Path,
    cache_dir: &Path,
    branch: &str,
) -> Result<()> {
    let slug = url_to_dir(repo_url)?;
    let cache_repo = cache_dir.join(&slug);
    let lock = repo_lock(&slug);

    {
        let _guard = lock.lock().await;
        if !cache_repo.exists() {
            if let Some(parent) = cache_repo.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut cmd = Command::new("git");
            cmd.current_dir(cache_dir)
                .arg("clone")
                .arg(repo_url)
                .arg(&cache_repo);
            run_git(cmd, "clone into cache").await?;
        } else {
            let mut cmd = Command::new("git");
            cmd.current_dir(&cache_repo).arg("pull");
            run_git(cmd, "update cache").await?;
        }

        if let Some(parent) = dest_dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut cmd = Command::new("git");
        cmd.current_dir(cache_dir)
            .arg("clone")
            .arg(&cache_repo)
            .arg(dest_dir);
        run_git(cmd, "clone from cache").await?;
    }

    let mut cmd = Command::new("git");
    cmd.current_dir(dest_dir)
        .args(["checkout", "-B", branch])
        .arg(commit_hash);
    run_git(cmd, "checkout pinned commit").await?;
    Ok(())
}

async fn run_git(mut cmd: Command, what: &str) -> Result<()> {
    let output = cmd
        .output()
        .await
        .with_context(|| format!("Failed to spawn git ({what})"))?;
    if !output.status.success() {
        anyhow::bail!(
            "git {} failed ({}): {}",
            what,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_for_scp_style_url() {
        assert_eq!(
            url_to_dir("git@github.com:user/foo.git").unwrap(),
            "github.com/user/foo.git"
        );
    }

    #[test]
    fn slug_for_https_url() {
        assert_eq!(
            url_to_dir("https://github.com/user/foo.git").unwrap(),
            "github.com/user/foo.git"
        );
    }

    #[test]
    fn slug_for_ssh_url_with_port() {
        assert_eq!(
            url_to_dir("ssh://git@host:2222/user/foo.git").unwrap(),
            "host/2222/user/foo.git"
        );
    }

    #[test]
    fn slug_neutralises_parent_traversal() {
        assert_eq!(
            url_to_dir("https://host/a/../b.git").unwrap(),
            "host/a/__/b.git"
        );
    }

    #[test]
    fn unknown_prefix_is_rejected() {
        assert!(url_to_dir("ftp://host/foo.git").is_err());
        assert!(url_to_dir("/local/path/foo.git").is_err());
    }

    #[test]
    fn repo_lock_is_shared_per_key() {
        let a = repo_lock("host/a.git");
        let b = repo_lock("host/a.git");
        let c = repo_lock("host/c.git");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
