pub mod executor;
pub mod executors;
pub mod gitrepo;
pub mod gpu;
pub mod manager;
pub mod model;
pub mod store;
pub mod worker;

use chrono::{Local, Utc};
use chrono_tz::Tz;
use std::path::PathBuf;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn get_config_dir() -> anyhow::Result<PathBuf> {
    dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Failed to get config directory"))
        .map(|p| p.join("gpuq"))
}

pub fn get_data_dir() -> anyhow::Result<PathBuf> {
    dirs::data_dir()
        .ok_or_else(|| anyhow::anyhow!("Failed to get data directory"))
        .map(|p| p.join("gpuq"))
}

/// Current time as an ISO-8601 string with offset.
///
/// Timestamps are stored as strings and compared lexicographically, so every
/// writer of a deployment should run with the same `timezone` setting.
pub fn now_iso(tz: Option<Tz>) -> String {
    match tz {
        Some(tz) => Utc::now().with_timezone(&tz).to_rfc3339(),
        None => Local::now().to_rfc3339(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_iso_is_ordered_lexicographically() {
        let tz: Tz = "Asia/Tokyo".parse().unwrap();
        let a = now_iso(Some(tz));
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = now_iso(Some(tz));
        assert!(a < b);
    }

    #[test]
    fn now_iso_carries_an_offset() {
        let tz: Tz = "Asia/Tokyo".parse().unwrap();
        let s = now_iso(Some(tz));
        assert!(s.ends_with("+09:00"));
    }
}
