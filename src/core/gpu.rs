use crate::config::GpuConfig;
use anyhow::{Context, Result};
use nvml_wrapper::Nvml;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of "which GPU indices does the hardware consider free right now".
#[cfg_attr(test, mockall::automock)]
pub trait GpuProbe: Send + Sync {
    fn available_gpus(&self) -> Vec<u32>;
}

/// NVML-backed probe. A GPU counts as free when its used-memory fraction is
/// at or below `max_memory_used`. Hosts without NVML report no GPUs.
pub struct NvmlProbe {
    nvml: Option<Nvml>,
    max_memory_used: f64,
}

impl NvmlProbe {
    pub fn new(max_memory_used: f64) -> Self {
        let nvml = match Nvml::init() {
            Ok(nvml) => Some(nvml),
            Err(e) => {
                tracing::warn!("NVML unavailable, assuming no GPUs: {e}");
                None
            }
        };
        Self {
            nvml,
            max_memory_used,
        }
    }
}

impl GpuProbe for NvmlProbe {
    fn available_gpus(&self) -> Vec<u32> {
        let Some(nvml) = &self.nvml else {
            return Vec::new();
        };
        let count = nvml.device_count().unwrap_or(0);
        let mut free = Vec::new();
        for index in 0..count {
            let Ok(device) = nvml.device_by_index(index) else {
                continue;
            };
            let Ok(mem) = device.memory_info() else {
                continue;
            };
            if mem.total > 0 && (mem.used as f64 / mem.total as f64) <= self.max_memory_used {
                free.push(index);
            }
        }
        free
    }
}

/// Host-local GPU reservation ledger.
///
/// The ledger is a JSON object mapping stringified GPU index to the epoch
/// second of its reservation, persisted next to an advisory lock file. The
/// lock coordinates this host's processes (runner, submitter, tooling); it
/// does not coordinate across hosts. Entries older than the caller's TTL are
/// swept on every access, so reservations leaked by a crashed process heal
/// on their own.
pub struct GpuLedger {
    lock_path: PathBuf,
    ledger_path: PathBuf,
    probe: Box<dyn GpuProbe>,
}

impl GpuLedger {
    pub fn new(config: &GpuConfig, probe: Box<dyn GpuProbe>) -> Self {
        Self {
            lock_path: config.lock_file.clone(),
            ledger_path: config.ledger_file.clone(),
            probe,
        }
    }

    /// Reserve free GPUs.
    ///
    /// `free = (probe ∩ candidates) − reserved`, where an empty candidate set
    /// means no restriction. With `n = None` all free indices are returned
    /// (possibly none); with `n = Some(k)` either exactly `k` indices or none.
    /// Returned indices are stamped into the ledger with the current time.
    pub fn try_reserve(
        &self,
        candidates: &BTreeSet<u32>,
        ttl: Duration,
        n: Option<usize>,
    ) -> Result<Vec<u32>> {
        let mut lock = self.open_lock()?;
        let _guard = lock
            .write()
            .with_context(|| format!("Failed to lock {:?}", self.lock_path))?;

        let now = epoch_secs();
        let mut ledger = self.load_ledger()?;
        ledger.retain(|_, stamp| now - *stamp <= ttl.as_secs_f64());

        let mut free: BTreeSet<u32> = self.probe.available_gpus().into_iter().collect();
        if !candidates.is_empty() {
            free.retain(|id| candidates.contains(id));
        }
        free.retain(|id| !ledger.contains_key(id));

        let mut ids: Vec<u32> = free.into_iter().collect();
        if let Some(n) = n {
            if ids.len() < n {
                return Ok(Vec::new());
            }
            ids.truncate(n);
        }
        for id in &ids {
            ledger.insert(*id, now);
        }
        self.store_ledger(&ledger)?;
        Ok(ids)
    }

    /// Drop reservations. Indices not currently reserved are ignored.
    pub fn release(&self, ids: &[u32]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut lock = self.open_lock()?;
        let _guard = lock
            .write()
            .with_context(|| format!("Failed to lock {:?}", self.lock_path))?;

        let mut ledger = self.load_ledger()?;
        for id in ids {
            ledger.remove(id);
        }
        self.store_ledger(&ledger)
    }

    fn open_lock(&self) -> Result<fd_lock::RwLock<File>> {
        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(parent) = self.ledger_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.lock_path)
            .with_context(|| format!("Failed to open lock file {:?}", self.lock_path))?;
        Ok(fd_lock::RwLock::new(file))
    }

    fn load_ledger(&self) -> Result<BTreeMap<u32, f64>> {
        if !self.ledger_path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = std::fs::read_to_string(&self.ledger_path)
            .with_context(|| format!("Failed to read {:?}", self.ledger_path))?;
        let parsed: BTreeMap<String, f64> =
            serde_json::from_str(&raw).with_context(|| format!("Bad ledger {:?}", self.ledger_path))?;
        Ok(parsed
            .into_iter()
            .filter_map(|(k, v)| k.parse().ok().map(|k: u32| (k, v)))
            .collect())
    }

    fn store_ledger(&self, ledger: &BTreeMap<u32, f64>) -> Result<()> {
        let out: BTreeMap<String, f64> = ledger.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        let raw = serde_json::to_string(&out)?;
        std::fs::write(&self.ledger_path, raw)
            .with_context(|| format!("Failed to write {:?}", self.ledger_path))
    }
}

fn epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TTL: Duration = Duration::from_secs(60 * 60);

    fn ledger_with(dir: &TempDir, gpus: Vec<u32>) -> GpuLedger {
        let mut probe = MockGpuProbe::new();
        probe.expect_available_gpus().returning(move || gpus.clone());
        let config = GpuConfig {
            lock_file: dir.path().join("gpu.lock"),
            ledger_file: dir.path().join("gpu-ledger.json"),
        };
        GpuLedger::new(&config, Box::new(probe))
    }

    #[test]
    fn reserve_all_free_without_count() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_with(&dir, vec![2, 0, 1]);
        let got = ledger.try_reserve(&BTreeSet::new(), TTL, None).unwrap();
        assert_eq!(got, vec![0, 1, 2]);
        // Everything is now reserved; a second pass finds nothing.
        let got = ledger.try_reserve(&BTreeSet::new(), TTL, None).unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn candidate_set_restricts_reservation() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_with(&dir, vec![0, 1, 2, 3]);
        let candidates: BTreeSet<u32> = [1, 3].into_iter().collect();
        let got = ledger.try_reserve(&candidates, TTL, None).unwrap();
        assert_eq!(got, vec![1, 3]);
    }

    #[test]
    fn counted_reservation_is_all_or_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_with(&dir, vec![0, 1]);
        assert!(ledger
            .try_reserve(&BTreeSet::new(), TTL, Some(3))
            .unwrap()
            .is_empty());
        // The failed attempt must not have reserved anything.
        let got = ledger.try_reserve(&BTreeSet::new(), TTL, Some(2)).unwrap();
        assert_eq!(got, vec![0, 1]);
    }

    #[test]
    fn release_is_the_inverse_of_reserve() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_with(&dir, vec![0, 1]);
        let got = ledger.try_reserve(&BTreeSet::new(), TTL, None).unwrap();
        ledger.release(&got).unwrap();
        let again = ledger.try_reserve(&BTreeSet::new(), TTL, None).unwrap();
        assert_eq!(again, got);
    }

    #[test]
    fn release_of_unreserved_indices_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_with(&dir, vec![0]);
        ledger.release(&[5, 6]).unwrap();
        let got = ledger.try_reserve(&BTreeSet::new(), TTL, None).unwrap();
        assert_eq!(got, vec![0]);
    }

    #[test]
    fn stale_entries_are_swept() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_with(&dir, vec![0]);
        // A reservation left behind long ago by a crashed process.
        std::fs::write(
            dir.path().join("gpu-ledger.json"),
            r#"{"0": 1000000.0}"#,
        )
        .unwrap();
        let got = ledger.try_reserve(&BTreeSet::new(), TTL, None).unwrap();
        assert_eq!(got, vec![0]);
    }

    #[test]
    fn fresh_entries_survive_the_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_with(&dir, vec![0, 1]);
        let first = ledger.try_reserve(&BTreeSet::new(), TTL, Some(1)).unwrap();
        assert_eq!(first, vec![0]);
        let second = ledger.try_reserve(&BTreeSet::new(), TTL, None).unwrap();
        assert_eq!(second, vec![1]);
    }
}
