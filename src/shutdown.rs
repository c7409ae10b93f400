use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Latched operator-interrupt flag.
///
/// Interrupts never unwind the scheduler mid-tick: the Ctrl-C watcher (and
/// the TUI's key handler, which sees Ctrl-C as a key while the terminal is
/// in raw mode) only set this flag, and the loop reads it at tick
/// boundaries. Database transactions and filesystem moves therefore always
/// run to completion.
#[derive(Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub fn spawn_ctrl_c_watcher(flag: ShutdownFlag) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                break;
            }
            tracing::info!("Interrupt received; draining running jobs");
            flag.set();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_latches() {
        let flag = ShutdownFlag::new();
        assert!(!flag.is_set());
        flag.set();
        assert!(flag.is_set());
        let clone = flag.clone();
        assert!(clone.is_set());
    }
}
