//! Cooperative cancellation shared by the controller and its collaborators.
//!
//! Besides the flag, a token records the process groups and scratch
//! directories that are live under it, so a forced exit can still clean up
//! after work that never got to unwind.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Longest uninterrupted sleep while waiting on a cancellable operation.
pub const POLL_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct Shared {
    cancelled: AtomicBool,
    groups: Mutex<BTreeSet<u32>>,
    dirs: Mutex<BTreeSet<PathBuf>>,
}

/// Clone-shared cancellation flag. Once cancelled it stays cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    shared: Arc<Shared>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless cancelled first.
    ///
    /// Returns `false` when the sleep was cut short by cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(POLL_SLICE));
        }
    }

    /// Record a live process group led by `pgid`.
    pub fn track_group(&self, pgid: u32) {
        locked(&self.shared.groups).insert(pgid);
    }

    pub fn untrack_group(&self, pgid: u32) {
        locked(&self.shared.groups).remove(&pgid);
    }

    pub fn tracked_groups(&self) -> Vec<u32> {
        locked(&self.shared.groups).iter().copied().collect()
    }

    /// Record a scratch directory until the returned guard is dropped.
    pub fn track_dir(&self, path: &Path) -> TrackedDir {
        locked(&self.shared.dirs).insert(path.to_path_buf());
        TrackedDir {
            token: self.clone(),
            path: path.to_path_buf(),
        }
    }

    pub fn tracked_dirs(&self) -> Vec<PathBuf> {
        locked(&self.shared.dirs).iter().cloned().collect()
    }
}

/// Keeps a directory listed in [`CancelToken::tracked_dirs`] while alive.
#[derive(Debug)]
pub struct TrackedDir {
    token: CancelToken,
    path: PathBuf,
}

impl Drop for TrackedDir {
    fn drop(&mut self) {
        locked(&self.token.shared.dirs).remove(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn sleep_completes_when_not_cancelled() {
        let token = CancelToken::new();
        assert!(token.sleep(Duration::from_millis(20)));
    }

    #[test]
    fn sleep_returns_early_on_cancel() {
        let token = CancelToken::new();
        let canceller = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            canceller.cancel();
        });
        let started = Instant::now();
        assert!(!token.sleep(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(2));
        handle.join().expect("canceller thread");
    }

    #[test]
    fn tracks_groups_and_dirs_across_clones() {
        let token = CancelToken::new();
        let other = token.clone();
        token.track_group(41);
        token.track_group(42);
        token.untrack_group(41);
        assert_eq!(other.tracked_groups(), vec![42]);

        let dir = token.track_dir(Path::new("/tmp/svcgen-sandbox-x"));
        assert_eq!(other.tracked_dirs(), vec![PathBuf::from("/tmp/svcgen-sandbox-x")]);
        drop(dir);
        assert!(other.tracked_dirs().is_empty());
    }
}
