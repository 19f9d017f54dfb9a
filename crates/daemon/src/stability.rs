//! Stability tracking for files still being written by the capture application.
//!
//! A candidate becomes ready once its size and modification time have stayed unchanged for
//! `stable_seconds`, measured both on the monotonic clock since the last observed change and
//! on the wall clock since the file's mtime. A ready path is emitted once and never again.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

/// Size and modification time observed for a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSnapshot {
    pub size: u64,
    pub mtime: SystemTime,
}

impl FileSnapshot {
    /// Read the current snapshot, `None` if the file is gone
    pub fn read(path: &Path) -> Option<Self> {
        let metadata = fs::metadata(path).ok()?;
        Some(Self {
            size: metadata.len(),
            mtime: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        })
    }
}

#[derive(Debug, Clone)]
struct Tracked {
    snapshot: FileSnapshot,
    last_change: Instant,
}

/// Decide whether a tracked file is ready.
///
/// Pure function extracted for property testing.
///
/// # Arguments
/// * `tracked` - Snapshot recorded at the last observed change
/// * `current` - Snapshot read now
/// * `since_change` - Monotonic time elapsed since the last observed change
/// * `since_mtime` - Wall-clock time elapsed since the file's mtime (`None` if mtime is in the future)
/// * `stable_for` - Required quiet period
pub fn is_ready(
    tracked: FileSnapshot,
    current: FileSnapshot,
    since_change: Duration,
    since_mtime: Option<Duration>,
    stable_for: Duration,
) -> bool {
    if tracked != current {
        return false;
    }
    let wall_quiet = since_mtime.map(|d| d >= stable_for).unwrap_or(false);
    since_change >= stable_for && wall_quiet
}

/// Tracks candidate files until they stop changing
#[derive(Debug)]
pub struct StabilityTracker {
    stable_for: Duration,
    tracked: HashMap<PathBuf, Tracked>,
    emitted: HashSet<PathBuf>,
}

impl StabilityTracker {
    pub fn new(stable_seconds: f64) -> Self {
        Self {
            stable_for: Duration::try_from_secs_f64(stable_seconds.max(0.0)).unwrap_or(Duration::MAX),
            tracked: HashMap::new(),
            emitted: HashSet::new(),
        }
    }

    /// Observe a candidate path.
    ///
    /// New paths are recorded; a size or mtime change restarts the quiet period.
    /// Paths already emitted or no longer present are ignored.
    pub fn mark_candidate(&mut self, path: &Path) {
        if self.emitted.contains(path) {
            return;
        }
        let Some(snapshot) = FileSnapshot::read(path) else {
            self.tracked.remove(path);
            return;
        };
        match self.tracked.get_mut(path) {
            Some(entry) if entry.snapshot == snapshot => {}
            Some(entry) => {
                entry.snapshot = snapshot;
                entry.last_change = Instant::now();
            }
            None => {
                self.tracked.insert(
                    path.to_path_buf(),
                    Tracked {
                        snapshot,
                        last_change: Instant::now(),
                    },
                );
            }
        }
    }

    /// Emit every tracked path that has been quiet long enough.
    ///
    /// Emitted paths stop being tracked and are never emitted again. Vanished files are
    /// dropped silently; files that changed since their snapshot restart their quiet period.
    pub fn collect_ready(&mut self) -> Vec<PathBuf> {
        let now = Instant::now();
        let wall_now = SystemTime::now();
        let mut ready = Vec::new();
        let mut vanished = Vec::new();

        for (path, entry) in self.tracked.iter_mut() {
            let Some(current) = FileSnapshot::read(path) else {
                vanished.push(path.clone());
                continue;
            };
            if current != entry.snapshot {
                entry.snapshot = current;
                entry.last_change = now;
                continue;
            }
            let since_mtime = wall_now.duration_since(current.mtime).ok();
            if is_ready(
                entry.snapshot,
                current,
                now.duration_since(entry.last_change),
                since_mtime,
                self.stable_for,
            ) {
                ready.push(path.clone());
            }
        }

        for path in vanished {
            self.tracked.remove(&path);
        }
        for path in &ready {
            self.tracked.remove(path);
            self.emitted.insert(path.clone());
        }
        ready.sort();
        ready
    }

    /// Forget that `path` was emitted so the next scan tracks it again.
    ///
    /// Used when a ready path could not be handed off and must be retried.
    pub fn release(&mut self, path: &Path) {
        self.emitted.remove(path);
    }

    /// Number of paths still waiting to settle
    pub fn pending(&self) -> usize {
        self.tracked.len()
    }
}
