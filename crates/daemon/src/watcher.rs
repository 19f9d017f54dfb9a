//! Polling source watcher.
//!
//! Every scan interval the ingest tree is listed and allowed files are fed to the
//! [`StabilityTracker`]; every poll interval the tracker's ready paths are handed to the
//! caller. The loop exits once the stop flag is raised.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::concurrency::StopFlag;
use crate::config::WatchConfig;
use crate::scan::scan_sources;
use crate::shot::ShotNamer;
use crate::stability::StabilityTracker;
use crate::store::JobStore;

/// Interval from config seconds, kept between 10 ms and one day
fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.clamp(0.01, 86_400.0)).unwrap_or(Duration::from_secs(1))
}

/// Watches one ingest tree for settled files
#[derive(Debug)]
pub struct SourceWatcher {
    source_dir: PathBuf,
    include_extensions: Vec<String>,
    poll_interval: Duration,
    scan_interval: Duration,
    tracker: StabilityTracker,
    last_scan: Option<Instant>,
}

impl SourceWatcher {
    pub fn new(watch: &WatchConfig) -> Self {
        Self {
            source_dir: watch.source_dir.clone(),
            include_extensions: watch.include_extensions.clone(),
            poll_interval: seconds(watch.poll_interval_seconds),
            scan_interval: seconds(watch.scan_interval_seconds),
            tracker: StabilityTracker::new(watch.stable_seconds),
            last_scan: None,
        }
    }

    /// Feed every allowed file under the source tree to the tracker
    pub fn scan(&mut self) -> usize {
        let found = scan_sources(&self.source_dir, &self.include_extensions);
        for path in &found {
            self.tracker.mark_candidate(path);
        }
        self.last_scan = Some(Instant::now());
        found.len()
    }

    /// One iteration: scan if the scan interval elapsed, then deliver ready paths.
    ///
    /// `on_ready` returns whether the path was accepted; rejected paths are released back to
    /// the tracker and offered again after they settle on a later scan. Returns the number
    /// of paths accepted.
    pub fn poll_once<F>(&mut self, on_ready: &mut F) -> usize
    where
        F: FnMut(&Path) -> bool,
    {
        let scan_due = self
            .last_scan
            .map(|t| t.elapsed() >= self.scan_interval)
            .unwrap_or(true);
        if scan_due {
            let found = self.scan();
            debug!("scanned {} candidates, {} pending", found, self.tracker.pending());
        }

        let mut accepted = 0;
        for path in self.tracker.collect_ready() {
            if on_ready(&path) {
                accepted += 1;
            } else {
                self.tracker.release(&path);
            }
        }
        accepted
    }

    /// Poll until `stop` is raised.
    pub async fn run<F>(&mut self, stop: &StopFlag, mut on_ready: F)
    where
        F: FnMut(&Path) -> bool,
    {
        info!("watching {}", self.source_dir.display());
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        while !stop.is_stopped() {
            ticker.tick().await;
            if stop.is_stopped() {
                break;
            }
            self.poll_once(&mut on_ready);
        }
        info!("watcher stopped");
    }
}

/// The standard `on_ready` callback: infer shot and frame, then enqueue.
///
/// Returns `false` when the store rejected the insert, so the watcher retries the path.
pub fn enqueue_ready(store: &JobStore, namer: &ShotNamer, path: &Path) -> bool {
    let (shot_name, frame) = namer.infer(path);
    match store.enqueue_detected(path, &shot_name, frame) {
        Ok(true) => {
            info!(shot = %shot_name, frame, "queued {}", path.display());
            true
        }
        Ok(false) => {
            debug!("already known: {}", path.display());
            true
        }
        Err(e) => {
            warn!("failed to enqueue {}, will retry: {}", path.display(), e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::jobs::JobState;
    use std::fs;
    use tempfile::TempDir;

    fn quick_watch(root: &Path) -> WatchConfig {
        let mut watch = Config::under_root(root).watch;
        watch.stable_seconds = 0.0;
        watch.poll_interval_seconds = 0.02;
        watch.scan_interval_seconds = 0.02;
        watch
    }

    #[test]
    fn test_poll_once_delivers_allowed_files_once() {
        let dir = TempDir::new().unwrap();
        let watch = quick_watch(dir.path());
        fs::create_dir_all(watch.source_dir.join("SHOT_A")).unwrap();
        fs::write(watch.source_dir.join("SHOT_A/SHOT_A_0001.CR3"), b"raw").unwrap();
        fs::write(watch.source_dir.join("SHOT_A/notes.txt"), b"txt").unwrap();
        fs::write(watch.source_dir.join("SHOT_A/.SHOT_A_0002.cr3"), b"hidden").unwrap();

        let mut watcher = SourceWatcher::new(&watch);
        let mut seen = Vec::new();
        watcher.poll_once(&mut |p: &Path| {
            seen.push(p.to_path_buf());
            true
        });
        watcher.scan();
        watcher.poll_once(&mut |p: &Path| {
            seen.push(p.to_path_buf());
            true
        });

        assert_eq!(seen, vec![watch.source_dir.join("SHOT_A/SHOT_A_0001.CR3")]);
    }

    #[test]
    fn test_enqueue_ready_infers_shot_and_frame() {
        let dir = TempDir::new().unwrap();
        let config = Config::under_root(dir.path());
        let store = JobStore::open(&config.watch.db_path).unwrap();
        let namer = ShotNamer::from_config(&config.watch).unwrap();
        let path = config.watch.source_dir.join("incoming_shots/SHOT_B_0042.cr2");

        assert!(enqueue_ready(&store, &namer, &path));
        assert!(enqueue_ready(&store, &namer, &path));

        let job = store.get_job_by_source(&path).unwrap().unwrap();
        assert_eq!(job.shot_name, "SHOT_B");
        assert_eq!(job.frame_number, 42);
        assert_eq!(job.state, JobState::Detected);
        assert_eq!(store.stats().unwrap().get("detected"), Some(&1));
    }

    #[test]
    fn test_rejected_path_is_offered_again() {
        let dir = TempDir::new().unwrap();
        let watch = quick_watch(dir.path());
        fs::create_dir_all(&watch.source_dir).unwrap();
        let path = watch.source_dir.join("X_0001.cr2");
        fs::write(&path, b"raw").unwrap();

        let mut watcher = SourceWatcher::new(&watch);
        let mut attempts = 0;
        let mut flaky = |_: &Path| {
            attempts += 1;
            attempts > 1
        };
        assert_eq!(watcher.poll_once(&mut flaky), 0);
        watcher.scan();
        assert_eq!(watcher.poll_once(&mut flaky), 1);
        watcher.scan();
        assert_eq!(watcher.poll_once(&mut flaky), 0);
        assert_eq!(attempts, 2);
    }

    #[test]
    fn test_enqueue_ready_reports_store_failure() {
        let dir = TempDir::new().unwrap();
        let config = Config::under_root(dir.path());
        let namer = ShotNamer::from_config(&config.watch).unwrap();
        let store = JobStore::open(&config.watch.db_path).unwrap();
        store.drop_jobs_table().unwrap();

        assert!(!enqueue_ready(&store, &namer, Path::new("/in/A_0001.cr3")));
    }

    #[tokio::test]
    async fn test_run_exits_when_stopped() {
        let dir = TempDir::new().unwrap();
        let watch = quick_watch(dir.path());
        fs::create_dir_all(&watch.source_dir).unwrap();
        fs::write(watch.source_dir.join("X_0001.raw"), b"raw").unwrap();

        let stop = StopFlag::new();
        let mut watcher = SourceWatcher::new(&watch);
        let mut seen = Vec::new();
        let stopper = {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                stop.stop();
            })
        };
        tokio::time::timeout(
            Duration::from_secs(10),
            watcher.run(&stop, |p| {
                seen.push(p.to_path_buf());
                true
            }),
        )
        .await
        .expect("watcher did not stop");
        stopper.await.unwrap();

        assert_eq!(seen, vec![watch.source_dir.join("X_0001.raw")]);
    }
}
