//! Durable job queue backed by SQLite.
//!
//! Every operation is individually transactional. Claims run inside a `BEGIN IMMEDIATE`
//! transaction and every state advance is a conditional `UPDATE ... WHERE state = ?`, so
//! workers in different threads or processes, each holding its own [`JobStore`], never claim
//! the same row. The database runs in WAL mode.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use thiserror::Error;

use crate::jobs::{format_timestamp, utc_now, AssemblyState, Job, JobState, ShotAssembly, ShotSettings};

/// Longest `last_error` text kept on a job
pub const MAX_ERROR_CHARS: usize = 4000;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    source_path     TEXT NOT NULL UNIQUE,
    shot_name       TEXT NOT NULL,
    frame_number    INTEGER NOT NULL,
    state           TEXT NOT NULL,
    attempts        INTEGER NOT NULL DEFAULT 0,
    last_error      TEXT,
    worker_id       TEXT,
    output_path     TEXT,
    source_sha256   TEXT,
    detected_at     TEXT NOT NULL,
    started_at      TEXT,
    finished_at     TEXT,
    updated_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_jobs_state_detected ON jobs(state, detected_at);
CREATE INDEX IF NOT EXISTS idx_jobs_shot_frame ON jobs(shot_name, frame_number);

CREATE TABLE IF NOT EXISTS shot_settings (
    shot_name               TEXT PRIMARY KEY,
    wb_multipliers_json     TEXT NOT NULL,
    exposure_offset_stops   REAL NOT NULL,
    reference_source_path   TEXT NOT NULL,
    created_at              TEXT NOT NULL,
    updated_at              TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS shot_assembly (
    shot_name           TEXT PRIMARY KEY,
    last_frame_done_at  TEXT NOT NULL,
    assembly_state      TEXT NOT NULL,
    output_mov_path     TEXT,
    review_mov_path     TEXT,
    updated_at          TEXT NOT NULL
);
";

/// Errors from the job store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to prepare database directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt shot settings: {0}")]
    Json(#[from] serde_json::Error),
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

fn parse_column<T>(row: &Row<'_>, name: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let idx = row.as_ref().column_index(name)?;
    let text: String = row.get(idx)?;
    text.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get("id")?,
        source_path: PathBuf::from(row.get::<_, String>("source_path")?),
        shot_name: row.get("shot_name")?,
        frame_number: row.get("frame_number")?,
        state: parse_column(row, "state")?,
        attempts: row.get("attempts")?,
        last_error: row.get("last_error")?,
        worker_id: row.get("worker_id")?,
        output_path: row.get::<_, Option<String>>("output_path")?.map(PathBuf::from),
        source_sha256: row.get("source_sha256")?,
        detected_at: row.get("detected_at")?,
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn assembly_from_row(row: &Row<'_>) -> rusqlite::Result<ShotAssembly> {
    Ok(ShotAssembly {
        shot_name: row.get("shot_name")?,
        last_frame_done_at: row.get("last_frame_done_at")?,
        state: parse_column(row, "assembly_state")?,
        output_mov_path: row.get::<_, Option<String>>("output_mov_path")?.map(PathBuf::from),
        review_mov_path: row.get::<_, Option<String>>("review_mov_path")?.map(PathBuf::from),
        updated_at: row.get("updated_at")?,
    })
}

/// Connection to the durable job queue.
///
/// One store per thread or process; the connection itself is not shared.
pub struct JobStore {
    conn: Connection,
    db_path: PathBuf,
}

impl std::fmt::Debug for JobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStore").field("db_path", &self.db_path).finish()
    }
}

impl JobStore {
    /// Open (creating if needed) the queue database at `db_path`.
    ///
    /// Creates the parent directory, enables WAL and a 30 s busy timeout, and ensures the schema.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            db_path: db_path.to_path_buf(),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn close(self) -> Result<(), StoreError> {
        self.conn.close().map_err(|(_, e)| StoreError::Sqlite(e))
    }

    /// Insert a new `detected` job.
    ///
    /// # Returns
    /// * `Ok(true)` if a job was inserted
    /// * `Ok(false)` if the source path is already known (no-op)
    pub fn enqueue_detected(
        &self,
        source_path: &Path,
        shot_name: &str,
        frame_number: u32,
    ) -> Result<bool, StoreError> {
        let now = utc_now();
        let inserted = self.conn.execute(
            "INSERT INTO jobs(source_path, shot_name, frame_number, state, detected_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(source_path) DO NOTHING",
            params![
                path_text(source_path),
                shot_name,
                frame_number,
                JobState::Detected.as_str(),
                now
            ],
        )?;
        Ok(inserted == 1)
    }

    /// Insert or reset a job to `detected`, clearing worker, error and start/finish times.
    pub fn force_detected(
        &self,
        source_path: &Path,
        shot_name: &str,
        frame_number: u32,
    ) -> Result<(), StoreError> {
        let now = utc_now();
        self.conn.execute(
            "INSERT INTO jobs(source_path, shot_name, frame_number, state, detected_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(source_path) DO UPDATE SET
               shot_name = excluded.shot_name,
               frame_number = excluded.frame_number,
               state = excluded.state,
               updated_at = excluded.updated_at,
               started_at = NULL,
               finished_at = NULL,
               worker_id = NULL,
               last_error = NULL",
            params![
                path_text(source_path),
                shot_name,
                frame_number,
                JobState::Detected.as_str(),
                now
            ],
        )?;
        Ok(())
    }

    /// Crash recovery: move every in-flight job back to `detected`.
    ///
    /// Clears the owning worker and records `reset after restart` unless an error is already
    /// present. Returns the number of jobs reset.
    pub fn reset_inflight_to_detected(&self) -> Result<usize, StoreError> {
        let now = utc_now();
        let count = self.conn.execute(
            "UPDATE jobs
             SET state = ?1, updated_at = ?2, worker_id = NULL,
                 last_error = COALESCE(last_error, 'reset after restart')
             WHERE state IN (?3, ?4, ?5)",
            params![
                JobState::Detected.as_str(),
                now,
                JobState::INFLIGHT[0].as_str(),
                JobState::INFLIGHT[1].as_str(),
                JobState::INFLIGHT[2].as_str()
            ],
        )?;
        Ok(count)
    }

    /// Claim the oldest `detected` job for `worker_id`.
    ///
    /// Oldest means ordered by detection time, then id. Returns `None` when the queue is empty
    /// or another worker won the race for the row.
    pub fn lease_next_job(&self, worker_id: &str) -> Result<Option<Job>, StoreError> {
        self.lease_where(
            "SELECT id FROM jobs WHERE state = ?1 ORDER BY detected_at ASC, id ASC LIMIT 1",
            None,
            worker_id,
        )
    }

    /// Claim the `detected` job for one specific source path.
    pub fn lease_job_for_source(
        &self,
        source_path: &Path,
        worker_id: &str,
    ) -> Result<Option<Job>, StoreError> {
        self.lease_where(
            "SELECT id FROM jobs WHERE state = ?1 AND source_path = ?2 LIMIT 1",
            Some(path_text(source_path)),
            worker_id,
        )
    }

    fn lease_where(
        &self,
        select_sql: &str,
        source_path: Option<String>,
        worker_id: &str,
    ) -> Result<Option<Job>, StoreError> {
        let now = utc_now();
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;

        let detected = JobState::Detected.as_str();
        let candidate: Option<i64> = match &source_path {
            Some(path) => tx
                .query_row(select_sql, params![detected, path], |row| row.get(0))
                .optional()?,
            None => tx
                .query_row(select_sql, params![detected], |row| row.get(0))
                .optional()?,
        };
        let Some(job_id) = candidate else {
            tx.commit()?;
            return Ok(None);
        };

        let updated = tx.execute(
            "UPDATE jobs
             SET state = ?1, attempts = attempts + 1, worker_id = ?2,
                 started_at = COALESCE(started_at, ?3), updated_at = ?3
             WHERE id = ?4 AND state = ?5",
            params![JobState::Decoding.as_str(), worker_id, now, job_id, detected],
        )?;
        tx.commit()?;

        if updated == 0 {
            return Ok(None);
        }
        self.get_job(job_id)
    }

    /// Conditionally advance a job; applies only while the row is still in `from`.
    ///
    /// Returns whether the row was updated. `last_error` replaces the stored error.
    pub fn transition(
        &self,
        job_id: i64,
        from: JobState,
        to: JobState,
        last_error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let updated = self.conn.execute(
            "UPDATE jobs SET state = ?1, updated_at = ?2, last_error = ?3
             WHERE id = ?4 AND state = ?5",
            params![
                to.as_str(),
                utc_now(),
                last_error.map(|e| truncate_chars(e, MAX_ERROR_CHARS)),
                job_id,
                from.as_str()
            ],
        )?;
        Ok(updated == 1)
    }

    /// Terminal success: records the output path and source hash and clears the error.
    pub fn mark_done(
        &self,
        job_id: i64,
        output_path: &Path,
        source_sha256: Option<&str>,
    ) -> Result<(), StoreError> {
        let now = utc_now();
        self.conn.execute(
            "UPDATE jobs
             SET state = ?1, updated_at = ?2, finished_at = ?2, output_path = ?3,
                 source_sha256 = ?4, last_error = NULL
             WHERE id = ?5",
            params![
                JobState::Done.as_str(),
                now,
                path_text(output_path),
                source_sha256,
                job_id
            ],
        )?;
        Ok(())
    }

    /// Terminal failure; `error` is truncated to [`MAX_ERROR_CHARS`].
    pub fn mark_failed(&self, job_id: i64, error: &str) -> Result<(), StoreError> {
        let now = utc_now();
        self.conn.execute(
            "UPDATE jobs SET state = ?1, updated_at = ?2, finished_at = ?2, last_error = ?3
             WHERE id = ?4",
            params![
                JobState::Failed.as_str(),
                now,
                truncate_chars(error, MAX_ERROR_CHARS),
                job_id
            ],
        )?;
        Ok(())
    }

    pub fn get_job(&self, job_id: i64) -> Result<Option<Job>, StoreError> {
        Ok(self
            .conn
            .query_row("SELECT * FROM jobs WHERE id = ?1", params![job_id], job_from_row)
            .optional()?)
    }

    pub fn get_job_by_source(&self, source_path: &Path) -> Result<Option<Job>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT * FROM jobs WHERE source_path = ?1",
                params![path_text(source_path)],
                job_from_row,
            )
            .optional()?)
    }

    pub fn get_output_path(&self, job_id: i64) -> Result<Option<PathBuf>, StoreError> {
        let path: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT output_path FROM jobs WHERE id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(path.flatten().map(PathBuf::from))
    }

    /// Jobs of one shot ordered by frame number
    pub fn jobs_for_shot(&self, shot_name: &str) -> Result<Vec<Job>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM jobs WHERE shot_name = ?1 ORDER BY frame_number ASC, id ASC",
        )?;
        let jobs = stmt
            .query_map(params![shot_name], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    /// Job count per state; states with no jobs are absent.
    pub fn stats(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state ORDER BY state")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?)))?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let (state, n) = row?;
            counts.insert(state, n);
        }
        Ok(counts)
    }

    /// Most recently updated jobs, newest first (ties broken by descending id).
    pub fn recent_jobs(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM jobs ORDER BY updated_at DESC, id DESC LIMIT ?1")?;
        let jobs = stmt
            .query_map(params![limit as i64], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    pub fn get_shot_settings(&self, shot_name: &str) -> Result<Option<ShotSettings>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT shot_name, wb_multipliers_json, exposure_offset_stops,
                        reference_source_path, created_at
                 FROM shot_settings WHERE shot_name = ?1",
                params![shot_name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((shot_name, wb_json, exposure, reference, created_at)) = row else {
            return Ok(None);
        };
        let wb_multipliers: [f32; 4] = serde_json::from_str(&wb_json)?;
        Ok(Some(ShotSettings {
            shot_name,
            wb_multipliers,
            exposure_offset_stops: exposure,
            reference_source_path: PathBuf::from(reference),
            created_at,
        }))
    }

    /// Lock settings for a shot. The first writer wins; later calls are no-ops.
    ///
    /// Returns whether this call created the lock.
    pub fn set_shot_settings(
        &self,
        shot_name: &str,
        wb_multipliers: [f32; 4],
        exposure_offset_stops: f64,
        reference_source_path: &Path,
    ) -> Result<bool, StoreError> {
        let now = utc_now();
        let inserted = self.conn.execute(
            "INSERT INTO shot_settings(shot_name, wb_multipliers_json, exposure_offset_stops,
                                       reference_source_path, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(shot_name) DO NOTHING",
            params![
                shot_name,
                serde_json::to_string(&wb_multipliers)?,
                exposure_offset_stops,
                path_text(reference_source_path),
                now
            ],
        )?;
        Ok(inserted == 1)
    }

    /// Record a finished frame for a shot; a `done` shot becomes `dirty`.
    pub fn mark_shot_frame_done(&self, shot_name: &str) -> Result<(), StoreError> {
        let now = utc_now();
        self.conn.execute(
            "INSERT INTO shot_assembly(shot_name, last_frame_done_at, assembly_state, updated_at)
             VALUES (?1, ?2, 'pending', ?2)
             ON CONFLICT(shot_name) DO UPDATE SET
               last_frame_done_at = excluded.last_frame_done_at,
               updated_at = excluded.updated_at,
               assembly_state = CASE WHEN shot_assembly.assembly_state = 'done'
                                     THEN 'dirty' ELSE shot_assembly.assembly_state END",
            params![shot_name, now],
        )?;
        Ok(())
    }

    /// Shots in `pending`/`dirty` whose last finished frame is at least `stale_seconds` old,
    /// oldest first.
    pub fn shots_ready_for_assembly(&self, stale_seconds: f64) -> Result<Vec<String>, StoreError> {
        let stale_ms = (stale_seconds.max(0.0) * 1000.0) as i64;
        let cutoff = format_timestamp(Utc::now() - chrono::Duration::milliseconds(stale_ms));
        let mut stmt = self.conn.prepare(
            "SELECT shot_name FROM shot_assembly
             WHERE assembly_state IN ('pending', 'dirty') AND last_frame_done_at <= ?1
             ORDER BY last_frame_done_at ASC",
        )?;
        let shots = stmt
            .query_map(params![cutoff], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(shots)
    }

    pub fn mark_shot_assembly_done(
        &self,
        shot_name: &str,
        output_mov_path: &Path,
        review_mov_path: Option<&Path>,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE shot_assembly
             SET assembly_state = ?1, output_mov_path = ?2, review_mov_path = ?3, updated_at = ?4
             WHERE shot_name = ?5",
            params![
                AssemblyState::Done.as_str(),
                path_text(output_mov_path),
                review_mov_path.map(path_text),
                utc_now(),
                shot_name
            ],
        )?;
        Ok(())
    }

    /// Revert a shot to `pending` so the next stale check retries it.
    pub fn mark_shot_assembly_failed(&self, shot_name: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE shot_assembly SET assembly_state = ?1, updated_at = ?2 WHERE shot_name = ?3",
            params![AssemblyState::Pending.as_str(), utc_now(), shot_name],
        )?;
        Ok(())
    }

    pub fn get_shot_assembly(&self, shot_name: &str) -> Result<Option<ShotAssembly>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT * FROM shot_assembly WHERE shot_name = ?1",
                params![shot_name],
                assembly_from_row,
            )
            .optional()?)
    }

    #[cfg(test)]
    pub(crate) fn backdate_shot(&self, shot_name: &str, seconds: i64) -> Result<(), StoreError> {
        let at = format_timestamp(Utc::now() - chrono::Duration::seconds(seconds));
        self.conn.execute(
            "UPDATE shot_assembly SET last_frame_done_at = ?1 WHERE shot_name = ?2",
            params![at, shot_name],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn drop_jobs_table(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("DROP TABLE jobs")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> JobStore {
        JobStore::open(&dir.path().join("db").join("queue.sqlite3")).unwrap()
    }

    // Enqueueing the same source path any number of times yields one job
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(20))]

        #[test]
        fn prop_enqueue_is_idempotent(
            stem in "[A-Z]{1,6}_[0-9]{4}",
            repeats in 1usize..5,
        ) {
            let dir = TempDir::new().unwrap();
            let store = open_store(&dir);
            let path = PathBuf::from(format!("/in/{}.cr3", stem));

            let inserted: Vec<bool> = (0..repeats)
                .map(|_| store.enqueue_detected(&path, "SHOT", 1).unwrap())
                .collect();

            prop_assert!(inserted[0]);
            prop_assert!(inserted[1..].iter().all(|b| !b));
            prop_assert_eq!(store.stats().unwrap().get("detected").copied(), Some(1));
        }
    }

    #[test]
    fn test_lease_is_fifo_and_increments_attempts() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.enqueue_detected(Path::new("/in/A_0001.cr3"), "A", 1).unwrap();
        store.enqueue_detected(Path::new("/in/A_0002.cr3"), "A", 2).unwrap();

        let first = store.lease_next_job("worker-1").unwrap().unwrap();
        assert_eq!(first.source_path, PathBuf::from("/in/A_0001.cr3"));
        assert_eq!(first.state, JobState::Decoding);
        assert_eq!(first.attempts, 1);
        assert_eq!(first.worker_id.as_deref(), Some("worker-1"));
        assert!(first.started_at.is_some());

        let second = store.lease_next_job("worker-2").unwrap().unwrap();
        assert_eq!(second.frame_number, 2);
        assert!(store.lease_next_job("worker-3").unwrap().is_none());
    }

    #[test]
    fn test_crash_recovery_hands_job_to_next_worker() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.enqueue_detected(Path::new("/in/A_0001.cr3"), "A", 1).unwrap();

        let leased_by_a = store.lease_next_job("worker-a").unwrap().unwrap();
        // worker-a dies here without completing the job
        drop(store);

        let store = open_store(&dir);
        assert_eq!(store.reset_inflight_to_detected().unwrap(), 1);

        let reset = store.get_job(leased_by_a.id).unwrap().unwrap();
        assert_eq!(reset.state, JobState::Detected);
        assert_eq!(reset.worker_id, None);
        assert_eq!(reset.last_error.as_deref(), Some("reset after restart"));

        let leased_by_b = store.lease_next_job("worker-b").unwrap().unwrap();
        assert_eq!(leased_by_b.id, leased_by_a.id);
        assert_eq!(leased_by_b.attempts, 2);
        // started_at keeps the first lease time
        assert_eq!(leased_by_b.started_at, leased_by_a.started_at);
    }

    #[test]
    fn test_reset_keeps_existing_error_and_skips_terminal_states() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        for i in 1..=3 {
            store
                .enqueue_detected(Path::new(&format!("/in/A_000{}.cr3", i)), "A", i)
                .unwrap();
        }
        let a = store.lease_next_job("w").unwrap().unwrap();
        let b = store.lease_next_job("w").unwrap().unwrap();
        let c = store.lease_next_job("w").unwrap().unwrap();
        store.transition(a.id, JobState::Decoding, JobState::Xform, Some("slow decode")).unwrap();
        store.mark_done(b.id, Path::new("/out/A/dpx/A_0002.dpx"), Some("abc")).unwrap();
        store.mark_failed(c.id, "boom").unwrap();

        assert_eq!(store.reset_inflight_to_detected().unwrap(), 1);
        let a = store.get_job(a.id).unwrap().unwrap();
        assert_eq!(a.state, JobState::Detected);
        assert_eq!(a.last_error.as_deref(), Some("slow decode"));
        assert_eq!(store.get_job(b.id).unwrap().unwrap().state, JobState::Done);
        assert_eq!(store.get_job(c.id).unwrap().unwrap().state, JobState::Failed);
    }

    #[test]
    fn test_concurrent_lease_single_winner() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("queue.sqlite3");
        JobStore::open(&db_path)
            .unwrap()
            .enqueue_detected(Path::new("/in/ONLY_0001.cr3"), "ONLY", 1)
            .unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|i| {
                let barrier = Arc::clone(&barrier);
                let db_path = db_path.clone();
                thread::spawn(move || {
                    let store = JobStore::open(&db_path).unwrap();
                    barrier.wait();
                    store.lease_next_job(&format!("worker-{}", i)).unwrap()
                })
            })
            .collect();

        let results: Vec<Option<Job>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners: Vec<&Job> = results.iter().flatten().collect();
        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0].attempts, 1);
    }

    #[test]
    fn test_transition_only_from_expected_state() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.enqueue_detected(Path::new("/in/A_0001.cr3"), "A", 1).unwrap();
        let job = store.lease_next_job("w").unwrap().unwrap();

        assert!(store.transition(job.id, JobState::Decoding, JobState::Xform, None).unwrap());
        assert!(!store.transition(job.id, JobState::Decoding, JobState::Xform, None).unwrap());
        assert!(store.transition(job.id, JobState::Xform, JobState::DpxWrite, None).unwrap());
        assert_eq!(store.get_job(job.id).unwrap().unwrap().state, JobState::DpxWrite);
    }

    #[test]
    fn test_mark_failed_truncates_and_mark_done_clears_error() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.enqueue_detected(Path::new("/in/A_0001.cr3"), "A", 1).unwrap();
        let job = store.lease_next_job("w").unwrap().unwrap();

        store.mark_failed(job.id, &"x".repeat(5000)).unwrap();
        let failed = store.get_job(job.id).unwrap().unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.last_error.unwrap().chars().count(), MAX_ERROR_CHARS);
        assert!(failed.finished_at.is_some());

        // Terminal transitions apply regardless of current state
        store.mark_done(job.id, Path::new("/out/A_0001.dpx"), None).unwrap();
        let done = store.get_job(job.id).unwrap().unwrap();
        assert_eq!(done.state, JobState::Done);
        assert_eq!(done.last_error, None);
        assert_eq!(
            store.get_output_path(job.id).unwrap(),
            Some(PathBuf::from("/out/A_0001.dpx"))
        );
        assert_eq!(store.get_output_path(9999).unwrap(), None);
    }

    #[test]
    fn test_force_detected_resets_existing_row() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let path = Path::new("/in/A_0001.cr3");
        store.enqueue_detected(path, "A", 1).unwrap();
        let job = store.lease_next_job("w").unwrap().unwrap();
        store.mark_failed(job.id, "decode failed").unwrap();

        store.force_detected(path, "A2", 1).unwrap();
        let reset = store.get_job_by_source(path).unwrap().unwrap();
        assert_eq!(reset.id, job.id);
        assert_eq!(reset.state, JobState::Detected);
        assert_eq!(reset.shot_name, "A2");
        assert_eq!(reset.last_error, None);
        assert_eq!(reset.worker_id, None);
        assert_eq!(reset.started_at, None);
        assert_eq!(reset.finished_at, None);

        // Unknown paths are inserted
        store.force_detected(Path::new("/in/B_0001.cr3"), "B", 1).unwrap();
        assert_eq!(store.stats().unwrap().get("detected").copied(), Some(2));
    }

    #[test]
    fn test_lease_job_for_source_only_claims_that_path() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.enqueue_detected(Path::new("/in/A_0001.cr3"), "A", 1).unwrap();
        store.enqueue_detected(Path::new("/in/A_0002.cr3"), "A", 2).unwrap();

        let job = store
            .lease_job_for_source(Path::new("/in/A_0002.cr3"), "transcode-one")
            .unwrap()
            .unwrap();
        assert_eq!(job.frame_number, 2);
        assert!(store
            .lease_job_for_source(Path::new("/in/A_0002.cr3"), "transcode-one")
            .unwrap()
            .is_none());
        assert!(store
            .lease_job_for_source(Path::new("/in/missing.cr3"), "transcode-one")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_shot_settings_first_writer_wins() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert!(store.get_shot_settings("A").unwrap().is_none());

        assert!(store
            .set_shot_settings("A", [2.0, 1.0, 1.5, 1.0], 0.5, Path::new("/in/A_0001.cr3"))
            .unwrap());
        assert!(!store
            .set_shot_settings("A", [9.0, 9.0, 9.0, 9.0], 3.0, Path::new("/in/A_0002.cr3"))
            .unwrap());

        let settings = store.get_shot_settings("A").unwrap().unwrap();
        assert_eq!(settings.wb_multipliers, [2.0, 1.0, 1.5, 1.0]);
        assert_eq!(settings.exposure_offset_stops, 0.5);
        assert_eq!(settings.reference_source_path, PathBuf::from("/in/A_0001.cr3"));
    }

    #[test]
    fn test_shot_assembly_lifecycle() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store.mark_shot_frame_done("A").unwrap();
        assert_eq!(
            store.get_shot_assembly("A").unwrap().unwrap().state,
            AssemblyState::Pending
        );
        // Not stale yet
        assert!(store.shots_ready_for_assembly(60.0).unwrap().is_empty());

        store.backdate_shot("A", 120).unwrap();
        assert_eq!(store.shots_ready_for_assembly(60.0).unwrap(), vec!["A".to_string()]);

        store
            .mark_shot_assembly_done("A", Path::new("/out/A/A.mov"), None)
            .unwrap();
        let done = store.get_shot_assembly("A").unwrap().unwrap();
        assert_eq!(done.state, AssemblyState::Done);
        assert_eq!(done.output_mov_path, Some(PathBuf::from("/out/A/A.mov")));
        assert!(store.shots_ready_for_assembly(0.0).unwrap().is_empty());

        // Another frame re-opens the shot
        store.mark_shot_frame_done("A").unwrap();
        assert_eq!(
            store.get_shot_assembly("A").unwrap().unwrap().state,
            AssemblyState::Dirty
        );

        // A pending shot is never demoted
        store.mark_shot_frame_done("B").unwrap();
        store.mark_shot_frame_done("B").unwrap();
        assert_eq!(
            store.get_shot_assembly("B").unwrap().unwrap().state,
            AssemblyState::Pending
        );

        store.mark_shot_assembly_failed("A").unwrap();
        assert_eq!(
            store.get_shot_assembly("A").unwrap().unwrap().state,
            AssemblyState::Pending
        );
    }

    #[test]
    fn test_recent_jobs_and_jobs_for_shot() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        for (stem, shot, frame) in [("B_0002", "B", 2), ("A_0001", "A", 1), ("B_0001", "B", 1)] {
            store
                .enqueue_detected(Path::new(&format!("/in/{}.cr3", stem)), shot, frame)
                .unwrap();
        }

        let recent = store.recent_jobs(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent[0].updated_at >= recent[1].updated_at);

        let frames: Vec<u32> = store
            .jobs_for_shot("B")
            .unwrap()
            .iter()
            .map(|j| j.frame_number)
            .collect();
        assert_eq!(frames, vec![1, 2]);
    }
}
