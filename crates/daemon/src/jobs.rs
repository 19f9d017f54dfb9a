//! Job model: per-frame processing records, per-shot locked settings and assembly status.
//!
//! These are plain values read out of the [`JobStore`](crate::store::JobStore); every state
//! change goes through the store's transactional operations.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Processing state of a frame job.
///
/// `detected -> decoding -> xform -> dpx_write -> done`, any stage may go to `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Stable on disk and waiting for a worker.
    Detected,
    /// Leased by a worker and being decoded.
    Decoding,
    /// Running through the color pipeline.
    Xform,
    /// Writing the DPX frame and sidecars.
    DpxWrite,
    /// Finished successfully.
    Done,
    /// Finished with an error recorded in `last_error`.
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Detected,
        JobState::Decoding,
        JobState::Xform,
        JobState::DpxWrite,
        JobState::Done,
        JobState::Failed,
    ];

    /// States a crashed worker can leave behind
    pub const INFLIGHT: [JobState; 3] = [JobState::Decoding, JobState::Xform, JobState::DpxWrite];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Detected => "detected",
            JobState::Decoding => "decoding",
            JobState::Xform => "xform",
            JobState::DpxWrite => "dpx_write",
            JobState::Done => "done",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }
}

impl Default for JobState {
    fn default() -> Self {
        Self::Detected
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown job state: {}", s))
    }
}

/// Whether a shot's delivery movie needs (re)building.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssemblyState {
    Pending,
    /// Was assembled, then received more frames.
    Dirty,
    Done,
}

impl AssemblyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssemblyState::Pending => "pending",
            AssemblyState::Dirty => "dirty",
            AssemblyState::Done => "done",
        }
    }
}

impl std::fmt::Display for AssemblyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssemblyState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AssemblyState::Pending),
            "dirty" => Ok(AssemblyState::Dirty),
            "done" => Ok(AssemblyState::Done),
            other => Err(format!("unknown assembly state: {}", other)),
        }
    }
}

/// One frame's processing record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: i64,
    /// Source RAW file; unique across the store.
    pub source_path: PathBuf,
    pub shot_name: String,
    pub frame_number: u32,
    pub state: JobState,
    /// Number of times the job has been leased.
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Worker currently owning the job.
    pub worker_id: Option<String>,
    /// DPX written for this frame.
    pub output_path: Option<PathBuf>,
    /// SHA-256 of the source file.
    pub source_sha256: Option<String>,
    pub detected_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub updated_at: String,
}

/// White balance and exposure locked by the first decoded frame of a shot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShotSettings {
    pub shot_name: String,
    /// Channel gains (R, G, B, G2).
    pub wb_multipliers: [f32; 4],
    pub exposure_offset_stops: f64,
    pub reference_source_path: PathBuf,
    pub created_at: String,
}

/// Assembly status of one shot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShotAssembly {
    pub shot_name: String,
    pub last_frame_done_at: String,
    pub state: AssemblyState,
    pub output_mov_path: Option<PathBuf>,
    pub review_mov_path: Option<PathBuf>,
    pub updated_at: String,
}

/// Format a UTC instant the way the store persists timestamps.
///
/// Fixed width with microseconds and a `Z` suffix, so string order equals time order.
pub fn format_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current time in store timestamp format
pub fn utc_now() -> String {
    format_timestamp(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_job_state_round_trips_through_str() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
            assert_eq!(state.to_string(), state.as_str());
        }
        assert!("queued".parse::<JobState>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Done.is_terminal());
        assert!(JobState::Failed.is_terminal());
        for state in JobState::INFLIGHT {
            assert!(!state.is_terminal());
        }
        assert!(!JobState::Detected.is_terminal());
    }

    #[test]
    fn test_job_state_serializes_snake_case() {
        let json = serde_json::to_string(&JobState::DpxWrite).unwrap();
        assert_eq!(json, "\"dpx_write\"");
    }

    #[test]
    fn test_assembly_state_parse() {
        assert_eq!("dirty".parse::<AssemblyState>().unwrap(), AssemblyState::Dirty);
        assert!("building".parse::<AssemblyState>().is_err());
    }

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 9, 59, 59).unwrap();
        let earlier = format_timestamp(base);
        let later = format_timestamp(base + Duration::microseconds(1));
        let much_later = format_timestamp(base + Duration::hours(30));
        assert!(earlier < later);
        assert!(later < much_later);
        assert_eq!(earlier, "2024-03-01T09:59:59.000000Z");
    }
}
