//! Runtime marker file for external diagnostics.
//!
//! `<working_dir>/.stopmo_runtime_state.json` records the last startup and shutdown of the
//! watch service. Updates are read-modify-write so keys written by other tools survive, and
//! unreadable content is treated as an empty object.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::fsutil::write_atomic;
use crate::jobs::utc_now;

pub const RUNTIME_STATE_FILE: &str = ".stopmo_runtime_state.json";

pub fn runtime_state_path(working_dir: &Path) -> PathBuf {
    working_dir.join(RUNTIME_STATE_FILE)
}

/// Current marker contents; missing, unreadable or non-object files read as empty
pub fn read_runtime_state(path: &Path) -> Map<String, Value> {
    fs::read_to_string(path)
        .ok()
        .and_then(|text| serde_json::from_str::<Value>(&text).ok())
        .and_then(|value| match value {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .unwrap_or_default()
}

fn write_runtime_state(path: &Path, state: &Map<String, Value>) -> std::io::Result<()> {
    let mut text = serde_json::to_string_pretty(state)?;
    text.push('\n');
    write_atomic(path, text.as_bytes())
}

/// Merge `updates` into the marker at `path`
pub fn update_runtime_state(path: &Path, updates: Map<String, Value>) -> std::io::Result<()> {
    let mut state = read_runtime_state(path);
    state.extend(updates);
    write_runtime_state(path, &state)
}

/// Record a service start
pub fn record_startup(path: &Path, inflight_reset: usize, db_path: &Path) -> std::io::Result<()> {
    let mut updates = Map::new();
    updates.insert("last_startup_utc".into(), Value::from(utc_now()));
    updates.insert("last_inflight_reset_count".into(), Value::from(inflight_reset));
    updates.insert(
        "last_db_path".into(),
        Value::from(db_path.to_string_lossy().into_owned()),
    );
    updates.insert("running".into(), Value::Bool(true));
    update_runtime_state(path, updates)
}

/// Record a clean service stop
pub fn record_shutdown(path: &Path) -> std::io::Result<()> {
    let mut updates = Map::new();
    updates.insert("running".into(), Value::Bool(false));
    updates.insert("last_shutdown_utc".into(), Value::from(utc_now()));
    update_runtime_state(path, updates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_startup_then_shutdown_preserves_foreign_keys() {
        let dir = TempDir::new().unwrap();
        let path = runtime_state_path(dir.path());
        fs::write(&path, r#"{"gui_last_opened": "yesterday", "running": false}"#).unwrap();

        record_startup(&path, 3, Path::new("/work/queue.sqlite3")).unwrap();
        let state = read_runtime_state(&path);
        assert_eq!(state["running"], Value::Bool(true));
        assert_eq!(state["last_inflight_reset_count"], 3);
        assert_eq!(state["last_db_path"], "/work/queue.sqlite3");
        assert_eq!(state["gui_last_opened"], "yesterday");

        record_shutdown(&path).unwrap();
        let state = read_runtime_state(&path);
        assert_eq!(state["running"], Value::Bool(false));
        assert!(state.contains_key("last_shutdown_utc"));
        assert!(state.contains_key("last_startup_utc"));
        assert!(fs::read_to_string(&path).unwrap().ends_with("}\n"));
    }

    #[test]
    fn test_garbage_marker_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let path = runtime_state_path(dir.path());
        assert!(read_runtime_state(&path).is_empty());

        fs::write(&path, "not json").unwrap();
        assert!(read_runtime_state(&path).is_empty());

        fs::write(&path, "[1, 2]").unwrap();
        assert!(read_runtime_state(&path).is_empty());

        record_shutdown(&path).unwrap();
        assert_eq!(read_runtime_state(&path)["running"], Value::Bool(false));
    }
}
