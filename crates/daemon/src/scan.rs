//! Scanner module for discovering camera RAW files under the ingest tree.
//!
//! Recursively walks the source directory, skipping hidden directories, and keeps files
//! whose extension is in the configured allow-list.

use std::path::{Path, PathBuf};

/// Lowercased extension of `path` with a leading dot (`.cr3`), if any
pub fn dotted_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_lowercase()))
}

/// Checks if a file's extension is in the allow-list (case-insensitive).
///
/// `extensions` are expected normalized: lowercase with a leading dot.
pub fn has_allowed_extension(path: &Path, extensions: &[String]) -> bool {
    dotted_extension(path)
        .map(|ext| extensions.iter().any(|allowed| *allowed == ext))
        .unwrap_or(false)
}

/// Scans the ingest root for candidate files.
///
/// This function:
/// - Recursively walks the root directory
/// - Skips hidden directories and hidden files (names starting with `.`)
/// - Filters files by the extension allow-list (case-insensitive)
///
/// A missing root yields an empty list. Results are sorted for deterministic ordering.
pub fn scan_sources(root: &Path, extensions: &[String]) -> Vec<PathBuf> {
    use walkdir::WalkDir;

    if !root.exists() {
        return Vec::new();
    }

    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        // Allow the root directory even if it starts with '.'
        if entry.depth() == 0 {
            return true;
        }
        !entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with('.'))
            .unwrap_or(false)
    });

    let mut found: Vec<PathBuf> = walker
        .filter_map(|e| e.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| has_allowed_extension(entry.path(), extensions))
        .map(|entry| entry.into_path())
        .collect();
    found.sort();
    found
}
