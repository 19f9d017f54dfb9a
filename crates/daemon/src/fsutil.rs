//! Filesystem helpers: atomic writes, no-clobber copies and content hashing.
//!
//! Outputs are written to a temporary sibling and renamed into place, so readers (and a
//! crash) never observe a half-written frame or sidecar.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

/// Open a uniquely named hidden temp file beside `target`, creating parent directories.
///
/// Every call gets its own file, so concurrent writers of the same target never share one.
/// For example: `/out/A/manifest.json` -> `/out/A/.manifest.json.XXXXXX.tmp`
pub fn temp_sibling(target: &Path) -> io::Result<NamedTempFile> {
    let parent = match target.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => parent,
        None => Path::new("."),
    };
    fs::create_dir_all(parent)?;
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    tempfile::Builder::new()
        .prefix(&format!(".{}.", name))
        .suffix(".tmp")
        .tempfile_in(parent)
}

/// Sync `tmp` and rename it over `path`. The temp file is removed on failure.
pub fn persist(tmp: NamedTempFile, path: &Path) -> io::Result<()> {
    tmp.as_file().sync_all()?;
    tmp.persist(path).map(|_| ()).map_err(|e| e.error)
}

/// Write `bytes` to `path` atomically, creating parent directories.
///
/// # Arguments
///
/// * `path` - Final location
/// * `bytes` - Complete file contents
///
/// # Returns
///
/// * `Ok(())` once the file is renamed into place
/// * `Err(io::Error)` if any step failed; the temporary file is removed
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp = temp_sibling(path)?;
    tmp.write_all(bytes)?;
    persist(tmp, path)
}

/// Copy `src` to `dst` unless `dst` already exists.
///
/// Returns whether a copy was made.
pub fn copy_if_absent(src: &Path, dst: &Path) -> io::Result<bool> {
    if dst.exists() {
        return Ok(false);
    }
    if let Some(parent) = dst.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dst)?;
    Ok(true)
}

/// Lowercase hex SHA-256 of a file, streamed in 1 MiB chunks
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1 << 20];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_temp_sibling_is_hidden_and_unique() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("A").join("manifest.json");
        let a = temp_sibling(&target).unwrap();
        let b = temp_sibling(&target).unwrap();

        assert_ne!(a.path(), b.path());
        assert_eq!(a.path().parent(), target.parent());
        let name = a.path().file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with(".manifest.json."));
        assert!(name.ends_with(".tmp"));
    }

    #[test]
    fn test_write_atomic_creates_parents_and_replaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a").join("b").join("file.bin");

        write_atomic(&path, b"first").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"first");

        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
        let leftovers = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_concurrent_writers_of_one_target_all_succeed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shot").join("manifest.json");

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let path = path.clone();
                std::thread::spawn(move || {
                    for round in 0..50 {
                        let body = format!("{{\"writer\": {}, \"round\": {}}}", i, round);
                        write_atomic(&path, body.as_bytes()).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("{\"writer\": ") && text.ends_with('}'));
        assert_eq!(fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn test_copy_if_absent_never_overwrites() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("nested").join("dst.bin");
        fs::write(&src, b"one").unwrap();

        assert!(copy_if_absent(&src, &dst).unwrap());
        fs::write(&src, b"two").unwrap();
        assert!(!copy_if_absent(&src, &dst).unwrap());
        assert_eq!(fs::read(&dst).unwrap(), b"one");
    }

    #[test]
    fn test_sha256_known_digest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("abc.txt");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(sha256_file(&dir.path().join("missing")).is_err());
    }
}
