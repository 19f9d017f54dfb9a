//! Batch conversion of existing DPX sequences to flat ProRes deliveries.
//!
//! Every directory named `dpx` under a root is scanned for `*.dpx`; files are grouped into
//! sequences by the stem prefix before their trailing frame digits.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;
use walkdir::WalkDir;

use super::{Assembler, AssemblyError};
use crate::concurrency::StopFlag;
use crate::shot::split_trailing_digits;

const SEPARATORS: &[char] = &['_', '-', '.', ' '];

/// One numbered DPX sequence found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DpxSequence {
    /// Name of the directory holding `dpx/`
    pub shot_name: String,
    pub dpx_dir: PathBuf,
    /// Stem text before the frame digits, separators included (`A_`)
    pub raw_prefix: String,
    /// Prefix with trailing separators trimmed (`A`)
    pub sequence_name: String,
    pub frame_count: usize,
}

impl DpxSequence {
    /// Glob matching exactly this sequence's frames
    pub fn frame_glob(&self) -> String {
        self.dpx_dir
            .join(format!("{}[0-9]*.dpx", self.raw_prefix))
            .to_string_lossy()
            .into_owned()
    }
}

/// `(raw prefix, sequence name)` for a numbered stem, `None` when it has no digits or no prefix
fn sequence_parts(stem: &str) -> Option<(&str, &str)> {
    let (prefix, digits) = split_trailing_digits(stem);
    if digits.is_empty() || prefix.is_empty() {
        return None;
    }
    let trimmed = prefix.trim_end_matches(SEPARATORS);
    let name = if trimmed.is_empty() { prefix } else { trimmed };
    Some((prefix, name))
}

/// Find every DPX sequence under `root`, sorted by directory then prefix.
pub fn discover_dpx_sequences(root: &Path) -> Result<Vec<DpxSequence>, AssemblyError> {
    let mut dpx_dirs: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir() && e.file_name() == "dpx")
        .map(|e| e.into_path())
        .collect();
    dpx_dirs.sort();

    let mut sequences = Vec::new();
    for dpx_dir in dpx_dirs {
        let mut groups: BTreeMap<String, (String, usize)> = BTreeMap::new();
        for entry in fs::read_dir(&dpx_dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("dpx") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some((prefix, name)) = sequence_parts(stem) else {
                continue;
            };
            groups
                .entry(prefix.to_string())
                .or_insert_with(|| (name.to_string(), 0))
                .1 += 1;
        }

        let shot_name = dpx_dir
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "default_shot".to_string());
        for (raw_prefix, (sequence_name, frame_count)) in groups {
            sequences.push(DpxSequence {
                shot_name: shot_name.clone(),
                dpx_dir: dpx_dir.clone(),
                raw_prefix,
                sequence_name,
                frame_count,
            });
        }
    }
    Ok(sequences)
}

/// Convert every sequence under `input_root` to `<output_root>/<sequence>.mov`.
///
/// # Arguments
/// * `assembler` - movie assembler
/// * `input_root` - tree containing `*/dpx/*.dpx`
/// * `output_root` - flat output directory, defaults to `<input_root>/PRORES`
/// * `framerate` - output frame rate
/// * `overwrite` - re-encode sequences whose movie already exists
/// * `cancel` - checked before each sequence
///
/// # Returns
/// The movies written, in discovery order. Two sequences mapping to the same output name
/// from different directories fail with [`AssemblyError::SequenceCollision`].
pub fn convert_dpx_sequences(
    assembler: &dyn Assembler,
    input_root: &Path,
    output_root: Option<&Path>,
    framerate: u32,
    overwrite: bool,
    cancel: &StopFlag,
) -> Result<Vec<PathBuf>, AssemblyError> {
    convert_dpx_sequences_with_progress(
        assembler,
        input_root,
        output_root,
        framerate,
        overwrite,
        cancel,
        |_, _| {},
    )
}

/// [`convert_dpx_sequences`] calling `on_written` after each movie is assembled
pub fn convert_dpx_sequences_with_progress<F>(
    assembler: &dyn Assembler,
    input_root: &Path,
    output_root: Option<&Path>,
    framerate: u32,
    overwrite: bool,
    cancel: &StopFlag,
    mut on_written: F,
) -> Result<Vec<PathBuf>, AssemblyError>
where
    F: FnMut(&DpxSequence, &Path),
{
    let output_root = output_root
        .map(Path::to_path_buf)
        .unwrap_or_else(|| input_root.join("PRORES"));
    fs::create_dir_all(&output_root)?;

    let sequences = discover_dpx_sequences(input_root)?;
    let mut reserved: BTreeMap<String, PathBuf> = BTreeMap::new();
    let mut outputs = Vec::new();

    for seq in sequences {
        if cancel.is_stopped() {
            info!("dpx conversion cancelled after {} outputs", outputs.len());
            break;
        }

        let out_name = format!("{}.mov", seq.sequence_name);
        if let Some(first) = reserved.get(&out_name) {
            if *first != seq.dpx_dir {
                return Err(AssemblyError::SequenceCollision {
                    name: out_name,
                    first: first.clone(),
                    second: seq.dpx_dir.clone(),
                });
            }
        }
        reserved.insert(out_name.clone(), seq.dpx_dir.clone());

        let out_mov = output_root.join(&out_name);
        if out_mov.exists() && !overwrite {
            info!("skip existing {}", out_mov.display());
            continue;
        }

        assembler.assemble_logc_prores(&seq.frame_glob(), &out_mov, framerate)?;
        info!(
            "assembled dpx sequence shot={} seq={} frames={} -> {}",
            seq.shot_name,
            seq.sequence_name,
            seq.frame_count,
            out_mov.display()
        );
        on_written(&seq, &out_mov);
        outputs.push(out_mov);
    }
    Ok(outputs)
}
