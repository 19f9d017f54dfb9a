//! Shot name and frame number inference from incoming file paths.

use std::path::Path;

use regex::Regex;

use crate::config::WatchConfig;

/// Characters trimmed from the end of a stem prefix (`SHOT_A_` -> `SHOT_A`)
const SEPARATORS: &[char] = &['_', '-', '.', ' '];

/// Split a stem into (prefix, trailing digit run)
pub(crate) fn split_trailing_digits(stem: &str) -> (&str, &str) {
    let idx = stem
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i)
        .unwrap_or(stem.len());
    stem.split_at(idx)
}

/// Frame number: the trailing digit run of the file stem, else 0
pub fn infer_frame_number(path: &Path) -> u32 {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
    let (_, digits) = split_trailing_digits(stem);
    // Saturate absurdly long digit runs instead of failing the file
    digits.parse::<u64>().map(|n| n.min(u32::MAX as u64) as u32).unwrap_or(0)
}

/// Stem with its trailing frame digits and separators removed (`SHOT_A_0012` -> `SHOT_A`)
pub fn stem_prefix(stem: &str) -> &str {
    let (prefix, _) = split_trailing_digits(stem);
    prefix.trim_end_matches(SEPARATORS)
}

/// Derives shot names in a fixed order of heuristics.
///
/// 1. configured regex (capture group 1, else the whole match) searched in the full path
/// 2. file stem prefix before the trailing frame digits
/// 3. parent directory name, unless it is a generic ingest folder
/// 4. the configured default
#[derive(Debug, Clone)]
pub struct ShotNamer {
    regex: Option<Regex>,
    generic_parent_dirs: Vec<String>,
    default_shot_name: String,
}

impl ShotNamer {
    pub fn new(
        shot_regex: Option<&str>,
        generic_parent_dirs: &[String],
        default_shot_name: &str,
    ) -> Result<Self, regex::Error> {
        let regex = shot_regex.map(Regex::new).transpose()?;
        Ok(Self {
            regex,
            generic_parent_dirs: generic_parent_dirs
                .iter()
                .map(|d| d.to_lowercase())
                .collect(),
            default_shot_name: default_shot_name.to_string(),
        })
    }

    pub fn from_config(watch: &WatchConfig) -> Result<Self, regex::Error> {
        Self::new(
            watch.shot_regex.as_deref(),
            &watch.generic_parent_dirs,
            &watch.default_shot_name,
        )
    }

    pub fn infer_shot_name(&self, path: &Path) -> String {
        if let Some(re) = &self.regex {
            if let Some(caps) = re.captures(&path.to_string_lossy()) {
                let m = caps.get(1).or_else(|| caps.get(0));
                if let Some(m) = m.filter(|m| !m.as_str().is_empty()) {
                    return m.as_str().to_string();
                }
            }
        }

        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
        let prefix = stem_prefix(stem);
        if !prefix.is_empty() {
            return prefix.to_string();
        }

        if let Some(parent) = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
        {
            if !parent.is_empty() && !self.is_generic_dir(parent) {
                return parent.to_string();
            }
        }

        self.default_shot_name.clone()
    }

    /// (shot name, frame number) for a detected path
    pub fn infer(&self, path: &Path) -> (String, u32) {
        (self.infer_shot_name(path), infer_frame_number(path))
    }

    fn is_generic_dir(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.generic_parent_dirs.iter().any(|g| *g == lower)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn namer(regex: Option<&str>) -> ShotNamer {
        let generic = vec!["incoming".to_string(), "capture".to_string()];
        ShotNamer::new(regex, &generic, "default_shot").unwrap()
    }

    #[test]
    fn test_stem_prefix_and_frame() {
        let n = namer(None);
        assert_eq!(
            n.infer(Path::new("/incoming/SHOT_A_0012.CR3")),
            ("SHOT_A".to_string(), 12)
        );
    }

    #[test]
    fn test_no_trailing_digits_uses_whole_stem() {
        let n = namer(None);
        assert_eq!(
            n.infer(Path::new("/incoming/HEROFRAME.CR3")),
            ("HEROFRAME".to_string(), 0)
        );
    }

    #[test]
    fn test_digits_only_stem_uses_parent_dir() {
        let n = namer(None);
        assert_eq!(
            n.infer(Path::new("/shoots/SC010/0007.cr2")),
            ("SC010".to_string(), 7)
        );
    }

    #[test]
    fn test_generic_parent_falls_back_to_default() {
        let n = namer(None);
        assert_eq!(n.infer_shot_name(Path::new("/x/Incoming/0007.cr2")), "default_shot");
        assert_eq!(n.infer_shot_name(Path::new("/x/capture/0001.cr2")), "default_shot");
    }

    #[test]
    fn test_regex_capture_group_wins() {
        let n = namer(Some(r"(SC\d+)_"));
        assert_eq!(n.infer_shot_name(Path::new("/in/SC042_take2_0001.cr3")), "SC042");
    }

    #[test]
    fn test_regex_without_group_uses_whole_match() {
        let n = namer(Some(r"SC\d+"));
        assert_eq!(n.infer_shot_name(Path::new("/in/SC042_take2_0001.cr3")), "SC042");
    }

    #[test]
    fn test_regex_miss_falls_through() {
        let n = namer(Some(r"(SC\d+)_"));
        assert_eq!(n.infer_shot_name(Path::new("/in/HERO_0003.cr3")), "HERO");
    }

    #[test]
    fn test_invalid_regex_is_rejected() {
        assert!(ShotNamer::new(Some("(unclosed"), &[], "default_shot").is_err());
    }

    #[test]
    fn test_separator_trimming() {
        assert_eq!(stem_prefix("SHOT-B-0001"), "SHOT-B");
        assert_eq!(stem_prefix("shot b 12"), "shot b");
        assert_eq!(stem_prefix("A.0001"), "A");
        assert_eq!(stem_prefix("0001"), "");
    }

    // Frame numbers survive formatting with any zero padding
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_frame_number_round_trip(
            shot in "[A-Z][A-Z_]{0,10}[A-Z]",
            frame in 0u32..100_000,
            pad in 1usize..8,
        ) {
            let name = format!("/in/{}_{:0width$}.cr3", shot, frame, width = pad);
            let (inferred_shot, inferred_frame) = namer(None).infer(Path::new(&name));
            prop_assert_eq!(inferred_frame, frame);
            prop_assert_eq!(inferred_shot, shot);
        }
    }
}
