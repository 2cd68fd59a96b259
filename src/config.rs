use crate::options::EncodeOptions;
use anyhow::{Context, Result};
use glob::Pattern;
use std::path::PathBuf;

/// Immutable run configuration. Built once by the driver, then shared by
/// reference with the scanner, workers and monitor.
pub struct Config {
    pub src: PathBuf,
    pub dest: PathBuf,
    pub recursive: bool,
    pub convert_match: GlobMatcher,
    pub copy_match: Option<GlobMatcher>,
    pub archive_match: GlobMatcher,
    pub copy_file_meta: bool,
    pub copy_image_meta: bool,
    pub check_image: bool,
    pub max_go: usize,
    /// Full path of this run's log file; the scanner skips it while walking.
    pub log_path: PathBuf,
    pub opts: EncodeOptions,
}

/// A compiled `|`-separated disjunction of glob patterns, tested against a
/// path's extension (leading dot included).
pub struct GlobMatcher {
    patterns: Vec<Pattern>,
}

impl GlobMatcher {
    /// Every pattern of the disjunction must compile or construction fails.
    pub fn new(pattern: &str) -> Result<Self> {
        let mut patterns = Vec::new();
        for part in pattern.split('|') {
            patterns
                .push(Pattern::new(part).with_context(|| format!("invalid glob pattern <{part}>"))?);
        }
        Ok(Self { patterns })
    }

    /// `dep_platform` selects platform path separators; POSIX separators
    /// otherwise (archive entry names). Empty paths never match.
    pub fn matches(&self, path: &str, dep_platform: bool) -> bool {
        if path.is_empty() {
            return false;
        }
        let ext = extension_of(path, dep_platform);
        self.patterns.iter().any(|p| p.matches(ext))
    }
}

/// The suffix starting at the final dot of the final path element, or ""
/// when that element has no dot.
fn extension_of(path: &str, dep_platform: bool) -> &str {
    let sep = if dep_platform {
        std::path::MAIN_SEPARATOR
    } else {
        '/'
    };
    let name_start = path.rfind(sep).map_or(0, |i| i + 1);
    let name = &path[name_start..];
    match name.rfind('.') {
        Some(i) => &name[i..],
        None => "",
    }
}
