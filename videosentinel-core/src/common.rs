//! Small shared helpers: supported extensions, stem/suffix path math.

use std::path::{Path, PathBuf};

/// Video containers the engine will discover and classify.
pub const SUPPORTED_VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mov", "avi", "mkv", "webm", "m4v", "wmv", "flv", "mpg", "mpeg", "ts", "mts",
];

pub fn has_video_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_lowercase();
            SUPPORTED_VIDEO_EXTENSIONS.iter().any(|ext| *ext == e)
        })
        .unwrap_or(false)
}

/// `a_reencoded.mp4` -> stem `a`, suffix `_reencoded`.
pub fn reencoded_sibling(path: &Path, suffix: &str) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("output");
    path.with_file_name(format!("{stem}{suffix}.mp4"))
}

/// The final, unsuffixed path a replaced file settles at: `<stem>.mp4`.
pub fn final_mp4_path(path: &Path) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("output");
    path.with_file_name(format!("{stem}.mp4"))
}

/// Every `<stem>_<suffix>.<ext>` sibling worth checking during resume-probe,
/// across all supported video extensions (the prior run may have written any).
pub fn candidate_siblings(path: &Path, suffixes: &[&str]) -> Vec<PathBuf> {
    let stem = match path.file_stem().and_then(|s| s.to_str()) {
        Some(s) => s,
        None => return Vec::new(),
    };
    let mut out = Vec::new();
    for suffix in suffixes {
        for ext in SUPPORTED_VIDEO_EXTENSIONS {
            out.push(path.with_file_name(format!("{stem}{suffix}.{ext}")));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_supported_extensions_case_insensitively() {
        assert!(has_video_extension(Path::new("a.MP4")));
        assert!(has_video_extension(Path::new("a.mkv")));
        assert!(!has_video_extension(Path::new("a.txt")));
    }

    #[test]
    fn builds_reencoded_sibling() {
        let p = Path::new("/tmp/movies/a.avi");
        assert_eq!(
            reencoded_sibling(p, "_reencoded"),
            Path::new("/tmp/movies/a_reencoded.mp4")
        );
    }

    #[test]
    fn builds_final_mp4_path() {
        let p = Path::new("/tmp/movies/a.avi");
        assert_eq!(final_mp4_path(p), Path::new("/tmp/movies/a.mp4"));
    }
}
