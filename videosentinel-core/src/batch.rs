//! Discovers files, selects a batch, and drives each one through
//! probe -> classify -> remux/encode -> replace.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};
use walkdir::WalkDir;

use crate::cache::MediaInfoCache;
use crate::common::{final_mp4_path, has_video_extension};
use crate::encoder::{self, EncodeFlags, EncodeResult, FindOutcome, ProgressSink, RemuxResult};
use crate::error::EngineError;
use crate::job::{EncodeJob, JobState};
use crate::media_info::{self, MediaInfo};
use crate::quality_policy::{self, ComplianceVerdict, TargetCodec};
use crate::shutdown::ShutdownCoordinator;

const RESUME_SUFFIXES: &[&str] = &["_reencoded", "_quicklook"];

/// Bounded retry for the delete-then-rename replace step, in case the
/// filesystem reports a transient error after a prior run was killed
/// mid-rename.
const REPLACE_RETRY_ATTEMPTS: u32 = 3;
const REPLACE_RETRY_BACKOFF_MILLIS: u64 = 50;

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub max_files: Option<usize>,
    pub only_noncompliant: bool,
    pub replace_original: bool,
    pub recover: bool,
    pub downscale: bool,
    pub fix_preview_only: bool,
    pub lenient: bool,
    pub manual_crf: Option<f32>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_files: None,
            only_noncompliant: false,
            replace_original: false,
            recover: false,
            downscale: false,
            fix_preview_only: false,
            lenient: false,
            manual_crf: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub jobs: Vec<EncodeJob>,
    /// Files selected for the run but never reached because shutdown was
    /// requested first.
    pub unprocessed: Vec<PathBuf>,
    /// Set when an infrastructure error aborted the whole batch rather than
    /// just one file. When set, every selected file ended up in `unprocessed`.
    pub fatal_error: Option<String>,
}

pub struct BatchController {
    cache: MediaInfoCache,
    shutdown: ShutdownCoordinator,
    progress_sink: Option<Arc<dyn ProgressSink>>,
}

impl BatchController {
    pub fn new(cache: MediaInfoCache, shutdown: ShutdownCoordinator) -> Self {
        Self {
            cache,
            shutdown,
            progress_sink: None,
        }
    }

    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress_sink = Some(sink);
        self
    }

    /// Walks `dir`, returning every supported video file in a stable,
    /// sorted order so batches are reproducible across runs.
    pub fn discover(&self, dir: &Path, recursive: bool) -> Vec<PathBuf> {
        let walker = if recursive {
            WalkDir::new(dir)
        } else {
            WalkDir::new(dir).max_depth(1)
        };

        let mut files: Vec<PathBuf> = walker
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| has_video_extension(p))
            .collect();
        files.sort();
        files
    }

    fn probe_cached(&self, path: &Path) -> crate::error::Result<MediaInfo> {
        if let Some(info) = self.cache.get(path) {
            return Ok(info);
        }
        let info = media_info::probe(path)?;
        let _ = self.cache.put(path, &info);
        Ok(info)
    }

    /// Picks which discovered files this run actually touches.
    ///
    /// With no filters, every file is processed. With `max_files` alone, the
    /// first `max_files` (by the stable sort order) are taken. With both
    /// `max_files` and `only_noncompliant`, probing continues until either
    /// `max_files` non-compliant files have been selected, `2 * max_files`
    /// non-compliant files have been located in total, or the file list is
    /// exhausted — compliant files encountered along the way don't count
    /// against that bound, so a run of compliant files interspersed with
    /// non-compliant ones still fills the batch.
    pub fn select_batch(&self, files: &[PathBuf], config: &BatchConfig) -> Vec<PathBuf> {
        let Some(max_files) = config.max_files else {
            return files.to_vec();
        };

        if !config.only_noncompliant {
            return files.iter().take(max_files).cloned().collect();
        }

        let noncompliant_limit = max_files.saturating_mul(2);
        let mut selected = Vec::new();
        let mut noncompliant_seen = 0usize;
        for path in files.iter() {
            if selected.len() >= max_files || noncompliant_seen >= noncompliant_limit {
                break;
            }
            let info = match self.probe_cached(path) {
                Ok(info) => info,
                Err(_) => continue,
            };
            if info.is_probe_invalid() {
                continue;
            }
            if quality_policy::classify(&info).needs_work() {
                noncompliant_seen += 1;
                selected.push(path.clone());
            }
        }
        selected
    }

    fn intermediate_suffix(&self, config: &BatchConfig) -> &'static str {
        if config.fix_preview_only {
            "_quicklook"
        } else {
            "_reencoded"
        }
    }

    fn encode_flags(&self, config: &BatchConfig) -> EncodeFlags {
        EncodeFlags {
            recover: config.recover,
            downscale: config.downscale,
            fix_preview_only: config.fix_preview_only,
            replace_original: config.replace_original,
        }
    }

    /// Runs one file through its whole lifecycle.
    pub fn process_single(&self, path: &Path, config: &BatchConfig) -> EncodeJob {
        let flags = self.encode_flags(config);
        let mut job = EncodeJob::new(path.to_path_buf(), TargetCodec::Hevc, 0.0, flags);

        // Completed-replacement detection: a prior run may have already
        // deleted `path` and settled at `<stem>.mp4`. Idempotent re-runs over a
        // stale file list must recognize that as already done rather than
        // failing to probe a file that no longer exists.
        if !path.exists() {
            let final_path = final_mp4_path(path);
            if encoder::validate(&final_path, None, true).is_ok() {
                info!(source = %path.display(), output = %final_path.display(), "resume: source already replaced by a prior run");
                job.final_path = Some(final_path);
                job.advance(JobState::Done);
            } else {
                job.fail("source file is missing and no valid completed replacement was found");
            }
            return job;
        }

        match encoder::find_existing_output(path, RESUME_SUFFIXES) {
            FindOutcome::Valid { path: existing, info: _ } => {
                info!(source = %path.display(), output = %existing.display(), "resume: prior output already valid");
                job.intermediate_path = Some(existing);
                job.advance(JobState::ExistingValid);
                return self.maybe_replace(job, config);
            }
            FindOutcome::Invalid { path: stale, reason } => {
                warn!(path = %stale.display(), %reason, "resume: discarding invalid prior output");
                let _ = std::fs::remove_file(&stale);
            }
            FindOutcome::NotFound => {}
        }

        job.advance(JobState::Discovered);

        let info = match self.probe_cached(path) {
            Ok(info) => info,
            Err(e) => {
                job.fail(e.to_string());
                return job;
            }
        };
        job.advance(JobState::Probed);

        if info.is_probe_invalid() {
            job.advance(JobState::Skipped);
            return job;
        }

        let verdict = quality_policy::classify(&info);
        job.advance(JobState::Classified);

        match verdict {
            ComplianceVerdict::Compliant => {
                job.advance(JobState::Compliant);
                job.advance(JobState::Done);
                job
            }
            ComplianceVerdict::NeedsRemux { target_codec } => {
                job.target_codec = target_codec;
                job.advance(JobState::NeedsRemux);
                self.run_remux(job, path, &info, config)
            }
            ComplianceVerdict::NeedsFullFix { target_codec, crf } | ComplianceVerdict::NeedsReencode { target_codec, crf } => {
                job.target_codec = target_codec;
                job.crf = config.manual_crf.unwrap_or(crf);
                job.advance(JobState::NeedsReencode);
                self.run_encode(job, path, &info, config)
            }
        }
    }

    fn run_remux(&self, mut job: EncodeJob, path: &Path, _info: &MediaInfo, config: &BatchConfig) -> EncodeJob {
        let dest = crate::common::reencoded_sibling(path, self.intermediate_suffix(config));
        let fix_tag = job.target_codec == TargetCodec::Hevc;

        match encoder::remux(path, &dest, fix_tag) {
            RemuxResult::Completed(_) => {
                job.intermediate_path = Some(dest.clone());
                self.cache.invalidate(&dest);
                job.advance(JobState::Remuxed);
                job.advance(JobState::Validated);
                self.maybe_replace(job, config)
            }
            RemuxResult::Failed(e) => {
                job.fail(e.to_string());
                job
            }
        }
    }

    fn run_encode(&self, mut job: EncodeJob, path: &Path, info: &MediaInfo, config: &BatchConfig) -> EncodeJob {
        let dest = crate::common::reencoded_sibling(path, self.intermediate_suffix(config));
        job.advance(JobState::Encoding);

        let result = encoder::encode(
            path,
            &dest,
            job.target_codec,
            job.crf,
            info,
            job.flags,
            self.progress_sink.clone(),
        );

        match result {
            EncodeResult::Completed(_) => {
                job.intermediate_path = Some(dest.clone());
                self.cache.invalidate(&dest);
                job.advance(JobState::Validated);
                self.maybe_replace(job, config)
            }
            EncodeResult::Failed(e) => {
                job.fail(e.to_string());
                job
            }
        }
    }

    /// Replaces the source with the intermediate in place, if `replace_original`
    /// is set. A transient I/O error during the delete-then-rename step is
    /// retried a bounded number of times before the job is marked `Failed`,
    /// leaving the intermediate on disk rather than losing it.
    fn maybe_replace(&self, mut job: EncodeJob, config: &BatchConfig) -> EncodeJob {
        if !config.replace_original {
            job.advance(JobState::Done);
            return job;
        }

        let Some(intermediate) = job.intermediate_path.clone() else {
            job.advance(JobState::Done);
            return job;
        };

        let source = job.source_path.clone();
        let dest = final_mp4_path(&source);

        match atomic_replace(&source, &intermediate, &dest) {
            Ok(()) => {
                job.final_path = Some(dest);
                job.advance(JobState::Replaced);
                job.advance(JobState::Done);
                job
            }
            Err(reason) => {
                job.fail(
                    EngineError::ReplaceFailed {
                        source_path: source,
                        intermediate_path: intermediate,
                        reason,
                    }
                    .to_string(),
                );
                job
            }
        }
    }

    /// Selects a batch then runs every file in it, honoring cooperative
    /// shutdown between files: the current file completes, further files are
    /// skipped and reported as unprocessed.
    pub fn run_batch(&self, files: &[PathBuf], config: &BatchConfig) -> BatchReport {
        let selected = self.select_batch(files, config);
        let mut report = BatchReport::default();

        if !media_info::is_probe_tool_available() {
            report.fatal_error = Some("required external tool not found: ffprobe".to_string());
            report.unprocessed = selected;
            return report;
        }
        if !encoder::is_encoder_tool_available() {
            report.fatal_error = Some("required external tool not found: ffmpeg".to_string());
            report.unprocessed = selected;
            return report;
        }

        for (index, path) in selected.iter().enumerate() {
            if self.shutdown.is_stopped() {
                report.unprocessed.extend(selected[index..].iter().cloned());
                break;
            }
            report.jobs.push(self.process_single(path, config));
        }

        report
    }
}

/// Deletes `source` then renames `intermediate` into its place at `dest`,
/// retrying transient failures with a short backoff.
fn atomic_replace(source: &Path, intermediate: &Path, dest: &Path) -> Result<(), String> {
    let mut last_error = String::new();
    for attempt in 0..REPLACE_RETRY_ATTEMPTS {
        match std::fs::remove_file(source).and_then(|_| std::fs::rename(intermediate, dest)) {
            Ok(()) => return Ok(()),
            Err(e) => {
                last_error = e.to_string();
                if attempt + 1 < REPLACE_RETRY_ATTEMPTS {
                    std::thread::sleep(std::time::Duration::from_millis(REPLACE_RETRY_BACKOFF_MILLIS));
                }
            }
        }
    }
    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn controller() -> (TempDir, BatchController) {
        let temp = TempDir::new().unwrap();
        let cache = MediaInfoCache::new(temp.path().join(".cache")).unwrap();
        let controller = BatchController::new(cache, ShutdownCoordinator::new());
        (temp, controller)
    }

    #[test]
    fn discover_finds_and_sorts_video_files() {
        let (temp, controller) = controller();
        std::fs::write(temp.path().join("b.mp4"), b"x").unwrap();
        std::fs::write(temp.path().join("a.avi"), b"x").unwrap();
        std::fs::write(temp.path().join("c.txt"), b"x").unwrap();

        let found = controller.discover(temp.path(), false);
        assert_eq!(found.len(), 2);
        assert!(found[0].to_string_lossy().ends_with("a.avi"));
        assert!(found[1].to_string_lossy().ends_with("b.mp4"));
    }

    #[test]
    fn select_batch_truncates_to_max_files_without_filter() {
        let (_temp, controller) = controller();
        let files: Vec<PathBuf> = (0..5).map(|i| PathBuf::from(format!("/tmp/{i}.mp4"))).collect();
        let config = BatchConfig {
            max_files: Some(2),
            ..Default::default()
        };
        let selected = controller.select_batch(&files, &config);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0], files[0]);
    }

    #[test]
    fn select_batch_with_no_limit_returns_all() {
        let (_temp, controller) = controller();
        let files: Vec<PathBuf> = (0..3).map(|i| PathBuf::from(format!("/tmp/{i}.mp4"))).collect();
        let selected = controller.select_batch(&files, &BatchConfig::default());
        assert_eq!(selected.len(), 3);
    }

    fn compliant_info() -> MediaInfo {
        MediaInfo {
            codec: "hevc".to_string(),
            pix_fmt: "yuv420p10le".to_string(),
            bit_depth: 10,
            container: "mp4".to_string(),
            width: 1920,
            height: 1080,
            duration: Some(60.0),
            frame_rate: 30.0,
            bitrate: Some(4_000_000),
            has_audio: true,
            codec_tag: "hvc1".to_string(),
        }
    }

    fn noncompliant_info() -> MediaInfo {
        MediaInfo {
            codec: "mpeg4".to_string(),
            pix_fmt: "yuv420p".to_string(),
            bit_depth: 8,
            container: "avi".to_string(),
            width: 640,
            height: 480,
            duration: Some(60.0),
            frame_rate: 30.0,
            bitrate: Some(1_000_000),
            has_audio: true,
            codec_tag: String::new(),
        }
    }

    #[test]
    fn select_batch_only_noncompliant_scans_past_a_compliant_prefix() {
        let (temp, controller) = controller();

        // Four compliant files sort ahead of one non-compliant file; with
        // max_files = 1 the old prescan bound (2 * max_files candidates
        // examined) would stop before ever reaching the non-compliant file.
        let mut files = Vec::new();
        for name in ["a.mp4", "b.mp4", "c.mp4", "d.mp4"] {
            let path = temp.path().join(name);
            std::fs::write(&path, b"x").unwrap();
            controller.cache.put(&path, &compliant_info()).unwrap();
            files.push(path);
        }
        let noncompliant_path = temp.path().join("e.avi");
        std::fs::write(&noncompliant_path, b"x").unwrap();
        controller.cache.put(&noncompliant_path, &noncompliant_info()).unwrap();
        files.push(noncompliant_path.clone());

        let config = BatchConfig {
            max_files: Some(1),
            only_noncompliant: true,
            ..Default::default()
        };
        let selected = controller.select_batch(&files, &config);
        assert_eq!(selected, vec![noncompliant_path]);
    }

    #[test]
    fn atomic_replace_moves_intermediate_into_source_slot() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("a.avi");
        let intermediate = temp.path().join("a_reencoded.mp4");
        let dest = temp.path().join("a.mp4");
        std::fs::write(&source, b"old").unwrap();
        std::fs::write(&intermediate, b"new").unwrap();

        atomic_replace(&source, &intermediate, &dest).unwrap();

        assert!(!source.exists());
        assert!(!intermediate.exists());
        assert_eq!(std::fs::read(&dest).unwrap(), b"new");
    }

    #[test]
    fn process_single_fails_when_source_and_replacement_are_both_missing() {
        let (temp, controller) = controller();
        let missing = temp.path().join("gone.avi");
        let job = controller.process_single(&missing, &BatchConfig::default());
        assert_eq!(job.state, JobState::Failed);
        assert!(job.error.is_some());
    }

    #[test]
    fn run_batch_reports_unprocessed_files_after_shutdown() {
        let (temp, controller) = controller();
        let a = temp.path().join("a.mp4");
        let b = temp.path().join("b.mp4");
        std::fs::write(&a, b"x").unwrap();
        std::fs::write(&b, b"x").unwrap();
        controller.shutdown.stop();

        let report = controller.run_batch(&[a.clone(), b.clone()], &BatchConfig::default());
        assert!(report.jobs.is_empty());
        assert_eq!(report.unprocessed, vec![a, b]);
    }
}
