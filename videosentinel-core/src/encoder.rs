//! Builds command lines, runs the external encoder, parses its progress
//! stream, and validates outputs.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use tracing::{info, warn};

use crate::common::candidate_siblings;
use crate::error::{EngineError, Result};
use crate::media_info::{self, MediaInfo};
use crate::quality_policy::TargetCodec;
use crate::subprocess::ManagedProcess;

/// Re-encode/remux behavior flags carried by an `EncodeJob`.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct EncodeFlags {
    pub recover: bool,
    pub downscale: bool,
    pub fix_preview_only: bool,
    pub replace_original: bool,
}

const FASTSTART_PIX_FMT_10BIT: &str = "yuv420p10le";
const FASTSTART_PIX_FMT_8BIT: &str = "yuv420p";
const HEVC_PREVIEW_TAG: &str = "hvc1";

/// Minimum size a written output must clear before it is even considered.
const MIN_OUTPUT_SIZE_BYTES: u64 = 1024;

/// Allowed drift between output and source duration outside `lenient` mode.
const DURATION_TOLERANCE_SECS: f64 = 2.0;

pub fn is_encoder_tool_available() -> bool {
    which::which("ffmpeg").is_ok()
}

fn pixel_format_for(target_codec: TargetCodec, source: &MediaInfo, recover: bool) -> &'static str {
    if target_codec == TargetCodec::H264 {
        // H.264 is never asked to carry 10-bit 4:2:0 in this pipeline.
        return FASTSTART_PIX_FMT_8BIT;
    }
    if source.bit_depth <= 8 && !recover {
        FASTSTART_PIX_FMT_8BIT
    } else {
        FASTSTART_PIX_FMT_10BIT
    }
}

/// Scale filter preserving aspect ratio, rounding each dimension down to an
/// even integer, producing exactly 1920×h or w×1080.
pub fn downscale_filter(width: u32, height: u32) -> Option<String> {
    if width <= 1920 && height <= 1080 {
        return None;
    }
    if width >= height {
        Some("scale='min(1920,iw)':-2".to_string())
    } else {
        Some("scale=-2:'min(1080,ih)'".to_string())
    }
}

/// Builds the argument vector for a transcode invocation.
pub fn build_encode_args(
    source: &Path,
    dest: &Path,
    target_codec: TargetCodec,
    crf: f32,
    source_info: &MediaInfo,
    flags: EncodeFlags,
) -> Vec<String> {
    let mut args = vec!["-y".to_string()];

    if flags.recover {
        args.extend(
            [
                "-err_detect",
                "ignore_err",
                "-fflags",
                "+genpts+discardcorrupt",
                "-ignore_unknown",
            ]
            .map(String::from),
        );
    }

    args.push("-i".to_string());
    args.push(source.to_string_lossy().into_owned());

    if flags.downscale {
        if let Some(filter) = downscale_filter(source_info.width, source_info.height) {
            args.push("-vf".to_string());
            args.push(filter);
        }
    }

    let encoder_name = match target_codec {
        TargetCodec::Hevc => "libx265",
        TargetCodec::Av1 => "libsvtav1",
        TargetCodec::H264 => "libx264",
    };

    args.push("-c:v".to_string());
    args.push(encoder_name.to_string());
    args.push("-preset".to_string());
    args.push("medium".to_string());
    args.push("-crf".to_string());
    args.push(format!("{crf}"));
    args.push("-pix_fmt".to_string());
    args.push(pixel_format_for(target_codec, source_info, flags.recover).to_string());

    if target_codec == TargetCodec::Hevc {
        args.push("-tag:v".to_string());
        args.push(HEVC_PREVIEW_TAG.to_string());
    }

    args.push("-movflags".to_string());
    args.push("faststart".to_string());

    if flags.recover {
        args.push("-max_muxing_queue_size".to_string());
        args.push("9999".to_string());
        args.push("-err_detect".to_string());
        args.push("ignore_err".to_string());
    }

    if source_info.has_audio {
        args.push("-c:a".to_string());
        args.push("aac".to_string());
    }

    args.push(dest.to_string_lossy().into_owned());
    args
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub frame: Option<u64>,
    pub fps: Option<f64>,
    pub time_seconds: Option<f64>,
    pub speed: Option<f64>,
    pub percent: Option<f64>,
    pub eta_seconds: Option<f64>,
}

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);
}

/// Permissively tokenizes one stderr line, extracting whichever of
/// `frame=`, `fps=`, `time=HH:MM:SS.cs`, `speed=<float>x` are present.
pub fn parse_progress_line(line: &str, source_duration: Option<f64>) -> Option<ProgressEvent> {
    if !line.contains("frame=") && !line.contains("time=") {
        return None;
    }

    let mut frame = None;
    let mut fps = None;
    let mut time_seconds = None;
    let mut speed = None;

    for token in line.split_whitespace() {
        if let Some(v) = token.strip_prefix("frame=") {
            frame = v.parse::<u64>().ok();
        } else if let Some(v) = token.strip_prefix("fps=") {
            fps = v.parse::<f64>().ok();
        } else if let Some(v) = token.strip_prefix("time=") {
            time_seconds = parse_timecode(v);
        } else if let Some(v) = token.strip_prefix("speed=") {
            speed = v.trim_end_matches('x').parse::<f64>().ok();
        }
    }

    if frame.is_none() && fps.is_none() && time_seconds.is_none() && speed.is_none() {
        return None;
    }

    let percent = match (time_seconds, source_duration) {
        (Some(t), Some(d)) if d > 0.0 => Some((t / d * 100.0).min(100.0)),
        _ => None,
    };

    let eta_seconds = match (time_seconds, source_duration, speed) {
        (Some(t), Some(d), Some(s)) if s > 0.0 && d > t => Some((d - t) / s),
        _ => None,
    };

    Some(ProgressEvent {
        frame,
        fps,
        time_seconds,
        speed,
        percent,
        eta_seconds,
    })
}

fn parse_timecode(s: &str) -> Option<f64> {
    let mut parts = s.splitn(3, ':');
    let h: f64 = parts.next()?.parse().ok()?;
    let m: f64 = parts.next()?.parse().ok()?;
    let sec: f64 = parts.next()?.parse().ok()?;
    Some(h * 3600.0 + m * 60.0 + sec)
}

#[derive(Debug, Clone, PartialEq)]
pub enum InvalidReason {
    MissingFile,
    TooSmall { size: u64 },
    ProbeFailed(String),
    NoVideoStream,
    DurationMismatch { expected: f64, actual: f64 },
}

impl std::fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidReason::MissingFile => write!(f, "output file does not exist"),
            InvalidReason::TooSmall { size } => write!(f, "output is only {size} bytes"),
            InvalidReason::ProbeFailed(reason) => write!(f, "output failed to probe: {reason}"),
            InvalidReason::NoVideoStream => write!(f, "output has no video stream with non-zero dimensions"),
            InvalidReason::DurationMismatch { expected, actual } => {
                write!(f, "output duration {actual:.2}s differs from source {expected:.2}s by more than tolerance")
            }
        }
    }
}

/// Validates an encoder output: existence, minimum size, probeable with a
/// real video stream, and duration within tolerance of the source unless
/// `lenient`.
pub fn validate(path: &Path, expected_duration: Option<f64>, lenient: bool) -> std::result::Result<MediaInfo, InvalidReason> {
    let metadata = std::fs::metadata(path).map_err(|_| InvalidReason::MissingFile)?;
    if metadata.len() <= MIN_OUTPUT_SIZE_BYTES {
        return Err(InvalidReason::TooSmall { size: metadata.len() });
    }

    let info = media_info::probe(path).map_err(|e| InvalidReason::ProbeFailed(e.to_string()))?;
    if info.width == 0 || info.height == 0 {
        return Err(InvalidReason::NoVideoStream);
    }

    if !lenient {
        if let (Some(expected), Some(actual)) = (expected_duration, info.duration) {
            if (expected - actual).abs() > DURATION_TOLERANCE_SECS {
                return Err(InvalidReason::DurationMismatch { expected, actual });
            }
        }
    }

    Ok(info)
}

#[derive(Debug)]
pub enum EncodeResult {
    Completed(MediaInfo),
    Failed(EngineError),
}

/// Blocking: runs the external encoder and validates its output, deleting
/// the intermediate on any failure path so the source is never at risk
/// before the output is `Valid`.
pub fn encode(
    source: &Path,
    dest: &Path,
    target_codec: TargetCodec,
    crf: f32,
    source_info: &MediaInfo,
    flags: EncodeFlags,
    sink: Option<Arc<dyn ProgressSink>>,
) -> EncodeResult {
    if !is_encoder_tool_available() {
        return EncodeResult::Failed(EngineError::ToolNotFound("ffmpeg".to_string()));
    }

    let args = build_encode_args(source, dest, target_codec, crf, source_info, flags);
    let mut cmd = Command::new("ffmpeg");
    cmd.args(&args);

    let duration = source_info.duration;
    let process = if let Some(sink) = sink {
        ManagedProcess::spawn_with_progress(&mut cmd, move |line| {
            if let Some(event) = parse_progress_line(line, duration) {
                sink.on_progress(event);
            }
        })
    } else {
        ManagedProcess::spawn(&mut cmd)
    };

    let process = match process {
        Ok(p) => p,
        Err(e) => return EncodeResult::Failed(EngineError::Io(e)),
    };

    let (status, stderr) = match process.wait_with_output() {
        Ok(v) => v,
        Err(e) => return EncodeResult::Failed(EngineError::Io(e)),
    };

    if !status.success() {
        let _ = std::fs::remove_file(dest);
        let tail: String = stderr.lines().rev().take(20).collect::<Vec<_>>().join("\n");
        return EncodeResult::Failed(EngineError::EncoderExitNonZero {
            path: source.to_path_buf(),
            code: status.code(),
            tail,
        });
    }

    match validate(dest, source_info.duration, flags.recover) {
        Ok(info) => EncodeResult::Completed(info),
        Err(reason) => {
            let _ = std::fs::remove_file(dest);
            EncodeResult::Failed(EngineError::ValidationFailed {
                path: dest.to_path_buf(),
                reason: reason.to_string(),
            })
        }
    }
}

#[derive(Debug)]
pub enum RemuxResult {
    Completed(MediaInfo),
    Failed(EngineError),
}

/// Fast remux: container/tag change via stream copy, no pixel decoding.
pub fn remux(source: &Path, dest: &Path, fix_tag: bool) -> RemuxResult {
    if !is_encoder_tool_available() {
        return RemuxResult::Failed(EngineError::ToolNotFound("ffmpeg".to_string()));
    }

    let mut args = vec![
        "-y".to_string(),
        "-i".to_string(),
        source.to_string_lossy().into_owned(),
        "-c".to_string(),
        "copy".to_string(),
        "-movflags".to_string(),
        "faststart".to_string(),
    ];
    if fix_tag {
        args.push("-tag:v".to_string());
        args.push(HEVC_PREVIEW_TAG.to_string());
    }
    args.push(dest.to_string_lossy().into_owned());

    let mut cmd = Command::new("ffmpeg");
    cmd.args(&args);

    let process = match ManagedProcess::spawn(&mut cmd) {
        Ok(p) => p,
        Err(e) => return RemuxResult::Failed(EngineError::Io(e)),
    };

    let (status, stderr) = match process.wait_with_output() {
        Ok(v) => v,
        Err(e) => return RemuxResult::Failed(EngineError::Io(e)),
    };

    if !status.success() {
        let _ = std::fs::remove_file(dest);
        let tail: String = stderr.lines().rev().take(20).collect::<Vec<_>>().join("\n");
        return RemuxResult::Failed(EngineError::EncoderExitNonZero {
            path: source.to_path_buf(),
            code: status.code(),
            tail,
        });
    }

    match validate(dest, media_info::probe(source).ok().and_then(|i| i.duration), false) {
        Ok(info) => RemuxResult::Completed(info),
        Err(reason) => {
            let _ = std::fs::remove_file(dest);
            RemuxResult::Failed(EngineError::ValidationFailed {
                path: dest.to_path_buf(),
                reason: reason.to_string(),
            })
        }
    }
}

#[derive(Debug, Clone)]
pub enum FindOutcome {
    Valid { path: PathBuf, info: Box<MediaInfo> },
    Invalid { path: PathBuf, reason: String },
    NotFound,
}

/// Looks for `<stem>_reencoded.<ext>` / `<stem>_quicklook.<ext>` siblings
/// across every supported extension and validates whichever exists first.
pub fn find_existing_output(source: &Path, suffixes: &[&str]) -> FindOutcome {
    for candidate in candidate_siblings(source, suffixes) {
        if !candidate.exists() {
            continue;
        }
        let expected_duration = media_info::probe(source).ok().and_then(|i| i.duration);
        return match validate(&candidate, expected_duration, false) {
            Ok(info) => {
                info!(path = %candidate.display(), "resume-probe found a valid prior output");
                FindOutcome::Valid {
                    path: candidate,
                    info: Box::new(info),
                }
            }
            Err(reason) => {
                warn!(path = %candidate.display(), %reason, "resume-probe found an invalid prior output");
                FindOutcome::Invalid {
                    path: candidate,
                    reason: reason.to_string(),
                }
            }
        };
    }
    FindOutcome::NotFound
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(w: u32, h: u32, bit_depth: u8) -> MediaInfo {
        MediaInfo {
            codec: "mpeg4".to_string(),
            pix_fmt: "yuv420p".to_string(),
            bit_depth,
            container: "avi".to_string(),
            width: w,
            height: h,
            duration: Some(60.0),
            frame_rate: 30.0,
            bitrate: Some(1_000_000),
            has_audio: true,
            codec_tag: String::new(),
        }
    }

    #[test]
    fn downscale_above_1080p_preserves_aspect_and_even_dims() {
        assert_eq!(downscale_filter(3840, 2160), Some("scale='min(1920,iw)':-2".to_string()));
    }

    #[test]
    fn downscale_at_or_below_1080p_is_unfiltered() {
        assert_eq!(downscale_filter(1920, 1080), None);
        assert_eq!(downscale_filter(1280, 720), None);
    }

    #[test]
    fn hevc_output_always_carries_hvc1_tag() {
        let args = build_encode_args(
            Path::new("in.avi"),
            Path::new("out.mp4"),
            TargetCodec::Hevc,
            22.0,
            &info(640, 480, 8),
            EncodeFlags::default(),
        );
        let tag_pos = args.iter().position(|a| a == "-tag:v").unwrap();
        assert_eq!(args[tag_pos + 1], "hvc1");
    }

    #[test]
    fn eight_bit_source_without_recovery_keeps_8bit_pix_fmt() {
        let args = build_encode_args(
            Path::new("in.avi"),
            Path::new("out.mp4"),
            TargetCodec::Hevc,
            22.0,
            &info(640, 480, 8),
            EncodeFlags::default(),
        );
        let pos = args.iter().position(|a| a == "-pix_fmt").unwrap();
        assert_eq!(args[pos + 1], "yuv420p");
    }

    #[test]
    fn ten_bit_default_applies_when_source_is_10bit() {
        let args = build_encode_args(
            Path::new("in.avi"),
            Path::new("out.mp4"),
            TargetCodec::Hevc,
            22.0,
            &info(640, 480, 10),
            EncodeFlags::default(),
        );
        let pos = args.iter().position(|a| a == "-pix_fmt").unwrap();
        assert_eq!(args[pos + 1], "yuv420p10le");
    }

    #[test]
    fn recovery_flags_are_added_on_both_sides_when_enabled() {
        let flags = EncodeFlags {
            recover: true,
            ..Default::default()
        };
        let args = build_encode_args(
            Path::new("in.avi"),
            Path::new("out.mp4"),
            TargetCodec::Hevc,
            22.0,
            &info(640, 480, 8),
            flags,
        );
        assert!(args.iter().any(|a| a == "ignore_unknown" || a == "-ignore_unknown"));
        assert!(args.iter().any(|a| a == "-max_muxing_queue_size"));
    }

    #[test]
    fn faststart_flag_is_always_present() {
        let args = build_encode_args(
            Path::new("in.avi"),
            Path::new("out.mp4"),
            TargetCodec::H264,
            20.0,
            &info(640, 480, 8),
            EncodeFlags::default(),
        );
        let pos = args.iter().position(|a| a == "-movflags").unwrap();
        assert_eq!(args[pos + 1], "faststart");
    }

    #[test]
    fn parses_progress_line_with_all_fields() {
        let event = parse_progress_line(
            "frame=  120 fps= 30 q=28.0 size=    2048kB time=00:00:04.00 bitrate=4194.3kbits/s speed=1.0x",
            Some(60.0),
        )
        .unwrap();
        assert_eq!(event.frame, Some(120));
        assert_eq!(event.fps, Some(30.0));
        assert_eq!(event.time_seconds, Some(4.0));
        assert_eq!(event.speed, Some(1.0));
        assert!((event.percent.unwrap() - 6.666).abs() < 0.01);
        assert!((event.eta_seconds.unwrap() - 56.0).abs() < 0.01);
    }

    #[test]
    fn ignores_unrelated_lines() {
        assert!(parse_progress_line("Input #0, mov,mp4,m4a,3gp,3g2,mj2", None).is_none());
    }

    #[test]
    fn validate_rejects_missing_file() {
        let result = validate(Path::new("/nonexistent/does-not-exist.mp4"), None, false);
        assert_eq!(result, Err(InvalidReason::MissingFile));
    }
}
