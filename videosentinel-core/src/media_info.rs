//! Invoke the external probe tool, parse its structured output, and answer
//! compliance-relevant questions about a file.
//!
//! Uses a permissive-tokenization approach to fields that may be absent,
//! with frame-rate parsed as a fraction.

use std::path::Path;
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Immutable per-file record produced by the probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub codec: String,
    pub pix_fmt: String,
    pub bit_depth: u8,
    pub container: String,
    pub width: u32,
    pub height: u32,
    pub duration: Option<f64>,
    pub frame_rate: f64,
    pub bitrate: Option<u64>,
    pub has_audio: bool,
    pub codec_tag: String,
}

impl MediaInfo {
    /// Zero dimensions or a missing/non-positive duration make the file
    /// unsuitable for normal processing.
    pub fn is_probe_invalid(&self) -> bool {
        self.width == 0 || self.height == 0 || !matches!(self.duration, Some(d) if d > 0.0)
    }

    /// Bits per pixel per frame. `None` when any input is missing or frame
    /// rate/area is zero — callers select the lowest CRF tier.
    pub fn bpp(&self) -> Option<f64> {
        let bitrate = self.bitrate? as f64;
        if self.width == 0 || self.height == 0 || self.frame_rate <= 0.0 {
            return None;
        }
        let area = self.width as f64 * self.height as f64 * self.frame_rate;
        if area <= 0.0 {
            return None;
        }
        Some(bitrate / area)
    }
}

pub fn is_probe_tool_available() -> bool {
    which::which("ffprobe").is_ok()
}

/// Runs the external probe tool against `path` and parses its JSON document.
///
/// Tolerates absent fields by reporting them as `None`/`0` rather than
/// fabricating values.
pub fn probe(path: &Path) -> Result<MediaInfo> {
    if !is_probe_tool_available() {
        return Err(EngineError::ToolNotFound("ffprobe".to_string()));
    }

    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::ProbeFailed {
            path: path.to_path_buf(),
            reason: "path is not valid UTF-8".to_string(),
        })?;

    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
            "--",
            path_str,
        ])
        .output()
        .map_err(|e| EngineError::ProbeFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(EngineError::ProbeFailed {
            path: path.to_path_buf(),
            reason: if stderr.trim().is_empty() {
                format!("ffprobe exited with {:?}", output.status.code())
            } else {
                stderr.trim().to_string()
            },
        });
    }

    parse_probe_json(path, &output.stdout)
}

fn parse_probe_json(path: &Path, stdout: &[u8]) -> Result<MediaInfo> {
    let json: serde_json::Value = serde_json::from_slice(stdout).map_err(|e| EngineError::ProbeFailed {
        path: path.to_path_buf(),
        reason: format!("malformed probe output: {e}"),
    })?;

    let format = &json["format"];
    let container = format["format_name"]
        .as_str()
        .unwrap_or("unknown")
        .split(',')
        .next()
        .unwrap_or("unknown")
        .to_string();
    let duration = format["duration"].as_str().and_then(|s| s.parse::<f64>().ok());
    let format_bitrate = format["bit_rate"].as_str().and_then(|s| s.parse::<u64>().ok());

    let streams = json["streams"].as_array().ok_or_else(|| EngineError::ProbeFailed {
        path: path.to_path_buf(),
        reason: "no streams found".to_string(),
    })?;

    let video_stream = streams
        .iter()
        .find(|s| s["codec_type"].as_str() == Some("video"))
        .ok_or_else(|| EngineError::ProbeFailed {
            path: path.to_path_buf(),
            reason: "no video stream found".to_string(),
        })?;

    let codec = video_stream["codec_name"].as_str().unwrap_or("unknown").to_string();
    let codec_tag = video_stream["codec_tag_string"]
        .as_str()
        .unwrap_or("")
        .to_string();
    let width = video_stream["width"].as_u64().unwrap_or(0) as u32;
    let height = video_stream["height"].as_u64().unwrap_or(0) as u32;
    let pix_fmt = video_stream["pix_fmt"].as_str().unwrap_or("unknown").to_string();
    let bit_depth = detect_bit_depth(&pix_fmt, video_stream["bits_per_raw_sample"].as_str());
    let frame_rate = parse_frame_rate(video_stream["r_frame_rate"].as_str().unwrap_or("0/1"));
    let video_bitrate = video_stream["bit_rate"].as_str().and_then(|s| s.parse::<u64>().ok());
    let bitrate = video_bitrate.or(format_bitrate);

    let has_audio = streams.iter().any(|s| s["codec_type"].as_str() == Some("audio"));

    Ok(MediaInfo {
        codec,
        pix_fmt,
        bit_depth,
        container,
        width,
        height,
        duration,
        frame_rate,
        bitrate,
        has_audio,
        codec_tag,
    })
}

const FALLBACK_FRAME_RATE: f64 = 24.0;

pub fn parse_frame_rate(s: &str) -> f64 {
    if let Some((num, den)) = s.split_once('/') {
        if let (Ok(num), Ok(den)) = (num.parse::<f64>(), den.parse::<f64>()) {
            if den > 0.0 {
                let rate = num / den;
                if rate > 0.0 {
                    return rate;
                }
            }
        }
        return FALLBACK_FRAME_RATE;
    }
    match s.parse::<f64>() {
        Ok(v) if v > 0.0 => v,
        _ => FALLBACK_FRAME_RATE,
    }
}

pub fn detect_bit_depth(pix_fmt: &str, bits_per_raw_sample: Option<&str>) -> u8 {
    if let Some(bits) = bits_per_raw_sample.and_then(|b| b.parse::<u8>().ok()) {
        if bits > 0 {
            return bits;
        }
    }

    if pix_fmt.contains("16le") || pix_fmt.contains("16be") {
        return 16;
    }
    if pix_fmt.contains("12le") || pix_fmt.contains("12be") {
        return 12;
    }
    if pix_fmt.contains("10le")
        || pix_fmt.contains("10be")
        || pix_fmt.contains("p010")
        || pix_fmt.contains("p210")
        || pix_fmt.contains("p410")
    {
        return 10;
    }
    8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json(
        format_name: &str,
        duration: &str,
        codec: &str,
        tag: &str,
        width: u64,
        height: u64,
        pix_fmt: &str,
        frame_rate: &str,
        bitrate: &str,
        has_audio: bool,
    ) -> Vec<u8> {
        let audio_stream = if has_audio {
            r#",{"codec_type":"audio","codec_name":"aac"}"#
        } else {
            ""
        };
        format!(
            r#"{{"format":{{"format_name":"{format_name}","duration":"{duration}","bit_rate":"{bitrate}"}},
                "streams":[{{"codec_type":"video","codec_name":"{codec}","codec_tag_string":"{tag}",
                "width":{width},"height":{height},"pix_fmt":"{pix_fmt}","r_frame_rate":"{frame_rate}"}}{audio_stream}]}}"#
        )
        .into_bytes()
    }

    #[test]
    fn parses_well_formed_document() {
        let json = sample_json(
            "mov,mp4,m4a,3gp,3g2,mj2",
            "60.0",
            "hevc",
            "hvc1",
            1920,
            1080,
            "yuv420p10le",
            "30/1",
            "5000000",
            true,
        );
        let info = parse_probe_json(Path::new("a.mp4"), &json).unwrap();
        assert_eq!(info.container, "mov");
        assert_eq!(info.codec, "hevc");
        assert_eq!(info.codec_tag, "hvc1");
        assert_eq!(info.width, 1920);
        assert_eq!(info.height, 1080);
        assert_eq!(info.bit_depth, 10);
        assert!((info.frame_rate - 30.0).abs() < 0.001);
        assert_eq!(info.bitrate, Some(5_000_000));
        assert!(info.has_audio);
        assert!(!info.is_probe_invalid());
    }

    #[test]
    fn zero_duration_is_probe_invalid() {
        let json = sample_json(
            "avi", "0.0", "mpeg4", "", 640, 480, "yuv420p", "30/1", "1000000", false,
        );
        let info = parse_probe_json(Path::new("a.avi"), &json).unwrap();
        assert!(info.is_probe_invalid());
    }

    #[test]
    fn zero_dimensions_are_probe_invalid() {
        let json = sample_json("avi", "60.0", "mpeg4", "", 0, 0, "yuv420p", "30/1", "1000000", false);
        let info = parse_probe_json(Path::new("a.avi"), &json).unwrap();
        assert!(info.is_probe_invalid());
    }

    #[test]
    fn missing_bitrate_reports_none_not_zero() {
        let json = br#"{"format":{"format_name":"avi","duration":"60.0"},
            "streams":[{"codec_type":"video","codec_name":"mpeg4","codec_tag_string":"",
            "width":640,"height":480,"pix_fmt":"yuv420p","r_frame_rate":"30/1"}]}"#;
        let info = parse_probe_json(Path::new("a.avi"), json).unwrap();
        assert_eq!(info.bitrate, None);
        assert_eq!(info.bpp(), None);
    }

    #[test]
    fn bpp_matches_s1_scenario() {
        let json = sample_json(
            "avi", "60.0", "mpeg4", "", 640, 480, "yuv420p", "30/1", "1000000", false,
        );
        let info = parse_probe_json(Path::new("a.avi"), &json).unwrap();
        let bpp = info.bpp().unwrap();
        assert!((bpp - 0.1085).abs() < 0.001, "bpp was {bpp}");
    }

    #[test]
    fn parse_frame_rate_handles_fractions_and_fallback() {
        assert!((parse_frame_rate("30000/1001") - 30000.0 / 1001.0).abs() < 0.0001);
        assert_eq!(parse_frame_rate("30/0"), FALLBACK_FRAME_RATE);
        assert_eq!(parse_frame_rate("invalid"), FALLBACK_FRAME_RATE);
        assert_eq!(parse_frame_rate(""), FALLBACK_FRAME_RATE);
    }

    #[test]
    fn detect_bit_depth_prefers_raw_sample_over_pix_fmt() {
        assert_eq!(detect_bit_depth("yuv420p", Some("10")), 10);
        assert_eq!(detect_bit_depth("yuv420p10le", None), 10);
        assert_eq!(detect_bit_depth("yuv420p", None), 8);
    }
}
