//! Maps source statistics to a CRF and decides compliance /
//! preview-compatibility.
//!
//! The codec/container tables are plain data: pure constants rather than a
//! trait hierarchy per encoder.

use crate::media_info::MediaInfo;

pub const MODERN_CONTAINERS: &[&str] = &["mp4", "mkv", "matroska", "webm"];
pub const MODERN_CODECS: &[&str] = &["hevc", "av1", "vp9", "h264"];

/// Pixel formats accepted for preview compatibility without a full re-encode.
/// VP9 is deliberately absent from the CRF table below: it is never chosen
/// as a re-encode target, only recognized as already-compliant.
const ACCEPTABLE_PIX_FMTS: &[&str] = &["yuv420p", "yuv420p10le", "yuv420p10be"];

/// HEVC's non-preview four-char tag; `hvc1` is the one preview systems accept.
const HEVC_LEGACY_TAG: &str = "hev1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TargetCodec {
    Hevc,
    Av1,
    H264,
}

impl TargetCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetCodec::Hevc => "hevc",
            TargetCodec::Av1 => "av1",
            TargetCodec::H264 => "h264",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ComplianceVerdict {
    Compliant,
    NeedsRemux {
        target_codec: TargetCodec,
    },
    NeedsFullFix {
        target_codec: TargetCodec,
        crf: f32,
    },
    NeedsReencode {
        target_codec: TargetCodec,
        crf: f32,
    },
}

impl ComplianceVerdict {
    pub fn needs_work(&self) -> bool {
        !matches!(self, ComplianceVerdict::Compliant)
    }
}

fn is_modern_container(container: &str) -> bool {
    MODERN_CONTAINERS.contains(&container.to_lowercase().as_str())
}

fn is_modern_codec(codec: &str) -> bool {
    MODERN_CODECS.contains(&codec.to_lowercase().as_str())
}

/// A file is preview-compatible iff its pixel format is accepted for its
/// codec and it is not carrying HEVC's legacy `hev1` tag.
pub fn is_preview_compatible(info: &MediaInfo) -> bool {
    if !ACCEPTABLE_PIX_FMTS.contains(&info.pix_fmt.to_lowercase().as_str()) {
        return false;
    }
    if info.codec.eq_ignore_ascii_case("hevc") && info.codec_tag.eq_ignore_ascii_case(HEVC_LEGACY_TAG) {
        return false;
    }
    true
}

fn default_target_codec(info: &MediaInfo) -> TargetCodec {
    // A file that is already a modern codec but simply misboxed keeps its
    // own codec through the remux/fix path; anything else modernizes to HEVC.
    match info.codec.to_lowercase().as_str() {
        "hevc" => TargetCodec::Hevc,
        "av1" => TargetCodec::Av1,
        "h264" => TargetCodec::H264,
        _ => TargetCodec::Hevc,
    }
}

/// Classifies a probed file as compliant, remux-only, full-fix, or
/// re-encode, each carrying the CRF/target codec a re-encode would use.
pub fn classify(info: &MediaInfo) -> ComplianceVerdict {
    let container_ok = is_modern_container(&info.container);
    let codec_ok = is_modern_codec(&info.codec);
    let pix_fmt_ok = ACCEPTABLE_PIX_FMTS.contains(&info.pix_fmt.to_lowercase().as_str());

    if !codec_ok {
        let target_codec = TargetCodec::Hevc;
        return ComplianceVerdict::NeedsReencode {
            target_codec,
            crf: crf_for(info, target_codec, None),
        };
    }

    if !pix_fmt_ok {
        let target_codec = default_target_codec(info);
        return ComplianceVerdict::NeedsFullFix {
            target_codec,
            crf: crf_for(info, target_codec, None),
        };
    }

    let needs_remux = !container_ok
        || (info.container.eq_ignore_ascii_case("mp4")
            && info.codec.eq_ignore_ascii_case("hevc")
            && info.codec_tag.eq_ignore_ascii_case(HEVC_LEGACY_TAG));

    if needs_remux {
        return ComplianceVerdict::NeedsRemux {
            target_codec: default_target_codec(info),
        };
    }

    ComplianceVerdict::Compliant
}

/// CRF tiers by bpp and target codec. `manual_override`, when set, replaces
/// the table outright.
pub fn crf_for(info: &MediaInfo, target_codec: TargetCodec, manual_override: Option<f32>) -> f32 {
    if let Some(crf) = manual_override {
        return crf;
    }

    let bpp = info.bpp();
    let tier = match bpp {
        Some(b) if b > 0.25 => 0,
        Some(b) if b > 0.15 => 1,
        Some(b) if b > 0.10 => 2,
        Some(b) if b > 0.07 => 3,
        Some(b) if b > 0.05 => 4,
        _ => 5,
    };

    const TABLE: [[f32; 3]; 6] = [
        // HEVC,  AV1,  H.264
        [18.0, 20.0, 16.0],
        [20.0, 24.0, 18.0],
        [22.0, 28.0, 20.0],
        [23.0, 30.0, 21.0],
        [25.0, 30.0, 23.0],
        [28.0, 32.0, 26.0],
    ];

    let column = match target_codec {
        TargetCodec::Hevc => 0,
        TargetCodec::Av1 => 1,
        TargetCodec::H264 => 2,
    };

    TABLE[tier][column]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(codec: &str, container: &str, pix_fmt: &str, tag: &str, w: u32, h: u32, br: u64, fps: f64) -> MediaInfo {
        MediaInfo {
            codec: codec.to_string(),
            pix_fmt: pix_fmt.to_string(),
            bit_depth: 8,
            container: container.to_string(),
            width: w,
            height: h,
            duration: Some(60.0),
            frame_rate: fps,
            bitrate: Some(br),
            has_audio: true,
            codec_tag: tag.to_string(),
        }
    }

    #[test]
    fn s1_mpeg4_avi_classifies_as_reencode_with_crf_22() {
        let i = info("mpeg4", "avi", "yuv420p", "", 640, 480, 1_000_000, 30.0);
        match classify(&i) {
            ComplianceVerdict::NeedsReencode { target_codec, crf } => {
                assert_eq!(target_codec, TargetCodec::Hevc);
                assert_eq!(crf, 22.0);
            }
            other => panic!("expected NeedsReencode, got {other:?}"),
        }
    }

    #[test]
    fn s2_hevc_hev1_mkv_needs_remux_only() {
        let i = info("hevc", "matroska", "yuv420p10le", "hev1", 1920, 1080, 4_000_000, 24.0);
        match classify(&i) {
            ComplianceVerdict::NeedsRemux { target_codec } => assert_eq!(target_codec, TargetCodec::Hevc),
            other => panic!("expected NeedsRemux, got {other:?}"),
        }
    }

    #[test]
    fn compliant_file_needs_no_work() {
        let i = info("hevc", "mp4", "yuv420p10le", "hvc1", 1920, 1080, 4_000_000, 24.0);
        assert_eq!(classify(&i), ComplianceVerdict::Compliant);
        assert!(!classify(&i).needs_work());
    }

    #[test]
    fn non_acceptable_pix_fmt_forces_full_fix() {
        let i = info("hevc", "mp4", "yuv422p", "hvc1", 1920, 1080, 4_000_000, 24.0);
        match classify(&i) {
            ComplianceVerdict::NeedsFullFix { .. } => {}
            other => panic!("expected NeedsFullFix, got {other:?}"),
        }
    }

    #[test]
    fn missing_bitrate_selects_lowest_tier() {
        let mut i = info("mpeg4", "avi", "yuv420p", "", 640, 480, 0, 30.0);
        i.bitrate = None;
        assert_eq!(crf_for(&i, TargetCodec::Hevc, None), 28.0);
        assert_eq!(crf_for(&i, TargetCodec::Av1, None), 32.0);
        assert_eq!(crf_for(&i, TargetCodec::H264, None), 26.0);
    }

    #[test]
    fn manual_override_replaces_table() {
        let i = info("mpeg4", "avi", "yuv420p", "", 640, 480, 1_000_000, 30.0);
        assert_eq!(crf_for(&i, TargetCodec::Hevc, Some(19.5)), 19.5);
    }

    #[test]
    fn crf_determinism_for_identical_inputs() {
        let i = info("mpeg4", "avi", "yuv420p", "", 640, 480, 1_000_000, 30.0);
        let first = crf_for(&i, TargetCodec::Hevc, None);
        let second = crf_for(&i, TargetCodec::Hevc, None);
        assert_eq!(first, second);
    }

    #[test]
    fn preview_compatibility_rejects_legacy_hevc_tag() {
        let i = info("hevc", "mp4", "yuv420p10le", "hev1", 1920, 1080, 4_000_000, 24.0);
        assert!(!is_preview_compatible(&i));
        let i2 = info("hevc", "mp4", "yuv420p10le", "hvc1", 1920, 1080, 4_000_000, 24.0);
        assert!(is_preview_compatible(&i2));
    }

    mod crf_properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn crf_is_monotonic_non_increasing_as_bitrate_grows(
                lower in 50_000u64..5_000_000,
                delta in 1u64..5_000_000,
            ) {
                let higher = lower + delta;
                let low_bpp = info("mpeg4", "avi", "yuv420p", "", 640, 480, lower, 30.0);
                let high_bpp = info("mpeg4", "avi", "yuv420p", "", 640, 480, higher, 30.0);

                for codec in [TargetCodec::Hevc, TargetCodec::Av1, TargetCodec::H264] {
                    let low_crf = crf_for(&low_bpp, codec, None);
                    let high_crf = crf_for(&high_bpp, codec, None);
                    prop_assert!(high_crf <= low_crf);
                }
            }
        }
    }
}
