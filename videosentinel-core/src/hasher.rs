//! DCT-based perceptual hash over frames sampled at evenly spaced
//! positions, used to detect re-encoded duplicates that no longer match
//! byte-for-byte or even by bitrate.

use std::f64::consts::PI;
use std::path::Path;
use std::process::Command;

use crate::error::{EngineError, Result};
use crate::media_info;

pub const DEFAULT_FRAME_COUNT: usize = 10;
pub const DEFAULT_HASH_WIDTH: usize = 12;

/// The DCT is taken over a grid this many times larger than the hash width,
/// a standard pHash ratio that leaves enough high-frequency detail to
/// discard while keeping the low frequencies meaningful.
const DOWNSAMPLE_FACTOR: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHash {
    bits: Vec<bool>,
    width: usize,
}

impl FrameHash {
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn hamming_distance(&self, other: &FrameHash) -> u32 {
        self.bits
            .iter()
            .zip(other.bits.iter())
            .filter(|(a, b)| a != b)
            .count() as u32
    }
}

/// Computes the DCT-based perceptual hash of one already-decoded, already
/// grayscale-downsampled image: retains low-frequency coefficients then
/// thresholds them against their median.
fn hash_luma_grid(pixels: &[Vec<f64>], grid_size: usize, w: usize) -> FrameHash {
    let dct = dct_2d_low_frequencies(pixels, grid_size, w);

    // The DC term (0,0) carries only average brightness, not structure.
    let mut coefficients: Vec<f64> = Vec::with_capacity(w * w - 1);
    for u in 0..w {
        for v in 0..w {
            if u == 0 && v == 0 {
                continue;
            }
            coefficients.push(dct[u][v]);
        }
    }
    let median = median_of(&coefficients);

    let mut bits = Vec::with_capacity(w * w);
    for u in 0..w {
        for v in 0..w {
            bits.push(dct[u][v] > median);
        }
    }

    FrameHash { bits, width: w }
}

fn median_of(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    if sorted.is_empty() {
        return 0.0;
    }
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Naive 2D DCT-II, computing only the `w x w` low-frequency coefficients a
/// pHash needs rather than the full `grid_size x grid_size` transform.
fn dct_2d_low_frequencies(pixels: &[Vec<f64>], grid_size: usize, w: usize) -> Vec<Vec<f64>> {
    let n = grid_size as f64;
    let mut out = vec![vec![0.0; w]; w];

    for u in 0..w {
        for v in 0..w {
            let mut sum = 0.0;
            for x in 0..grid_size {
                let cos_u = ((2.0 * x as f64 + 1.0) * u as f64 * PI / (2.0 * n)).cos();
                for y in 0..grid_size {
                    let cos_v = ((2.0 * y as f64 + 1.0) * v as f64 * PI / (2.0 * n)).cos();
                    sum += pixels[x][y] * cos_u * cos_v;
                }
            }
            let alpha_u = if u == 0 { (1.0 / n).sqrt() } else { (2.0 / n).sqrt() };
            let alpha_v = if v == 0 { (1.0 / n).sqrt() } else { (2.0 / n).sqrt() };
            out[u][v] = alpha_u * alpha_v * sum;
        }
    }
    out
}

/// Extracts one frame at `timestamp_secs` via ffmpeg into a temp PNG,
/// decodes it, and converts it to a luminance grid downsampled to `4w x 4w`.
/// A plain `Command` is used rather than [`ManagedProcess`] since the only
/// output wanted is the file ffmpeg writes, not its stdout/stderr streams.
fn extract_frame_grid(path: &Path, timestamp_secs: f64, w: usize) -> Option<Vec<Vec<f64>>> {
    let grid_size = w * DOWNSAMPLE_FACTOR as usize;

    let tmp = tempfile::Builder::new().suffix(".png").tempfile().ok()?;
    let tmp_path = tmp.path().to_path_buf();

    let status = Command::new("ffmpeg")
        .args([
            "-y",
            "-ss",
            &format!("{timestamp_secs:.3}"),
            "-i",
            &path.to_string_lossy(),
            "-frames:v",
            "1",
            tmp_path.to_string_lossy().as_ref(),
        ])
        .status()
        .ok()?;
    if !status.success() {
        return None;
    }

    let img = image::open(&tmp_path).ok()?;
    let resized = img.resize_exact(grid_size as u32, grid_size as u32, image::imageops::FilterType::Triangle);
    let gray = resized.to_luma8();

    let mut grid = vec![vec![0.0; grid_size]; grid_size];
    for (x, row) in grid.iter_mut().enumerate() {
        for (y, cell) in row.iter_mut().enumerate() {
            *cell = gray.get_pixel(x as u32, y as u32).0[0] as f64;
        }
    }
    Some(grid)
}

/// Hashes `N` evenly spaced frames of `path`. Positions whose frame fails
/// to decode are skipped; if fewer than `n / 2` frames succeed, returns
/// `HashFailed`.
pub fn hash_video(path: &Path, n: usize, w: usize) -> Result<Vec<FrameHash>> {
    let info = media_info::probe(path)?;
    let duration = info.duration.ok_or_else(|| EngineError::HashFailed {
        path: path.to_path_buf(),
        reason: "source has no known duration".to_string(),
    })?;

    let mut hashes = Vec::with_capacity(n);
    for i in 0..n {
        let timestamp = duration * (i as f64) / (n as f64);
        if let Some(grid) = extract_frame_grid(path, timestamp, w) {
            hashes.push(hash_luma_grid(&grid, w * DOWNSAMPLE_FACTOR as usize, w));
        }
    }

    if hashes.len() < n / 2 {
        return Err(EngineError::HashFailed {
            path: path.to_path_buf(),
            reason: format!("only {} of {} frames decoded", hashes.len(), n),
        });
    }

    Ok(hashes)
}

/// Mean of per-index Hamming distances; positions beyond the shorter
/// sequence's length are not compared.
pub fn similarity(a: &[FrameHash], b: &[FrameHash]) -> f64 {
    let common_len = a.len().min(b.len());
    if common_len == 0 {
        return f64::MAX;
    }
    let total: u32 = (0..common_len).map(|i| a[i].hamming_distance(&b[i])).sum();
    total as f64 / common_len as f64
}
