//! Disk-backed MediaInfo cache.
//!
//! A directory of small JSON files keyed by a stable hash of the absolute
//! path. Each record embeds `(size, mtime, probe JSON)`; any mismatch on
//! size or mtime invalidates the entry and the caller re-probes.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::media_info::MediaInfo;

#[derive(Debug, Serialize, Deserialize)]
struct CacheRecord {
    size: u64,
    mtime_unix_nanos: u128,
    info: MediaInfo,
}

pub struct MediaInfoCache {
    dir: PathBuf,
}

impl MediaInfoCache {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn key_for(path: &Path) -> String {
        let absolute = path
            .canonicalize()
            .unwrap_or_else(|_| path.to_path_buf());
        blake3::hash(absolute.to_string_lossy().as_bytes()).to_hex().to_string()
    }

    fn entry_path(&self, path: &Path) -> PathBuf {
        self.dir.join(format!("{}.json", Self::key_for(path)))
    }

    /// Returns a cached `MediaInfo` only if the file's current size and mtime
    /// still match what was recorded when the entry was written.
    pub fn get(&self, path: &Path) -> Option<MediaInfo> {
        let metadata = std::fs::metadata(path).ok()?;
        let entry_path = self.entry_path(path);
        let bytes = std::fs::read(&entry_path).ok()?;
        let record: CacheRecord = serde_json::from_slice(&bytes).ok()?;

        let mtime_nanos = metadata
            .modified()
            .ok()?
            .duration_since(SystemTime::UNIX_EPOCH)
            .ok()?
            .as_nanos();

        if record.size == metadata.len() && record.mtime_unix_nanos == mtime_nanos {
            Some(record.info)
        } else {
            let _ = std::fs::remove_file(&entry_path);
            None
        }
    }

    pub fn put(&self, path: &Path, info: &MediaInfo) -> std::io::Result<()> {
        let metadata = std::fs::metadata(path)?;
        let mtime_unix_nanos = metadata
            .modified()?
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let record = CacheRecord {
            size: metadata.len(),
            mtime_unix_nanos,
            info: info.clone(),
        };
        let bytes = serde_json::to_vec(&record)?;
        std::fs::write(self.entry_path(path), bytes)
    }

    /// Drops any cached entry for `path`. Used after a file is written to in
    /// the current run, so a stale probe result is never served for it.
    pub fn invalidate(&self, path: &Path) {
        let _ = std::fs::remove_file(self.entry_path(path));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_info() -> MediaInfo {
        MediaInfo {
            codec: "h264".to_string(),
            pix_fmt: "yuv420p".to_string(),
            bit_depth: 8,
            container: "mp4".to_string(),
            width: 1920,
            height: 1080,
            duration: Some(60.0),
            frame_rate: 30.0,
            bitrate: Some(5_000_000),
            has_audio: true,
            codec_tag: "avc1".to_string(),
        }
    }

    #[test]
    fn round_trips_a_cache_hit() {
        let temp = TempDir::new().unwrap();
        let video = temp.path().join("a.mp4");
        std::fs::write(&video, b"fake video bytes").unwrap();

        let cache = MediaInfoCache::new(temp.path().join(".cache")).unwrap();
        assert!(cache.get(&video).is_none());

        cache.put(&video, &sample_info()).unwrap();
        assert_eq!(cache.get(&video), Some(sample_info()));
    }

    #[test]
    fn size_change_invalidates_entry() {
        let temp = TempDir::new().unwrap();
        let video = temp.path().join("a.mp4");
        std::fs::write(&video, b"fake video bytes").unwrap();

        let cache = MediaInfoCache::new(temp.path().join(".cache")).unwrap();
        cache.put(&video, &sample_info()).unwrap();

        std::fs::write(&video, b"different, longer content on disk now").unwrap();
        assert!(cache.get(&video).is_none());
    }

    #[test]
    fn invalidate_removes_entry() {
        let temp = TempDir::new().unwrap();
        let video = temp.path().join("a.mp4");
        std::fs::write(&video, b"fake video bytes").unwrap();

        let cache = MediaInfoCache::new(temp.path().join(".cache")).unwrap();
        cache.put(&video, &sample_info()).unwrap();
        cache.invalidate(&video);
        assert!(cache.get(&video).is_none());
    }
}
