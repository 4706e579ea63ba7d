//! Metadata-preserving copy used by the network pipeline's download/upload
//! stages: copy the bytes, then best-effort restore timestamps and extended
//! attributes, downgrading to a plain copy if that fails rather than failing
//! the whole transfer.

use std::fs;
use std::path::Path;

use tracing::warn;

use crate::error::Result;

/// Outcome of a metadata-preserving copy, distinguishing a full preserve
/// from the EPERM/unsupported-filesystem fallback so callers can log it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    MetadataPreserved,
    PlainCopyFallback,
}

/// Copies `src` to `dst`, then attempts to restore mtime/atime and xattrs.
/// A permission error or unsupported filesystem on the metadata step is
/// logged and downgraded rather than propagated, since the byte copy itself
/// already succeeded and the transfer should not be blocked on metadata.
pub fn copy_preserving_metadata(src: &Path, dst: &Path) -> Result<CopyOutcome> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dst)?;

    let metadata = match fs::metadata(src) {
        Ok(m) => m,
        Err(e) => {
            warn!(path = %src.display(), error = %e, "could not stat source for metadata preservation");
            return Ok(CopyOutcome::PlainCopyFallback);
        }
    };

    let atime = filetime::FileTime::from_last_access_time(&metadata);
    let mtime = filetime::FileTime::from_last_modification_time(&metadata);
    if let Err(e) = filetime::set_file_times(dst, atime, mtime) {
        warn!(path = %dst.display(), error = %e, "failed to restore timestamps, continuing with plain copy");
        return Ok(CopyOutcome::PlainCopyFallback);
    }

    if !copy_xattrs(src, dst) {
        return Ok(CopyOutcome::PlainCopyFallback);
    }

    Ok(CopyOutcome::MetadataPreserved)
}

/// Returns `false` (without failing the copy) if any attribute could not be
/// transferred, e.g. the destination filesystem doesn't support xattrs.
fn copy_xattrs(src: &Path, dst: &Path) -> bool {
    let Ok(names) = xattr::list(src) else {
        return true;
    };
    let mut ok = true;
    for name in names {
        let Some(name_str) = name.to_str() else { continue };
        match xattr::get(src, name_str) {
            Ok(Some(value)) => {
                if let Err(e) = xattr::set(dst, name_str, &value) {
                    warn!(path = %dst.display(), attr = name_str, error = %e, "failed to copy extended attribute");
                    ok = false;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(path = %src.display(), attr = name_str, error = %e, "failed to read extended attribute");
                ok = false;
            }
        }
    }
    ok
}
