//! Partitioned data-lake paths and atomic file publishing.
//!
//! Staged files live at
//! `<root>/<protocol>/<source>/<YYYY-MM-DD>/<safe_source>_<utc_timestamp>.<ext>`
//! and are always written to a temporary sibling first, then renamed into
//! place, so a reader never observes a half-written file.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::EtlError;

/// Replace path separators and dots so a source name is a safe file token.
pub fn safe_name(value: &str) -> String {
    value.replace(['/', '.'], "_")
}

/// UTC timestamp token with microsecond precision, e.g.
/// `20250316T142233123456Z`.
pub fn timestamp_token(now: &DateTime<Utc>) -> String {
    now.format("%Y%m%dT%H%M%S%6fZ").to_string()
}

/// Partition directory for a protocol/source pair on the given day.
pub fn partition_dir(
    lake_root: &Path,
    protocol: &str,
    source_name: &str,
    now: &DateTime<Utc>,
) -> PathBuf {
    lake_root
        .join(protocol)
        .join(source_name)
        .join(now.format("%Y-%m-%d").to_string())
}

/// Compute (and reserve a directory for) the next staged file path.
///
/// Microsecond timestamps make collisions within a partition effectively
/// impossible; if one happens anyway, a short random suffix keeps the file
/// unique without disturbing the normal naming scheme.
pub fn staged_file_path(
    lake_root: &Path,
    protocol: &str,
    source_name: &str,
    now: &DateTime<Utc>,
    extension: &str,
) -> Result<PathBuf, EtlError> {
    let dir = partition_dir(lake_root, protocol, source_name, now);
    std::fs::create_dir_all(&dir)
        .map_err(|e| EtlError::StagingFailed(format!("{}: {}", dir.display(), e)))?;

    let stem = format!("{}_{}", safe_name(source_name), timestamp_token(now));
    let target = dir.join(format!("{}.{}", stem, extension));
    if !target.exists() {
        return Ok(target);
    }

    let suffix = uuid::Uuid::new_v4().simple().to_string();
    Ok(dir.join(format!("{}_{}.{}", stem, &suffix[..4], extension)))
}

/// Local target for a downloaded remote file, under the partition scheme.
pub fn download_target(
    lake_root: &Path,
    protocol: &str,
    source_name: &str,
    now: &DateTime<Utc>,
    basename: &str,
) -> Result<PathBuf, EtlError> {
    let dir = partition_dir(lake_root, protocol, source_name, now);
    std::fs::create_dir_all(&dir)
        .map_err(|e| EtlError::StagingFailed(format!("{}: {}", dir.display(), e)))?;
    Ok(dir.join(basename))
}

/// Write `bytes` to a temporary sibling of `target` and rename into place.
pub fn publish_atomic(bytes: &[u8], target: &Path) -> Result<(), EtlError> {
    let dir = target
        .parent()
        .ok_or_else(|| EtlError::StagingFailed(format!("{} has no parent", target.display())))?;
    let file_name = target
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| EtlError::StagingFailed(format!("{} has no file name", target.display())))?;

    let temp = dir.join(format!(".{}.tmp", file_name));
    std::fs::write(&temp, bytes)
        .map_err(|e| EtlError::StagingFailed(format!("{}: {}", temp.display(), e)))?;
    std::fs::rename(&temp, target)
        .map_err(|e| EtlError::StagingFailed(format!("{}: {}", target.display(), e)))?;
    Ok(())
}
