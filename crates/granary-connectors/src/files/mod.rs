//! File-server connectors (FTP, SFTP, WebDAV).
//!
//! Each fetch enumerates one directory level, downloads every regular file
//! into the staging partition for the connector's protocol, and returns one
//! item per downloaded file with `lake_path` set and no in-memory payload.
//! Downloads publish atomically: bytes land in a temporary sibling that is
//! renamed into place.

pub mod ftp;
pub mod sftp;
pub mod webdav;

use std::path::{Path, PathBuf};

use chrono::Utc;

use granary_core::{lake, EtlError, IngestedItem};

/// Stage one downloaded file and build its ingestion item.
pub(crate) fn stage_download(
    lake_root: &Path,
    protocol: &str,
    source_name: &str,
    remote_path: &str,
    bytes: &[u8],
) -> Result<IngestedItem, EtlError> {
    let basename = Path::new(remote_path)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            EtlError::FetchFailed(format!("remote path '{}' has no file name", remote_path))
        })?;

    let now = Utc::now();
    let target: PathBuf = lake::download_target(lake_root, protocol, source_name, &now, basename)?;
    lake::publish_atomic(bytes, &target)?;

    Ok(IngestedItem::pre_staged(
        remote_path,
        target,
        bytes.len() as u64,
    ))
}

/// The remote path for a fetch: the query when given, the configured base
/// path otherwise.
pub(crate) fn resolve_remote_path<'a>(query: &'a str, base_path: &'a str) -> &'a str {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        base_path
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_download_places_file_in_partition() {
        let dir = tempfile::tempdir().unwrap();
        let item =
            stage_download(dir.path(), "ftp", "exports", "/outbound/data.csv", b"a,b\n1,2\n")
                .unwrap();

        let lake_path = item.lake_path.unwrap();
        assert!(lake_path.exists());
        assert_eq!(item.source_path.as_deref(), Some("/outbound/data.csv"));
        assert_eq!(item.size_bytes, Some(8));
        let relative = lake_path.strip_prefix(dir.path()).unwrap();
        let parts: Vec<&str> = relative.iter().map(|p| p.to_str().unwrap()).collect();
        assert_eq!(parts[0], "ftp");
        assert_eq!(parts[1], "exports");
        assert_eq!(parts[3], "data.csv");
    }

    #[test]
    fn empty_query_falls_back_to_base_path() {
        assert_eq!(resolve_remote_path("", "/outbound"), "/outbound");
        assert_eq!(resolve_remote_path("  ", "/outbound"), "/outbound");
        assert_eq!(resolve_remote_path("/other", "/outbound"), "/other");
    }
}
