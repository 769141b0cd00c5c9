//! On-disk manifest handling: gzip sniffing on read, tempfile + fsync +
//! rename on write. Readers always observe either the old or the new
//! manifest, never a partial file.

use std::ffi::CString;
use std::io::{Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use super::Manifest;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Read a manifest from disk. A missing file yields an empty manifest
/// (initial run); an unparseable one is an error so the caller can leave
/// local state untouched.
pub fn read_manifest(path: &Path) -> Result<Manifest> {
    if !path.exists() {
        tracing::debug!("no manifest at {}, starting empty", path.display());
        return Ok(Manifest::default());
    }
    let raw = std::fs::read(path)
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;
    let data = decompress_if_needed(&raw)?;
    Manifest::parse(&data).with_context(|| format!("Failed to parse manifest {}", path.display()))
}

/// Decode bytes that may or may not be gzip-compressed (sniffed by magic,
/// not by filename, since HTTP servers sometimes deflate transparently).
pub fn decompress_if_needed(raw: &[u8]) -> Result<Vec<u8>> {
    if raw.len() >= 2 && raw[..2] == GZIP_MAGIC {
        let mut decoder = GzDecoder::new(raw);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .context("Failed to decompress gzipped manifest")?;
        Ok(out)
    } else {
        Ok(raw.to_vec())
    }
}

/// Atomically replace the manifest: write a temporary sibling, fsync, then
/// rename over the target. Gzip output is chosen by the `.gz` suffix.
/// When `mtime` is given the file's modification time is set to it so HTTP
/// conditional fetches track the origin's Last-Modified.
pub fn write_manifest(
    path: &Path,
    manifest: &Manifest,
    pretty: bool,
    mtime: Option<i64>,
) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create manifest directory {}", dir.display()))?;

    let bytes = manifest.to_bytes(pretty)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;

    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        let mut encoder = GzEncoder::new(tmp.as_file_mut(), Compression::new(9));
        encoder.write_all(&bytes)?;
        encoder.finish()?;
    } else {
        tmp.as_file_mut().write_all(&bytes)?;
    }

    tmp.as_file_mut().sync_all()?;
    std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o644))?;
    if let Some(mtime) = mtime {
        set_mtime(tmp.path(), mtime)?;
    }

    tmp.persist(path)
        .with_context(|| format!("Failed to move manifest into place at {}", path.display()))?;
    tracing::debug!("wrote {} ({} entries)", path.display(), manifest.len());
    Ok(())
}

/// Purge safety: may `removed` entries disappear from a manifest that
/// previously held `prior_total`? Small absolute removals are always fine;
/// beyond `threshold` entries the removed fraction must stay within
/// `quorum`. `force` overrides.
pub fn quorum_allows(
    prior_total: usize,
    removed: usize,
    quorum: f64,
    threshold: usize,
    force: bool,
) -> bool {
    if force || removed == 0 || prior_total == 0 {
        return true;
    }
    if removed <= threshold {
        return true;
    }
    (removed as f64) / (prior_total as f64) <= quorum
}

fn set_mtime(path: &Path, mtime: i64) -> Result<()> {
    let cpath = CString::new(path.as_os_str().as_bytes()).context("path contains NUL")?;
    let times = [
        libc::timespec { tv_sec: mtime, tv_nsec: 0 },
        libc::timespec { tv_sec: mtime, tv_nsec: 0 },
    ];
    let rc = unsafe { libc::utimensat(libc::AT_FDCWD, cpath.as_ptr(), times.as_ptr(), 0) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("Failed to set mtime on {}", path.display()));
    }
    Ok(())
}

/// Modification time of a file as unix seconds, if it exists.
pub fn file_mtime(path: &Path) -> Option<i64> {
    let meta = std::fs::metadata(path).ok()?;
    let mtime = meta.modified().ok()?;
    mtime
        .duration_since(std::time::UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::RepoEntry;
    use tempfile::TempDir;

    fn sample() -> Manifest {
        let mut manifest = Manifest::new();
        manifest.repos.insert(
            "/a.git".to_string(),
            RepoEntry {
                modified: 100,
                fingerprint: Some("abc".to_string()),
                ..Default::default()
            },
        );
        manifest
    }

    #[test]
    fn test_write_read_plain() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("manifest.js");
        write_manifest(&path, &sample(), false, None).unwrap();
        let back = read_manifest(&path).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back.repos["/a.git"].fingerprint.as_deref(), Some("abc"));
    }

    #[test]
    fn test_write_read_gzip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("manifest.js.gz");
        write_manifest(&path, &sample(), false, None).unwrap();

        // The file on disk must actually be gzip.
        let raw = std::fs::read(&path).unwrap();
        assert_eq!(raw[..2], GZIP_MAGIC);

        let back = read_manifest(&path).unwrap();
        assert_eq!(back.len(), 1);
    }

    #[test]
    fn test_missing_manifest_is_empty() {
        let tmp = TempDir::new().unwrap();
        let back = read_manifest(&tmp.path().join("nope.js")).unwrap();
        assert!(back.is_empty());
    }

    #[test]
    fn test_garbage_manifest_is_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("manifest.js");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(read_manifest(&path).is_err());
    }

    #[test]
    fn test_mtime_propagation() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("manifest.js");
        write_manifest(&path, &sample(), false, Some(1234567890)).unwrap();
        assert_eq!(file_mtime(&path), Some(1234567890));
    }

    #[test]
    fn test_quorum_boundaries() {
        // Removing exactly the quorum fraction is allowed; one more is not.
        assert!(quorum_allows(100, 5, 0.05, 0, false));
        assert!(!quorum_allows(100, 6, 0.05, 0, false));
        // Small absolute removals always pass.
        assert!(quorum_allows(100, 5, 0.01, 5, false));
        // 20% of 100 with default quorum refused, force overrides.
        assert!(!quorum_allows(100, 20, 0.05, 5, false));
        assert!(quorum_allows(100, 20, 0.05, 5, true));
    }
}
