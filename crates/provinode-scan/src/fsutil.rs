//! Atomic file write helpers shared by the on-disk stores.

use std::io;
use std::path::Path;

/// Writes `bytes` to `path` atomically (temp file + rename).
///
/// The temp file lives next to the target so the rename never crosses
/// a filesystem boundary.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Best-effort backup-exclusion marker next to a sensitive file.
///
/// Platforms with a real exclusion attribute handle it in their shell
/// layer; the portable core leaves a marker the packager recognizes.
pub(crate) async fn mark_no_backup(path: &Path) {
    if let Some(parent) = path.parent() {
        let marker = parent.join(".nobackup");
        let _ = tokio::fs::write(&marker, b"").await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_atomic_creates_parents_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/store.json");

        write_atomic(&path, b"one").await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"one");

        write_atomic(&path, b"two").await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"two");
        assert!(!path.with_extension("tmp").exists());
    }
}
