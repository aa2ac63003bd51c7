//! Filesystem helpers for atomic publishing and cross-device moves.

use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::{MediaError, MediaResult};

/// Size of `path` if it exists as a non-empty regular file.
pub async fn file_size_if_present(path: impl AsRef<Path>) -> MediaResult<Option<u64>> {
    match fs::metadata(path.as_ref()).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(Some(meta.len())),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Unique temporary path next to `dst`.
///
/// Lives in the same directory so the final rename stays on one filesystem.
/// The original extension is kept last so tools that infer the format from
/// the name (FFmpeg) still work.
pub fn temp_sibling(dst: &Path) -> PathBuf {
    let stem = dst
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let name = match dst.extension() {
        Some(ext) => format!(".{}.{}.tmp.{}", stem, &suffix[..12], ext.to_string_lossy()),
        None => format!(".{}.{}.tmp", stem, &suffix[..12]),
    };
    dst.with_file_name(name)
}

/// Move a file from `src` to `dst`, handling cross-device moves.
///
/// Tries a rename first and falls back to copy-and-delete on EXDEV. The copy
/// goes through a temp file next to `dst` so readers never see a partial file.
pub async fn move_file(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> MediaResult<()> {
    let src = src.as_ref();
    let dst = dst.as_ref();

    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).await?;
    }

    match fs::rename(src, dst).await {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device_error(&e) => {
            tracing::debug!(
                "Cross-device rename detected, falling back to copy+delete: {} -> {}",
                src.display(),
                dst.display()
            );
            copy_and_delete(src, dst).await
        }
        Err(e) => Err(MediaError::from(e)),
    }
}

/// Copy `src` to `dst` through a temp sibling, leaving `src` in place.
pub async fn copy_atomic(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> MediaResult<u64> {
    let src = src.as_ref();
    let dst = dst.as_ref();

    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp = temp_sibling(dst);
    let copied = fs::copy(src, &tmp).await?;
    if let Err(e) = fs::rename(&tmp, dst).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(copied)
}

/// Remove a file, treating "already gone" as success.
pub async fn remove_if_exists(path: impl AsRef<Path>) -> MediaResult<bool> {
    match fs::remove_file(path.as_ref()).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// EXDEV is error code 18 on Linux/macOS.
fn is_cross_device_error(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(18)
}

async fn copy_and_delete(src: &Path, dst: &Path) -> MediaResult<()> {
    copy_atomic(src, dst).await.map_err(|e| {
        tracing::error!(
            "Failed to copy file during cross-device move: {} -> {}: {}",
            src.display(),
            dst.display(),
            e
        );
        e
    })?;

    if let Err(e) = fs::remove_file(src).await {
        tracing::warn!(
            "Failed to remove source file after cross-device move: {}: {}",
            src.display(),
            e
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_move_file_to_subdirectory() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("source.txt");
        let dst = dir.path().join("subdir").join("dest.txt");

        fs::write(&src, b"test content").await.unwrap();
        move_file(&src, &dst).await.unwrap();

        assert!(!src.exists());
        assert_eq!(fs::read_to_string(&dst).await.unwrap(), "test content");
    }

    #[tokio::test]
    async fn test_copy_atomic_keeps_source() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.jpg");
        let dst = dir.path().join("out").join("b.jpg");
        fs::write(&src, b"img").await.unwrap();

        assert_eq!(copy_atomic(&src, &dst).await.unwrap(), 3);
        assert!(src.exists());
        assert_eq!(fs::read(&dst).await.unwrap(), b"img");
    }

    #[tokio::test]
    async fn test_file_size_if_present() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        assert_eq!(file_size_if_present(&path).await.unwrap(), None);

        fs::write(&path, b"").await.unwrap();
        assert_eq!(file_size_if_present(&path).await.unwrap(), None);

        fs::write(&path, b"abc").await.unwrap();
        assert_eq!(file_size_if_present(&path).await.unwrap(), Some(3));
        assert_eq!(file_size_if_present(dir.path()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_remove_if_exists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"x").await.unwrap();
        assert!(remove_if_exists(&path).await.unwrap());
        assert!(!remove_if_exists(&path).await.unwrap());
    }

    #[test]
    fn test_temp_sibling_keeps_extension() {
        let tmp = temp_sibling(Path::new("/w/media/m1/audio.mp3"));
        assert_eq!(tmp.parent(), Some(Path::new("/w/media/m1")));
        assert_eq!(tmp.extension().and_then(|e| e.to_str()), Some("mp3"));
        assert_ne!(tmp, temp_sibling(Path::new("/w/media/m1/audio.mp3")));
    }

    #[test]
    fn test_is_cross_device_error() {
        assert!(is_cross_device_error(&std::io::Error::from_raw_os_error(18)));
        assert!(!is_cross_device_error(&std::io::Error::from_raw_os_error(2)));
    }
}
