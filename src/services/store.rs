//! Object storage seam.
//!
//! The pipeline treats storage as a collaborator with a narrow surface:
//! put bytes at a key, read them back, append during a merge, commit a
//! temp object into place, delete, and mint a download URL. `DiskStore`
//! is the local-filesystem implementation; the merge orchestrator and
//! handlers only ever see the trait.

use async_trait::async_trait;
use bytes::Bytes;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

const MAX_KEY_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("invalid storage key `{0}`")]
    InvalidKey(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Minimal object-storage operations needed by the pipeline.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Persist `bytes` at `key`, overwriting any prior object.
    /// Returns the number of bytes written.
    async fn put(&self, key: &str, bytes: Bytes) -> StoreResult<u64>;

    /// Read the full object at `key`.
    async fn read(&self, key: &str) -> StoreResult<Bytes>;

    /// Open the object for streaming out. Returns its length and a reader.
    async fn reader(&self, key: &str) -> StoreResult<(u64, Box<dyn AsyncRead + Send + Unpin>)>;

    /// Append `bytes` to the object at `key`, creating it if absent.
    /// Returns the number of bytes appended.
    async fn append(&self, key: &str, bytes: Bytes) -> StoreResult<u64>;

    /// Durably move a temp object into its final key.
    async fn commit(&self, tmp_key: &str, final_key: &str) -> StoreResult<()>;

    /// Delete the object at `key`. Missing objects are not an error.
    async fn remove(&self, key: &str) -> StoreResult<()>;

    /// Download URL for the object at `key`.
    fn download_url(&self, key: &str) -> String;
}

/// Basic key validation to avoid trivial path traversal vectors.
///
/// Rejects keys that are empty, begin with `/`, or contain `..`,
/// backslashes, or control bytes.
pub fn ensure_key_safe(key: &str) -> StoreResult<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    if key.starts_with('/') || key.contains("..") {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    if key
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
    {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Local-disk object store rooted at `base_path`.
#[derive(Clone, Debug)]
pub struct DiskStore {
    base_path: PathBuf,
}

impl DiskStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn resolve(&self, key: &str) -> StoreResult<PathBuf> {
        ensure_key_safe(key)?;
        Ok(self.base_path.join(key))
    }

    /// Recursively remove empty directories up to the store root.
    ///
    /// Stops when a directory is non-empty, missing, or the root is
    /// reached.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for DiskStore {
    async fn put(&self, key: &str, bytes: Bytes) -> StoreResult<u64> {
        let path = self.resolve(key)?;
        let parent = path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StoreError::Io(io::Error::new(
                ErrorKind::InvalidInput,
                "object key missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;

        // Write through a temp file and rename so a concurrent reader
        // never observes a half-written object.
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;
        if let Err(err) = file.write_all(&bytes).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }

        if let Err(err) = fs::rename(&tmp_path, &path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&path).await?;
                fs::rename(&tmp_path, &path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::Io(err));
            }
        }

        Ok(bytes.len() as u64)
    }

    async fn read(&self, key: &str) -> StoreResult<Bytes> {
        let path = self.resolve(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    async fn reader(&self, key: &str) -> StoreResult<(u64, Box<dyn AsyncRead + Send + Unpin>)> {
        let path = self.resolve(key)?;
        let file = File::open(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StoreError::NotFound(key.to_string())
            } else {
                StoreError::Io(err)
            }
        })?;
        let len = file.metadata().await?.len();
        Ok((len, Box::new(file)))
    }

    async fn append(&self, key: &str, bytes: Bytes) -> StoreResult<u64> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        Ok(bytes.len() as u64)
    }

    async fn commit(&self, tmp_key: &str, final_key: &str) -> StoreResult<()> {
        let tmp_path = self.resolve(tmp_key)?;
        let final_path = self.resolve(final_key)?;
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // fsync before rename; append() only flushed.
        let file = fs::OpenOptions::new().read(true).open(&tmp_path).await?;
        file.sync_all().await?;

        if let Err(err) = fs::rename(&tmp_path, &final_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&final_path).await?;
                fs::rename(&tmp_path, &final_path).await?;
            } else {
                return Err(StoreError::Io(err));
            }
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path).await {
            Ok(_) => debug!("removed object {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("object {} already missing", path.display());
            }
            Err(err) => return Err(StoreError::Io(err)),
        }
        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    fn download_url(&self, key: &str) -> String {
        format!("/v1/files/{}", key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_safety_rejects_traversal() {
        assert!(ensure_key_safe("pkg/app.apk").is_ok());
        assert!(ensure_key_safe("chunks/u1/00001.part").is_ok());
        assert!(ensure_key_safe("").is_err());
        assert!(ensure_key_safe("/etc/passwd").is_err());
        assert!(ensure_key_safe("a/../b").is_err());
        assert!(ensure_key_safe("a\\b").is_err());
        assert!(ensure_key_safe("a\0b").is_err());
    }

    #[tokio::test]
    async fn put_read_append_commit_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path());

        store.put("a/b.bin", Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(store.read("a/b.bin").await.unwrap(), Bytes::from_static(b"hello"));

        // overwrite, not duplicate
        store.put("a/b.bin", Bytes::from_static(b"world")).await.unwrap();
        assert_eq!(store.read("a/b.bin").await.unwrap(), Bytes::from_static(b"world"));

        store.append("a/out.tmp", Bytes::from_static(b"one")).await.unwrap();
        store.append("a/out.tmp", Bytes::from_static(b"two")).await.unwrap();
        store.commit("a/out.tmp", "a/out.bin").await.unwrap();
        assert_eq!(store.read("a/out.bin").await.unwrap(), Bytes::from_static(b"onetwo"));
        assert!(matches!(
            store.read("a/out.tmp").await,
            Err(StoreError::NotFound(_))
        ));

        store.remove("a/b.bin").await.unwrap();
        assert!(matches!(
            store.read("a/b.bin").await,
            Err(StoreError::NotFound(_))
        ));
        // removing again is fine
        store.remove("a/b.bin").await.unwrap();
    }

    #[tokio::test]
    async fn remove_prunes_empty_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path());

        store
            .put("chunks/u1/00000.part", Bytes::from_static(b"x"))
            .await
            .unwrap();
        store.remove("chunks/u1/00000.part").await.unwrap();

        assert!(!dir.path().join("chunks").exists());
    }
}
