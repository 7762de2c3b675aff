//! Local blob backends: a directory tree and an in-memory map.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::blob::{BlobBackend, BlobError, BlobObject};

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Blobs as files under `root`; the version token is the content hash.
///
/// Conditional writes are checked and applied under an in-process lock and land via an
/// atomic temp-file rename, so readers never observe a half-written table.
#[derive(Debug)]
pub struct FsBlobBackend {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FsBlobBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, BlobError> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_)))
        {
            return Err(BlobError::Backend {
                path: path.to_string(),
                message: "blob paths must be plain relative paths".to_string(),
            });
        }
        Ok(self.root.join(relative))
    }

    async fn read(&self, path: &str, absolute: &Path) -> Result<Option<BlobObject>, BlobError> {
        match fs::read(absolute).await {
            Ok(bytes) => Ok(Some(BlobObject {
                version: sha256_hex(&bytes),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            })),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(path, "reading", err)),
        }
    }
}

fn io_error(path: &str, action: &str, err: std::io::Error) -> BlobError {
    BlobError::Backend {
        path: path.to_string(),
        message: format!("{action} failed: {err}"),
    }
}

#[async_trait]
impl BlobBackend for FsBlobBackend {
    fn describe(&self) -> String {
        format!("fs:{}", self.root.display())
    }

    async fn get(&self, path: &str) -> Result<Option<BlobObject>, BlobError> {
        let absolute = self.resolve(path)?;
        self.read(path, &absolute).await
    }

    async fn put(
        &self,
        path: &str,
        body: &str,
        _message: &str,
        expected: Option<&str>,
    ) -> Result<String, BlobError> {
        let absolute = self.resolve(path)?;
        let _guard = self.write_lock.lock().await;

        let current = self.read(path, &absolute).await?.map(|obj| obj.version);
        if current.as_deref() != expected {
            return Err(BlobError::Conflict {
                path: path.to_string(),
            });
        }

        let parent = absolute.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&parent)
            .await
            .map_err(|err| io_error(path, "creating directory", err))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), body.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|err| io_error(path, "opening temp file", err))?;
        file.write_all(body.as_bytes())
            .await
            .map_err(|err| io_error(path, "writing temp file", err))?;
        file.flush()
            .await
            .map_err(|err| io_error(path, "flushing temp file", err))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_error(path, "renaming temp file", err));
        }

        Ok(sha256_hex(body.as_bytes()))
    }
}

/// In-memory blobs with counter versions. Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryBlobBackend {
    blobs: std::sync::Mutex<HashMap<String, (String, u64)>>,
    next_version: AtomicU64,
    writes: AtomicUsize,
    conflict_next_put: AtomicBool,
}

impl MemoryBlobBackend {
    /// Seed a blob directly, bypassing version checks.
    pub fn insert(&self, path: &str, body: &str) {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut blobs) = self.blobs.lock() {
            blobs.insert(path.to_string(), (body.to_string(), version));
        }
    }

    pub fn body(&self, path: &str) -> Option<String> {
        self.blobs
            .lock()
            .ok()
            .and_then(|blobs| blobs.get(path).map(|(body, _)| body.clone()))
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make the next `put` fail as if another writer had moved the blob.
    pub fn fail_next_put_with_conflict(&self) {
        self.conflict_next_put.store(true, Ordering::SeqCst);
    }

    fn poisoned(path: &str) -> BlobError {
        BlobError::Backend {
            path: path.to_string(),
            message: "memory backend lock poisoned".to_string(),
        }
    }
}

#[async_trait]
impl BlobBackend for MemoryBlobBackend {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn get(&self, path: &str) -> Result<Option<BlobObject>, BlobError> {
        let blobs = self.blobs.lock().map_err(|_| Self::poisoned(path))?;
        Ok(blobs.get(path).map(|(body, version)| BlobObject {
            body: body.clone(),
            version: format!("v{version}"),
        }))
    }

    async fn put(
        &self,
        path: &str,
        body: &str,
        _message: &str,
        expected: Option<&str>,
    ) -> Result<String, BlobError> {
        if self.conflict_next_put.swap(false, Ordering::SeqCst) {
            return Err(BlobError::Conflict {
                path: path.to_string(),
            });
        }

        let mut blobs = self.blobs.lock().map_err(|_| Self::poisoned(path))?;
        let current = blobs.get(path).map(|(_, v)| format!("v{v}"));
        if current.as_deref() != expected {
            return Err(BlobError::Conflict {
                path: path.to_string(),
            });
        }

        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        blobs.insert(path.to_string(), (body.to_string(), version));
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(format!("v{version}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sha256_hex_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn fs_backend_writes_atomically_and_checks_versions() {
        let dir = tempdir().expect("tempdir");
        let backend = FsBlobBackend::new(dir.path());

        assert_eq!(backend.get("nasdaq/aapl.csv").await.unwrap(), None);
        let v1 = backend
            .put("nasdaq/aapl.csv", "date,sentiment\n", "create", None)
            .await
            .unwrap();
        assert_eq!(v1, sha256_hex(b"date,sentiment\n"));

        let again = backend.put("nasdaq/aapl.csv", "x", "create", None).await;
        assert!(matches!(again, Err(BlobError::Conflict { .. })));

        let v2 = backend
            .put("nasdaq/aapl.csv", "date,sentiment\n2024-01-01,1\n", "append", Some(&v1))
            .await
            .unwrap();
        let stale = backend.put("nasdaq/aapl.csv", "y", "append", Some(&v1)).await;
        assert!(matches!(stale, Err(BlobError::Conflict { .. })));

        let obj = backend.get("nasdaq/aapl.csv").await.unwrap().unwrap();
        assert_eq!(obj.version, v2);
        assert_eq!(obj.body, "date,sentiment\n2024-01-01,1\n");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("nasdaq"))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn fs_backend_rejects_escaping_paths() {
        let dir = tempdir().expect("tempdir");
        let backend = FsBlobBackend::new(dir.path());
        assert!(matches!(
            backend.get("../outside.csv").await,
            Err(BlobError::Backend { .. })
        ));
    }

    #[tokio::test]
    async fn memory_backend_versions_every_write() {
        let backend = MemoryBlobBackend::default();
        let v1 = backend.put("a", "1", "m", None).await.unwrap();
        let v2 = backend.put("a", "2", "m", Some(&v1)).await.unwrap();
        assert_ne!(v1, v2);
        assert!(backend.put("a", "3", "m", Some(&v1)).await.is_err());
        assert_eq!(backend.body("a").as_deref(), Some("2"));
        assert_eq!(backend.write_count(), 2);
    }
}
