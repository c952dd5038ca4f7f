use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

const BLOB_PREFIX: &str = "blobs";

#[async_trait]
pub trait ObjectStorage: Send + Sync + 'static {
    async fn put_object(&self, key: &str, bytes: Vec<u8>) -> Result<()>;

    async fn get_object(&self, key: &str) -> Result<Vec<u8>>;

    /// Removing a missing object is not an error.
    async fn delete_object(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn list_keys(&self) -> Result<Vec<String>>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Content-addressed key for a blob with the given sha256 hex digest.
pub fn blob_key(checksum: &str) -> String {
    let shard = checksum.get(..2).unwrap_or("00");
    format!("{BLOB_PREFIX}/{shard}/{checksum}")
}

/// Blob store rooted at a local directory. Objects are written to a temp file
/// in the destination directory and renamed into place.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create upload directory {}", root.display()))?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let clean = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if key.is_empty() || !clean {
            bail!("invalid storage key {key:?}");
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStorage for LocalStorage {
    async fn put_object(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let path = self.path_for(key)?;
        tokio::task::spawn_blocking(move || -> Result<()> {
            if path.exists() {
                return Ok(());
            }
            let parent = path
                .parent()
                .context("storage key has no parent directory")?;
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
            let mut temp = tempfile::NamedTempFile::new_in(parent)
                .context("failed to create temporary blob file")?;
            temp.write_all(&bytes)
                .context("failed to write blob contents")?;
            temp.as_file()
                .sync_all()
                .context("failed to flush blob contents")?;
            temp.persist(&path)
                .map_err(|err| err.error)
                .with_context(|| format!("failed to move blob into {}", path.display()))?;
            Ok(())
        })
        .await
        .context("blob write task panicked")?
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read blob {key}"))
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to delete blob {key}")),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        let blobs = self.root.join(BLOB_PREFIX);
        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let mut keys = Vec::new();
            let shards = match std::fs::read_dir(&blobs) {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => return Ok(keys),
                Err(err) => return Err(err).context("failed to list blob shards"),
            };
            for shard in shards {
                let shard = shard?;
                if !shard.file_type()?.is_dir() {
                    continue;
                }
                let shard_name = shard.file_name().to_string_lossy().into_owned();
                for blob in std::fs::read_dir(shard.path())? {
                    let blob = blob?;
                    let name = blob.file_name().to_string_lossy().into_owned();
                    // Skip half-written temp files.
                    if name.starts_with(".tmp") {
                        continue;
                    }
                    keys.push(format!("{BLOB_PREFIX}/{shard_name}/{name}"));
                }
            }
            keys.sort();
            Ok(keys)
        })
        .await
        .context("blob listing task panicked")?
    }
}
