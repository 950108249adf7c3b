//! Filesystem access for the artifact cache

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Suffix used for in-progress writes; such files are never visible as artifacts
pub const TEMP_SUFFIX: &str = "partial";

// ============================================================================
// Trait Definitions
// ============================================================================

/// Trait for storage backend operations
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Write content to a file path atomically (temp file, fsync, rename)
    async fn write_atomic(&self, path: &Path, content: &[u8]) -> io::Result<()>;

    /// Write content to a new file, failing if it already exists
    async fn write_new(&self, path: &Path, content: &[u8]) -> io::Result<()>;

    /// Read a file. Returns None if the file doesn't exist
    async fn read(&self, path: &Path) -> io::Result<Option<Vec<u8>>>;

    /// Remove a file. Returns false if it was already absent
    async fn remove(&self, path: &Path) -> io::Result<bool>;

    /// List regular files in a directory. A missing directory is empty
    async fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;

    /// Create a directory and its parents
    async fn create_dir_all(&self, dir: &Path) -> io::Result<()>;
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Production storage backend using tokio::fs
pub struct FileSystemStorage;

impl FileSystemStorage {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FileSystemStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(TEMP_SUFFIX);
    path.with_file_name(name)
}

#[async_trait]
impl StorageBackend for FileSystemStorage {
    async fn write_atomic(&self, path: &Path, content: &[u8]) -> io::Result<()> {
        let temp_file = temp_path(path);

        let mut file = fs::File::create(&temp_file).await?;
        file.write_all(content).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&temp_file, path).await {
            let _ = fs::remove_file(&temp_file).await;
            return Err(e);
        }

        Ok(())
    }

    async fn write_new(&self, path: &Path, content: &[u8]) -> io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        file.write_all(content).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn read(&self, path: &Path) -> io::Result<Option<Vec<u8>>> {
        match fs::read(path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn remove(&self, path: &Path) -> io::Result<bool> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    async fn create_dir_all(&self, dir: &Path) -> io::Result<()> {
        fs::create_dir_all(dir).await
    }
}
