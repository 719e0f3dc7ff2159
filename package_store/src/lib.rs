use std::path::{Path, PathBuf};

use anyhow::Result;
use bytes::Bytes;
use data_model::version::is_installable;
use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::{info, warn};

const HASH_READ_BUF_SIZE: usize = 8192;

#[derive(Debug, thiserror::Error)]
pub enum PackageStoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("upload stream error: {0}")]
    Stream(anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct PutResult {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub sha256_hash: String,
}

/// A directly uploaded package found by the startup scan.
#[derive(Debug, Clone)]
pub struct ScannedUpload {
    pub file_name: String,
    pub sha256_hash: String,
}

/// An unpacked CI artifact found by the startup scan.
#[derive(Debug, Clone)]
pub struct ScannedArtifact {
    pub job_id: u64,
    pub file_name: String,
    pub folder_path: PathBuf,
}

/// On-disk home of installable packages: an upload directory fed by the
/// multipart endpoint and an artifact directory holding one subdirectory per
/// ingested CI job.
#[derive(Clone)]
pub struct PackageStore {
    upload_dir: PathBuf,
    artifact_dir: PathBuf,
}

impl PackageStore {
    pub async fn new(upload_dir: PathBuf, artifact_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&upload_dir).await?;
        fs::create_dir_all(&artifact_dir).await?;
        Ok(Self {
            upload_dir,
            artifact_dir,
        })
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    /// Streams an upload to `upload_dir/file_name`, digesting it on the way
    /// through. The file never passes through memory whole.
    pub async fn put(
        &self,
        file_name: &str,
        mut data: impl Stream<Item = Result<Bytes>> + Send + Unpin,
    ) -> Result<PutResult, PackageStoreError> {
        let path = self.upload_dir.join(file_name);
        let mut file = fs::File::create(&path).await.map_err(|source| {
            PackageStoreError::Io {
                path: path.clone(),
                source,
            }
        })?;

        let mut hasher = Sha256::new();
        let mut size_bytes = 0u64;
        while let Some(chunk) = data.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    // Half-written uploads must not linger and be mistaken
                    // for packages by the next startup scan.
                    drop(file);
                    let _ = fs::remove_file(&path).await;
                    return Err(PackageStoreError::Stream(err));
                }
            };
            hasher.update(&chunk);
            size_bytes += chunk.len() as u64;
            file.write_all(&chunk).await.map_err(|source| {
                PackageStoreError::Io {
                    path: path.clone(),
                    source,
                }
            })?;
        }
        file.flush().await.map_err(|source| PackageStoreError::Io {
            path: path.clone(),
            source,
        })?;

        Ok(PutResult {
            path,
            size_bytes,
            sha256_hash: format!("{:x}", hasher.finalize()),
        })
    }

    /// Streamed SHA-256 of an arbitrary file, hex encoded.
    pub async fn compute_hash(&self, path: &Path) -> Result<String, PackageStoreError> {
        let mut file = fs::File::open(path).await.map_err(|source| {
            PackageStoreError::Io {
                path: path.to_path_buf(),
                source,
            }
        })?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; HASH_READ_BUF_SIZE];
        loop {
            let read = file.read(&mut buf).await.map_err(|source| {
                PackageStoreError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Re-discovers directly uploaded packages, re-hashing each so the
    /// known-hash set can be rebuilt after a restart.
    pub async fn scan_upload_dir(&self) -> Result<Vec<ScannedUpload>> {
        let mut found = Vec::new();
        let mut entries = fs::read_dir(&self.upload_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().to_string();
            if !entry.file_type().await?.is_file() || !is_installable(&file_name) {
                continue;
            }
            match self.compute_hash(&entry.path()).await {
                Ok(sha256_hash) => found.push(ScannedUpload {
                    file_name,
                    sha256_hash,
                }),
                Err(err) => warn!(file_name, "skipping unreadable upload: {err}"),
            }
        }
        info!("found {} uploaded packages on disk", found.len());
        Ok(found)
    }

    /// Re-discovers unpacked artifacts: every `artifact_dir/<job_id>/`
    /// subdirectory containing an installable file.
    pub async fn scan_artifact_dir(&self) -> Result<Vec<ScannedArtifact>> {
        let mut found = Vec::new();
        let mut entries = fs::read_dir(&self.artifact_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Ok(job_id) = entry.file_name().to_string_lossy().parse::<u64>() else {
                continue;
            };
            match self.find_installable(&entry.path()).await? {
                Some((file_name, folder_path)) => found.push(ScannedArtifact {
                    job_id,
                    file_name,
                    folder_path,
                }),
                None => warn!(job_id, "artifact directory holds no installable file"),
            }
        }
        info!("found {} unpacked artifacts on disk", found.len());
        Ok(found)
    }

    /// Walks an unpacked artifact tree for the first installable file,
    /// returning its name and containing directory.
    pub async fn find_installable(&self, dir: &Path) -> Result<Option<(String, PathBuf)>> {
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || find_installable_blocking(&dir)).await?
    }
}

fn find_installable_blocking(dir: &Path) -> Result<Option<(String, PathBuf)>> {
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(entry.path());
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().to_string();
            if file_type.is_file() && is_installable(&file_name) {
                return Ok(Some((file_name, current)));
            }
        }
    }
    Ok(None)
}
