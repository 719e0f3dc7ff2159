use std::path::{Path, PathBuf};

use data_model::{CiJob, ProgressEvent};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::{fs, io::AsyncWriteExt, sync::mpsc};
use tracing::{info, warn};

/// Connection attempts per download; retried back to back, no backoff.
const DOWNLOAD_ATTEMPTS: usize = 3;

const PRIVATE_TOKEN_HEADER: &str = "PRIVATE-TOKEN";

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("download failed: {0}")]
    DownloadFailed(String),
    #[error("error unpacking zip file: {0}")]
    Unpack(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no installable file in artifact for job {0}")]
    NoPackage(u64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitLabConfig {
    pub base_url: String,
    pub project_id: String,
    pub access_token: String,
}

impl Default for GitLabConfig {
    fn default() -> Self {
        Self {
            base_url: "https://gitlab.com".to_string(),
            project_id: String::new(),
            access_token: String::new(),
        }
    }
}

/// Streams CI artifacts to disk with live percent reporting and unpacks them
/// under one directory per job. Re-invoking for the same job overwrites the
/// previous unpack; callers de-duplicate against the package catalog first.
pub struct ArtifactDownloader {
    client: reqwest::Client,
    config: GitLabConfig,
    artifact_dir: PathBuf,
    scratch_dir: PathBuf,
}

impl ArtifactDownloader {
    pub fn new(
        config: GitLabConfig,
        artifact_dir: PathBuf,
        scratch_dir: PathBuf,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            config,
            artifact_dir,
            scratch_dir,
        })
    }

    fn artifact_url(&self, job_id: u64) -> String {
        format!(
            "{}/api/v4/projects/{}/jobs/{}/artifacts",
            self.config.base_url.trim_end_matches('/'),
            self.config.project_id,
            job_id
        )
    }

    fn jobs_url(&self, page: usize, per_page: usize) -> String {
        format!(
            "{}/api/v4/projects/{}/jobs?scope[]=success&per_page={}&page={}",
            self.config.base_url.trim_end_matches('/'),
            self.config.project_id,
            per_page,
            page + 1
        )
    }

    /// Downloads the artifact zip for `job_id`, emitting percent events on
    /// `events`, and unpacks it into `artifact_dir/<job_id>`. The temporary
    /// zip is removed on every exit path.
    pub async fn download(
        &self,
        job_id: u64,
        events: mpsc::Sender<ProgressEvent>,
    ) -> Result<PathBuf, ArtifactError> {
        fs::create_dir_all(&self.scratch_dir).await?;
        let zip_path = self.scratch_dir.join(format!("{job_id}_tmp.zip"));
        let dest_dir = self.artifact_dir.join(job_id.to_string());

        if let Err(err) = self.download_to_zip(job_id, &zip_path, &events).await {
            remove_if_exists(&zip_path).await;
            return Err(err);
        }

        info!(job_id, dest = %dest_dir.display(), "unpacking artifact");
        let unpack_result = {
            let zip_path = zip_path.clone();
            let dest_dir = dest_dir.clone();
            tokio::task::spawn_blocking(move || unpack_zip_file(&zip_path, &dest_dir))
                .await
                .map_err(|err| ArtifactError::Unpack(err.to_string()))
                .and_then(|inner| inner)
        };
        remove_if_exists(&zip_path).await;
        unpack_result?;

        info!(job_id, "artifact downloaded and unpacked");
        Ok(dest_dir)
    }

    async fn download_to_zip(
        &self,
        job_id: u64,
        zip_path: &Path,
        events: &mpsc::Sender<ProgressEvent>,
    ) -> Result<(), ArtifactError> {
        let url = self.artifact_url(job_id);
        let response = self.get_with_retry(&url).await?;
        if !response.status().is_success() {
            return Err(ArtifactError::DownloadFailed(format!(
                "HTTP error! status: {}",
                response.status()
            )));
        }

        let total_size = response.content_length().unwrap_or(0);
        let mut downloaded: u64 = 0;
        let mut file = fs::File::create(zip_path).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| ArtifactError::DownloadFailed(err.to_string()))?;
            downloaded += chunk.len() as u64;
            file.write_all(&chunk).await?;
            let _ = events
                .send(ProgressEvent::Progress(format_percent(
                    downloaded, total_size,
                )))
                .await;
        }
        file.flush().await?;
        Ok(())
    }

    async fn get_with_retry(&self, url: &str) -> Result<reqwest::Response, ArtifactError> {
        let mut last_error = String::new();
        for attempt in 1..=DOWNLOAD_ATTEMPTS {
            match self
                .client
                .get(url)
                .header(PRIVATE_TOKEN_HEADER, &self.config.access_token)
                .send()
                .await
            {
                Ok(response) => return Ok(response),
                Err(err) => {
                    warn!(url, attempt, "artifact request failed: {err}");
                    last_error = err.to_string();
                }
            }
        }
        Err(ArtifactError::DownloadFailed(last_error))
    }

    /// Lists finished CI jobs for the configured project, newest page first.
    pub async fn list_jobs(
        &self,
        page: usize,
        per_page: usize,
    ) -> Result<Vec<CiJob>, ArtifactError> {
        let url = self.jobs_url(page, per_page);
        let response = self.get_with_retry(&url).await?;
        if !response.status().is_success() {
            return Err(ArtifactError::DownloadFailed(format!(
                "HTTP error! status: {}",
                response.status()
            )));
        }
        response
            .json::<Vec<CiJob>>()
            .await
            .map_err(|err| ArtifactError::DownloadFailed(err.to_string()))
    }
}

/// Download percentage with three decimal places, e.g. "42.857".
fn format_percent(downloaded: u64, total: u64) -> String {
    if total == 0 {
        return "0.000".to_string();
    }
    format!("{:.3}", (downloaded as f64 / total as f64) * 100.0)
}

fn unpack_zip_file(zip_path: &Path, dest: &Path) -> Result<(), ArtifactError> {
    std::fs::create_dir_all(dest)?;
    let file = std::fs::File::open(zip_path)?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|err| ArtifactError::Unpack(err.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| ArtifactError::Unpack(err.to_string()))?;

        // Entries with unsafe paths are skipped rather than extracted.
        let Some(relative) = entry.enclosed_name() else {
            warn!(entry = entry.name(), "skipping zip entry with unsafe path");
            continue;
        };
        let out_path = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out_file = std::fs::File::create(&out_path)?;
        std::io::copy(&mut entry, &mut out_file)?;
    }

    Ok(())
}

async fn remove_if_exists(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), "failed to remove temp zip: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn percent_is_formatted_to_three_decimals() {
        assert_eq!(format_percent(0, 100), "0.000");
        assert_eq!(format_percent(50, 100), "50.000");
        assert_eq!(format_percent(3, 7), "42.857");
        assert_eq!(format_percent(100, 100), "100.000");
        // Unknown content length degrades gracefully.
        assert_eq!(format_percent(10, 0), "0.000");
    }

    #[test]
    fn urls_follow_the_gitlab_v4_shape() {
        let downloader = ArtifactDownloader::new(
            GitLabConfig {
                base_url: "https://gitlab.com/".to_string(),
                project_id: "42713979".to_string(),
                access_token: "secret".to_string(),
            },
            PathBuf::from("/tmp/artifacts"),
            PathBuf::from("/tmp/scratch"),
        )
        .unwrap();
        assert_eq!(
            downloader.artifact_url(555),
            "https://gitlab.com/api/v4/projects/42713979/jobs/555/artifacts"
        );
        assert_eq!(
            downloader.jobs_url(0, 20),
            "https://gitlab.com/api/v4/projects/42713979/jobs?scope[]=success&per_page=20&page=1"
        );
    }

    fn write_fixture_zip(path: &Path) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        writer
            .add_directory("nested", options)
            .unwrap();
        writer
            .start_file("nested/pkg-release-master-1.0.0.0.iesa", options)
            .unwrap();
        writer.write_all(b"package bytes").unwrap();
        writer.start_file("README", options).unwrap();
        writer.write_all(b"readme").unwrap();
        writer.finish().unwrap();
    }

    #[test]
    fn unpack_preserves_directory_structure() {
        let tmp = tempfile::tempdir().unwrap();
        let zip_path = tmp.path().join("artifact.zip");
        write_fixture_zip(&zip_path);

        let dest = tmp.path().join("out");
        unpack_zip_file(&zip_path, &dest).unwrap();

        let package = dest.join("nested/pkg-release-master-1.0.0.0.iesa");
        assert_eq!(std::fs::read(&package).unwrap(), b"package bytes");
        assert_eq!(std::fs::read(dest.join("README")).unwrap(), b"readme");
    }

    #[test]
    fn unpack_skips_entries_escaping_the_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let zip_path = tmp.path().join("evil.zip");
        let file = std::fs::File::create(&zip_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file("../escape.txt", options).unwrap();
        writer.write_all(b"nope").unwrap();
        writer.start_file("kept.txt", options).unwrap();
        writer.write_all(b"fine").unwrap();
        writer.finish().unwrap();

        let dest = tmp.path().join("out");
        unpack_zip_file(&zip_path, &dest).unwrap();

        assert_eq!(std::fs::read(dest.join("kept.txt")).unwrap(), b"fine");
        assert!(!tmp.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn failed_download_leaves_no_scratch_leftovers() {
        let tmp = tempfile::tempdir().unwrap();
        // Nothing listens on port 1; every connection attempt fails.
        let downloader = ArtifactDownloader::new(
            GitLabConfig {
                base_url: "http://127.0.0.1:1".to_string(),
                project_id: "1".to_string(),
                access_token: "token".to_string(),
            },
            tmp.path().join("artifacts"),
            tmp.path().join("scratch"),
        )
        .unwrap();

        let (tx, _rx) = mpsc::channel(8);
        let err = downloader.download(77, tx).await.unwrap_err();
        assert!(matches!(err, ArtifactError::DownloadFailed(_)));

        let leftovers: Vec<_> = std::fs::read_dir(tmp.path().join("scratch"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
        assert!(!tmp.path().join("artifacts").join("77").exists());
    }

    #[test]
    fn unpack_rejects_garbage_input() {
        let tmp = tempfile::tempdir().unwrap();
        let zip_path = tmp.path().join("garbage.zip");
        std::fs::write(&zip_path, b"not a zip archive").unwrap();

        let err = unpack_zip_file(&zip_path, &tmp.path().join("out")).unwrap_err();
        assert!(matches!(err, ArtifactError::Unpack(_)));
    }

    #[test]
    fn ci_job_schema_captures_the_consumed_fields() {
        let payload = r#"[{
            "id": 4100,
            "name": "build_release",
            "ref": "release-master",
            "status": "success",
            "created_at": "2024-03-01T10:30:00.000Z",
            "stage": "build",
            "web_url": "https://gitlab.com/x/y/-/jobs/4100"
        }]"#;
        let jobs: Vec<CiJob> = serde_json::from_str(payload).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, 4100);
        assert_eq!(jobs[0].git_ref, "release-master");
        assert_eq!(jobs[0].created_at, "2024-03-01T10:30:00.000Z");
    }
}
