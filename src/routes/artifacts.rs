use anyhow::anyhow;
use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use data_model::{PackageInfo, ProgressEvent};
use state_store::requests::{RegisterPackageRequest, RequestPayload, StateMachineUpdateRequest};
use tokio::sync::mpsc;
use tracing::error;

use super::{progress_stream_response, RouteState};
use crate::http_objects::{ApiError, DownloadArtifactQuery, RepoJobsQuery, RepoJobsResponse};

const JOBS_PER_PAGE: usize = 20;
const INGEST_CHANNEL_CAPACITY: usize = 64;

/// Fetches a CI job's artifact, unpacks it and registers the contained
/// package, streaming `progress` percentages and one `complete` event. A job
/// that already has a catalog record short-circuits without re-downloading.
pub async fn download_artifact_from_repo(
    Query(query): Query<DownloadArtifactQuery>,
    State(state): State<RouteState>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(existing) = state.state.package_for_job(query.job_id).await {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(ProgressEvent::Complete {
            success: true,
            message: format!(
                "Artifact for job {} already downloaded: {}",
                query.job_id, existing.file_name
            ),
        });
        return Ok(progress_stream_response(rx, state.metrics.clone()));
    }

    state.metrics.artifact_downloads.add(1, &[]);
    let (tx, rx) = mpsc::channel(INGEST_CHANNEL_CAPACITY);
    let job_id = query.job_id;
    let ingest_state = state.clone();
    tokio::spawn(async move {
        let event = match ingest_artifact(&ingest_state, job_id, &tx).await {
            Ok(package) => ProgressEvent::Complete {
                success: true,
                message: format!(
                    "Artifact downloaded successfully. Registered {}",
                    package.file_name
                ),
            },
            Err(err) => {
                error!(job_id, "artifact ingestion failed: {err:?}");
                ProgressEvent::Complete {
                    success: false,
                    message: format!("Download failed: {err}"),
                }
            }
        };
        let _ = tx.send(event).await;
    });

    Ok(progress_stream_response(rx, state.metrics.clone()))
}

async fn ingest_artifact(
    state: &RouteState,
    job_id: u64,
    events: &mpsc::Sender<ProgressEvent>,
) -> anyhow::Result<PackageInfo> {
    let output_dir = state.artifacts.download(job_id, events.clone()).await?;
    let (file_name, folder_path) = state
        .package_store
        .find_installable(&output_dir)
        .await?
        .ok_or_else(|| anyhow!("no installable file in artifact for job {job_id}"))?;

    let outcome = state
        .state
        .write(StateMachineUpdateRequest {
            payload: RequestPayload::RegisterPackage(RegisterPackageRequest {
                file_name,
                folder_path: folder_path.to_string_lossy().to_string(),
                job_id: Some(job_id),
            }),
        })
        .await?;
    outcome
        .registered_package
        .ok_or_else(|| anyhow!("registration produced no record"))
}

pub async fn get_repo_jobs(
    Query(query): Query<RepoJobsQuery>,
    State(state): State<RouteState>,
) -> Result<Json<RepoJobsResponse>, ApiError> {
    let page = query.page.unwrap_or(0);
    let jobs = state
        .artifacts
        .list_jobs(page, JOBS_PER_PAGE)
        .await
        .map_err(|err| ApiError::internal_error(anyhow!(err)))?;
    Ok(Json(RepoJobsResponse { jobs }))
}
