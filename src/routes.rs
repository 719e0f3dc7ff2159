use std::{sync::Arc, time::Duration};

use anyhow::anyhow;
use axum::{
    extract::{DefaultBodyLimit, MatchedPath, Multipart, Request, State},
    http::Method,
    response::{
        sse::{Event, KeepAlive},
        IntoResponse,
        Response,
    },
    routing::{get, post},
    Json,
    Router,
};
use data_model::{version::is_installable, ProgressEvent};
use futures::StreamExt;
use gitlab_artifacts::ArtifactDownloader;
use installer_utils::GuardStreamExt;
use metrics::api_io_stats;
use once_cell::sync::Lazy;
use package_store::PackageStore;
use regex::Regex;
use state_store::{
    requests::{RecordHashRequest, RegisterPackageRequest, RequestPayload, StateMachineUpdateRequest},
    InstallerState,
    StateStoreError,
};
use supervisor::InstallSupervisor;
use tokio::sync::mpsc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub(crate) mod artifacts;
pub(crate) mod install;

use artifacts::{download_artifact_from_repo, get_repo_jobs};
use install::{cancel_transfer, install_file};

use crate::http_objects::{
    ApiError,
    CheckFileExistRequest,
    FileExistenceResponse,
    InstallFilesResponse,
    UploadResponse,
    UtInfosResponse,
};

static SHA256_HEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^[a-f0-9]{64}$").expect("hash regex is valid"));

#[derive(Clone)]
pub struct RouteState {
    pub state: Arc<InstallerState>,
    pub package_store: PackageStore,
    pub supervisor: Arc<InstallSupervisor>,
    pub artifacts: Arc<ArtifactDownloader>,
    pub metrics: Arc<api_io_stats::Metrics>,
}

pub fn create_routes(route_state: RouteState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_origin(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index))
        .route(
            "/checkFileExist",
            post(check_file_exists).with_state(route_state.clone()),
        )
        .route(
            "/uploadFile",
            post(upload_file).with_state(route_state.clone()),
        )
        .route(
            "/getExistingFileInfos",
            get(get_file_infos).with_state(route_state.clone()),
        )
        .route(
            "/getUtInfos",
            get(get_ut_infos).with_state(route_state.clone()),
        )
        .route(
            "/installFile",
            get(install_file).with_state(route_state.clone()),
        )
        .route(
            "/cancelTransfer",
            get(cancel_transfer).with_state(route_state.clone()),
        )
        .route(
            "/downloadArtifactFromRepo",
            get(download_artifact_from_repo).with_state(route_state.clone()),
        )
        .route(
            "/getRepoJobs",
            get(get_repo_jobs).with_state(route_state.clone()),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    let method = req.method();
                    let uri = req.uri();

                    let matched_path = req
                        .extensions()
                        .get::<MatchedPath>()
                        .map(|matched_path| matched_path.as_str());

                    tracing::debug_span!("request", %method, %uri, matched_path)
                })
                .on_failure(()),
        )
        .layer(cors)
        .layer(DefaultBodyLimit::max(usize::MAX))
}

async fn index() -> &'static str {
    "Software Install Server"
}

pub(crate) async fn check_file_exists(
    State(state): State<RouteState>,
    Json(request): Json<CheckFileExistRequest>,
) -> Result<Json<FileExistenceResponse>, ApiError> {
    if !SHA256_HEX.is_match(&request.hash) {
        return Err(ApiError::bad_request("Invalid hash format"));
    }
    let exists = state.state.has_hash(&request.hash.to_lowercase()).await;
    Ok(Json(FileExistenceResponse { exists }))
}

async fn upload_file(
    State(state): State<RouteState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(&err.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field
            .file_name()
            .ok_or_else(|| ApiError::bad_request("uploaded file has no name"))?
            .to_string();
        if !is_installable(&file_name) {
            return Err(ApiError::bad_request("File is not ok to install"));
        }

        let stream = field.map(|res| res.map_err(|err| anyhow!(err)));
        let put_result = state
            .package_store
            .put(&file_name, stream)
            .await
            .map_err(|err| ApiError::internal_error(anyhow!("failed to store upload: {err}")))?;
        state.metrics.uploads.add(1, &[]);
        state.metrics.upload_bytes.add(put_result.size_bytes, &[]);

        state
            .state
            .write(StateMachineUpdateRequest {
                payload: RequestPayload::RecordHash(RecordHashRequest {
                    sha256_hash: put_result.sha256_hash.clone(),
                }),
            })
            .await
            .map_err(|err| ApiError::internal_error(anyhow!(err)))?;

        let outcome = state
            .state
            .write(StateMachineUpdateRequest {
                payload: RequestPayload::RegisterPackage(RegisterPackageRequest {
                    file_name,
                    folder_path: state.package_store.upload_dir().to_string_lossy().to_string(),
                    job_id: None,
                }),
            })
            .await
            .map_err(|err| match err {
                StateStoreError::NotInstallable(_) => {
                    ApiError::bad_request("File is not ok to install")
                }
                other => ApiError::internal_error(anyhow!(other)),
            })?;
        let file_info = outcome
            .registered_package
            .ok_or_else(|| ApiError::internal_error_str("registration produced no record"))?;

        return Ok(Json(UploadResponse {
            success: true,
            message: format!(
                "File uploaded successfully: {}",
                put_result.path.display()
            ),
            file_info,
        }));
    }

    Err(ApiError::bad_request("multipart field 'file' is required"))
}

async fn get_file_infos(
    State(state): State<RouteState>,
) -> Result<Json<InstallFilesResponse>, ApiError> {
    let file_infos = state.state.list_packages().await;
    Ok(Json(InstallFilesResponse { file_infos }))
}

async fn get_ut_infos(State(state): State<RouteState>) -> Result<Json<UtInfosResponse>, ApiError> {
    let ut_infos_by_ip = state.state.list_units().await;
    Ok(Json(UtInfosResponse { ut_infos_by_ip }))
}

/// Bridges a per-run progress feed onto one SSE response: log lines as
/// unnamed events, download percentages as `progress`, and the single
/// terminal message as `complete`, after which the connection closes.
pub(crate) fn progress_stream_response(
    mut rx: mpsc::Receiver<ProgressEvent>,
    metrics: Arc<api_io_stats::Metrics>,
) -> Response {
    metrics.event_streams_active.add(1, &[]);
    let events = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            let terminal = event.is_terminal();
            yield event_to_sse(event);
            if terminal {
                return;
            }
        }
    };
    let stream = events.guard(move || metrics.event_streams_active.add(-1, &[]));

    axum::response::Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(1))
                .text("keep-alive-text"),
        )
        .into_response()
}

fn event_to_sse(event: ProgressEvent) -> Result<Event, axum::Error> {
    match event {
        ProgressEvent::Log(line) => Event::default().json_data(line),
        ProgressEvent::Progress(percent) => Event::default().event("progress").json_data(percent),
        ProgressEvent::Complete { message, .. } => {
            Event::default().event("complete").json_data(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_validation_accepts_only_64_hex_chars() {
        let valid = "a".repeat(64);
        assert!(SHA256_HEX.is_match(&valid));
        assert!(SHA256_HEX.is_match(&"A1B2C3D4".repeat(8)));
        assert!(!SHA256_HEX.is_match(&"a".repeat(63)));
        assert!(!SHA256_HEX.is_match(&"a".repeat(65)));
        assert!(!SHA256_HEX.is_match(&"g".repeat(64)));
        assert!(!SHA256_HEX.is_match(""));
    }
}
