use std::collections::HashMap;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use data_model::{CiJob, PackageInfo, UnitInfo};
use serde::{Deserialize, Serialize};
use supervisor::SupervisorError;
use tracing::error;

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(skip)]
    status_code: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: &str) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn internal_error(e: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string().as_str())
    }

    pub fn internal_error_str(e: &str) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!("API Error: {} - {}", self.status_code, self.message);
        (
            self.status_code,
            axum::Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorBody {
    error: String,
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        match &err {
            SupervisorError::AlreadyInstalling(_) | SupervisorError::NotCancellable(_) => {
                ApiError::conflict(&err.to_string())
            }
            SupervisorError::NotInstallable(_) => ApiError::bad_request(&err.to_string()),
            SupervisorError::UnknownUnit(_) => ApiError::not_found(&err.to_string()),
            SupervisorError::Spawn(_) => ApiError::internal_error_str(&err.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CheckFileExistRequest {
    pub hash: String,
}

#[derive(Debug, Serialize)]
pub struct FileExistenceResponse {
    pub exists: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub success: bool,
    pub message: String,
    pub file_info: PackageInfo,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallFilesResponse {
    pub file_infos: Vec<PackageInfo>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UtInfosResponse {
    pub ut_infos_by_ip: HashMap<String, UnitInfo>,
}

#[derive(Debug, Serialize)]
pub struct CancelTransferResponse {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct RepoJobsResponse {
    pub jobs: Vec<CiJob>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallQuery {
    pub ut_ip: String,
    pub install_file_id: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelQuery {
    pub ut_ip: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadArtifactQuery {
    pub job_id: u64,
}

#[derive(Debug, Deserialize)]
pub struct RepoJobsQuery {
    pub page: Option<usize>,
}
