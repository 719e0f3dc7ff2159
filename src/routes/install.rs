use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};

use super::{progress_stream_response, RouteState};
use crate::http_objects::{ApiError, CancelQuery, CancelTransferResponse, InstallQuery};

/// Starts an install run and streams its progress. The response stays open
/// until the installer reports its terminal outcome; dropping the connection
/// does not stop the run.
pub async fn install_file(
    Query(query): Query<InstallQuery>,
    State(state): State<RouteState>,
) -> Result<impl IntoResponse, ApiError> {
    let package = state
        .state
        .get_package(query.install_file_id)
        .await
        .ok_or_else(|| ApiError::not_found("No file info"))?;

    let rx = state
        .supervisor
        .start_install(&query.ut_ip, &package)
        .await?;
    Ok(progress_stream_response(rx, state.metrics.clone()))
}

pub async fn cancel_transfer(
    Query(query): Query<CancelQuery>,
    State(state): State<RouteState>,
) -> Result<Json<CancelTransferResponse>, ApiError> {
    state.supervisor.cancel_install(&query.ut_ip).await?;
    Ok(Json(CancelTransferResponse {
        message: "Cancel transfer success!".to_string(),
    }))
}
