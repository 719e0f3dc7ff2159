pub mod version;

use serde::{Deserialize, Serialize};
use strum::Display;

/// Catalog record for one installable package, either uploaded directly by an
/// operator or unpacked from a CI artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PackageInfo {
    pub id: u64,
    /// CI job that produced the package; `None` for direct uploads.
    pub job_id: Option<u64>,
    pub file_name: String,
    pub folder_path: String,
    pub version: String,
    pub is_latest_version: bool,
}

impl PackageInfo {
    /// Absolute location handed to the installer subprocess.
    pub fn file_path(&self) -> String {
        format!(
            "{}/{}",
            self.folder_path.trim_end_matches('/'),
            self.file_name
        )
    }
}

/// Installation lifecycle of one unit. `Idle` is both the initial and the
/// steady terminal state; `Error` sticks until the next install attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
pub enum UnitStatus {
    Idle,
    Connecting,
    Transferring,
    Installing,
    Error,
}

impl UnitStatus {
    /// Cancellation is only allowed before the installer reaches the
    /// irreversible `Installing` phase.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, UnitStatus::Connecting | UnitStatus::Transferring)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UnitInfo {
    pub ip: String,
    pub status: UnitStatus,
}

impl UnitInfo {
    pub fn new(ip: String) -> Self {
        Self {
            ip,
            status: UnitStatus::Idle,
        }
    }
}

/// The subset of the CI job object the server actually consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiJob {
    pub id: u64,
    pub name: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub status: String,
    pub created_at: String,
}

/// One message on a per-run progress feed, bridged onto an SSE response by
/// the HTTP layer. Exactly one `Complete` closes every feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Free-form installer output, forwarded verbatim.
    Log(String),
    /// Download percentage, already formatted to three decimals.
    Progress(String),
    /// Terminal outcome of the run.
    Complete { success: bool, message: String },
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Complete { .. })
    }
}
