use data_model::UnitStatus;
use serde::{Deserialize, Serialize};

/// Broadcast to every observer when a unit's lifecycle state moves. The
/// store only emits this for actual changes, so subscribers see the clean
/// transition sequence of a run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum InstallStateChangeEvent {
    UnitStatusChanged(UnitStatusChanged),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UnitStatusChanged {
    pub ip: String,
    pub status: UnitStatus,
}

impl InstallStateChangeEvent {
    pub fn unit_ip(&self) -> &str {
        match self {
            InstallStateChangeEvent::UnitStatusChanged(UnitStatusChanged { ip, .. }) => ip,
        }
    }
}
