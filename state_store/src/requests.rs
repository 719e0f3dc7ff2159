use data_model::UnitStatus;

pub struct StateMachineUpdateRequest {
    pub payload: RequestPayload,
}

#[derive(Debug, Clone, strum::Display)]
pub enum RequestPayload {
    RegisterPackage(RegisterPackageRequest),
    RecordHash(RecordHashRequest),
    SetUnitStatus(SetUnitStatusRequest),
}

#[derive(Debug, Clone)]
pub struct RegisterPackageRequest {
    pub file_name: String,
    pub folder_path: String,
    pub job_id: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RecordHashRequest {
    pub sha256_hash: String,
}

#[derive(Debug, Clone)]
pub struct SetUnitStatusRequest {
    pub ip: String,
    pub status: UnitStatus,
}
