use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering as AtomicOrdering},
        Arc,
    },
};

use data_model::{
    version::{compare_versions, extract_version, is_installable},
    PackageInfo,
    UnitInfo,
    UnitStatus,
};
use install_events::{InstallStateChangeEvent, UnitStatusChanged};
use metrics::{state_store_stats::StateStoreMetrics, Timer};
use opentelemetry::KeyValue;
use requests::{RequestPayload, StateMachineUpdateRequest};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

pub mod install_events;
pub mod requests;

const INSTALL_EVENT_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error("unknown unit: {0}")]
    UnknownUnit(String),
    #[error("file is not ok to install: {0}")]
    NotInstallable(String),
}

/// Result of applying a [`StateMachineUpdateRequest`]; only package
/// registration produces a value the caller needs back.
#[derive(Debug, Default)]
pub struct WriteOutcome {
    pub registered_package: Option<PackageInfo>,
}

/// All mutable orchestration state: the package catalog, the known-hash set
/// fed by direct uploads, and the per-unit status map. Every mutation funnels
/// through [`InstallerState::write`] and completes while holding exactly one
/// lock, so readers always observe a consistent snapshot.
pub struct InstallerState {
    packages: RwLock<Vec<PackageInfo>>,
    next_package_id: AtomicU64,
    known_hashes: RwLock<HashSet<String>>,
    units: RwLock<HashMap<String, UnitInfo>>,
    install_event_tx: broadcast::Sender<InstallStateChangeEvent>,
    metrics: StateStoreMetrics,
}

impl InstallerState {
    pub fn new(unit_ips: &[String]) -> Arc<Self> {
        let units = unit_ips
            .iter()
            .map(|ip| (ip.clone(), UnitInfo::new(ip.clone())))
            .collect::<HashMap<_, _>>();
        let (install_event_tx, _) = broadcast::channel(INSTALL_EVENT_CHANNEL_CAPACITY);
        info!("initialized state store with {} units", units.len());
        Arc::new(Self {
            packages: RwLock::new(Vec::new()),
            next_package_id: AtomicU64::new(1),
            known_hashes: RwLock::new(HashSet::new()),
            units: RwLock::new(units),
            install_event_tx,
            metrics: StateStoreMetrics::new(),
        })
    }

    pub async fn write(
        &self,
        request: StateMachineUpdateRequest,
    ) -> Result<WriteOutcome, StateStoreError> {
        let timer_kv = &[KeyValue::new("request", request.payload.to_string())];
        let _timer = Timer::start(&self.metrics.state_write, timer_kv);
        match request.payload {
            RequestPayload::RegisterPackage(req) => {
                let package = self
                    .register_package(req.file_name, req.folder_path, req.job_id)
                    .await?;
                Ok(WriteOutcome {
                    registered_package: Some(package),
                })
            }
            RequestPayload::RecordHash(req) => {
                self.known_hashes.write().await.insert(req.sha256_hash);
                Ok(WriteOutcome::default())
            }
            RequestPayload::SetUnitStatus(req) => {
                self.set_unit_status(&req.ip, req.status).await?;
                Ok(WriteOutcome::default())
            }
        }
    }

    async fn register_package(
        &self,
        file_name: String,
        folder_path: String,
        job_id: Option<u64>,
    ) -> Result<PackageInfo, StateStoreError> {
        if !is_installable(&file_name) {
            return Err(StateStoreError::NotInstallable(file_name));
        }

        let version = extract_version(&file_name);
        let package = PackageInfo {
            id: self.next_package_id.fetch_add(1, AtomicOrdering::Relaxed),
            job_id,
            file_name,
            folder_path,
            version,
            is_latest_version: false,
        };

        let mut packages = self.packages.write().await;
        packages.push(package.clone());
        // Highest version first; the whole catalog is re-ranked on every
        // insertion, which is fine at catalog sizes of tens of packages.
        packages.sort_by(|a, b| compare_versions(&b.version, &a.version));
        for (index, info) in packages.iter_mut().enumerate() {
            info.is_latest_version = index == 0;
        }
        let registered = packages
            .iter()
            .find(|info| info.id == package.id)
            .cloned()
            .expect("package was just inserted");
        debug!(
            package_id = registered.id,
            version = %registered.version,
            "registered package"
        );
        Ok(registered)
    }

    async fn set_unit_status(&self, ip: &str, status: UnitStatus) -> Result<(), StateStoreError> {
        let mut units = self.units.write().await;
        let unit = units
            .get_mut(ip)
            .ok_or_else(|| StateStoreError::UnknownUnit(ip.to_string()))?;
        if unit.status == status {
            return Ok(());
        }
        debug!(unit_ip = ip, status = %status, "unit status changed");
        unit.status = status;
        let _ = self
            .install_event_tx
            .send(InstallStateChangeEvent::UnitStatusChanged(
                UnitStatusChanged {
                    ip: ip.to_string(),
                    status,
                },
            ));
        Ok(())
    }

    pub async fn list_packages(&self) -> Vec<PackageInfo> {
        self.packages.read().await.clone()
    }

    pub async fn get_package(&self, id: u64) -> Option<PackageInfo> {
        self.packages
            .read()
            .await
            .iter()
            .find(|info| info.id == id)
            .cloned()
    }

    pub async fn package_for_job(&self, job_id: u64) -> Option<PackageInfo> {
        self.packages
            .read()
            .await
            .iter()
            .find(|info| info.job_id == Some(job_id))
            .cloned()
    }

    pub async fn has_hash(&self, sha256_hash: &str) -> bool {
        self.known_hashes.read().await.contains(sha256_hash)
    }

    pub async fn unit_status(&self, ip: &str) -> Result<UnitStatus, StateStoreError> {
        self.units
            .read()
            .await
            .get(ip)
            .map(|unit| unit.status)
            .ok_or_else(|| StateStoreError::UnknownUnit(ip.to_string()))
    }

    pub async fn list_units(&self) -> HashMap<String, UnitInfo> {
        self.units.read().await.clone()
    }

    pub fn install_event_stream(&self) -> broadcast::Receiver<InstallStateChangeEvent> {
        self.install_event_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requests::{RegisterPackageRequest, RecordHashRequest, SetUnitStatusRequest};

    fn test_state() -> Arc<InstallerState> {
        InstallerState::new(&["10.0.0.5".to_string(), "10.0.0.6".to_string()])
    }

    async fn register(
        state: &InstallerState,
        file_name: &str,
        job_id: Option<u64>,
    ) -> Result<PackageInfo, StateStoreError> {
        let outcome = state
            .write(StateMachineUpdateRequest {
                payload: RequestPayload::RegisterPackage(RegisterPackageRequest {
                    file_name: file_name.to_string(),
                    folder_path: "/srv/upload".to_string(),
                    job_id,
                }),
            })
            .await?;
        Ok(outcome.registered_package.expect("registration outcome"))
    }

    #[tokio::test]
    async fn register_assigns_increasing_ids_and_latest_flag() {
        let state = test_state();
        let first = register(&state, "pkg-release-master-1.0.0.0.iesa", None)
            .await
            .unwrap();
        assert_eq!(first.version, "1.0.0.0");
        assert!(first.is_latest_version);

        let second = register(&state, "pkg-release-master-0.9.0.0.iesa", None)
            .await
            .unwrap();
        assert!(second.id > first.id);
        assert!(!second.is_latest_version);

        let packages = state.list_packages().await;
        let latest: Vec<_> = packages.iter().filter(|p| p.is_latest_version).collect();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].version, "1.0.0.0");
    }

    #[tokio::test]
    async fn exactly_one_latest_after_many_inserts() {
        let state = test_state();
        for name in [
            "pkg-release-master-0.1.0.0.iesa",
            "pkg-release-master-2.0.0.0.iesa",
            "pkg-release-master-1.5.0.0.iesa",
            "unversioned.iesa",
            "pkg-release-master-2.0.0.1.iesa",
        ] {
            register(&state, name, None).await.unwrap();
        }
        let packages = state.list_packages().await;
        assert_eq!(packages.len(), 5);
        let latest: Vec<_> = packages.iter().filter(|p| p.is_latest_version).collect();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].version, "2.0.0.1");
        // Catalog is held sorted descending by version.
        assert_eq!(packages[0].version, "2.0.0.1");
    }

    #[tokio::test]
    async fn register_rejects_ineligible_extension() {
        let state = test_state();
        let err = register(&state, "pkg-release-master-1.0.0.0.zip", None)
            .await
            .unwrap_err();
        assert!(matches!(err, StateStoreError::NotInstallable(_)));
        assert!(state.list_packages().await.is_empty());
    }

    #[tokio::test]
    async fn package_lookup_by_id_and_job() {
        let state = test_state();
        let registered = register(&state, "pkg-release-master-1.0.0.0.iesa", Some(42))
            .await
            .unwrap();
        assert_eq!(
            state.get_package(registered.id).await.unwrap().id,
            registered.id
        );
        assert_eq!(
            state.package_for_job(42).await.unwrap().id,
            registered.id
        );
        assert!(state.get_package(9999).await.is_none());
        assert!(state.package_for_job(7).await.is_none());
    }

    #[tokio::test]
    async fn hash_set_round_trip() {
        let state = test_state();
        let hash = "a".repeat(64);
        assert!(!state.has_hash(&hash).await);
        state
            .write(StateMachineUpdateRequest {
                payload: RequestPayload::RecordHash(RecordHashRequest {
                    sha256_hash: hash.clone(),
                }),
            })
            .await
            .unwrap();
        assert!(state.has_hash(&hash).await);
    }

    #[tokio::test]
    async fn unit_status_writes_and_unknown_unit() {
        let state = test_state();
        assert_eq!(
            state.unit_status("10.0.0.5").await.unwrap(),
            UnitStatus::Idle
        );
        state
            .write(StateMachineUpdateRequest {
                payload: RequestPayload::SetUnitStatus(SetUnitStatusRequest {
                    ip: "10.0.0.5".to_string(),
                    status: UnitStatus::Connecting,
                }),
            })
            .await
            .unwrap();
        assert_eq!(
            state.unit_status("10.0.0.5").await.unwrap(),
            UnitStatus::Connecting
        );
        // The other unit is untouched.
        assert_eq!(
            state.unit_status("10.0.0.6").await.unwrap(),
            UnitStatus::Idle
        );

        let err = state
            .write(StateMachineUpdateRequest {
                payload: RequestPayload::SetUnitStatus(SetUnitStatusRequest {
                    ip: "192.0.2.1".to_string(),
                    status: UnitStatus::Connecting,
                }),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StateStoreError::UnknownUnit(_)));
    }

    #[tokio::test]
    async fn status_broadcast_skips_no_op_writes() {
        let state = test_state();
        let mut rx = state.install_event_stream();
        for status in [
            UnitStatus::Connecting,
            UnitStatus::Connecting, // marker repeat, must not re-broadcast
            UnitStatus::Transferring,
        ] {
            state
                .write(StateMachineUpdateRequest {
                    payload: RequestPayload::SetUnitStatus(SetUnitStatusRequest {
                        ip: "10.0.0.5".to_string(),
                        status,
                    }),
                })
                .await
                .unwrap();
        }

        let first = rx.try_recv().unwrap();
        assert_eq!(
            first,
            InstallStateChangeEvent::UnitStatusChanged(UnitStatusChanged {
                ip: "10.0.0.5".to_string(),
                status: UnitStatus::Connecting,
            })
        );
        let second = rx.try_recv().unwrap();
        assert_eq!(
            second,
            InstallStateChangeEvent::UnitStatusChanged(UnitStatusChanged {
                ip: "10.0.0.5".to_string(),
                status: UnitStatus::Transferring,
            })
        );
        assert!(rx.try_recv().is_err());
    }
}
