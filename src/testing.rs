use anyhow::Result;
use data_model::PackageInfo;
use state_store::requests::{RegisterPackageRequest, RequestPayload, StateMachineUpdateRequest};
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{config::ServerConfig, routes::RouteState, service::Service};

pub const TEST_UNIT: &str = "10.0.0.5";

pub struct TestService {
    pub service: Service,
    _temp_dir: tempfile::TempDir,
}

impl TestService {
    pub async fn new() -> Result<Self> {
        Self::with_installer("echo '[Connecting]'; echo '[Transferring]'; echo '[Installing]'")
            .await
    }

    /// Builds a service whose installer is `sh -c <script>`, so tests can
    /// script arbitrary installer behavior per run.
    pub async fn with_installer(script: &str) -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let temp_dir = tempfile::tempdir()?;
        let config = ServerConfig {
            upload_dir: temp_dir.path().join("upload").to_string_lossy().to_string(),
            artifact_dir: temp_dir
                .path()
                .join("uploadFromRepo")
                .to_string_lossy()
                .to_string(),
            scratch_dir: temp_dir
                .path()
                .join("gitArtifact")
                .to_string_lossy()
                .to_string(),
            units: vec![TEST_UNIT.to_string()],
            installer_command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            ..Default::default()
        };
        let service = Service::new(config).await?;

        Ok(Self {
            service,
            _temp_dir: temp_dir,
        })
    }

    pub fn route_state(&self) -> RouteState {
        RouteState {
            state: self.service.state.clone(),
            package_store: self.service.package_store.clone(),
            supervisor: self.service.supervisor.clone(),
            artifacts: self.service.artifacts.clone(),
            metrics: self.service.metrics.clone(),
        }
    }

    /// Puts a package file on disk and registers it, the way a finished
    /// upload or artifact unpack would.
    pub async fn seed_package(
        &self,
        file_name: &str,
        job_id: Option<u64>,
    ) -> Result<PackageInfo> {
        let folder = match job_id {
            Some(id) => self.service.package_store.artifact_dir().join(id.to_string()),
            None => self.service.package_store.upload_dir().to_path_buf(),
        };
        tokio::fs::create_dir_all(&folder).await?;
        tokio::fs::write(folder.join(file_name), b"package bytes").await?;

        let outcome = self
            .service
            .state
            .write(StateMachineUpdateRequest {
                payload: RequestPayload::RegisterPackage(RegisterPackageRequest {
                    file_name: file_name.to_string(),
                    folder_path: folder.to_string_lossy().to_string(),
                    job_id,
                }),
            })
            .await?;
        outcome
            .registered_package
            .ok_or_else(|| anyhow::anyhow!("registration produced no record"))
    }
}
