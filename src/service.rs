use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use axum_server::Handle;
use gitlab_artifacts::ArtifactDownloader;
use metrics::api_io_stats;
use package_store::PackageStore;
use state_store::{
    requests::{RecordHashRequest, RegisterPackageRequest, RequestPayload, StateMachineUpdateRequest},
    InstallerState,
};
use supervisor::InstallSupervisor;
use tokio::{signal, sync::watch};
use tracing::{info, warn};

use crate::{
    config::ServerConfig,
    routes::{create_routes, RouteState},
};

#[derive(Clone)]
pub struct Service {
    pub config: ServerConfig,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub state: Arc<InstallerState>,
    pub package_store: PackageStore,
    pub supervisor: Arc<InstallSupervisor>,
    pub artifacts: Arc<ArtifactDownloader>,
    pub metrics: Arc<api_io_stats::Metrics>,
}

impl Service {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(());

        let state = InstallerState::new(&config.units);
        let package_store = PackageStore::new(
            PathBuf::from(&config.upload_dir),
            PathBuf::from(&config.artifact_dir),
        )
        .await
        .context("error initializing package store")?;
        let metrics = Arc::new(api_io_stats::Metrics::new());
        let supervisor = InstallSupervisor::new(
            state.clone(),
            config.installer_command.clone(),
            metrics.clone(),
        );
        let artifacts = Arc::new(
            ArtifactDownloader::new(
                config.gitlab.clone(),
                PathBuf::from(&config.artifact_dir),
                PathBuf::from(&config.scratch_dir),
            )
            .context("error initializing artifact downloader")?,
        );

        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            state,
            package_store,
            supervisor,
            artifacts,
            metrics,
        })
    }

    pub async fn start(&self) -> Result<()> {
        self.reload_storage().await?;

        let route_state = RouteState {
            state: self.state.clone(),
            package_store: self.package_store.clone(),
            supervisor: self.supervisor.clone(),
            artifacts: self.artifacts.clone(),
            metrics: self.metrics.clone(),
        };

        let handle = Handle::new();
        let handle_sh = handle.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh, shutdown_tx).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!("server api listening on {}", self.config.listen_addr);
        let routes = create_routes(route_state);
        axum_server::bind(addr)
            .handle(handle)
            .serve(routes.into_make_service())
            .await?;

        Ok(())
    }

    /// Rebuilds the in-memory registries from what is already on disk: every
    /// eligible direct upload is re-hashed into the known-hash set and
    /// registered, and every unpacked artifact directory is registered under
    /// its job id.
    async fn reload_storage(&self) -> Result<()> {
        for upload in self.package_store.scan_upload_dir().await? {
            self.state
                .write(StateMachineUpdateRequest {
                    payload: RequestPayload::RecordHash(RecordHashRequest {
                        sha256_hash: upload.sha256_hash,
                    }),
                })
                .await?;
            if let Err(err) = self
                .state
                .write(StateMachineUpdateRequest {
                    payload: RequestPayload::RegisterPackage(RegisterPackageRequest {
                        file_name: upload.file_name.clone(),
                        folder_path: self
                            .package_store
                            .upload_dir()
                            .to_string_lossy()
                            .to_string(),
                        job_id: None,
                    }),
                })
                .await
            {
                warn!(file_name = upload.file_name, "skipping upload: {err}");
            }
        }

        for artifact in self.package_store.scan_artifact_dir().await? {
            if let Err(err) = self
                .state
                .write(StateMachineUpdateRequest {
                    payload: RequestPayload::RegisterPackage(RegisterPackageRequest {
                        file_name: artifact.file_name.clone(),
                        folder_path: artifact.folder_path.to_string_lossy().to_string(),
                        job_id: Some(artifact.job_id),
                    }),
                })
                .await
            {
                warn!(job_id = artifact.job_id, "skipping artifact: {err}");
            }
        }

        info!(
            "storage reload complete: {} packages in catalog",
            self.state.list_packages().await.len()
        );
        Ok(())
    }
}

async fn shutdown_signal(handle: Handle, shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    handle.shutdown();
    let _ = shutdown_tx.send(());
    info!("signal received, shutting down server gracefully");
}
