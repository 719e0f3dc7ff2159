use std::{
    process::Stdio,
    sync::{Arc, Mutex},
    time::Instant,
};

use dashmap::{mapref::entry::Entry, DashMap};
use data_model::{version::is_installable, PackageInfo, ProgressEvent, UnitStatus};
use installer_utils::format_elapsed;
use metrics::api_io_stats;
use state_store::{
    requests::{RequestPayload, SetUnitStatusRequest, StateMachineUpdateRequest},
    InstallerState,
    StateStoreError,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Phase markers the installer prints on stdout. A matching line drives the
/// unit state machine instead of being forwarded to the progress stream.
pub const MARKER_CONNECTING: &str = "[Connecting]";
pub const MARKER_TRANSFERRING: &str = "[Transferring]";
pub const MARKER_INSTALLING: &str = "[Installing]";

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("an install is already running for unit {0}")]
    AlreadyInstalling(String),
    #[error("file is not ok to install: {0}")]
    NotInstallable(String),
    #[error("unknown unit: {0}")]
    UnknownUnit(String),
    #[error("cannot cancel transfer for unit {0}")]
    NotCancellable(String),
    #[error("failed to spawn installer: {0}")]
    Spawn(std::io::Error),
}

impl From<StateStoreError> for SupervisorError {
    fn from(err: StateStoreError) -> Self {
        match err {
            StateStoreError::UnknownUnit(ip) => SupervisorError::UnknownUnit(ip),
            StateStoreError::NotInstallable(name) => SupervisorError::NotInstallable(name),
        }
    }
}

struct InstallHandle {
    cancel: CancellationToken,
}

/// Owns the live installer subprocesses, at most one per unit. Spawns the
/// external installer, classifies its output into state transitions and log
/// lines, and emits exactly one terminal event per run.
pub struct InstallSupervisor {
    state: Arc<InstallerState>,
    installer_command: Vec<String>,
    processes: Arc<DashMap<String, InstallHandle>>,
    metrics: Arc<api_io_stats::Metrics>,
}

impl InstallSupervisor {
    pub fn new(
        state: Arc<InstallerState>,
        installer_command: Vec<String>,
        metrics: Arc<api_io_stats::Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            installer_command,
            processes: Arc::new(DashMap::new()),
            metrics,
        })
    }

    /// Starts an install run for `unit_ip`. On success the unit is in
    /// `Connecting`, the installer subprocess is running, and the returned
    /// receiver yields its log lines followed by one terminal event.
    pub async fn start_install(
        &self,
        unit_ip: &str,
        package: &PackageInfo,
    ) -> Result<mpsc::Receiver<ProgressEvent>, SupervisorError> {
        if !is_installable(&package.file_name) {
            return Err(SupervisorError::NotInstallable(package.file_name.clone()));
        }
        // Surfaces UnknownUnit before any entry is claimed.
        self.state.unit_status(unit_ip).await?;

        let token = CancellationToken::new();
        match self.processes.entry(unit_ip.to_string()) {
            Entry::Occupied(_) => {
                return Err(SupervisorError::AlreadyInstalling(unit_ip.to_string()));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(InstallHandle {
                    cancel: token.clone(),
                });
            }
        }

        let mut command = Command::new(&self.installer_command[0]);
        command
            .args(&self.installer_command[1..])
            .arg("-path")
            .arg(package.file_path())
            .arg("-ip")
            .arg(unit_ip)
            .arg("-version")
            .arg(&package.version)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                self.processes.remove(unit_ip);
                return Err(SupervisorError::Spawn(err));
            }
        };

        if let Err(err) = self.set_unit_status(unit_ip, UnitStatus::Connecting).await {
            self.processes.remove(unit_ip);
            return Err(err);
        }

        info!(
            unit_ip,
            package_id = package.id,
            version = %package.version,
            "started install"
        );
        self.metrics.installs_started.add(1, &[]);

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(run_install(
            self.state.clone(),
            self.processes.clone(),
            self.metrics.clone(),
            unit_ip.to_string(),
            child,
            token,
            tx,
        ));
        Ok(rx)
    }

    /// Kills a run that has not yet reached the `Installing` phase and parks
    /// the unit back at `Idle`. Fails with `NotCancellable` (and no side
    /// effects) in every other situation.
    pub async fn cancel_install(&self, unit_ip: &str) -> Result<(), SupervisorError> {
        let status = self.state.unit_status(unit_ip).await?;
        if !status.is_cancellable() {
            return Err(SupervisorError::NotCancellable(unit_ip.to_string()));
        }
        // Fire the token before dropping the table entry so the run task can
        // never mistake the kill for a natural exit.
        {
            let Some(handle) = self.processes.get(unit_ip) else {
                return Err(SupervisorError::NotCancellable(unit_ip.to_string()));
            };
            handle.cancel.cancel();
        }
        self.processes.remove(unit_ip);
        self.set_unit_status(unit_ip, UnitStatus::Idle).await?;
        info!(unit_ip, "cancelled install");
        Ok(())
    }

    async fn set_unit_status(&self, ip: &str, status: UnitStatus) -> Result<(), SupervisorError> {
        self.state
            .write(StateMachineUpdateRequest {
                payload: RequestPayload::SetUnitStatus(SetUnitStatusRequest {
                    ip: ip.to_string(),
                    status,
                }),
            })
            .await?;
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_install(
    state: Arc<InstallerState>,
    processes: Arc<DashMap<String, InstallHandle>>,
    metrics: Arc<api_io_stats::Metrics>,
    unit_ip: String,
    mut child: Child,
    token: CancellationToken,
    tx: mpsc::Sender<ProgressEvent>,
) {
    let started = Instant::now();
    let latest_log = Arc::new(Mutex::new(String::new()));

    // stderr never carries phase markers; it only refreshes the latest log
    // line used in the failure message.
    let stderr_task = child.stderr.take().map(|stderr| {
        let latest_log = latest_log.clone();
        let unit_ip = unit_ip.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(unit_ip, line, "installer stderr");
                *latest_log.lock().expect("latest log lock poisoned") = line;
            }
        })
    });

    let mut cancelled = false;
    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    cancelled = true;
                    break;
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        classify_line(&state, &unit_ip, line, &latest_log, &tx).await;
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(unit_ip, "error reading installer output: {err}");
                        break;
                    }
                }
            }
        }
    }

    if cancelled {
        // cancel_install already removed the table entry and parked the unit
        // at Idle; the exit of the killed process must not disturb that.
        if let Err(err) = child.kill().await {
            warn!(unit_ip, "failed to kill installer: {err}");
        }
        let _ = child.wait().await;
        if let Some(task) = stderr_task {
            let _ = task.await;
        }
        metrics.installs_cancelled.add(1, &[]);
        let _ = tx
            .send(ProgressEvent::Complete {
                success: false,
                message: "Install cancelled".to_string(),
            })
            .await;
        return;
    }

    if let Some(task) = stderr_task {
        let _ = task.await;
    }
    let exit = child.wait().await;

    processes.remove(&unit_ip);
    if token.is_cancelled() {
        // Cancellation raced with process exit; the unit is already Idle.
        metrics.installs_cancelled.add(1, &[]);
        let _ = tx
            .send(ProgressEvent::Complete {
                success: false,
                message: "Install cancelled".to_string(),
            })
            .await;
        return;
    }

    let elapsed = format_elapsed(started.elapsed());
    let success = matches!(&exit, Ok(status) if status.success());
    let (final_status, message) = if success {
        (
            UnitStatus::Idle,
            format!("Install Success!. {elapsed}"),
        )
    } else {
        metrics.installs_failed.add(1, &[]);
        let latest = latest_log.lock().expect("latest log lock poisoned").clone();
        (
            UnitStatus::Error,
            format!("Install Failed!. Latest log = {latest}. {elapsed}"),
        )
    };
    info!(unit_ip, success, "installer exited: {message}");

    if let Err(err) = state
        .write(StateMachineUpdateRequest {
            payload: RequestPayload::SetUnitStatus(SetUnitStatusRequest {
                ip: unit_ip.clone(),
                status: final_status,
            }),
        })
        .await
    {
        error!(unit_ip, "failed to finalize unit status: {err}");
    }

    let _ = tx
        .send(ProgressEvent::Complete { success, message })
        .await;
}

async fn classify_line(
    state: &InstallerState,
    unit_ip: &str,
    line: String,
    latest_log: &Mutex<String>,
    tx: &mpsc::Sender<ProgressEvent>,
) {
    let status = if line.starts_with(MARKER_CONNECTING) {
        Some(UnitStatus::Connecting)
    } else if line.starts_with(MARKER_TRANSFERRING) {
        Some(UnitStatus::Transferring)
    } else if line.starts_with(MARKER_INSTALLING) {
        Some(UnitStatus::Installing)
    } else {
        None
    };

    match status {
        Some(status) => {
            if let Err(err) = state
                .write(StateMachineUpdateRequest {
                    payload: RequestPayload::SetUnitStatus(SetUnitStatusRequest {
                        ip: unit_ip.to_string(),
                        status,
                    }),
                })
                .await
            {
                error!(unit_ip, "failed to apply status marker: {err}");
            }
        }
        None => {
            *latest_log.lock().expect("latest log lock poisoned") = line.clone();
            let _ = tx.send(ProgressEvent::Log(line)).await;
        }
    }
}
