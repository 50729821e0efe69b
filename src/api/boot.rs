// Boot-mode service
//
// Everything a client of the boot-mode device can ask for: status polling, the two
// long-running jobs (initial provisioning and app download), credential/keystore
// uploads and the final switch into core mode.
//
// Long-running jobs follow the same shape: claim the guard slot synchronously, move the
// ticket into a spawned task, return the join handle. Progress goes out on the bus.

use std::sync::Arc;

use log::{info, warn};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::artifact::{ArtifactFetcher, HttpTransport, ReqwestTransport};
use crate::config::BootConfig;
use crate::error::InstallError;
use crate::installation::markers;
use crate::installation::provisioning::ProvisioningPipeline;
use crate::installation::service::switch_to_core_mode;
use crate::installation::{CommandRunner, ShellCommandRunner};
use crate::models::requests::{KeystoreRequest, UserPasswordRequest};
use crate::models::responses::{DeviceStatus, DownloadOutcome, ProvisionOutcome};
use crate::models::state::InstallGuard;
use crate::progress::{JobKind, ProgressBus, ProgressEvent};
use crate::utils::path_resolver::MarkerPaths;

pub type JobHandle<T> = JoinHandle<Result<T, InstallError>>;

/// Shared handle; clones talk to the same guard, bus and host.
#[derive(Clone)]
pub struct BootService {
    inner: Arc<Inner>,
}

struct Inner {
    config: BootConfig,
    paths: MarkerPaths,
    guard: InstallGuard,
    bus: ProgressBus,
    runner: Arc<dyn CommandRunner>,
    fetcher: ArtifactFetcher,
    pipeline: ProvisioningPipeline,
}

impl BootService {
    pub fn new(
        config: BootConfig,
        runner: Arc<dyn CommandRunner>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        let paths = MarkerPaths::new(
            &config.root_dir,
            &config.registry.target_file,
            &config.registry.temp_file,
        );
        let fetcher = ArtifactFetcher::new(transport, config.registry.clone(), paths.clone());
        let pipeline = ProvisioningPipeline::new(Arc::clone(&runner), config.provisioning.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                paths,
                guard: InstallGuard::new(),
                bus: ProgressBus::default(),
                runner,
                fetcher,
                pipeline,
            }),
        }
    }

    /// Production wiring: `sh` on the local host and the registry over HTTPS.
    pub fn from_config(config: BootConfig) -> Result<Self, InstallError> {
        let transport = ReqwestTransport::new(
            config.registry.metadata_timeout(),
            config.registry.download_timeout(),
        )?;
        Ok(Self::new(
            config,
            Arc::new(ShellCommandRunner::new()),
            Arc::new(transport),
        ))
    }

    pub fn config(&self) -> &BootConfig {
        &self.inner.config
    }

    pub fn paths(&self) -> &MarkerPaths {
        &self.inner.paths
    }

    pub fn guard(&self) -> &InstallGuard {
        &self.inner.guard
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.inner.bus.subscribe()
    }

    /// Whether the host has already been provisioned (no cached flag; probes every time).
    pub async fn has_init_setup_completed(&self) -> bool {
        self.inner.pipeline.is_setup_done().await
    }

    pub async fn status(&self) -> DeviceStatus {
        let paths = &self.inner.paths;
        let guard = &self.inner.guard;
        let keystore_timestamp = markers::keystore_timestamp(paths).await;
        DeviceStatus {
            boot_only: true,
            has_artifact: markers::exists(&paths.target_artifact()).await,
            installing_app: guard.is_in_progress(JobKind::Download),
            init_installing: guard.is_in_progress(JobKind::Init),
            has_keystore: keystore_timestamp.is_some(),
            keystore_timestamp,
            has_init_setup_done: self.has_init_setup_completed().await,
            has_user_password: markers::exists(&paths.user_password()).await,
        }
    }

    /// Start initial provisioning in the background.
    ///
    /// Fails immediately with `AlreadyInProgress` if a provisioning run holds the slot.
    pub fn start_provisioning(&self) -> Result<JobHandle<ProvisionOutcome>, InstallError> {
        let ticket = self.inner.guard.try_enter(JobKind::Init)?;
        info!("[PHASE: provisioning] [STEP: trigger] Initial setup requested");
        let inner = Arc::clone(&self.inner);
        Ok(tokio::spawn(async move {
            let _ticket = ticket;
            inner.pipeline.run(&inner.bus).await
        }))
    }

    /// Start the app download in the background. Independent of provisioning.
    pub fn start_download(&self) -> Result<JobHandle<DownloadOutcome>, InstallError> {
        let ticket = self.inner.guard.try_enter(JobKind::Download)?;
        info!("[PHASE: download] [STEP: trigger] App download requested");
        let inner = Arc::clone(&self.inner);
        Ok(tokio::spawn(async move {
            let _ticket = ticket;
            inner.fetcher.download_and_install(&inner.bus).await
        }))
    }

    pub async fn set_user_password(&self, request: &UserPasswordRequest) -> Result<(), InstallError> {
        markers::save_user_password(&self.inner.paths, request).await
    }

    pub async fn set_keystore(&self, request: &KeystoreRequest) -> Result<(), InstallError> {
        markers::save_keystore(&self.inner.paths, request).await
    }

    /// Rewrite the service unit into core mode and reboot.
    ///
    /// Refused while either job runs. Both slots are held until the reboot command has
    /// been issued, then released.
    pub async fn finish_configuration(&self) -> Result<(), InstallError> {
        if let Some(busy) = self.inner.guard.any_in_progress() {
            warn!(
                "[PHASE: finish] [STEP: check] Refusing core-mode switch ({} in progress)",
                busy.describe()
            );
            return Err(InstallError::AlreadyInProgress(busy));
        }
        let _init = self.inner.guard.try_enter(JobKind::Init)?;
        let _download = self.inner.guard.try_enter(JobKind::Download)?;

        if !markers::exists(&self.inner.paths.target_artifact()).await {
            warn!(
                "[PHASE: finish] [STEP: check] Switching to core mode without a downloaded artifact"
            );
        }
        switch_to_core_mode(
            self.inner.runner.as_ref(),
            &self.inner.config.service.unit_path,
            &self.inner.config.provisioning.database_service,
        )
        .await
    }
}
