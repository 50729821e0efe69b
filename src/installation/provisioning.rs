// Provisioning pipeline ("init" job)
//
// Fixed, linear script run to completion or first failure. No rollback and no retry:
// the precondition probe makes a re-run after success a no-op, and a re-run after
// failure starts over from the first stage.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use uuid::Uuid;

use crate::config::{PackageSpec, ProvisioningConfig};
use crate::error::{root_cause_message, InstallError};
use crate::installation::{postgres, CommandRunner};
use crate::models::responses::ProvisionOutcome;
use crate::progress::{JobKind, ProgressSink, Reporter};
use crate::utils::logging::mask_command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageAction {
    Command { command: String, timeout: Duration },
    InstallPackages(Vec<PackageSpec>),
    ConfigureDatabase,
}

/// One provisioning unit. `percent` is published before the action runs.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub name: &'static str,
    pub percent: f64,
    pub title: String,
    pub action: StageAction,
}

/// The ordered stage list for `cfg`.
pub fn stages(cfg: &ProvisioningConfig) -> Vec<Stage> {
    vec![
        Stage {
            name: "update_os",
            percent: 5.0,
            title: "Update os".to_string(),
            action: StageAction::Command {
                command: "apt-get update".to_string(),
                timeout: Duration::from_secs(cfg.update_timeout_secs),
            },
        },
        Stage {
            name: "full_upgrade",
            percent: 20.0,
            title: "Full upgrade os".to_string(),
            action: StageAction::Command {
                command: "apt-get -y full-upgrade".to_string(),
                timeout: Duration::from_secs(cfg.upgrade_timeout_secs),
            },
        },
        Stage {
            name: "install_tools",
            percent: 30.0,
            title: format!(
                "Install {}",
                cfg.tools
                    .iter()
                    .map(|t| t.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            action: StageAction::InstallPackages(cfg.tools.clone()),
        },
        Stage {
            name: "install_database",
            percent: 40.0,
            title: "Installing Postgresql".to_string(),
            action: StageAction::ConfigureDatabase,
        },
        Stage {
            name: "cleanup",
            percent: 95.0,
            title: "Cleanup".to_string(),
            action: StageAction::Command {
                command: "apt-get clean".to_string(),
                timeout: cfg.default_command_timeout(),
            },
        },
    ]
}

pub struct ProvisioningPipeline {
    runner: Arc<dyn CommandRunner>,
    config: ProvisioningConfig,
}

impl ProvisioningPipeline {
    pub fn new(runner: Arc<dyn CommandRunner>, config: ProvisioningConfig) -> Self {
        Self { runner, config }
    }

    /// Precondition probe; also backs the "init setup done" status flag.
    pub async fn is_setup_done(&self) -> bool {
        self.runner
            .is_package_installed(&self.config.precondition_package)
            .await
    }

    /// Run every stage, publishing `Init` progress to `sink`.
    ///
    /// Always ends with exactly one terminal (100%) event: "Done." or "Error: <cause>".
    pub async fn run(&self, sink: &dyn ProgressSink) -> Result<ProvisionOutcome, InstallError> {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let progress = Reporter::new(JobKind::Init, sink);
        info!(
            "[PHASE: provisioning] [STEP: start] Provisioning run started (run_id={})",
            run_id
        );

        match self.run_stages(&progress).await {
            Ok(outcome) => {
                info!(
                    "[PHASE: provisioning] [STEP: done] Provisioning finished (run_id={}, outcome={:?}, duration_ms={})",
                    run_id,
                    outcome,
                    started.elapsed().as_millis()
                );
                progress.report(100.0, "Done.");
                Ok(outcome)
            }
            Err(e) => {
                error!(
                    "[PHASE: provisioning] [STEP: failed] Provisioning failed (run_id={}, duration_ms={}): {}",
                    run_id,
                    started.elapsed().as_millis(),
                    mask_command(&DisplayChain(&e).to_string())
                );
                progress.report(
                    100.0,
                    format!("Error: {}", mask_command(&root_cause_message(&e))),
                );
                Err(e)
            }
        }
    }

    async fn run_stages(&self, progress: &Reporter<'_>) -> Result<ProvisionOutcome, InstallError> {
        if self.is_setup_done().await {
            info!(
                "[PHASE: provisioning] [STEP: precondition] '{}' already installed; skipping all stages",
                self.config.precondition_package
            );
            return Ok(ProvisionOutcome::AlreadyProvisioned);
        }

        for stage in stages(&self.config) {
            info!(
                "[PHASE: provisioning] [STEP: {}] {} ({}%)",
                stage.name, stage.title, stage.percent
            );
            progress.report(stage.percent, stage.title.as_str());
            self.run_stage(&stage, progress)
                .await
                .map_err(|source| InstallError::Provisioning {
                    stage: stage.name.to_string(),
                    source: Box::new(source),
                })?;
        }
        Ok(ProvisionOutcome::Provisioned)
    }

    async fn run_stage(&self, stage: &Stage, progress: &Reporter<'_>) -> Result<(), InstallError> {
        let percent = stage.percent;
        // Output is republished at the stage milestone so percent never regresses.
        let echo = move |line: &str| {
            let line = line.trim();
            if !line.is_empty() {
                progress.report(percent, line);
            }
        };

        match &stage.action {
            StageAction::Command { command, timeout } => {
                self.runner
                    .execute(command, Some(*timeout), Some(&echo))
                    .await?;
            }
            StageAction::InstallPackages(packages) => {
                for package in packages {
                    progress.report(percent, format!("Install {}", package.name));
                    self.runner
                        .install_package(&package.name, package.timeout(), Some(&echo))
                        .await?;
                }
            }
            StageAction::ConfigureDatabase => {
                let template = self.load_template().await?;
                postgres::install_and_configure(
                    self.runner.as_ref(),
                    &self.config,
                    &template,
                    Some(&echo),
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn load_template(&self) -> Result<String, InstallError> {
        match &self.config.database_template {
            Some(path) => read_template(path).await,
            None => Ok(postgres::BUNDLED_TEMPLATE.to_string()),
        }
    }
}

async fn read_template(path: &Path) -> Result<String, InstallError> {
    info!(
        "[PHASE: provisioning] [STEP: database] Using template override (path={})",
        path.display()
    );
    tokio::fs::read_to_string(path).await.map_err(|e| {
        warn!(
            "[PHASE: provisioning] [STEP: database] Template override unreadable (path={}): {}",
            path.display(),
            e
        );
        InstallError::io(path, e)
    })
}

/// `a: b: c` rendering of an error and its sources, for log lines.
struct DisplayChain<'a>(&'a InstallError);

impl std::fmt::Display for DisplayChain<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = std::error::Error::source(self.0);
        while let Some(cause) = source {
            write!(f, ": {}", cause)?;
            source = cause.source();
        }
        Ok(())
    }
}
