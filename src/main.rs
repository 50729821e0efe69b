//! boot-installer - boot-mode device installer
//!
//! Provisions a fresh device, downloads the core application and switches the service
//! unit over to it.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use boot_installer::models::requests::{KeystoreRequest, UserPasswordRequest};
use boot_installer::{BootConfig, BootService, JobKind, ProgressEvent};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast;

/// boot-installer - boot-mode device installer
#[derive(Parser, Debug)]
#[command(name = "boot-installer")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a TOML configuration file (default: <root>/boot-installer.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Also write log lines to stdout
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the device status snapshot as JSON
    Status,

    /// Run initial host provisioning (OS update, tools, database)
    Provision,

    /// Download, verify and install the core application
    Download,

    /// Store the credentials for the first core-mode account
    SetUserPassword {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },

    /// Store the keystore and SSH key pair
    SetKeystore {
        /// JSON body `{ks, prvKey, pubKey}` with base64 fields, or `@<path>` to read it from a file
        #[arg(long)]
        request: String,
    },

    /// Patch the service unit into core mode and reboot
    Finish,

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = BootConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    if let Commands::Config = cli.command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    boot_installer::init_logging(&config.root_dir, cli.verbose, level)
        .context("Failed to initialize logging")?;

    let service = BootService::from_config(config).context("Failed to start boot service")?;

    match cli.command {
        Commands::Status => {
            let status = service.status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Provision => {
            let events = service.subscribe();
            let job = service.start_provisioning()?;
            let render = tokio::spawn(render_progress(events, JobKind::Init));
            let outcome = job.await.context("Provisioning task panicked")?;
            finish_render(render).await;
            let outcome = outcome.context("Provisioning failed")?;
            println!("{}", serde_json::to_string(&outcome)?);
        }
        Commands::Download => {
            let events = service.subscribe();
            let job = service.start_download()?;
            let render = tokio::spawn(render_progress(events, JobKind::Download));
            let outcome = job.await.context("Download task panicked")?;
            finish_render(render).await;
            let outcome = outcome.context("App download failed")?;
            println!("{}", serde_json::to_string(&outcome)?);
        }
        Commands::SetUserPassword { email, password } => {
            service
                .set_user_password(&UserPasswordRequest { email, password })
                .await?;
            println!("User password saved.");
        }
        Commands::SetKeystore { request } => {
            let body = match request.strip_prefix('@') {
                Some(path) => std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read keystore request {}", path))?,
                None => request,
            };
            let req: KeystoreRequest =
                serde_json::from_str(&body).context("Malformed keystore request")?;
            service.set_keystore(&req).await?;
            println!("Keystore saved.");
        }
        Commands::Finish => {
            service.finish_configuration().await?;
        }
        Commands::Config => {}
    }
    Ok(())
}

/// The terminal event can be lost to lag; don't wait on the renderer forever.
async fn finish_render(render: tokio::task::JoinHandle<()>) {
    if tokio::time::timeout(Duration::from_secs(2), render).await.is_err() {
        log::debug!("[PHASE: cli] [STEP: progress] renderer did not see a terminal event");
    }
}

/// Draw `kind` events on a progress bar until the terminal event arrives.
async fn render_progress(mut events: broadcast::Receiver<ProgressEvent>, kind: JobKind) {
    let bar = ProgressBar::new(100);
    if let Ok(style) = ProgressStyle::with_template("{prefix} {spinner} [{bar:40}] {pos:>3}% {wide_msg}") {
        bar.set_style(style.progress_chars("=> "));
    }
    bar.set_prefix(kind.describe());

    loop {
        match events.recv().await {
            Ok(ev) if ev.kind == kind => {
                bar.set_position(ev.percent.round() as u64);
                bar.set_message(ev.message.clone());
                if ev.is_terminal() {
                    bar.finish_with_message(ev.message);
                    break;
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                log::debug!(
                    "[PHASE: cli] [STEP: progress] progress renderer lagged (missed={})",
                    missed
                );
            }
            Err(broadcast::error::RecvError::Closed) => {
                bar.abandon();
                break;
            }
        }
    }
}
