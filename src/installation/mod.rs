// Host provisioning
//
// `CommandRunner` is the seam between the provisioning pipeline and the host. The
// pipeline only ever talks to the trait; `ShellCommandRunner` is the production
// implementation (sh -c, streamed stdout, timeout with kill, retry of transient spawns).
//
// IMPORTANT:
// - Never log secrets. Commands go through `mask_command` before they reach a log line.
// - All I/O should be async.

pub mod markers;
pub mod postgres;
pub mod provisioning;
pub mod service;

use std::process::{ExitStatus, Stdio};
use std::time::Instant;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{timeout, Duration};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::error::InstallError;
use crate::utils::logging::mask_command;

/// Line-oriented observer for command output.
pub type OutputSink<'a> = Option<&'a (dyn Fn(&str) + Send + Sync)>;

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a shell command line; returns captured stdout.
    ///
    /// Non-zero exit, spawn failure and timeout are all `CommandExecution`.
    async fn execute(
        &self,
        command: &str,
        timeout: Option<Duration>,
        on_output: OutputSink<'_>,
    ) -> Result<String, InstallError>;

    async fn install_package(
        &self,
        name: &str,
        timeout: Duration,
        on_output: OutputSink<'_>,
    ) -> Result<(), InstallError>;

    async fn is_package_installed(&self, name: &str) -> bool;

    async fn is_service_running(&self, service: &str) -> bool;

    async fn reboot(&self) -> Result<(), InstallError>;
}

const SERVICE_PROBE_TIMEOUT: Duration = Duration::from_secs(15);
const REBOOT_TIMEOUT: Duration = Duration::from_secs(60);

pub struct ShellCommandRunner {
    shell: String,
}

impl Default for ShellCommandRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellCommandRunner {
    pub fn new() -> Self {
        if !running_as_root() {
            warn!(
                "[PHASE: installation] [STEP: runner] Not running as root; package installs and service changes will likely fail"
            );
        }
        Self {
            shell: "sh".to_string(),
        }
    }

    /// Use a different POSIX shell (tests, busybox images).
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    fn spawn_once(&self, command: &str) -> std::io::Result<Child> {
        Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }

    /// Spawn with up to 3 retries, only for spawn errors that look transient.
    async fn spawn(&self, command: &str) -> Result<Child, InstallError> {
        let retry_strategy = ExponentialBackoff::from_millis(200)
            .factor(2)
            .max_delay(Duration::from_secs(2))
            .take(3)
            .map(jitter);

        RetryIf::spawn(
            retry_strategy,
            move || async move { self.spawn_once(command) },
            |e: &std::io::Error| {
                let transient = is_transient_spawn_error(e);
                if transient {
                    warn!(
                        "[PHASE: installation] [STEP: cmd] Transient spawn failure; will retry (command={}, err={})",
                        mask_command(command),
                        e
                    );
                }
                transient
            },
        )
        .await
        .map_err(|e| InstallError::command(&[command], format!("failed to spawn {}: {}", self.shell, e)))
    }
}

fn is_transient_spawn_error(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) {
        return true;
    }
    let msg = e.to_string().to_ascii_lowercase();
    msg.contains("temporarily") || msg.contains("busy") || msg.contains("resource")
}

#[cfg(target_os = "linux")]
fn running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(target_os = "linux"))]
fn running_as_root() -> bool {
    false
}

/// `CommandExecution` for a finished process, `None` on success.
fn exit_failure(command: &str, status: ExitStatus, stderr: &str) -> Option<InstallError> {
    if status.success() {
        return None;
    }
    let code = status
        .code()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string());
    let stderr = stderr.trim();
    let message = if stderr.is_empty() {
        format!("exit code {}", code)
    } else {
        format!("exit code {}: {}", code, stderr)
    };
    Some(InstallError::command(&[command], message))
}

#[async_trait]
impl CommandRunner for ShellCommandRunner {
    async fn execute(
        &self,
        command: &str,
        timeout_dur: Option<Duration>,
        on_output: OutputSink<'_>,
    ) -> Result<String, InstallError> {
        let started = Instant::now();
        let masked = mask_command(command);
        info!(
            "[PHASE: installation] [STEP: cmd] execute entered (command={}, timeout_ms={:?})",
            masked,
            timeout_dur.map(|d| d.as_millis())
        );

        let mut child = self.spawn(command).await?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| InstallError::command(&[command], "failed to capture stdout"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| InstallError::command(&[command], "failed to capture stderr"))?;

        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            stderr.read_to_end(&mut buf).await?;
            Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).to_string())
        });

        let run = async {
            let mut collected = String::new();
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                let n = reader
                    .read_until(b'\n', &mut buf)
                    .await
                    .map_err(|e| InstallError::command(&[command], format!("stdout read failed: {}", e)))?;
                if n == 0 {
                    break;
                }
                // Output may not be UTF-8.
                let raw = buf.strip_suffix(b"\n").unwrap_or(&buf);
                let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
                let line = String::from_utf8_lossy(raw);
                if let Some(sink) = on_output {
                    sink(&line);
                }
                collected.push_str(&line);
                collected.push('\n');
            }
            let status = child
                .wait()
                .await
                .map_err(|e| InstallError::command(&[command], format!("wait failed: {}", e)))?;
            Ok::<_, InstallError>((status, collected))
        };

        let outcome = match timeout_dur {
            Some(limit) => match timeout(limit, run).await {
                Ok(r) => r,
                Err(_) => {
                    warn!(
                        "[PHASE: installation] [STEP: cmd] Timeout reached (command={}, timeout_ms={}); attempting to kill process",
                        masked,
                        limit.as_millis()
                    );
                    if let Err(e) = child.kill().await {
                        warn!(
                            "[PHASE: installation] [STEP: cmd] Failed to kill timed-out process (command={}): {}",
                            masked, e
                        );
                    }
                    stderr_task.abort();
                    return Err(InstallError::command(
                        &[command],
                        format!("timed out after {}ms", limit.as_millis()),
                    ));
                }
            },
            None => run.await,
        };

        let (status, stdout_str) = match outcome {
            Ok(v) => v,
            Err(e) => {
                stderr_task.abort();
                error!(
                    "[PHASE: installation] [STEP: cmd] execute error (command={}, err={})",
                    masked, e
                );
                return Err(e);
            }
        };
        let stderr_str = match stderr_task.await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                debug!("[PHASE: installation] [STEP: cmd] stderr read failed: {}", e);
                String::new()
            }
            Err(e) => {
                debug!("[PHASE: installation] [STEP: cmd] stderr join failed: {}", e);
                String::new()
            }
        };

        if let Some(err) = exit_failure(command, status, &stderr_str) {
            error!(
                "[PHASE: installation] [STEP: cmd] execute failed (command={}, exit_code={:?}, duration_ms={})",
                masked,
                status.code(),
                started.elapsed().as_millis()
            );
            return Err(err);
        }

        info!(
            "[PHASE: installation] [STEP: cmd] execute exit (command={}, duration_ms={}, stdout_len={})",
            masked,
            started.elapsed().as_millis(),
            stdout_str.len()
        );
        Ok(stdout_str)
    }

    async fn install_package(
        &self,
        name: &str,
        timeout_dur: Duration,
        on_output: OutputSink<'_>,
    ) -> Result<(), InstallError> {
        if !is_valid_package_name(name) {
            return Err(InstallError::command(&[name], "invalid package name"));
        }
        let command = format!("DEBIAN_FRONTEND=noninteractive apt-get install -y {}", name);
        self.execute(&command, Some(timeout_dur), on_output)
            .await
            .map(|_| ())
    }

    async fn is_package_installed(&self, name: &str) -> bool {
        let found = which::which(name);
        debug!(
            "[PHASE: installation] [STEP: probe] is_package_installed (name={}, found={:?})",
            name,
            found.as_ref().ok()
        );
        found.is_ok()
    }

    async fn is_service_running(&self, service_name: &str) -> bool {
        // --no-pager prevents blocking on interactive pager
        let command = format!("systemctl is-active --no-pager {}", service_name);
        match self.execute(&command, Some(SERVICE_PROBE_TIMEOUT), None).await {
            Ok(stdout) => service::is_active_output(&stdout),
            Err(e) => {
                debug!(
                    "[PHASE: installation] [STEP: service] is_service_running exit (running=false, error={})",
                    e
                );
                false
            }
        }
    }

    async fn reboot(&self) -> Result<(), InstallError> {
        warn!("[PHASE: installation] [STEP: reboot] Rebooting host");
        self.execute("reboot", Some(REBOOT_TIMEOUT), None)
            .await
            .map(|_| ())
    }
}

/// Debian package names: lowercase alphanumerics plus `+-.`, optional `:arch`.
fn is_valid_package_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.' | ':' | '_'))
}
