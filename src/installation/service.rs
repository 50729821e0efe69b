// Service management helpers
//
// Switching the device from boot mode to core mode is a text patch of the systemd unit
// followed by a reboot. The command builders are pure so they can be tested on any OS.

use std::path::Path;

use log::{info, warn};

use crate::error::InstallError;
use crate::installation::CommandRunner;

/// `true` when `systemctl is-active` printed "active".
pub fn is_active_output(stdout: &str) -> bool {
    stdout.trim().eq_ignore_ascii_case("active")
}

/// Quote a path for a `sh -c` command line.
fn shell_quote_path(path: &Path) -> String {
    let s = path.to_string_lossy();
    if s.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '-' | '_'))
    {
        s.into_owned()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// Edits applied to the boot unit before rebooting into core mode:
/// rename boot -> core everywhere, then order the unit after the database.
///
/// Line 3 / 4 insertion assumes the stock unit layout (`[Unit]`, `Description=`, ...).
pub fn build_unit_patch_commands(unit_path: &Path, database_service: &str) -> Vec<String> {
    let unit = shell_quote_path(unit_path);
    vec![
        format!("sed -i 's/boot/core/g' {}", unit),
        format!("sed -i '3 i After={}.service' {}", database_service, unit),
        format!("sed -i '4 i Requires={}.service' {}", database_service, unit),
    ]
}

/// Patch the unit and reboot. Stops at the first failing edit; nothing is rolled back.
pub async fn switch_to_core_mode(
    runner: &dyn CommandRunner,
    unit_path: &Path,
    database_service: &str,
) -> Result<(), InstallError> {
    info!(
        "[PHASE: finish] [STEP: unit] Patching service unit (unit_path={})",
        unit_path.display()
    );
    if !unit_path.exists() {
        warn!(
            "[PHASE: finish] [STEP: unit] Unit file not found; sed will fail (unit_path={})",
            unit_path.display()
        );
    }
    for command in build_unit_patch_commands(unit_path, database_service) {
        runner.execute(&command, None, None).await?;
    }
    info!("[PHASE: finish] [STEP: reboot] Unit patched; rebooting into core mode");
    runner.reboot().await
}
