//! Marker files under the root directory.
//!
//! Markers signal installation state by existence and are always written wholesale:
//! content goes to a sibling temp file which is then renamed over the marker, so a
//! reader never sees a half-written key or password file.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info};
use tokio::io::AsyncWriteExt;

use crate::error::InstallError;
use crate::models::requests::{KeystoreRequest, UserPasswordRequest};
use crate::utils::path_resolver::MarkerPaths;

/// Unix mode for private key material.
const PRIVATE_MODE: u32 = 0o600;

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Replace `path` with `bytes` in one rename. `mode` is applied before the rename.
pub async fn write_atomic(path: &Path, bytes: &[u8], mode: Option<u32>) -> Result<(), InstallError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| InstallError::io(parent, e))?;
    }

    let staging = staging_path(path);
    let write = async {
        let mut file = tokio::fs::File::create(&staging).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = mode {
                tokio::fs::set_permissions(&staging, std::fs::Permissions::from_mode(mode))
                    .await?;
            }
        }
        #[cfg(not(unix))]
        let _ = mode;

        Ok::<(), std::io::Error>(())
    };

    if let Err(e) = write.await {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(InstallError::io(&staging, e));
    }
    tokio::fs::rename(&staging, path)
        .await
        .map_err(|e| InstallError::io(path, e))?;
    debug!(
        "[PHASE: markers] [STEP: write] Marker written (path={}, bytes={})",
        path.display(),
        bytes.len()
    );
    Ok(())
}

pub async fn save_user_password(
    paths: &MarkerPaths,
    request: &UserPasswordRequest,
) -> Result<(), InstallError> {
    request.validate()?;
    let json = serde_json::to_vec_pretty(request)
        .map_err(|e| InstallError::InvalidRequest(format!("unable to encode credentials: {}", e)))?;
    write_atomic(&paths.user_password(), &json, Some(PRIVATE_MODE)).await?;
    info!("[PHASE: markers] [STEP: user_password] User credentials saved");
    Ok(())
}

/// Write the SSH key pair and the keystore. The keystore goes last since its presence
/// (and mtime) is what status reports.
pub async fn save_keystore(paths: &MarkerPaths, request: &KeystoreRequest) -> Result<(), InstallError> {
    request.validate()?;
    write_atomic(&paths.ssh_private_key(), &request.prv_key, Some(PRIVATE_MODE)).await?;
    write_atomic(&paths.ssh_public_key(), &request.pub_key, None).await?;
    write_atomic(&paths.keystore(), &request.ks, Some(PRIVATE_MODE)).await?;
    info!(
        "[PHASE: markers] [STEP: keystore] Keystore and SSH key pair saved (ssh_dir={})",
        paths.ssh_dir().display()
    );
    Ok(())
}

/// Last modification time of the keystore, if present.
pub async fn keystore_timestamp(paths: &MarkerPaths) -> Option<DateTime<Utc>> {
    let meta = tokio::fs::metadata(paths.keystore()).await.ok()?;
    meta.modified().ok().map(DateTime::<Utc>::from)
}

pub async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}
