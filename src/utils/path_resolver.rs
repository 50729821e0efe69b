use anyhow::Result;
use std::path::{Path, PathBuf};

/// Default root directory (absolute path)
pub fn default_root_dir() -> PathBuf {
    // Prefer the invoking user's home; services normally run as root so this lands in /root.
    if let Some(home) = dirs::home_dir() {
        return home.join(".boot-installer");
    }

    // Fallback: current working directory
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".boot-installer")
}

/// Resolve log folder (absolute path), creating it if needed.
pub fn resolve_log_folder(root: &Path) -> Result<PathBuf> {
    let log_dir = root.join("logs");
    std::fs::create_dir_all(&log_dir)
        .map_err(|e| anyhow::anyhow!("Failed to create log folder {:?}: {}", log_dir, e))?;
    Ok(log_dir)
}

/// Well-known marker file locations under the root directory.
#[derive(Debug, Clone)]
pub struct MarkerPaths {
    root: PathBuf,
    target_file: String,
    temp_file: String,
}

impl MarkerPaths {
    pub fn new(root: impl Into<PathBuf>, target_file: &str, temp_file: &str) -> Self {
        Self {
            root: root.into(),
            target_file: target_file.to_string(),
            temp_file: temp_file.to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Published application artifact.
    pub fn target_artifact(&self) -> PathBuf {
        self.root.join(&self.target_file)
    }

    /// Download destination before verification; same directory as the target so the
    /// final rename stays on one filesystem.
    pub fn temp_artifact(&self) -> PathBuf {
        self.root.join(&self.temp_file)
    }

    pub fn keystore(&self) -> PathBuf {
        self.root.join("init_private_key")
    }

    pub fn ssh_dir(&self) -> PathBuf {
        self.root.join("ssh")
    }

    pub fn ssh_private_key(&self) -> PathBuf {
        self.ssh_dir().join("id_rsa_boot")
    }

    pub fn ssh_public_key(&self) -> PathBuf {
        self.ssh_dir().join("id_rsa_boot.pub")
    }

    pub fn user_password(&self) -> PathBuf {
        self.root.join("user_password.conf")
    }
}
