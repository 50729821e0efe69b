// API response models

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Snapshot answered to status polls. Recomputed from disk and the guard on every query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    /// Always true: this process is the boot-mode stand-in, never the core app.
    pub boot_only: bool,
    pub has_artifact: bool,
    pub installing_app: bool,
    pub init_installing: bool,
    pub has_keystore: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keystore_timestamp: Option<DateTime<Utc>>,
    pub has_init_setup_done: bool,
    pub has_user_password: bool,
}

/// How a download request ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum DownloadOutcome {
    /// Target artifact was already present; nothing was fetched.
    AlreadyPresent,
    #[serde(rename_all = "camelCase")]
    Installed { tag_name: String, bytes: u64 },
}

/// How a provisioning request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ProvisionOutcome {
    /// Precondition probe said the host is already set up; every stage was skipped.
    AlreadyProvisioned,
    Provisioned,
}
