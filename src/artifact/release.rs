// Release descriptor (registry "latest release" document)

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::InstallError;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReleaseDescriptor {
    #[serde(default)]
    pub name: String,
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Asset {
    pub name: String,
    #[serde(rename = "size")]
    pub size_bytes: u64,
    #[serde(rename = "browser_download_url")]
    pub download_url: String,
    pub updated_at: DateTime<Utc>,
}

impl ReleaseDescriptor {
    pub fn from_json(bytes: &[u8]) -> Result<Self, InstallError> {
        serde_json::from_slice(bytes)
            .map_err(|e| InstallError::Registry(format!("malformed release metadata: {}", e)))
    }
}

/// Exact-name lookup; a missing asset is terminal, there is no fallback name.
pub fn find_asset<'a>(
    descriptor: &'a ReleaseDescriptor,
    name: &str,
) -> Result<&'a Asset, InstallError> {
    descriptor
        .assets
        .iter()
        .find(|a| a.name == name)
        .ok_or_else(|| InstallError::NotFound {
            name: name.to_string(),
        })
}
