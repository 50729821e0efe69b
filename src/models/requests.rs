// API request models

use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::InstallError;

/// Credentials the core application will use for its first admin account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPasswordRequest {
    pub email: String,
    pub password: String,
}

impl UserPasswordRequest {
    pub fn validate(&self) -> Result<(), InstallError> {
        if self.email.trim().is_empty() {
            return Err(InstallError::InvalidRequest("Email is required.".to_string()));
        }
        if self.password.is_empty() {
            return Err(InstallError::InvalidRequest(
                "Password is required.".to_string(),
            ));
        }
        Ok(())
    }
}

/// Keystore material pushed by the provisioning client.
///
/// On the wire every field is a base64 string (the client serializes raw byte arrays).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeystoreRequest {
    #[serde(deserialize_with = "base64_bytes")]
    pub ks: Vec<u8>,
    #[serde(deserialize_with = "base64_bytes")]
    pub prv_key: Vec<u8>,
    #[serde(deserialize_with = "base64_bytes")]
    pub pub_key: Vec<u8>,
}

impl KeystoreRequest {
    pub fn validate(&self) -> Result<(), InstallError> {
        if self.ks.is_empty() {
            return Err(InstallError::InvalidRequest(
                "Keystore is required.".to_string(),
            ));
        }
        if self.prv_key.is_empty() || self.pub_key.is_empty() {
            return Err(InstallError::InvalidRequest(
                "SSH key pair is required.".to_string(),
            ));
        }
        Ok(())
    }
}

fn base64_bytes<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    base64::engine::general_purpose::STANDARD
        .decode(raw.trim())
        .map_err(serde::de::Error::custom)
}
