// Installer configuration
//
// Layering (later wins): built-in defaults -> optional TOML file -> BOOT_INSTALLER__* env.
// Defaults reproduce the behavior of a stock device, so an empty config is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const ENV_PREFIX: &str = "BOOT_INSTALLER";
pub const CONFIG_FILE_NAME: &str = "boot-installer.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootConfig {
    /// Directory holding marker files, the downloaded artifact and logs.
    pub root_dir: PathBuf,
    pub registry: RegistryConfig,
    pub provisioning: ProvisioningConfig,
    pub service: ServiceConfig,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            root_dir: crate::utils::path_resolver::default_root_dir(),
            registry: RegistryConfig::default(),
            provisioning: ProvisioningConfig::default(),
            service: ServiceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// "Latest release" endpoint of the registry API.
    pub endpoint: String,
    pub artifact_asset: String,
    pub checksum_asset: String,
    /// File name of the published artifact under `root_dir`.
    pub target_file: String,
    /// File name the download streams into before verification.
    pub temp_file: String,
    /// Whole-request limit for the release descriptor and checksum asset.
    pub metadata_timeout_secs: u64,
    /// Whole-request limit for the artifact stream.
    pub download_timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.github.com/repos/boot-installer/core/releases/latest"
                .to_string(),
            artifact_asset: "app.bin".to_string(),
            checksum_asset: "md5.hex".to_string(),
            target_file: "app.bin".to_string(),
            temp_file: "app_tmp.bin".to_string(),
            metadata_timeout_secs: 30,
            download_timeout_secs: 3600,
        }
    }
}

impl RegistryConfig {
    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Binary whose presence on PATH means initial setup already ran.
    pub precondition_package: String,
    pub update_timeout_secs: u64,
    pub upgrade_timeout_secs: u64,
    pub tools: Vec<PackageSpec>,
    pub database_package: String,
    pub database_install_timeout_secs: u64,
    pub database_service: String,
    /// Overrides the bundled database configuration template.
    pub database_template: Option<PathBuf>,
    pub admin_password: String,
    pub replication_password: String,
    pub default_command_timeout_secs: u64,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            precondition_package: "psql".to_string(),
            update_timeout_secs: 600,
            upgrade_timeout_secs: 1200,
            tools: vec![
                PackageSpec::new("autossh", 60),
                PackageSpec::new("ffmpeg", 600),
            ],
            database_package: "postgresql".to_string(),
            database_install_timeout_secs: 1200,
            database_service: "postgresql".to_string(),
            database_template: None,
            admin_password: "password".to_string(),
            replication_password: "password".to_string(),
            default_command_timeout_secs: 120,
        }
    }
}

impl ProvisioningConfig {
    pub fn default_command_timeout(&self) -> Duration {
        Duration::from_secs(self.default_command_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSpec {
    pub name: String,
    pub timeout_secs: u64,
}

impl PackageSpec {
    pub fn new(name: &str, timeout_secs: u64) -> Self {
        Self {
            name: name.to_string(),
            timeout_secs,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// systemd unit of this service; rewritten from boot to core mode on finish.
    pub unit_path: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            unit_path: PathBuf::from("/etc/systemd/system/boot-installer.service"),
        }
    }
}

impl BootConfig {
    /// Load configuration.
    ///
    /// `explicit` must exist when given; otherwise `<default root>/boot-installer.toml` is
    /// read if present.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let file = match explicit {
            Some(p) => {
                if !p.exists() {
                    anyhow::bail!("Config file not found: {:?}", p);
                }
                config::File::from(p.to_path_buf()).required(true)
            }
            None => {
                let p = crate::utils::path_resolver::default_root_dir().join(CONFIG_FILE_NAME);
                config::File::from(p).required(false)
            }
        };

        let cfg = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let parsed: BootConfig = cfg
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn validate(&self) -> Result<()> {
        if self.registry.artifact_asset.trim().is_empty() {
            anyhow::bail!("registry.artifact_asset must not be empty");
        }
        if self.registry.checksum_asset.trim().is_empty() {
            anyhow::bail!("registry.checksum_asset must not be empty");
        }
        if self.registry.target_file == self.registry.temp_file {
            anyhow::bail!("registry.temp_file must differ from registry.target_file");
        }
        if self.registry.metadata_timeout_secs == 0 || self.registry.download_timeout_secs == 0 {
            anyhow::bail!("registry timeouts must be greater than zero");
        }
        url::Url::parse(&self.registry.endpoint)
            .with_context(|| format!("Invalid registry endpoint: {}", self.registry.endpoint))?;
        if self.provisioning.precondition_package.trim().is_empty() {
            anyhow::bail!("provisioning.precondition_package must not be empty");
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render configuration as TOML")
    }
}
