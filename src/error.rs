// Installer error taxonomy
//
// Every pipeline failure ends up as one of these variants. The boot service turns
// them into a terminal progress event (see `root_cause_message`) and hands them back
// to whoever triggered the run.

use std::path::PathBuf;

use thiserror::Error;

use crate::progress::JobKind;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("{} already in progress", .0.describe())]
    AlreadyInProgress(JobKind),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("unable to find asset '{name}' in release")]
    NotFound { name: String },

    #[error("download failed: {0}")]
    Download(String),

    #[error("downloaded file corrupted (expected checksum {expected}, got {actual})")]
    CorruptArtifact { expected: String, actual: String },

    #[error("command failed: {message} (inputs: {})", .inputs.join("; "))]
    CommandExecution { inputs: Vec<String>, message: String },

    #[error("{0} is not running")]
    ServiceNotRunning(String),

    #[error("unable to determine database engine version from '{0}'")]
    EngineVersionNotFound(String),

    #[error("provisioning stage '{stage}' failed")]
    Provisioning {
        stage: String,
        #[source]
        source: Box<InstallError>,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl InstallError {
    pub fn command(inputs: &[&str], message: impl Into<String>) -> Self {
        InstallError::CommandExecution {
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        InstallError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Message of the innermost error in the `source()` chain.
///
/// This is what ends up in the terminal `Error: ...` progress event: the stage wrapper
/// is useful in logs but the user wants to see why apt or postgres failed.
pub fn root_cause_message(err: &(dyn std::error::Error + 'static)) -> String {
    let mut cause = err;
    while let Some(next) = cause.source() {
        cause = next;
    }
    let msg = cause.to_string();
    if msg.trim().is_empty() {
        format!("{:?}", cause)
    } else {
        msg
    }
}
