// Boot-mode installer
// Main library entry point

pub mod api;
pub mod artifact;
pub mod config;
pub mod error;
pub mod installation;
pub mod models;
pub mod progress;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub use api::BootService;
pub use config::BootConfig;
pub use error::InstallError;
pub use progress::{JobKind, ProgressBus, ProgressEvent, ProgressSink};

/// Initialize logging with dual format (JSON + human-readable) under `<root>/logs`.
///
/// Returns the log directory.
pub fn init_logging(root: &Path, with_stdout: bool, level: log::LevelFilter) -> Result<PathBuf> {
    let log_dir = utils::path_resolver::resolve_log_folder(root)?;
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {:?}", log_dir))?;

    let timestamp = chrono::Utc::now().format("%Y-%m-%d-%H%M%S");

    // JSON log file for structured parsing
    let json_log_file = log_dir.join(format!("boot-installer-{}.log", timestamp));

    // Human-readable log file (.txt)
    let txt_log_file = log_dir.join(format!("boot-installer-{}.txt", timestamp));

    // - JSON format to .log file
    // - Human-readable format to .txt file
    // - Optional: human-readable to stdout (off while a progress bar owns the terminal)
    let mut dispatch = fern::Dispatch::new().level(level);

    if with_stdout {
        dispatch = dispatch.chain(
            fern::Dispatch::new()
                .format(|out, message, record| {
                    out.finish(format_args!("{}", human_line(&message.to_string(), record)))
                })
                .chain(std::io::stdout()),
        );
    }

    dispatch = dispatch
        .chain(
            fern::Dispatch::new()
                .format(|out, message, record| {
                    let timestamp_utc = chrono::Utc::now().to_rfc3339();
                    let message_str = message.to_string();
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let json_line = utils::logging::format_json_log(
                        &timestamp_utc,
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                    );
                    out.finish(format_args!("{}\n", json_line));
                })
                .chain(
                    fern::log_file(&json_log_file)
                        .with_context(|| format!("Failed to open {:?}", json_log_file))?,
                ),
        )
        .chain(
            fern::Dispatch::new()
                .format(|out, message, record| {
                    out.finish(format_args!("{}\n", human_line(&message.to_string(), record)))
                })
                .chain(
                    fern::log_file(&txt_log_file)
                        .with_context(|| format!("Failed to open {:?}", txt_log_file))?,
                ),
        );

    dispatch
        .apply()
        .context("A global logger is already installed")?;

    log::info!(
        "[PHASE: initialization] Logging initialized, log directory: {:?}",
        log_dir
    );
    Ok(log_dir)
}

fn human_line(message: &str, record: &log::Record) -> String {
    let timestamp_local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    let (phase, step, cleaned_message) = utils::logging::parse_log_metadata(message);
    utils::logging::format_human_readable_log(
        &timestamp_local.to_string(),
        record.level(),
        record.target(),
        &cleaned_message,
        phase.as_deref(),
        step.as_deref(),
    )
}
