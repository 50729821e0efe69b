// Logging utilities
// Structured logging with JSON and human-readable formats

use log::Level;
use regex::Regex;
use serde_json::json;
use std::sync::LazyLock;

static PASSWORD_LITERAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(password\s+)'[^']*'").expect("password literal regex is valid")
});

static PASSWORD_ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)((?:pgpassword|password|pwd)=)(\S+)").expect("password assignment regex is valid")
});

/// Mask credentials embedded in a shell command line.
///
/// Handles SQL literals (`PASSWORD 'x'`) and env-style assignments (`PGPASSWORD=x`).
pub fn mask_command(command: &str) -> String {
    let masked = PASSWORD_LITERAL.replace_all(command, "${1}'***'");
    PASSWORD_ASSIGNMENT
        .replace_all(&masked, "${1}***")
        .into_owned()
}

/// Parse phase and step from log message
/// Extracts [PHASE: ...] and [STEP: ...] patterns
pub fn parse_log_metadata(message: &str) -> (Option<String>, Option<String>, String) {
    let mut phase = None;
    let mut step = None;
    let mut cleaned_message = message.to_string();

    // Extract [PHASE: ...]
    if let Some(start) = message.find("[PHASE:") {
        if let Some(end) = message[start..].find(']') {
            let phase_str = &message[start + 7..start + end].trim();
            phase = Some(phase_str.to_string());
            cleaned_message = format!("{} {}", &message[..start], &message[start + end + 1..])
                .trim()
                .to_string();
        }
    }

    // Extract [STEP: ...]
    if let Some(start) = cleaned_message.find("[STEP:") {
        if let Some(end) = cleaned_message[start..].find(']') {
            let step_str = &cleaned_message[start + 6..start + end].trim();
            step = Some(step_str.to_string());
            cleaned_message = format!(
                "{} {}",
                &cleaned_message[..start],
                &cleaned_message[start + end + 1..]
            )
            .trim()
            .to_string();
        }
    }

    (phase, step, cleaned_message)
}

/// Format log entry as JSON for structured logging
pub fn format_json_log(
    timestamp: &str,
    level: Level,
    target: &str,
    message: &str,
    phase: Option<&str>,
    step: Option<&str>,
) -> String {
    let mut log_entry = json!({
        "timestamp": timestamp,
        "level": level.as_str(),
        "target": target,
        "message": message,
    });

    if let Some(phase) = phase {
        log_entry["phase"] = json!(phase);
    }

    if let Some(step) = step {
        log_entry["step"] = json!(step);
    }

    serde_json::to_string(&log_entry).unwrap_or_else(|_| "{}".to_string())
}

/// Format log entry as human-readable text
pub fn format_human_readable_log(
    timestamp: &str,
    level: Level,
    target: &str,
    message: &str,
    phase: Option<&str>,
    step: Option<&str>,
) -> String {
    let mut log_line = format!("[{}] [{}]", timestamp, level.as_str());

    if let Some(phase) = phase {
        log_line.push_str(&format!(" [PHASE: {}]", phase));
    }

    if let Some(step) = step {
        log_line.push_str(&format!(" [STEP: {}]", step));
    }

    log_line.push_str(&format!(" [{}] {}", target, message));
    log_line
}
