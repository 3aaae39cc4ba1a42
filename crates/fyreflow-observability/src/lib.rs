//! Structured logging for Fyreflow processes: one JSONL file per process per
//! day under `<data>/logs`, a compact console layer, and a fixed-schema
//! event emitter the engine uses for run and provider milestones.

use chrono::{NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Engine,
    Server,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Engine => "engine",
            ProcessKind::Server => "server",
        }
    }

    fn file_prefix(self) -> String {
        format!("fyreflow.{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: String,
    pub logs_dir: String,
    pub prefix: String,
    pub retention_days: u64,
    pub initialized_at: chrono::DateTime<Utc>,
}

/// Fixed field schema for engine milestones (run transitions, provider
/// calls, gate verdicts). Serialized whole into one log line so consumers
/// never reassemble an event from scattered fields.
#[derive(Debug, Clone, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<&'a str>,
}

impl<'a> ObservabilityEvent<'a> {
    pub fn run(event: &'a str, component: &'a str, run_id: &'a str) -> Self {
        Self {
            event,
            component,
            run_id: Some(run_id),
            step_id: None,
            provider_id: None,
            status: None,
            error_code: None,
            detail: None,
        }
    }

    pub fn with_status(mut self, status: &'a str) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_step(mut self, step_id: &'a str) -> Self {
        self.step_id = Some(step_id);
        self
    }

    pub fn with_detail(mut self, detail: &'a str) -> Self {
        self.detail = Some(detail);
        self
    }
}

static SECRET_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)token|secret|password|api[_-]?key|oauth").expect("secret key regex")
});

/// Keys whose values must never reach logs or composed context.
pub fn is_secret_key(key: &str) -> bool {
    SECRET_KEY.is_match(key)
}

/// Replaces a sensitive value with a length-and-digest marker that still
/// lets two log lines be compared for equality.
pub fn redact_text(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!("[redacted:{}:{}]", trimmed.chars().count(), short_hash(trimmed))
}

pub fn short_hash(input: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    let digest = hasher.finish();
    // Eight hex chars identify a value well enough for log correlation.
    format!("{:08x}", (digest >> 32) as u32 ^ digest as u32)
}

/// Emits one milestone event. The event is serialized once; the level only
/// selects the tracing macro.
pub fn emit_event(level: Level, process: ProcessKind, event: ObservabilityEvent<'_>) {
    let fields = serde_json::to_string(&event)
        .unwrap_or_else(|_| format!("{{\"event\":\"{}\"}}", event.event));
    let process = process.as_str();
    match level {
        Level::ERROR => {
            tracing::error!(target: "fyreflow.obs", process, event = event.event, %fields)
        }
        Level::WARN => {
            tracing::warn!(target: "fyreflow.obs", process, event = event.event, %fields)
        }
        _ => tracing::info!(target: "fyreflow.obs", process, event = event.event, %fields),
    }
}

pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    let prefix = process.file_prefix();
    prune_rotated_logs(logs_dir, &prefix, retention_days)?;

    let (writer, guard) = tracing_appender::non_blocking(daily_jsonl(logs_dir, &prefix)?);
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(true)
                .with_ansi(true),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_current_span(false)
                .with_span_list(false),
        );
    // A second init (tests, embedded engines) keeps the first subscriber.
    registry.try_init().ok();

    Ok((
        guard,
        LoggingInitInfo {
            process: process.as_str().to_string(),
            logs_dir: logs_dir.display().to_string(),
            prefix,
            retention_days,
            initialized_at: Utc::now(),
        },
    ))
}

fn daily_jsonl(logs_dir: &Path, prefix: &str) -> anyhow::Result<RollingFileAppender> {
    Ok(tracing_appender::rolling::Builder::new()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .filename_suffix("jsonl")
        .build(logs_dir)?)
}

/// Deletes rotated files whose date stamp has aged out. File names are
/// `<prefix>.<YYYY-MM-DD>.jsonl`; anything that does not match the shape is
/// left alone.
fn prune_rotated_logs(logs_dir: &Path, prefix: &str, retention_days: u64) -> anyhow::Result<()> {
    let oldest_kept = Utc::now().date_naive() - chrono::Days::new(retention_days);
    let dotted = format!("{prefix}.");
    for entry in fs::read_dir(logs_dir)?.flatten() {
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name();
        let Some(stamp) = name
            .to_str()
            .and_then(|n| n.strip_prefix(&dotted))
            .and_then(|rest| rest.strip_suffix(".jsonl"))
            .and_then(|date| NaiveDate::parse_from_str(date, "%Y-%m-%d").ok())
        else {
            continue;
        };
        if stamp < oldest_kept {
            let _ = fs::remove_file(entry.path());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_key_pattern_matches_the_usual_suspects() {
        for key in ["api_key", "API-KEY", "oauth_token", "db_password", "client_secret"] {
            assert!(is_secret_key(key), "{key} should be secret");
        }
        assert!(!is_secret_key("theme"));
        assert!(!is_secret_key("frame_count"));
    }

    #[test]
    fn redact_text_masks_content_but_stays_comparable() {
        let raw = "sk-ant-oat01-super-secret";
        let redacted = redact_text(raw);
        assert!(redacted.starts_with("[redacted:25:"));
        assert!(!redacted.contains("super-secret"));
        assert_eq!(redacted, redact_text(raw));
        assert_ne!(redacted, redact_text("another-value"));
    }

    #[test]
    fn event_builder_fills_only_named_fields() {
        let event = ObservabilityEvent::run("run.completed", "scheduler", "r1")
            .with_status("completed")
            .with_step("deliver");
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["run_id"], "r1");
        assert_eq!(json["step_id"], "deliver");
        assert!(json.get("provider_id").is_none());
    }

    #[test]
    fn prune_removes_only_aged_matching_files() {
        let dir = std::env::temp_dir().join(format!("fyreflow-obs-{}", short_hash("prune-test")));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).expect("mkdir");
        let old = dir.join("fyreflow.engine.2001-01-01.jsonl");
        let unrelated = dir.join("notes.txt");
        fs::write(&old, "{}").expect("write");
        fs::write(&unrelated, "keep").expect("write");
        prune_rotated_logs(&dir, "fyreflow.engine", 14).expect("prune");
        assert!(!old.exists());
        assert!(unrelated.exists());
        let _ = fs::remove_dir_all(&dir);
    }
}
