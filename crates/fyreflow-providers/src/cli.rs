//! CLI subprocess transport. Used when a provider has no usable HTTP
//! credential: the configured binary (`codex`, `claude`) is spawned with a
//! role-specific argv, the composed prompt is written to stdin, and stdout is
//! drained as stream-json where tool calls surface as incremental events.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use fyreflow_types::{OutputFormat, ProviderKind, StepRole};

use crate::prompt::compose_cli_prompt;
use crate::{InvocationRequest, InvokeError, RunLogSender};

static UNKNOWN_OPTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)unknown (option|argument)|unrecognized option").expect("unknown option regex")
});

static TOOL_CALL_ISLAND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<tool_call>(.*?)</tool_call>").expect("tool call regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionMode {
    AcceptEdits,
    BypassPermissions,
    Default,
    DontAsk,
    Plan,
}

impl PermissionMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "acceptEdits" => Some(Self::AcceptEdits),
            "bypassPermissions" => Some(Self::BypassPermissions),
            "default" => Some(Self::Default),
            "dontAsk" => Some(Self::DontAsk),
            "plan" => Some(Self::Plan),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AcceptEdits => "acceptEdits",
            Self::BypassPermissions => "bypassPermissions",
            Self::Default => "default",
            Self::DontAsk => "dontAsk",
            Self::Plan => "plan",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CliOptions {
    pub codex_path: Option<PathBuf>,
    pub claude_path: Option<PathBuf>,
    pub skip_permissions: bool,
    pub strict_mcp: bool,
    pub disable_slash_commands: bool,
    pub setting_sources: String,
    pub permission_mode: Option<PermissionMode>,
}

impl Default for CliOptions {
    fn default() -> Self {
        Self {
            codex_path: None,
            claude_path: None,
            skip_permissions: true,
            strict_mcp: true,
            disable_slash_commands: true,
            setting_sources: "user".to_string(),
            permission_mode: None,
        }
    }
}

/// Inline schema attached to review/tester steps that must answer in JSON.
pub const GATE_CONTRACT_JSON_SCHEMA: &str = r#"{"type":"object","properties":{"workflow_status":{"type":"string","enum":["PASS","FAIL","NEUTRAL","COMPLETE","NEEDS_INPUT"]},"next_action":{"type":"string","enum":["continue","retry_step","retry_stage","escalate","stop"]},"reasons":{"type":"array","items":{"type":"object","properties":{"code":{"type":"string"},"message":{"type":"string"},"severity":{"type":"string"}}}},"summary":{"type":"string"}},"required":["workflow_status"]}"#;

fn binary_name(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::Openai => "codex",
        ProviderKind::Claude => "claude",
    }
}

/// Explicit configuration wins, then `~/.local/bin/<name>`, then PATH.
fn resolve_binary(options: &CliOptions, request: &InvocationRequest) -> PathBuf {
    if let Some(path) = request.provider.cli_path.as_deref().map(str::trim) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    let name = binary_name(request.provider.kind);
    let configured = match request.provider.kind {
        ProviderKind::Openai => options.codex_path.clone(),
        ProviderKind::Claude => options.claude_path.clone(),
    };
    if let Some(path) = configured {
        return path;
    }
    if let Some(home) = dirs::home_dir() {
        let local = home.join(".local").join("bin").join(name);
        if local.exists() {
            return local;
        }
    }
    PathBuf::from(name)
}

/// Builds the argv for one attempt. `include_effort` is dropped when the
/// installed CLI rejects the flag (compatibility profile).
pub(crate) fn build_argv(
    options: &CliOptions,
    request: &InvocationRequest,
    include_effort: bool,
) -> Vec<String> {
    let step = &request.step;
    let kind = request.provider.kind;
    let mut argv: Vec<String> = match kind {
        ProviderKind::Openai => vec!["exec".to_string()],
        ProviderKind::Claude => vec!["-p".to_string()],
    };

    let model = if step.model.trim().is_empty() {
        request.provider.default_model.clone()
    } else {
        step.model.trim().to_string()
    };
    if !model.is_empty() {
        argv.push("--model".to_string());
        argv.push(model);
    }

    match (step.role, step.output_format) {
        // Orchestrators delegate tool use to other steps through the prompt.
        (StepRole::Orchestrator, _) => {
            argv.push("--tools".to_string());
            argv.push(String::new());
            argv.push("--output-format".to_string());
            argv.push("json".to_string());
        }
        (StepRole::Review | StepRole::Tester, OutputFormat::Json) => {
            argv.push("--json-schema".to_string());
            argv.push(GATE_CONTRACT_JSON_SCHEMA.to_string());
            argv.push("--output-format".to_string());
            argv.push("stream-json".to_string());
        }
        // Artifact-writing steps keep tools enabled and stream tool calls.
        _ => {
            argv.push("--output-format".to_string());
            argv.push("stream-json".to_string());
        }
    }

    if kind == ProviderKind::Claude {
        argv.push("--no-session-persistence".to_string());
        argv.push("--setting-sources".to_string());
        argv.push(options.setting_sources.clone());
        if options.strict_mcp {
            argv.push("--strict-mcp-config".to_string());
        }
        if options.disable_slash_commands {
            argv.push("--disable-slash-commands".to_string());
        }
        if let Some(mode) = options.permission_mode {
            argv.push("--permission-mode".to_string());
            argv.push(mode.as_str().to_string());
        } else if options.skip_permissions {
            argv.push("--dangerously-skip-permissions".to_string());
        }
    }

    let effort = step.reasoning_effort.trim();
    if include_effort && !effort.is_empty() {
        argv.push("--effort".to_string());
        argv.push(effort.to_string());
    }

    argv
}

struct DrainCounters {
    stdout_bytes: AtomicU64,
    stderr_bytes: AtomicU64,
    last_stdout_ms: AtomicU64,
}

pub(crate) async fn invoke_cli(
    options: &CliOptions,
    request: &InvocationRequest,
    cancel: &CancellationToken,
    log: &RunLogSender,
) -> Result<String, InvokeError> {
    let prompt = compose_cli_prompt(request);
    match run_cli_once(options, request, &prompt, true, cancel, log).await {
        Err(InvokeError::Fatal(detail)) if UNKNOWN_OPTION.is_match(&detail) => {
            let _ = log.send(format!(
                "cli for provider `{}` rejected a flag; retrying with compatibility profile",
                request.provider.id
            ));
            run_cli_once(options, request, &prompt, false, cancel, log).await
        }
        other => other,
    }
}

async fn run_cli_once(
    options: &CliOptions,
    request: &InvocationRequest,
    prompt: &str,
    include_effort: bool,
    cancel: &CancellationToken,
    log: &RunLogSender,
) -> Result<String, InvokeError> {
    let binary = resolve_binary(options, request);
    let argv = build_argv(options, request, include_effort);
    let started = Instant::now();

    let mut child = Command::new(&binary)
        .args(&argv)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| {
            InvokeError::Fatal(format!("failed to spawn `{}`: {err}", binary.display()))
        })?;
    let pid = child.id().unwrap_or_default();

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| InvokeError::Fatal("cli stdin unavailable".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| InvokeError::Fatal("cli stdout unavailable".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| InvokeError::Fatal("cli stderr unavailable".to_string()))?;

    let prompt_bytes = prompt.as_bytes().to_vec();
    let stdin_task = tokio::spawn(async move {
        let _ = stdin.write_all(&prompt_bytes).await;
        let _ = stdin.shutdown().await;
    });

    let counters = Arc::new(DrainCounters {
        stdout_bytes: AtomicU64::new(0),
        stderr_bytes: AtomicU64::new(0),
        last_stdout_ms: AtomicU64::new(0),
    });

    let stdout_counters = counters.clone();
    let stdout_log = log.clone();
    let stdout_task = tokio::spawn(async move {
        let mut raw = String::new();
        let mut extracted = String::new();
        let mut reader = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            stdout_counters
                .stdout_bytes
                .fetch_add(line.len() as u64 + 1, Ordering::Relaxed);
            stdout_counters
                .last_stdout_ms
                .store(0, Ordering::Relaxed);
            if raw.len() < 2_000_000 {
                raw.push_str(&line);
                raw.push('\n');
            }
            if let Ok(value) = serde_json::from_str::<Value>(&line) {
                if let Some(text) = extract_stream_text(&value) {
                    extracted.push_str(&text);
                }
                for call in extract_tool_calls(&value) {
                    let _ = stdout_log.send(format!(
                        "tool call: {} {}",
                        call.name, call.args_preview
                    ));
                }
            }
        }
        (raw, extracted)
    });

    let stderr_counters = counters.clone();
    let stderr_task = tokio::spawn(async move {
        let mut collected = String::new();
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            stderr_counters
                .stderr_bytes
                .fetch_add(line.len() as u64 + 1, Ordering::Relaxed);
            if collected.len() < 200_000 {
                collected.push_str(&line);
                collected.push('\n');
            }
        }
        collected
    });

    // Liveness watchdog: debug-level sample every second, run-log line every
    // fifteen samples so long CLI calls stay visible without flooding.
    let watchdog_counters = counters.clone();
    let watchdog_log = log.clone();
    let watchdog_cancel = cancel.clone();
    let binary_label = binary.display().to_string();
    let watchdog = tokio::spawn(async move {
        let mut samples = 0u64;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = watchdog_cancel.cancelled() => break,
            }
            samples += 1;
            let idle_ms = watchdog_counters.last_stdout_ms.fetch_add(1_000, Ordering::Relaxed);
            let stdout_bytes = watchdog_counters.stdout_bytes.load(Ordering::Relaxed);
            let stderr_bytes = watchdog_counters.stderr_bytes.load(Ordering::Relaxed);
            let line = format!(
                "cli pid={pid} cmd={binary_label} elapsed={}ms idle={}ms stdout={}B stderr={}B",
                samples * 1_000,
                idle_ms,
                stdout_bytes,
                stderr_bytes
            );
            tracing::debug!(target: "fyreflow.providers", "{line}");
            if samples % 15 == 0 {
                let _ = watchdog_log.send(line);
            }
        }
    });

    enum WaitOutcome {
        Exited(std::io::Result<std::process::ExitStatus>),
        TimedOut,
        Cancelled,
    }

    let timeout = Duration::from_millis(request.stage_timeout_ms);
    // The wait future borrows `child`; resolve the outcome first so the
    // borrow has ended before any kill.
    let outcome = tokio::select! {
        waited = tokio::time::timeout(timeout, child.wait()) => match waited {
            Ok(status) => WaitOutcome::Exited(status),
            Err(_) => WaitOutcome::TimedOut,
        },
        _ = cancel.cancelled() => WaitOutcome::Cancelled,
    };
    watchdog.abort();
    let status = match outcome {
        WaitOutcome::Exited(status) => {
            status.map_err(|err| InvokeError::Fatal(format!("cli wait failed: {err}")))?
        }
        WaitOutcome::TimedOut => {
            let _ = child.kill().await;
            return Err(InvokeError::Timeout {
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        }
        WaitOutcome::Cancelled => {
            let _ = child.kill().await;
            return Err(InvokeError::Aborted);
        }
    };
    let _ = stdin_task.await;
    let (raw, extracted) = stdout_task.await.unwrap_or_default();
    let stderr_text = stderr_task.await.unwrap_or_default();

    if !status.success() {
        let code = status.code().unwrap_or(-1);
        return Err(InvokeError::Fatal(format!(
            "cli exited with status {code}: {}",
            truncate_text(&stderr_text, 500)
        )));
    }

    if !extracted.trim().is_empty() {
        Ok(extracted)
    } else {
        Ok(raw)
    }
}

/// Pulls assistant-visible text out of one stream-json event.
fn extract_stream_text(value: &Value) -> Option<String> {
    match value.get("type").and_then(|v| v.as_str()).unwrap_or_default() {
        "content_block_delta" => value
            .get("delta")
            .and_then(|d| d.get("text"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        "assistant" | "message" => {
            let mut out = String::new();
            collect_text_content(value, &mut out);
            if out.is_empty() {
                None
            } else {
                Some(out)
            }
        }
        "result" => value
            .get("result")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        _ => None,
    }
}

fn collect_text_content(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            for item in items {
                collect_text_content(item, out);
            }
        }
        Value::Object(map) => {
            if map.get("type").and_then(|v| v.as_str()) == Some("text") {
                if let Some(text) = map.get("text").and_then(|v| v.as_str()) {
                    out.push_str(text);
                }
            }
            if let Some(content) = map.get("content") {
                collect_text_content(content, out);
            }
            if let Some(message) = map.get("message") {
                collect_text_content(message, out);
            }
        }
        _ => {}
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallSummary {
    pub name: String,
    pub args_preview: String,
}

/// Finds tool invocations in one stream-json event: `tool_use` records,
/// `<tool_call>` islands embedded in strings, and stringified JSON carried in
/// `tool_input` fields.
pub fn extract_tool_calls(value: &Value) -> Vec<ToolCallSummary> {
    let mut out = Vec::new();
    walk_tool_calls(value, &mut out);
    out
}

fn walk_tool_calls(value: &Value, out: &mut Vec<ToolCallSummary>) {
    match value {
        Value::Array(items) => {
            for item in items {
                walk_tool_calls(item, out);
            }
        }
        Value::Object(map) => {
            if map.get("type").and_then(|v| v.as_str()) == Some("tool_use") {
                let name = map
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                let input = map
                    .get("input")
                    .or_else(|| map.get("tool_input"))
                    .cloned()
                    .unwrap_or(Value::Null);
                let input = match input {
                    // tool_input sometimes arrives as stringified JSON.
                    Value::String(raw) => {
                        serde_json::from_str::<Value>(&raw).unwrap_or(Value::String(raw))
                    }
                    other => other,
                };
                out.push(ToolCallSummary {
                    name,
                    args_preview: truncate_text(&input.to_string(), 120),
                });
            }
            for child in map.values() {
                walk_tool_calls(child, out);
            }
        }
        Value::String(text) => {
            for capture in TOOL_CALL_ISLAND.captures_iter(text) {
                let body = capture.get(1).map(|m| m.as_str().trim()).unwrap_or("");
                match serde_json::from_str::<Value>(body) {
                    Ok(parsed) => {
                        let name = parsed
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or("tool_call")
                            .to_string();
                        let args = parsed
                            .get("arguments")
                            .or_else(|| parsed.get("input"))
                            .cloned()
                            .unwrap_or(Value::Null);
                        out.push(ToolCallSummary {
                            name,
                            args_preview: truncate_text(&args.to_string(), 120),
                        });
                    }
                    Err(_) => out.push(ToolCallSummary {
                        name: "tool_call".to_string(),
                        args_preview: truncate_text(body, 120),
                    }),
                }
            }
        }
        _ => {}
    }
}

pub(crate) fn truncate_text(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        input.to_string()
    } else {
        let mut end = max_len;
        while !input.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &input[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fyreflow_types::{ProviderAuthMode, ProviderSettings, Step};

    fn request(role: &str, output_format: &str, kind: ProviderKind) -> InvocationRequest {
        let step: Step = serde_json::from_value(serde_json::json!({
            "id": "s1",
            "role": role,
            "output_format": output_format,
            "reasoning_effort": "high",
        }))
        .expect("step");
        InvocationRequest {
            step,
            provider: ProviderSettings {
                id: "p1".to_string(),
                kind,
                auth_mode: ProviderAuthMode::ApiKey,
                api_key: None,
                oauth_token: None,
                base_url: None,
                cli_path: None,
                default_model: "model-x".to_string(),
                disable_effort_beta: false,
            },
            context: "do the thing".to_string(),
            stage_timeout_ms: 60_000,
            orchestrator_prompt: None,
        }
    }

    #[test]
    fn orchestrator_disables_tools() {
        let argv = build_argv(&CliOptions::default(), &request("orchestrator", "markdown", ProviderKind::Claude), true);
        let tools_at = argv.iter().position(|a| a == "--tools").expect("tools flag");
        assert_eq!(argv[tools_at + 1], "");
    }

    #[test]
    fn review_json_gets_inline_schema() {
        let argv = build_argv(&CliOptions::default(), &request("review", "json", ProviderKind::Claude), true);
        assert!(argv.iter().any(|a| a == "--json-schema"));
        assert!(argv.contains(&"stream-json".to_string()));
    }

    #[test]
    fn executor_streams_tool_calls() {
        let argv = build_argv(&CliOptions::default(), &request("executor", "markdown", ProviderKind::Openai), true);
        assert!(argv.contains(&"stream-json".to_string()));
        assert!(!argv.iter().any(|a| a == "--json-schema"));
    }

    #[test]
    fn claude_safety_flags_are_present() {
        let argv = build_argv(&CliOptions::default(), &request("executor", "markdown", ProviderKind::Claude), true);
        for flag in [
            "--no-session-persistence",
            "--strict-mcp-config",
            "--disable-slash-commands",
            "--dangerously-skip-permissions",
        ] {
            assert!(argv.contains(&flag.to_string()), "missing {flag}");
        }
    }

    #[test]
    fn permission_mode_replaces_skip_permissions() {
        let options = CliOptions {
            permission_mode: Some(PermissionMode::BypassPermissions),
            ..Default::default()
        };
        let argv = build_argv(&options, &request("executor", "markdown", ProviderKind::Claude), true);
        assert!(argv.contains(&"--permission-mode".to_string()));
        assert!(!argv.contains(&"--dangerously-skip-permissions".to_string()));
    }

    #[test]
    fn compat_profile_drops_effort_flag() {
        let with = build_argv(&CliOptions::default(), &request("executor", "markdown", ProviderKind::Claude), true);
        let without = build_argv(&CliOptions::default(), &request("executor", "markdown", ProviderKind::Claude), false);
        assert!(with.contains(&"--effort".to_string()));
        assert!(!without.contains(&"--effort".to_string()));
    }

    #[test]
    fn unknown_option_stderr_is_detected() {
        assert!(UNKNOWN_OPTION.is_match("error: unknown option '--effort'"));
        assert!(UNKNOWN_OPTION.is_match("Unrecognized option: effort"));
        assert!(UNKNOWN_OPTION.is_match("error: Unknown argument --effort"));
        assert!(!UNKNOWN_OPTION.is_match("model not found"));
    }

    #[test]
    fn tool_use_records_are_extracted() {
        let value: Value = serde_json::from_str(
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"write_file","input":{"path":"frame-map.json"}}]}}"#,
        )
        .unwrap();
        let calls = extract_tool_calls(&value);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "write_file");
        assert!(calls[0].args_preview.contains("frame-map.json"));
    }

    #[test]
    fn stringified_tool_input_is_parsed() {
        let value: Value = serde_json::from_str(
            r#"{"type":"tool_use","name":"bash","tool_input":"{\"command\":\"ls\"}"}"#,
        )
        .unwrap();
        let calls = extract_tool_calls(&value);
        assert_eq!(calls[0].args_preview, r#"{"command":"ls"}"#);
    }

    #[test]
    fn xml_tool_call_islands_are_extracted() {
        let value: Value = serde_json::from_str(
            r#"{"type":"content_block_delta","delta":{"text":"<tool_call>{\"name\":\"read_file\",\"arguments\":{\"path\":\"a.txt\"}}</tool_call>"}}"#,
        )
        .unwrap();
        let calls = extract_tool_calls(&value);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "read_file");
    }

    #[test]
    fn stream_text_extraction_handles_delta_and_result() {
        let delta: Value =
            serde_json::from_str(r#"{"type":"content_block_delta","delta":{"text":"hi"}}"#).unwrap();
        assert_eq!(extract_stream_text(&delta).as_deref(), Some("hi"));
        let result: Value =
            serde_json::from_str(r#"{"type":"result","result":"WORKFLOW_STATUS: PASS"}"#).unwrap();
        assert_eq!(
            extract_stream_text(&result).as_deref(),
            Some("WORKFLOW_STATUS: PASS")
        );
    }
}
