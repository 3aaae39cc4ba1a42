//! Extracts the structured result contract from free-form model output.
//!
//! Models are asked to end their turn with a JSON object declaring
//! `workflow_status` and `next_action`, but real output arrives as prose,
//! fenced code blocks, or bare status markers. Resolution order: the whole
//! trimmed text as JSON, then each fenced ```json block, then the first
//! balanced object, then legacy `WORKFLOW_STATUS:` text markers.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use fyreflow_types::{
    ContractReason, ContractSource, GateContract, NextAction, WorkflowStatus,
};

static FENCED_JSON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```json\s*(.*?)```").expect("fenced json regex")
});

static STATUS_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bWORKFLOW_STATUS\s*[:=]\s*([A-Z_]+)").expect("status marker regex")
});

static HTML_REVIEW_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bHTML_REVIEW_STATUS\s*[:=]\s*([A-Z_]+)").expect("html review regex")
});

static PDF_REVIEW_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bPDF_REVIEW_STATUS\s*[:=]\s*([A-Z_]+)").expect("pdf review regex")
});

/// Strips markdown emphasis from lines carrying a status marker so that
/// `**WORKFLOW_STATUS: PASS**` and `WORKFLOW_STATUS: PASS` parse alike.
/// Idempotent by construction.
pub fn normalize_status_markers(text: &str) -> String {
    text.lines()
        .map(|line| {
            if line.to_ascii_uppercase().contains("STATUS") {
                line.replace(['*', '_', '`'], "")
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parses the result contract out of raw model output. Returns `None` when
/// neither a status-bearing JSON record nor a legacy marker is present.
pub fn parse(text: &str) -> Option<GateContract> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
        if let Some(contract) = contract_from_record(&map) {
            return Some(contract);
        }
    }

    for capture in FENCED_JSON.captures_iter(trimmed) {
        let body = capture.get(1).map(|m| m.as_str().trim()).unwrap_or("");
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body) {
            if let Some(contract) = contract_from_record(&map) {
                return Some(contract);
            }
        }
    }

    if let Some(candidate) = first_balanced_object(trimmed) {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&candidate) {
            if let Some(contract) = contract_from_record(&map) {
                return Some(contract);
            }
        }
    }

    let normalized = normalize_status_markers(trimmed);
    let status_word = STATUS_MARKER
        .captures(&normalized)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())?;
    let workflow_status = WorkflowStatus::parse(&status_word);
    let next_action = if workflow_status == WorkflowStatus::Fail {
        NextAction::RetryStep
    } else {
        NextAction::Continue
    };
    Some(GateContract {
        workflow_status,
        next_action,
        reasons: Vec::new(),
        summary: None,
        stage: None,
        step_role: None,
        gate_target: None,
        source: ContractSource::LegacyText,
    })
}

/// Reads a fixed set of keys out of a JSON record; arbitrary extra fields are
/// ignored. A record qualifies only when it carries a recognizable status
/// field (`workflow_status` / `workflowStatus` / `status`, case-insensitive).
fn contract_from_record(map: &Map<String, Value>) -> Option<GateContract> {
    let status_raw = string_field(map, &["workflow_status", "workflowstatus", "status"])?;
    let workflow_status = WorkflowStatus::parse(&status_raw);

    let next_action = string_field(map, &["next_action", "nextaction"])
        .map(|raw| NextAction::parse(&raw))
        .unwrap_or_default();

    let reasons = map
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("reasons"))
        .and_then(|(_, v)| v.as_array())
        .map(|items| items.iter().filter_map(reason_from_value).collect())
        .unwrap_or_default();

    Some(GateContract {
        workflow_status,
        next_action,
        reasons,
        summary: string_field(map, &["summary", "final_summary"]),
        stage: string_field(map, &["stage"]),
        step_role: string_field(map, &["step_role", "steprole"]),
        gate_target: string_field(map, &["gate_target", "gatetarget"]),
        source: ContractSource::Json,
    })
}

fn string_field(map: &Map<String, Value>, names: &[&str]) -> Option<String> {
    for (key, value) in map {
        let lowered = key.to_ascii_lowercase();
        if names.contains(&lowered.as_str()) {
            if let Some(text) = value.as_str() {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_string());
                }
            }
        }
    }
    None
}

fn reason_from_value(value: &Value) -> Option<ContractReason> {
    match value {
        Value::String(text) => Some(ContractReason {
            code: String::new(),
            message: text.clone(),
            severity: None,
        }),
        Value::Object(map) => Some(ContractReason {
            code: string_field(map, &["code"]).unwrap_or_default(),
            message: string_field(map, &["message", "detail", "reason"]).unwrap_or_default(),
            severity: string_field(map, &["severity"]),
        }),
        _ => None,
    }
}

/// Scans for the first balanced `{...}` region, aware of string quoting and
/// escapes, so `{"a": "}"}` embedded in prose is carved out intact.
pub fn first_balanced_object(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, byte) in bytes[start..].iter().enumerate() {
        match byte {
            _ if escaped => escaped = false,
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusSignals {
    pub workflow: Option<WorkflowStatus>,
    pub html_review: Option<WorkflowStatus>,
    pub pdf_review: Option<WorkflowStatus>,
}

/// Collects every status marker family present in the output. The workflow
/// signal prefers the JSON contract when one parses.
pub fn extract_status_signals(text: &str) -> StatusSignals {
    let normalized = normalize_status_markers(text);
    let marker = |regex: &Regex| {
        regex
            .captures(&normalized)
            .and_then(|c| c.get(1))
            .map(|m| WorkflowStatus::parse(m.as_str()))
    };
    let workflow = parse(text)
        .map(|c| c.workflow_status)
        .or_else(|| marker(&STATUS_MARKER));
    StatusSignals {
        workflow,
        html_review: marker(&HTML_REVIEW_MARKER),
        pdf_review: marker(&PDF_REVIEW_MARKER),
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputRequest {
    pub key: String,
    pub question: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputRequestSignal {
    pub requests: Vec<InputRequest>,
}

/// Detects a step asking the user for input, either through a
/// `NEEDS_INPUT` status or an `input_requests` array on any JSON record.
pub fn extract_input_request_signal(text: &str) -> Option<InputRequestSignal> {
    let mut requests = Vec::new();
    for record in json_records(text) {
        if let Some(items) = record
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("input_requests"))
            .and_then(|(_, v)| v.as_array())
        {
            for item in items {
                match item {
                    Value::String(key) => requests.push(InputRequest {
                        key: key.clone(),
                        question: String::new(),
                    }),
                    Value::Object(map) => requests.push(InputRequest {
                        key: string_field(map, &["key", "name", "id"]).unwrap_or_default(),
                        question: string_field(map, &["question", "prompt", "message"])
                            .unwrap_or_default(),
                    }),
                    _ => {}
                }
            }
        }
    }
    if !requests.is_empty() {
        return Some(InputRequestSignal { requests });
    }
    let needs_input = parse(text)
        .map(|c| c.workflow_status == WorkflowStatus::NeedsInput)
        .unwrap_or(false);
    if needs_input {
        return Some(InputRequestSignal::default());
    }
    None
}

fn json_records(text: &str) -> Vec<Map<String, Value>> {
    let trimmed = text.trim();
    let mut records = Vec::new();
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
        records.push(map);
    }
    for capture in FENCED_JSON.captures_iter(trimmed) {
        let body = capture.get(1).map(|m| m.as_str().trim()).unwrap_or("");
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body) {
            records.push(map);
        }
    }
    if records.is_empty() {
        if let Some(candidate) = first_balanced_object(trimmed) {
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&candidate) {
                records.push(map);
            }
        }
    }
    records
}

/// Picks the first English sentence from the contract's summary fields, or
/// synthesizes `workflow=X | next=Y` when nothing qualifies.
pub fn build_english_summary(contract: &GateContract) -> String {
    let mut candidates: Vec<&str> = Vec::new();
    if let Some(summary) = contract.summary.as_deref() {
        candidates.push(summary);
    }
    for reason in &contract.reasons {
        if !reason.message.is_empty() {
            candidates.push(&reason.message);
        }
    }
    for candidate in candidates {
        if let Some(sentence) = first_sentence(candidate) {
            if looks_english(&sentence) {
                return sentence;
            }
        }
    }
    format!(
        "workflow={} | next={}",
        contract.workflow_status.as_str(),
        contract.next_action.as_str()
    )
}

fn first_sentence(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    let end = trimmed
        .char_indices()
        .find(|(_, c)| matches!(c, '.' | '!' | '?' | '\n'))
        .map(|(i, c)| if c == '\n' { i } else { i + c.len_utf8() })
        .unwrap_or(trimmed.len());
    let sentence = trimmed[..end].trim().to_string();
    if sentence.is_empty() {
        None
    } else {
        Some(sentence)
    }
}

fn looks_english(text: &str) -> bool {
    let total = text.chars().count();
    if total == 0 {
        return false;
    }
    let latin = text
        .chars()
        .filter(|c| c.is_ascii_alphabetic() || c.is_ascii_whitespace() || c.is_ascii_punctuation())
        .count();
    latin * 10 >= total * 8 && text.split_ascii_whitespace().count() >= 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_text_json_wins() {
        let contract = parse(r#"{"workflow_status":"PASS","next_action":"continue"}"#)
            .expect("contract");
        assert_eq!(contract.workflow_status, WorkflowStatus::Pass);
        assert_eq!(contract.source, ContractSource::Json);
    }

    #[test]
    fn camel_case_status_key_is_recognized() {
        let contract = parse(r#"{"workflowStatus":"FAIL"}"#).expect("contract");
        assert_eq!(contract.workflow_status, WorkflowStatus::Fail);
    }

    #[test]
    fn fenced_block_is_used_when_prose_surrounds_it() {
        let text = "All done, see below.\n```json\n{\"workflow_status\": \"COMPLETE\", \"summary\": \"Deck delivered.\"}\n```\nThanks!";
        let contract = parse(text).expect("contract");
        assert_eq!(contract.workflow_status, WorkflowStatus::Complete);
        assert_eq!(contract.summary.as_deref(), Some("Deck delivered."));
    }

    #[test]
    fn balanced_object_with_braces_inside_strings() {
        let text = r#"Result: {"status": "PASS", "note": "kept {braces} and \"quotes\""} trailing"#;
        let contract = parse(text).expect("contract");
        assert_eq!(contract.workflow_status, WorkflowStatus::Pass);
        assert_eq!(contract.source, ContractSource::Json);
    }

    #[test]
    fn json_without_status_field_falls_through_to_markers() {
        let text = "{\"unrelated\": true}\nWORKFLOW_STATUS: FAIL";
        let contract = parse(text).expect("contract");
        assert_eq!(contract.workflow_status, WorkflowStatus::Fail);
        assert_eq!(contract.source, ContractSource::LegacyText);
        assert_eq!(contract.next_action, NextAction::RetryStep);
    }

    #[test]
    fn emphasized_marker_parses_like_plain_marker() {
        let plain = parse("WORKFLOW_STATUS: PASS").expect("plain");
        let bold = parse("**WORKFLOW_STATUS: PASS**").expect("bold");
        assert_eq!(plain.workflow_status, bold.workflow_status);
    }

    #[test]
    fn parse_is_idempotent_under_marker_normalization() {
        let text = "`WORKFLOW_STATUS`: **FAIL**\nretrying";
        let direct = parse(text).expect("direct");
        let normalized = parse(&normalize_status_markers(text)).expect("normalized");
        assert_eq!(direct.workflow_status, normalized.workflow_status);
        assert_eq!(direct.next_action, normalized.next_action);
    }

    #[test]
    fn unknown_extra_keys_are_ignored() {
        let contract = parse(
            r#"{"workflow_status":"PASS","confidence":0.93,"debug":{"tokens":512}}"#,
        )
        .expect("contract");
        assert_eq!(contract.workflow_status, WorkflowStatus::Pass);
    }

    #[test]
    fn reasons_accept_strings_and_records() {
        let contract = parse(
            r#"{"workflow_status":"FAIL","reasons":["missing artifact",{"code":"E_GATE","message":"regex gate failed","severity":"error"}]}"#,
        )
        .expect("contract");
        assert_eq!(contract.reasons.len(), 2);
        assert_eq!(contract.reasons[0].message, "missing artifact");
        assert_eq!(contract.reasons[1].code, "E_GATE");
        assert_eq!(contract.reasons[1].severity.as_deref(), Some("error"));
    }

    #[test]
    fn status_signals_pick_up_review_markers() {
        let signals = extract_status_signals(
            "WORKFLOW_STATUS: PASS\nHTML_REVIEW_STATUS: FAIL\nPDF_REVIEW_STATUS: PASS",
        );
        assert_eq!(signals.workflow, Some(WorkflowStatus::Pass));
        assert_eq!(signals.html_review, Some(WorkflowStatus::Fail));
        assert_eq!(signals.pdf_review, Some(WorkflowStatus::Pass));
    }

    #[test]
    fn input_requests_array_is_detected() {
        let signal = extract_input_request_signal(
            r#"{"workflow_status":"NEEDS_INPUT","input_requests":[{"key":"api_base","question":"Which API base URL?"}]}"#,
        )
        .expect("signal");
        assert_eq!(signal.requests.len(), 1);
        assert_eq!(signal.requests[0].key, "api_base");
    }

    #[test]
    fn bare_needs_input_marker_is_detected() {
        let signal = extract_input_request_signal("WORKFLOW_STATUS: NEEDS_INPUT").expect("signal");
        assert!(signal.requests.is_empty());
    }

    #[test]
    fn no_contract_in_plain_prose() {
        assert!(parse("I moved some files around and everything looks good.").is_none());
    }

    #[test]
    fn english_summary_prefers_summary_field() {
        let contract = parse(
            r#"{"workflow_status":"PASS","summary":"All twelve frames rendered cleanly. Details follow."}"#,
        )
        .expect("contract");
        assert_eq!(
            build_english_summary(&contract),
            "All twelve frames rendered cleanly."
        );
    }

    #[test]
    fn english_summary_synthesizes_when_nothing_qualifies() {
        let contract = parse(r#"{"workflow_status":"FAIL","summary":"全部失败了"}"#).expect("contract");
        assert_eq!(build_english_summary(&contract), "workflow=FAIL | next=continue");
    }
}
