//! Quality-gate evaluation: step contracts derived from the step definition
//! and pipeline gates declared on the flow. Manual-approval gates are not
//! evaluated here; they are raised to the scheduler.

use std::collections::HashMap;

use regex::RegexBuilder;
use serde_json::{json, Value};

use fyreflow_types::{GateKind, GateResult, OutputFormat, QualityGate, Step};

use crate::artifacts;
use crate::storage_paths::StepStoragePaths;

const ALLOWED_REGEX_FLAGS: &str = "gimsuy";

/// Parses the step output into the JSON object gate checks run against:
/// the whole output when it parses, otherwise the first balanced object.
pub fn resolve_output_json(output: &str) -> Option<Value> {
    let trimmed = output.trim();
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    let candidate = fyreflow_contract::first_balanced_object(trimmed)?;
    match serde_json::from_str::<Value>(&candidate) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

/// Walks a dotted path (`assets.frames.0.path`) through objects and arrays.
pub fn lookup_dotted_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        if segment.is_empty() {
            return None;
        }
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Contracts implied by the step definition itself. All of these block.
pub fn evaluate_step_contracts(
    step: &Step,
    output: &str,
    paths: &StepStoragePaths,
    inputs: &HashMap<String, String>,
) -> Vec<GateResult> {
    let mut results = Vec::new();
    let output_json = resolve_output_json(output);

    if step.output_format == OutputFormat::Json {
        match &output_json {
            Some(_) => results.push(GateResult::pass(
                "step:output_format",
                "JSON output contract",
                GateKind::JsonFieldExists,
                "output parses as a JSON object",
            )),
            None => results.push(GateResult::fail(
                "step:output_format",
                "JSON output contract",
                GateKind::JsonFieldExists,
                true,
                "step is declared output_format=json but the output is not a JSON object",
            )),
        }
    }

    for field in &step.required_output_fields {
        let gate_id = format!("step:field:{field}");
        let found = output_json
            .as_ref()
            .and_then(|json| lookup_dotted_path(json, field))
            .is_some();
        if found {
            results.push(GateResult::pass(
                &gate_id,
                "required output field",
                GateKind::JsonFieldExists,
                format!("field `{field}` present"),
            ));
        } else {
            results.push(GateResult::fail(
                &gate_id,
                "required output field",
                GateKind::JsonFieldExists,
                true,
                format!("required field `{field}` missing from JSON output"),
            ));
        }
    }

    for template in &step.required_output_files {
        let gate_id = format!("step:file:{template}");
        let resolution = artifacts::resolve(template, paths, inputs);
        if resolution.exists {
            results.push(
                GateResult::pass(
                    &gate_id,
                    "required output file",
                    GateKind::ArtifactExists,
                    format!("artifact `{template}` present"),
                )
                .with_details(json!({
                    "found_path": resolution.found_path,
                    "size_bytes": resolution.size_bytes,
                })),
            );
        } else if resolution.disabled_storage {
            results.push(
                GateResult::fail(
                    &gate_id,
                    "required output file",
                    GateKind::ArtifactExists,
                    true,
                    format!(
                        "artifact `{template}` references a storage mode this step has disabled"
                    ),
                )
                .with_details(json!({ "disabled_storage": true })),
            );
        } else {
            results.push(
                GateResult::fail(
                    &gate_id,
                    "required output file",
                    GateKind::ArtifactExists,
                    true,
                    format!("required artifact `{template}` was not produced"),
                )
                .with_details(json!({ "candidates": resolution.candidate_paths })),
            );
        }
    }

    results
}

/// Splits the flow's gates for this step into evaluated results and the
/// manual-approval gates the scheduler must turn into approvals.
pub fn evaluate_pipeline_gates(
    gates: &[&QualityGate],
    step: &Step,
    output: &str,
    paths: &StepStoragePaths,
    inputs: &HashMap<String, String>,
) -> (Vec<GateResult>, Vec<QualityGate>) {
    let mut results = Vec::new();
    let mut manual = Vec::new();
    let output_json = resolve_output_json(output);

    for gate in gates {
        match gate.kind {
            GateKind::ManualApproval => manual.push((*gate).clone()),
            GateKind::RegexMustMatch | GateKind::RegexMustNotMatch => {
                results.push(evaluate_regex_gate(gate, output));
            }
            GateKind::JsonFieldExists => {
                let found = output_json
                    .as_ref()
                    .and_then(|json| lookup_dotted_path(json, gate.json_path.trim()))
                    .is_some();
                if found {
                    results.push(GateResult::pass(
                        &gate.id,
                        gate.display_name(),
                        gate.kind,
                        format!("json path `{}` present", gate.json_path),
                    ));
                } else {
                    let message = if output_json.is_none() {
                        "output is not JSON; json_field_exists gate cannot pass".to_string()
                    } else {
                        format!("json path `{}` missing", gate.json_path)
                    };
                    results.push(GateResult::fail(
                        &gate.id,
                        gate.display_name(),
                        gate.kind,
                        gate.blocking,
                        message,
                    ));
                }
            }
            GateKind::ArtifactExists => {
                let resolution = artifacts::resolve(gate.artifact_path.trim(), paths, inputs);
                if resolution.exists {
                    results.push(
                        GateResult::pass(
                            &gate.id,
                            gate.display_name(),
                            gate.kind,
                            format!("artifact `{}` present", gate.artifact_path),
                        )
                        .with_details(json!({ "found_path": resolution.found_path })),
                    );
                } else if resolution.disabled_storage {
                    results.push(
                        GateResult::fail(
                            &gate.id,
                            gate.display_name(),
                            gate.kind,
                            gate.blocking,
                            format!(
                                "artifact `{}` references a storage mode step `{}` has disabled",
                                gate.artifact_path, step.id
                            ),
                        )
                        .with_details(json!({ "disabled_storage": true })),
                    );
                } else {
                    results.push(GateResult::fail(
                        &gate.id,
                        gate.display_name(),
                        gate.kind,
                        gate.blocking,
                        format!("artifact `{}` not found", gate.artifact_path),
                    ));
                }
            }
        }
    }
    (results, manual)
}

fn evaluate_regex_gate(gate: &QualityGate, output: &str) -> GateResult {
    if gate.pattern.is_empty() {
        return GateResult::fail(
            &gate.id,
            gate.display_name(),
            gate.kind,
            gate.blocking,
            "gate has an empty pattern",
        );
    }
    if let Some(bad) = gate
        .flags
        .chars()
        .find(|c| !ALLOWED_REGEX_FLAGS.contains(*c))
    {
        return GateResult::fail(
            &gate.id,
            gate.display_name(),
            gate.kind,
            gate.blocking,
            format!("unsupported regex flag `{bad}`"),
        );
    }
    let mut builder = RegexBuilder::new(&gate.pattern);
    builder
        .case_insensitive(gate.flags.contains('i'))
        .multi_line(gate.flags.contains('m'))
        .dot_matches_new_line(gate.flags.contains('s'));
    let regex = match builder.build() {
        Ok(regex) => regex,
        Err(err) => {
            return GateResult::fail(
                &gate.id,
                gate.display_name(),
                gate.kind,
                gate.blocking,
                format!("pattern does not compile: {err}"),
            )
        }
    };
    let matched = regex.is_match(output);
    let wanted = gate.kind == GateKind::RegexMustMatch;
    if matched == wanted {
        GateResult::pass(
            &gate.id,
            gate.display_name(),
            gate.kind,
            if wanted {
                format!("pattern `{}` matched", gate.pattern)
            } else {
                format!("pattern `{}` absent as required", gate.pattern)
            },
        )
    } else {
        let message = if gate.message.trim().is_empty() {
            if wanted {
                format!("pattern `{}` did not match the output", gate.pattern)
            } else {
                format!("forbidden pattern `{}` matched the output", gate.pattern)
            }
        } else {
            gate.message.clone()
        };
        GateResult::fail(&gate.id, gate.display_name(), gate.kind, gate.blocking, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_paths::StorageRoots;
    use fyreflow_types::GateResultStatus;

    fn step(json: serde_json::Value) -> Step {
        serde_json::from_value(json).expect("step")
    }

    fn paths(dir: &std::path::Path) -> StepStoragePaths {
        let roots = StorageRoots::new(dir);
        StepStoragePaths::for_step(
            &roots,
            "r1",
            "p1",
            &step(serde_json::json!({ "id": "s1" })),
        )
    }

    fn gate(kind: &str, json: serde_json::Value) -> QualityGate {
        let mut value = json;
        value["id"] = serde_json::json!("g1");
        value["kind"] = serde_json::json!(kind);
        serde_json::from_value(value).expect("gate")
    }

    #[test]
    fn json_step_with_markdown_output_blocks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = step(serde_json::json!({ "id": "s1", "output_format": "json" }));
        let results =
            evaluate_step_contracts(&s, "not json at all", &paths(dir.path()), &HashMap::new());
        assert!(results[0].is_blocking_failure());
    }

    #[test]
    fn required_field_checks_dotted_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = step(serde_json::json!({
            "id": "s1",
            "required_output_fields": ["report.verdict", "report.missing"],
        }));
        let results = evaluate_step_contracts(
            &s,
            r#"{"report": {"verdict": "ok"}}"#,
            &paths(dir.path()),
            &HashMap::new(),
        );
        assert_eq!(results[0].status, GateResultStatus::Pass);
        assert!(results[1].is_blocking_failure());
    }

    #[test]
    fn required_file_missing_blocks_with_candidates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = step(serde_json::json!({
            "id": "s1",
            "required_output_files": ["frame-map.json"],
        }));
        let results = evaluate_step_contracts(&s, "", &paths(dir.path()), &HashMap::new());
        assert!(results[0].is_blocking_failure());
        assert!(results[0].details.get("candidates").is_some());
    }

    #[test]
    fn disabled_storage_fails_with_note_not_a_crash() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = step(serde_json::json!({
            "id": "s1",
            "enable_shared_storage": false,
            "required_output_files": ["{{shared_storage_path}}/out.json"],
        }));
        let roots = StorageRoots::new(dir.path());
        let step_paths = StepStoragePaths::for_step(&roots, "r1", "p1", &s);
        let results = evaluate_step_contracts(&s, "", &step_paths, &HashMap::new());
        assert!(results[0].is_blocking_failure());
        assert_eq!(results[0].details["disabled_storage"], true);
    }

    #[test]
    fn regex_must_match_with_case_flag() {
        let g = gate(
            "regex_must_match",
            serde_json::json!({ "pattern": "workflow_status:\\s*pass", "flags": "i" }),
        );
        let result = evaluate_regex_gate(&g, "WORKFLOW_STATUS: PASS");
        assert_eq!(result.status, GateResultStatus::Pass);
    }

    #[test]
    fn regex_must_not_match_fails_on_match() {
        let g = gate(
            "regex_must_not_match",
            serde_json::json!({ "pattern": "TODO", "blocking": true }),
        );
        let result = evaluate_regex_gate(&g, "TODO: fix this");
        assert!(result.is_blocking_failure());
    }

    #[test]
    fn empty_pattern_fails() {
        let g = gate("regex_must_match", serde_json::json!({ "pattern": "" }));
        let result = evaluate_regex_gate(&g, "anything");
        assert_eq!(result.status, GateResultStatus::Fail);
    }

    #[test]
    fn unsupported_flag_fails() {
        let g = gate(
            "regex_must_match",
            serde_json::json!({ "pattern": "x", "flags": "gx" }),
        );
        let result = evaluate_regex_gate(&g, "x");
        assert!(result.message.contains("unsupported regex flag"));
    }

    #[test]
    fn json_field_gate_fails_on_non_json_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let g = gate(
            "json_field_exists",
            serde_json::json!({ "json_path": "a.b", "blocking": true }),
        );
        let s = step(serde_json::json!({ "id": "s1" }));
        let (results, _) = evaluate_pipeline_gates(
            &[&g],
            &s,
            "plain text",
            &paths(dir.path()),
            &HashMap::new(),
        );
        assert!(results[0].is_blocking_failure());
        assert!(results[0].message.contains("not JSON"));
    }

    #[test]
    fn manual_approval_gates_are_raised_not_evaluated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let g = gate("manual_approval", serde_json::json!({ "name": "sign-off" }));
        let s = step(serde_json::json!({ "id": "s1" }));
        let (results, manual) =
            evaluate_pipeline_gates(&[&g], &s, "", &paths(dir.path()), &HashMap::new());
        assert!(results.is_empty());
        assert_eq!(manual.len(), 1);
        assert_eq!(manual[0].name, "sign-off");
    }
}
