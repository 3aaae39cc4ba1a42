use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::flow::ValidationIssue;

pub const MAX_TASK_CHARS: usize = 16_000;
pub const MAX_INPUT_KEYS: usize = 120;
pub const MAX_INPUT_VALUE_CHARS: usize = 4_000;
pub const MAX_SCENARIO_CHARS: usize = 80;

/// Sentinel value a caller may send instead of a secret; it is replaced from
/// the pipeline's secure-input store before the run is created.
pub const SECURE_INPUT_SENTINEL: &str = "[secure]";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StartRunRequest {
    #[serde(default)]
    pub task: String,
    #[serde(default)]
    pub inputs: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
}

/// Lowercases and collapses internal whitespace. `" Force  Rebuild "`
/// becomes `"force rebuild"`.
pub fn normalize_input_key(key: &str) -> String {
    key.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

impl StartRunRequest {
    pub fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        if self.task.trim().is_empty() {
            issues.push(ValidationIssue::new("task", "task cannot be empty"));
        }
        if self.task.chars().count() > MAX_TASK_CHARS {
            issues.push(ValidationIssue::new(
                "task",
                format!("task exceeds {MAX_TASK_CHARS} characters"),
            ));
        }
        if self.inputs.len() > MAX_INPUT_KEYS {
            issues.push(ValidationIssue::new(
                "inputs",
                format!("at most {MAX_INPUT_KEYS} input keys are accepted"),
            ));
        }
        for (key, value) in &self.inputs {
            if value.chars().count() > MAX_INPUT_VALUE_CHARS {
                issues.push(ValidationIssue::new(
                    format!("inputs.{key}"),
                    format!("value exceeds {MAX_INPUT_VALUE_CHARS} characters"),
                ));
            }
        }
        if let Some(scenario) = &self.scenario {
            if scenario.chars().count() > MAX_SCENARIO_CHARS {
                issues.push(ValidationIssue::new(
                    "scenario",
                    format!("scenario exceeds {MAX_SCENARIO_CHARS} characters"),
                ));
            }
        }
        issues
    }

    /// Returns the inputs with normalized keys. Later duplicates win, which
    /// matches JSON object semantics upstream.
    pub fn normalized_inputs(&self) -> HashMap<String, String> {
        self.inputs
            .iter()
            .map(|(k, v)| (normalize_input_key(k), v.clone()))
            .collect()
    }
}
