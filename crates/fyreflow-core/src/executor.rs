//! One attempt of one step: compose context, honor skip-if, snapshot
//! artifacts around the provider call, evaluate every contract layer, and
//! derive the attempt result the scheduler routes on.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use fyreflow_contract::InputRequest;
use fyreflow_providers::{
    InvocationRequest, InvokeError, ProviderCatalog, ProviderInvoker, RunLogSender,
};
use fyreflow_types::{
    has_blocking_failure, normalize_input_key, Flow, GateKind, GateResult, QualityGate, Step,
    StepRunStatus, WorkflowOutcome, WorkflowStatus, SECURE_INPUT_SENTINEL,
};

use crate::artifacts;
use crate::gates;
use crate::policy::{self, PolicyRegistry};
use crate::storage_paths::{StepStoragePaths, StorageRoots};

static NO_CACHE_PROMPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)runs?\s+every\s+time|no\s+cache").expect("no-cache regex"));

const DEFAULT_CONTEXT_TEMPLATE: &str = "{{task}}\n\n{{previous_output}}";
const DISABLED_STORAGE_MARKER: &str = "DISABLED";

pub struct AttemptInput<'a> {
    pub run_id: &'a str,
    pub pipeline_id: &'a str,
    pub task: &'a str,
    pub inputs: &'a HashMap<String, String>,
    pub flow: &'a Flow,
    pub step: &'a Step,
    pub previous_output: &'a str,
    pub orchestrator_prompt: Option<&'a str>,
    pub global_cache_bypass: bool,
}

#[derive(Debug, Default)]
pub struct StepAttemptResult {
    pub status: StepRunStatus,
    pub outcome: WorkflowOutcome,
    pub output: String,
    pub input_context: String,
    pub gate_results: Vec<GateResult>,
    pub blocking_failure: bool,
    pub should_stop_for_input: bool,
    pub input_requests: Vec<InputRequest>,
    pub manual_gates: Vec<QualityGate>,
    pub provider_fatal: Option<String>,
    pub aborted: bool,
    pub skipped_fresh: bool,
    pub delivery_complete: bool,
    pub summary: String,
    pub error: Option<String>,
}

pub struct StepExecutor {
    invoker: Arc<dyn ProviderInvoker>,
    catalog: ProviderCatalog,
    policies: PolicyRegistry,
    roots: StorageRoots,
}

impl StepExecutor {
    pub fn new(
        invoker: Arc<dyn ProviderInvoker>,
        catalog: ProviderCatalog,
        policies: PolicyRegistry,
        roots: StorageRoots,
    ) -> Self {
        Self {
            invoker,
            catalog,
            policies,
            roots,
        }
    }

    pub fn roots(&self) -> &StorageRoots {
        &self.roots
    }

    pub async fn execute_attempt(
        &self,
        input: &AttemptInput<'_>,
        cancel: CancellationToken,
        log: RunLogSender,
    ) -> StepAttemptResult {
        let step = input.step;
        let paths =
            StepStoragePaths::for_step(&self.roots, input.run_id, input.pipeline_id, step);
        let context = compose_context(step, input.task, input.previous_output, input.inputs, &paths);

        let profiles = self.policies.profiles_for_step(step);

        // Skip-if: reuse fresh artifacts instead of invoking the provider.
        if !step.skip_if_artifacts.is_empty() {
            let bypass = cache_bypass_reason(input, &self.policies, &profiles);
            if let Some(reason) = &bypass {
                let _ = log.send(format!("cache bypass for step `{}`: {reason}", step.id));
            } else {
                let snapshots =
                    artifacts::capture_all(&step.skip_if_artifacts, &paths, input.inputs);
                if snapshots.iter().all(|s| s.exists) {
                    let mut validation = policy::SkipValidation::ok();
                    for profile in &profiles {
                        validation = profile.validate_skip_if_artifacts(step, &snapshots);
                        if !validation.ok {
                            break;
                        }
                    }
                    if validation.ok {
                        let listed = snapshots
                            .iter()
                            .map(|s| s.template.clone())
                            .collect::<Vec<_>>()
                            .join(", ");
                        let _ = log.send(format!(
                            "step `{}` skipped: artifacts already fresh ({listed})",
                            step.id
                        ));
                        return StepAttemptResult {
                            status: StepRunStatus::Completed,
                            outcome: WorkflowOutcome::Pass,
                            output: format!("Reused cached artifacts: {listed}"),
                            input_context: context,
                            skipped_fresh: true,
                            summary: "reused cached artifacts".to_string(),
                            ..Default::default()
                        };
                    }
                    let _ = log.send(format!(
                        "skip_if_artifacts rejected for step `{}`: {}",
                        step.id,
                        validation.reason.unwrap_or_default()
                    ));
                }
            }
        }

        // Before snapshots: the step's own artifacts, skip-if set, and the
        // immutable-monitored templates owned by upstream analysis steps.
        let monitored_templates = policy::immutable_monitored_templates(input.flow, step);
        let required_before =
            artifacts::capture_all(&step.required_output_files, &paths, input.inputs);
        let monitored_before = artifacts::capture_all(&monitored_templates, &paths, input.inputs);
        let scripts_before = policy::scan_helper_scripts(&paths);

        let provider = match self.catalog.resolve(&step.provider_id).await {
            Ok(provider) => provider,
            Err(err) => {
                return provider_fatal_result(context, format!("{err:#}"));
            }
        };

        let request = InvocationRequest {
            step: step.clone(),
            provider,
            context: context.clone(),
            stage_timeout_ms: input.flow.runtime.stage_timeout_ms,
            orchestrator_prompt: input.orchestrator_prompt.map(|s| s.to_string()),
        };
        let output = match self.invoker.invoke(&request, cancel, log.clone()).await {
            Ok(output) => output,
            Err(InvokeError::Aborted) => {
                return StepAttemptResult {
                    status: StepRunStatus::Failed,
                    input_context: context,
                    aborted: true,
                    ..Default::default()
                };
            }
            Err(err) => {
                return provider_fatal_result(context, err.to_string());
            }
        };

        let required_after =
            artifacts::capture_all(&step.required_output_files, &paths, input.inputs);
        let monitored_after = artifacts::capture_all(&monitored_templates, &paths, input.inputs);
        let scripts_after = policy::scan_helper_scripts(&paths);

        let mut gate_results =
            gates::evaluate_step_contracts(step, &output, &paths, input.inputs);
        let flow_gates = input.flow.gates_for_step(&step.id);
        let (pipeline_results, manual_gates) =
            gates::evaluate_pipeline_gates(&flow_gates, step, &output, &paths, input.inputs);
        gate_results.extend(pipeline_results);

        let mut contract_snapshots = required_after.clone();
        for snapshot in artifacts::capture_all(&step.skip_if_artifacts, &paths, input.inputs) {
            if !contract_snapshots.iter().any(|s| s.template == snapshot.template) {
                contract_snapshots.push(snapshot);
            }
        }
        for profile in &profiles {
            gate_results.extend(profile.evaluate_artifact_contracts(step, &contract_snapshots));
        }

        if let Some(result) =
            policy::evaluate_helper_script_guard(step, &scripts_before, &scripts_after)
        {
            gate_results.push(result);
        }
        gate_results.extend(policy::evaluate_immutable_guard(
            step,
            &monitored_before,
            &monitored_after,
        ));
        gate_results.extend(policy::evaluate_freshness_guard(
            &required_before,
            &required_after,
        ));

        let contract = fyreflow_contract::parse(&output);
        let input_signal = fyreflow_contract::extract_input_request_signal(&output);

        // COMPLETE is only honored on the resolved delivery step.
        let delivery_id = input.flow.delivery_step_id();
        let declares_complete = contract
            .as_ref()
            .map(|c| c.workflow_status == WorkflowStatus::Complete)
            .unwrap_or(false);
        let is_delivery_step = delivery_id.as_deref() == Some(step.id.as_str());
        if declares_complete && !is_delivery_step {
            gate_results.push(GateResult::fail(
                "invariant:delivery_completion",
                "Delivery completion target invariant",
                GateKind::RegexMustMatch,
                true,
                format!(
                    "step `{}` declared COMPLETE but the delivery step is `{}`",
                    step.id,
                    delivery_id.as_deref().unwrap_or("unresolved")
                ),
            ));
        }

        let blocking_failure = has_blocking_failure(&gate_results);
        let contract_outcome = contract
            .as_ref()
            .map(|c| c.workflow_status.outcome())
            .unwrap_or(WorkflowOutcome::Neutral);
        let outcome = if blocking_failure {
            WorkflowOutcome::Fail
        } else {
            contract_outcome
        };
        let summary = contract
            .as_ref()
            .map(fyreflow_contract::build_english_summary)
            .unwrap_or_else(|| "no status contract found in output".to_string());

        StepAttemptResult {
            status: if blocking_failure {
                StepRunStatus::Failed
            } else {
                StepRunStatus::Completed
            },
            outcome,
            output,
            input_context: context,
            gate_results,
            blocking_failure,
            should_stop_for_input: input_signal.is_some(),
            input_requests: input_signal.map(|s| s.requests).unwrap_or_default(),
            manual_gates,
            provider_fatal: None,
            aborted: false,
            skipped_fresh: false,
            delivery_complete: declares_complete && is_delivery_step && !blocking_failure,
            summary,
            error: None,
        }
    }
}

fn provider_fatal_result(context: String, detail: String) -> StepAttemptResult {
    StepAttemptResult {
        status: StepRunStatus::Failed,
        input_context: context,
        provider_fatal: Some(detail.clone()),
        error: Some(detail),
        ..Default::default()
    }
}

/// Substitutes the context template. Secret-looking inputs are redacted
/// before they can reach a provider or the run log.
pub fn compose_context(
    step: &Step,
    task: &str,
    previous_output: &str,
    inputs: &HashMap<String, String>,
    paths: &StepStoragePaths,
) -> String {
    let template = if step.context_template.trim().is_empty() {
        DEFAULT_CONTEXT_TEMPLATE
    } else {
        &step.context_template
    };
    let mut context = template
        .replace("{{task}}", task)
        .replace("{{previous_output}}", previous_output)
        .replace(
            artifacts::SHARED_STORAGE_TEMPLATE,
            &paths
                .shared
                .as_ref()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_else(|| DISABLED_STORAGE_MARKER.to_string()),
        )
        .replace(
            artifacts::ISOLATED_STORAGE_TEMPLATE,
            &paths
                .isolated
                .as_ref()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_else(|| DISABLED_STORAGE_MARKER.to_string()),
        )
        .replace(
            artifacts::RUN_STORAGE_TEMPLATE,
            &paths.run.to_string_lossy(),
        );
    for (key, value) in inputs {
        let needle = format!("{{{{input.{key}}}}}");
        if !context.contains(&needle) {
            continue;
        }
        let substituted = if fyreflow_observability::is_secret_key(key)
            || value == SECURE_INPUT_SENTINEL
        {
            "[redacted]".to_string()
        } else {
            value.clone()
        };
        context = context.replace(&needle, &substituted);
    }
    context
}

/// Returns the reason the artifact cache must be bypassed, if any.
fn cache_bypass_reason(
    input: &AttemptInput<'_>,
    registry: &PolicyRegistry,
    profiles: &[Arc<dyn policy::PolicyProfile>],
) -> Option<String> {
    if input.global_cache_bypass {
        return Some("step cache disabled globally".to_string());
    }
    let step = input.step;
    let bypass_keys = registry.merged_cache_bypass_input_keys(step, profiles);
    for key in input.inputs.keys() {
        let normalized = normalize_input_key(key);
        if normalized == "force_rebuild" || bypass_keys.contains(&normalized) {
            let value = input.inputs.get(key).map(String::as_str).unwrap_or("");
            if !matches!(value.trim(), "" | "0" | "false" | "no") {
                return Some(format!("input `{normalized}` requests a rebuild"));
            }
        }
    }
    if NO_CACHE_PROMPT.is_match(&step.prompt) {
        return Some("step prompt opts out of caching".to_string());
    }
    if let Some(orchestrator_prompt) = input.orchestrator_prompt {
        for pattern in registry.merged_orchestrator_prompt_patterns(step, profiles) {
            let Ok(regex) = Regex::new(&pattern) else {
                continue;
            };
            if regex.is_match(orchestrator_prompt) {
                return Some(format!("orchestrator prompt matched `{pattern}`"));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(json: serde_json::Value) -> Step {
        serde_json::from_value(json).expect("step")
    }

    fn paths(dir: &std::path::Path) -> StepStoragePaths {
        let roots = StorageRoots::new(dir);
        StepStoragePaths::for_step(&roots, "r1", "p1", &step(serde_json::json!({ "id": "s1" })))
    }

    #[test]
    fn context_substitutes_all_placeholders() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = step(serde_json::json!({
            "id": "s1",
            "context_template": "Task: {{task}}\nPrev: {{previous_output}}\nShared: {{shared_storage_path}}\nTheme: {{input.theme}}",
        }));
        let mut inputs = HashMap::new();
        inputs.insert("theme".to_string(), "dark".to_string());
        let context = compose_context(&s, "build", "earlier", &inputs, &paths(dir.path()));
        assert!(context.contains("Task: build"));
        assert!(context.contains("Prev: earlier"));
        assert!(context.contains("Theme: dark"));
        assert!(context.contains("shared/p1"));
    }

    #[test]
    fn secret_inputs_are_redacted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = step(serde_json::json!({
            "id": "s1",
            "context_template": "key={{input.api_key}} plain={{input.city}} pending={{input.city_secure}}",
        }));
        let mut inputs = HashMap::new();
        inputs.insert("api_key".to_string(), "sk-live-visible".to_string());
        inputs.insert("city".to_string(), "lisbon".to_string());
        inputs.insert("city_secure".to_string(), "[secure]".to_string());
        let context = compose_context(&s, "t", "", &inputs, &paths(dir.path()));
        assert!(!context.contains("sk-live-visible"));
        assert!(context.contains("plain=lisbon"));
        assert!(context.contains("pending=[redacted]"));
    }

    #[test]
    fn disabled_shared_storage_renders_disabled_marker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = step(serde_json::json!({
            "id": "s1",
            "enable_shared_storage": false,
            "context_template": "root={{shared_storage_path}}",
        }));
        let roots = StorageRoots::new(dir.path());
        let step_paths = StepStoragePaths::for_step(&roots, "r1", "p1", &s);
        let context = compose_context(&s, "t", "", &HashMap::new(), &step_paths);
        assert_eq!(context, "root=DISABLED");
    }

    #[test]
    fn no_cache_prompt_wording_bypasses_skip() {
        let s = step(serde_json::json!({
            "id": "s1",
            "prompt": "This extraction runs every time; results feed the deck.",
            "skip_if_artifacts": ["frame-map.json"],
        }));
        let flow: Flow = serde_json::from_value(serde_json::json!({
            "id": "f", "steps": [{ "id": "s1" }], "links": [],
        }))
        .expect("flow");
        let inputs = HashMap::new();
        let registry = PolicyRegistry::with_builtins();
        let input = AttemptInput {
            run_id: "r1",
            pipeline_id: "p1",
            task: "t",
            inputs: &inputs,
            flow: &flow,
            step: &s,
            previous_output: "",
            orchestrator_prompt: None,
            global_cache_bypass: false,
        };
        let profiles = registry.profiles_for_step(&s);
        let reason = cache_bypass_reason(&input, &registry, &profiles).expect("bypass");
        assert!(reason.contains("opts out of caching"));
    }

    #[test]
    fn force_rebuild_input_bypasses_cache_unless_falsy() {
        let s = step(serde_json::json!({ "id": "s1", "skip_if_artifacts": ["x"] }));
        let flow: Flow = serde_json::from_value(serde_json::json!({
            "id": "f", "steps": [{ "id": "s1" }], "links": [],
        }))
        .expect("flow");
        let registry = PolicyRegistry::with_builtins();
        let profiles = registry.profiles_for_step(&s);

        let mut inputs = HashMap::new();
        inputs.insert("Force Rebuild".to_string(), "yes".to_string());
        let input = AttemptInput {
            run_id: "r1",
            pipeline_id: "p1",
            task: "t",
            inputs: &inputs,
            flow: &flow,
            step: &s,
            previous_output: "",
            orchestrator_prompt: None,
            global_cache_bypass: false,
        };
        assert!(cache_bypass_reason(&input, &registry, &profiles).is_some());

        let mut falsy = HashMap::new();
        falsy.insert("force_rebuild".to_string(), "false".to_string());
        let input = AttemptInput {
            inputs: &falsy,
            ..input
        };
        assert!(cache_bypass_reason(&input, &registry, &profiles).is_none());
    }

    #[test]
    fn orchestrator_prompt_pattern_bypasses_cache() {
        let s = step(serde_json::json!({
            "id": "s1",
            "skip_if_artifacts": ["frame-map.json"],
            "cache_bypass_orchestrator_prompt_patterns": ["(?i)rebuild\\s+the\\s+frames"],
        }));
        let flow: Flow = serde_json::from_value(serde_json::json!({
            "id": "f", "steps": [{ "id": "s1" }], "links": [],
        }))
        .expect("flow");
        let registry = PolicyRegistry::with_builtins();
        let profiles = registry.profiles_for_step(&s);
        let inputs = HashMap::new();
        let input = AttemptInput {
            run_id: "r1",
            pipeline_id: "p1",
            task: "t",
            inputs: &inputs,
            flow: &flow,
            step: &s,
            previous_output: "",
            orchestrator_prompt: Some("Please rebuild the frames from the new export."),
            global_cache_bypass: false,
        };
        assert!(cache_bypass_reason(&input, &registry, &profiles).is_some());
    }
}
