use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Role a step plays inside a flow. Unknown values round-trip to
/// [`StepRole::Executor`] instead of failing deserialization.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepRole {
    Analysis,
    Planner,
    Orchestrator,
    Executor,
    Tester,
    Review,
}

impl StepRole {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "analysis" => Self::Analysis,
            "planner" => Self::Planner,
            "orchestrator" => Self::Orchestrator,
            "tester" => Self::Tester,
            "review" => Self::Review,
            _ => Self::Executor,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::Planner => "planner",
            Self::Orchestrator => "orchestrator",
            Self::Executor => "executor",
            Self::Tester => "tester",
            Self::Review => "review",
        }
    }

    /// Roles whose declared artifacts are treated as immutable once written.
    pub fn owns_immutable_artifacts(self) -> bool {
        matches!(self, Self::Analysis)
    }
}

impl Default for StepRole {
    fn default() -> Self {
        Self::Executor
    }
}

impl<'de> Deserialize<'de> for StepRole {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Markdown,
    Json,
}

impl OutputFormat {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Markdown,
        }
    }
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::Markdown
    }
}

impl<'de> Deserialize<'de> for OutputFormat {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

/// Edge condition on a link. Empty or unknown strings coerce to `Always`.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LinkCondition {
    Always,
    OnPass,
    OnFail,
}

impl LinkCondition {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "on_pass" => Self::OnPass,
            "on_fail" => Self::OnFail,
            _ => Self::Always,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::OnPass => "on_pass",
            Self::OnFail => "on_fail",
        }
    }
}

impl Default for LinkCondition {
    fn default() -> Self {
        Self::Always
    }
}

impl<'de> Deserialize<'de> for LinkCondition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    RegexMustMatch,
    RegexMustNotMatch,
    JsonFieldExists,
    ArtifactExists,
    ManualApproval,
}

impl GateKind {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "regex_must_not_match" => Self::RegexMustNotMatch,
            "json_field_exists" => Self::JsonFieldExists,
            "artifact_exists" => Self::ArtifactExists,
            "manual_approval" => Self::ManualApproval,
            _ => Self::RegexMustMatch,
        }
    }

    pub fn is_known(value: &str) -> bool {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "regex_must_match"
                | "regex_must_not_match"
                | "json_field_exists"
                | "artifact_exists"
                | "manual_approval"
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RegexMustMatch => "regex_must_match",
            Self::RegexMustNotMatch => "regex_must_not_match",
            Self::JsonFieldExists => "json_field_exists",
            Self::ArtifactExists => "artifact_exists",
            Self::ManualApproval => "manual_approval",
        }
    }
}

impl Default for GateKind {
    fn default() -> Self {
        Self::RegexMustMatch
    }
}

impl<'de> Deserialize<'de> for GateKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub role: StepRole,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub provider_id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub reasoning_effort: String,
    #[serde(default)]
    pub context_template: String,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub required_output_fields: Vec<String>,
    #[serde(default)]
    pub required_output_files: Vec<String>,
    #[serde(default)]
    pub skip_if_artifacts: Vec<String>,
    #[serde(default)]
    pub scenarios: Vec<String>,
    #[serde(default)]
    pub policy_profile_ids: Vec<String>,
    #[serde(default)]
    pub cache_bypass_input_keys: Vec<String>,
    #[serde(default)]
    pub cache_bypass_orchestrator_prompt_patterns: Vec<String>,
    #[serde(default)]
    pub fast_mode: bool,
    #[serde(default)]
    pub use_1m_context: bool,
    #[serde(default)]
    pub context_window_tokens: u64,
    #[serde(default)]
    pub enable_isolated_storage: bool,
    #[serde(default = "default_true")]
    pub enable_shared_storage: bool,
    #[serde(default)]
    pub enabled_mcp_server_ids: Vec<String>,
    #[serde(default)]
    pub enable_delegation: bool,
    #[serde(default)]
    pub delegation_count: u32,
}

fn default_true() -> bool {
    true
}

impl Step {
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Link {
    pub source_step_id: String,
    pub target_step_id: String,
    #[serde(default)]
    pub condition: LinkCondition,
}

pub const MAX_LOOPS_RANGE: (u32, u32) = (0, 12);
pub const MAX_STEP_EXECUTIONS_RANGE: (u32, u32) = (4, 120);
pub const STAGE_TIMEOUT_MS_RANGE: (u64, u64) = (10_000, 18_000_000);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeLimits {
    #[serde(default = "default_max_loops")]
    pub max_loops: u32,
    #[serde(default = "default_max_step_executions")]
    pub max_step_executions: u32,
    #[serde(default = "default_stage_timeout_ms")]
    pub stage_timeout_ms: u64,
}

fn default_max_loops() -> u32 {
    2
}

fn default_max_step_executions() -> u32 {
    24
}

fn default_stage_timeout_ms() -> u64 {
    1_800_000
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        Self {
            max_loops: default_max_loops(),
            max_step_executions: default_max_step_executions(),
            stage_timeout_ms: default_stage_timeout_ms(),
        }
    }
}

impl RuntimeLimits {
    /// Clamps every limit into its documented range and keeps
    /// `max_step_executions >= max_loops + 1`.
    pub fn clamped(&self) -> Self {
        let max_loops = self.max_loops.clamp(MAX_LOOPS_RANGE.0, MAX_LOOPS_RANGE.1);
        let max_step_executions = self
            .max_step_executions
            .clamp(MAX_STEP_EXECUTIONS_RANGE.0, MAX_STEP_EXECUTIONS_RANGE.1)
            .max(max_loops + 1);
        Self {
            max_loops,
            max_step_executions,
            stage_timeout_ms: self
                .stage_timeout_ms
                .clamp(STAGE_TIMEOUT_MS_RANGE.0, STAGE_TIMEOUT_MS_RANGE.1),
        }
    }
}

pub const ANY_STEP_TARGET: &str = "any_step";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityGate {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_gate_target")]
    pub target_step_id: String,
    #[serde(default)]
    pub kind: GateKind,
    #[serde(default = "default_true")]
    pub blocking: bool,
    #[serde(default)]
    pub pattern: String,
    #[serde(default)]
    pub flags: String,
    #[serde(default)]
    pub json_path: String,
    #[serde(default)]
    pub artifact_path: String,
    #[serde(default)]
    pub message: String,
}

fn default_gate_target() -> String {
    ANY_STEP_TARGET.to_string()
}

impl QualityGate {
    pub fn applies_to(&self, step_id: &str) -> bool {
        self.target_step_id == ANY_STEP_TARGET || self.target_step_id == step_id
    }

    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// A declarative pipeline definition. Unknown fields on the outer object are
/// preserved through `extra`; unknown fields on steps, links, and gates are
/// dropped on load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Flow {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub links: Vec<Link>,
    #[serde(default)]
    pub runtime: RuntimeLimits,
    #[serde(default)]
    pub quality_gates: Vec<QualityGate>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Flow {
    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn outgoing_links(&self, step_id: &str) -> Vec<&Link> {
        self.links
            .iter()
            .filter(|l| l.source_step_id == step_id)
            .collect()
    }

    pub fn has_outgoing_links(&self, step_id: &str) -> bool {
        self.links.iter().any(|l| l.source_step_id == step_id)
    }

    pub fn has_incoming_links(&self, step_id: &str) -> bool {
        self.links.iter().any(|l| l.target_step_id == step_id)
    }

    pub fn gates_for_step(&self, step_id: &str) -> Vec<&QualityGate> {
        self.quality_gates
            .iter()
            .filter(|g| g.applies_to(step_id))
            .collect()
    }

    /// The terminal step eligible to emit `COMPLETE`. Preference order:
    /// last terminal executor, last terminal step, last executor, last step.
    pub fn delivery_step_id(&self) -> Option<String> {
        let terminal: Vec<&Step> = self
            .steps
            .iter()
            .filter(|s| !self.has_outgoing_links(&s.id))
            .collect();
        if let Some(step) = terminal
            .iter()
            .rev()
            .find(|s| s.role == StepRole::Executor)
        {
            return Some(step.id.clone());
        }
        if let Some(step) = terminal.last() {
            return Some(step.id.clone());
        }
        if let Some(step) = self
            .steps
            .iter()
            .rev()
            .find(|s| s.role == StepRole::Executor)
        {
            return Some(step.id.clone());
        }
        self.steps.last().map(|s| s.id.clone())
    }
}

/// Trims identifiers, clamps runtime limits, and retargets delivery-completion
/// gates. Idempotent: `normalize(normalize(flow)) == normalize(flow)`.
pub fn normalize_flow(flow: &mut Flow) {
    flow.id = flow.id.trim().to_string();
    flow.name = flow.name.trim().to_string();
    for step in &mut flow.steps {
        step.id = step.id.trim().to_string();
        step.cache_bypass_input_keys = step
            .cache_bypass_input_keys
            .iter()
            .map(|k| k.trim().to_ascii_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
    }
    for link in &mut flow.links {
        link.source_step_id = link.source_step_id.trim().to_string();
        link.target_step_id = link.target_step_id.trim().to_string();
    }
    for gate in &mut flow.quality_gates {
        gate.id = gate.id.trim().to_string();
        gate.target_step_id = gate.target_step_id.trim().to_string();
        if gate.target_step_id.is_empty() {
            gate.target_step_id = ANY_STEP_TARGET.to_string();
        }
    }
    flow.runtime = flow.runtime.clamped();
    retarget_delivery_gates(flow);
}

/// A gate that asserts the delivery completion marker must watch the delivery
/// step itself. `any_step` and non-terminal targets are rewritten.
pub fn retarget_delivery_gates(flow: &mut Flow) {
    let Some(delivery_id) = flow.delivery_step_id() else {
        return;
    };
    let non_terminal: Vec<String> = flow
        .steps
        .iter()
        .filter(|s| flow.links.iter().any(|l| l.source_step_id == s.id))
        .map(|s| s.id.clone())
        .collect();
    for gate in &mut flow.quality_gates {
        if gate.kind != GateKind::RegexMustMatch {
            continue;
        }
        let pattern = gate.pattern.to_ascii_lowercase();
        if !(pattern.contains("workflow_status") && pattern.contains("complete")) {
            continue;
        }
        if gate.target_step_id == ANY_STEP_TARGET
            || non_terminal.contains(&gate.target_step_id)
        {
            gate.target_step_id = delivery_id.clone();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Structural validation run on flow CRUD. The scheduler never sees a flow
/// that fails these checks.
pub fn validate_flow(flow: &Flow) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    if flow.id.trim().is_empty() {
        issues.push(ValidationIssue::new("id", "pipeline id cannot be empty"));
    }
    if flow.steps.is_empty() {
        issues.push(ValidationIssue::new("steps", "pipeline needs at least one step"));
    }
    let mut seen = std::collections::HashSet::new();
    for (index, step) in flow.steps.iter().enumerate() {
        let path = format!("steps[{index}]");
        if step.id.trim().is_empty() {
            issues.push(ValidationIssue::new(format!("{path}.id"), "step id cannot be empty"));
            continue;
        }
        if !seen.insert(step.id.clone()) {
            issues.push(ValidationIssue::new(
                format!("{path}.id"),
                format!("duplicate step id `{}`", step.id),
            ));
        }
    }
    for (index, link) in flow.links.iter().enumerate() {
        let path = format!("links[{index}]");
        if flow.step(&link.source_step_id).is_none() {
            issues.push(ValidationIssue::new(
                format!("{path}.source_step_id"),
                format!("unknown step `{}`", link.source_step_id),
            ));
        }
        if flow.step(&link.target_step_id).is_none() {
            issues.push(ValidationIssue::new(
                format!("{path}.target_step_id"),
                format!("unknown step `{}`", link.target_step_id),
            ));
        }
    }
    for (index, gate) in flow.quality_gates.iter().enumerate() {
        let path = format!("quality_gates[{index}]");
        if gate.id.trim().is_empty() {
            issues.push(ValidationIssue::new(format!("{path}.id"), "gate id cannot be empty"));
        }
        if gate.target_step_id != ANY_STEP_TARGET && flow.step(&gate.target_step_id).is_none() {
            issues.push(ValidationIssue::new(
                format!("{path}.target_step_id"),
                format!("unknown step `{}`", gate.target_step_id),
            ));
        }
        match gate.kind {
            GateKind::RegexMustMatch | GateKind::RegexMustNotMatch => {
                if gate.pattern.is_empty() {
                    issues.push(ValidationIssue::new(
                        format!("{path}.pattern"),
                        "regex gate needs a pattern",
                    ));
                }
            }
            GateKind::JsonFieldExists => {
                if gate.json_path.trim().is_empty() {
                    issues.push(ValidationIssue::new(
                        format!("{path}.json_path"),
                        "json_field_exists gate needs a json_path",
                    ));
                }
            }
            GateKind::ArtifactExists => {
                if gate.artifact_path.trim().is_empty() {
                    issues.push(ValidationIssue::new(
                        format!("{path}.artifact_path"),
                        "artifact_exists gate needs an artifact_path",
                    ));
                }
            }
            GateKind::ManualApproval => {}
        }
    }
    issues
}
