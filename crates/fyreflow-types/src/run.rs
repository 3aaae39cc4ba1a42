use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::flow::{Flow, GateKind};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Paused,
    AwaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "running" => Self::Running,
            "paused" => Self::Paused,
            "awaiting_approval" => Self::AwaitingApproval,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => Self::Queued,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal states are sticky; no transition leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Live runs are reattached to a worker after a process restart.
    pub fn is_live(self) -> bool {
        !self.is_terminal()
    }
}

impl<'de> Deserialize<'de> for RunStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl Default for StepRunStatus {
    fn default() -> Self {
        Self::Pending
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowOutcome {
    Neutral,
    Pass,
    Fail,
}

impl Default for WorkflowOutcome {
    fn default() -> Self {
        Self::Neutral
    }
}

impl WorkflowOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Neutral => "neutral",
            Self::Pass => "pass",
            Self::Fail => "fail",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueReason {
    EntryStep,
    CycleBootstrap,
    Route,
    SkipIfArtifacts,
    DisconnectedFallback,
}

impl QueueReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EntryStep => "entry_step",
            Self::CycleBootstrap => "cycle_bootstrap",
            Self::Route => "route",
            Self::SkipIfArtifacts => "skip_if_artifacts",
            Self::DisconnectedFallback => "disconnected_fallback",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GateResultStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateResult {
    pub gate_id: String,
    pub gate_name: String,
    pub kind: GateKind,
    pub status: GateResultStatus,
    pub blocking: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl GateResult {
    pub fn pass(gate_id: &str, gate_name: &str, kind: GateKind, message: impl Into<String>) -> Self {
        Self {
            gate_id: gate_id.to_string(),
            gate_name: gate_name.to_string(),
            kind,
            status: GateResultStatus::Pass,
            blocking: false,
            message: message.into(),
            details: Value::Null,
        }
    }

    pub fn fail(
        gate_id: &str,
        gate_name: &str,
        kind: GateKind,
        blocking: bool,
        message: impl Into<String>,
    ) -> Self {
        Self {
            gate_id: gate_id.to_string(),
            gate_name: gate_name.to_string(),
            kind,
            status: GateResultStatus::Fail,
            blocking,
            message: message.into(),
            details: Value::Null,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn is_blocking_failure(&self) -> bool {
        self.status == GateResultStatus::Fail && self.blocking
    }
}

/// True when at least one result is a failed blocking gate.
pub fn has_blocking_failure(results: &[GateResult]) -> bool {
    results.iter().any(GateResult::is_blocking_failure)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRun {
    pub step_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by_step_id: Option<String>,
    pub triggered_by_reason: QueueReason,
    pub status: StepRunStatus,
    pub attempts: u32,
    #[serde(default)]
    pub workflow_outcome: WorkflowOutcome,
    #[serde(default)]
    pub input_context: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub quality_gate_results: Vec<GateResult>,
    #[serde(default)]
    pub subagent_notes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepRun {
    pub fn new(step_id: &str, triggered_by: Option<&str>, reason: QueueReason) -> Self {
        Self {
            step_id: step_id.to_string(),
            triggered_by_step_id: triggered_by.map(|s| s.to_string()),
            triggered_by_reason: reason,
            status: StepRunStatus::Pending,
            attempts: 0,
            workflow_outcome: WorkflowOutcome::Neutral,
            input_context: String::new(),
            output: String::new(),
            quality_gate_results: Vec::new(),
            subagent_notes: Vec::new(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    /// Change signature used by the realtime fan-out to decide whether a
    /// `run_step` frame needs to be sent.
    pub fn fingerprint(&self) -> String {
        format!(
            "{:?}|{}|{}|{}",
            self.status,
            self.attempts,
            self.output.len(),
            self.finished_at
                .map(|t| t.timestamp_millis())
                .unwrap_or_default()
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Approval {
    pub id: String,
    pub gate_id: String,
    pub gate_name: String,
    pub step_id: String,
    pub step_name: String,
    pub status: ApprovalStatus,
    pub blocking: bool,
    #[serde(default)]
    pub message: String,
    pub requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub pipeline_id: String,
    pub pipeline_name: String,
    /// Immutable snapshot taken at run creation; later pipeline edits do not
    /// affect a run in flight.
    pub pipeline: Flow,
    pub task: String,
    #[serde(default)]
    pub inputs: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub steps: Vec<StepRun>,
    #[serde(default)]
    pub approvals: Vec<Approval>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<Value>,
}

impl Run {
    pub fn new(
        pipeline: Flow,
        task: String,
        inputs: HashMap<String, String>,
        scenario: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            pipeline_id: pipeline.id.clone(),
            pipeline_name: pipeline.name.clone(),
            pipeline,
            task,
            inputs,
            scenario,
            status: RunStatus::Queued,
            started_at: Utc::now(),
            finished_at: None,
            logs: Vec::new(),
            steps: Vec::new(),
            approvals: Vec::new(),
            failure_reason: None,
        }
    }

    pub fn step_run(&self, step_id: &str) -> Option<&StepRun> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn step_run_mut(&mut self, step_id: &str) -> Option<&mut StepRun> {
        self.steps.iter_mut().find(|s| s.step_id == step_id)
    }

    pub fn pending_approvals(&self) -> Vec<&Approval> {
        self.approvals
            .iter()
            .filter(|a| a.status == ApprovalStatus::Pending)
            .collect()
    }
}
