use serde::{Deserialize, Deserializer, Serialize};

use crate::run::WorkflowOutcome;

/// Status declared by a model attempt. Unrecognized words parse to `Neutral`.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Pass,
    Fail,
    Neutral,
    Complete,
    NeedsInput,
}

impl WorkflowStatus {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "PASS" | "PASSED" | "SUCCESS" => Self::Pass,
            "FAIL" | "FAILED" | "FAILURE" => Self::Fail,
            "COMPLETE" | "COMPLETED" | "DONE" => Self::Complete,
            "NEEDS_INPUT" | "NEEDS INPUT" | "INPUT_REQUIRED" => Self::NeedsInput,
            _ => Self::Neutral,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Neutral => "NEUTRAL",
            Self::Complete => "COMPLETE",
            Self::NeedsInput => "NEEDS_INPUT",
        }
    }

    /// Maps the contract status onto the routing outcome:
    /// PASS/COMPLETE route as pass, FAIL as fail, everything else is neutral.
    pub fn outcome(self) -> WorkflowOutcome {
        match self {
            Self::Pass | Self::Complete => WorkflowOutcome::Pass,
            Self::Fail => WorkflowOutcome::Fail,
            Self::Neutral | Self::NeedsInput => WorkflowOutcome::Neutral,
        }
    }
}

impl<'de> Deserialize<'de> for WorkflowStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    Continue,
    RetryStep,
    RetryStage,
    Escalate,
    Stop,
}

impl NextAction {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "retry_step" | "retry-step" => Self::RetryStep,
            "retry_stage" | "retry-stage" => Self::RetryStage,
            "escalate" => Self::Escalate,
            "stop" | "halt" => Self::Stop,
            _ => Self::Continue,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::RetryStep => "retry_step",
            Self::RetryStage => "retry_stage",
            Self::Escalate => "escalate",
            Self::Stop => "stop",
        }
    }
}

impl Default for NextAction {
    fn default() -> Self {
        Self::Continue
    }
}

impl<'de> Deserialize<'de> for NextAction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContractReason {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
}

/// Where the contract was recovered from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContractSource {
    Json,
    LegacyText,
}

/// The structured result contract a step attempt declares. Producers may
/// attach arbitrary extra keys; only the fields below are read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateContract {
    pub workflow_status: WorkflowStatus,
    #[serde(default)]
    pub next_action: NextAction,
    #[serde(default)]
    pub reasons: Vec<ContractReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_target: Option<String>,
    pub source: ContractSource,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_status_word_is_neutral() {
        assert_eq!(WorkflowStatus::parse("SHRUG"), WorkflowStatus::Neutral);
        assert_eq!(WorkflowStatus::parse("pass"), WorkflowStatus::Pass);
        assert_eq!(WorkflowStatus::parse(" COMPLETE "), WorkflowStatus::Complete);
    }

    #[test]
    fn status_maps_to_routing_outcome() {
        assert_eq!(WorkflowStatus::Pass.outcome(), WorkflowOutcome::Pass);
        assert_eq!(WorkflowStatus::Complete.outcome(), WorkflowOutcome::Pass);
        assert_eq!(WorkflowStatus::Fail.outcome(), WorkflowOutcome::Fail);
        assert_eq!(WorkflowStatus::NeedsInput.outcome(), WorkflowOutcome::Neutral);
    }

    #[test]
    fn next_action_defaults_to_continue() {
        assert_eq!(NextAction::parse("do_a_flip"), NextAction::Continue);
        assert_eq!(NextAction::parse("retry_step"), NextAction::RetryStep);
    }
}
