//! Per-run cooperative scheduler. One worker task owns one run: it drains a
//! FIFO queue of step attempts, routes each result along outcome-conditional
//! links, and terminates on the delivery contract, budget exhaustion, or a
//! user signal. Cycles are first-class; termination comes from the per-step
//! loop budget and the global execution budget, never from a topological
//! sort.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::Level;
use uuid::Uuid;

use fyreflow_observability::{emit_event, ObservabilityEvent, ProcessKind};

use fyreflow_types::{
    Approval, ApprovalStatus, Flow, GateKind, GateResult, GateResultStatus, Link,
    LinkCondition, QueueReason, Run, RunStatus, Step, StepRole, StepRun, StepRunStatus,
    WorkflowOutcome,
};

use crate::cancellation::{CancellationRegistry, RunCancelHandle, StopCause};
use crate::engine::RunEvents;
use crate::executor::{AttemptInput, StepAttemptResult, StepExecutor};
use crate::storage_paths::StorageRoots;
use crate::store::RunStore;

#[derive(Debug, Clone)]
struct QueueEntry {
    step_id: String,
    queued_by: Option<String>,
    reason: QueueReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EnqueueDecision {
    Queued,
    AlreadyQueued,
    LoopBudgetReached,
}

#[derive(Default)]
struct SchedulerState {
    queue: VecDeque<QueueEntry>,
    queued: HashSet<String>,
    in_flight: HashSet<String>,
    attempts: HashMap<String, u32>,
    executed: u32,
    visited: HashSet<String>,
    outputs: HashMap<String, String>,
    last_output: String,
}

impl SchedulerState {
    fn attempts_for(&self, step_id: &str) -> u32 {
        self.attempts.get(step_id).copied().unwrap_or(0)
    }

    fn enqueue(
        &mut self,
        step_id: &str,
        queued_by: Option<&str>,
        reason: QueueReason,
        max_loops: u32,
    ) -> EnqueueDecision {
        if self.queued.contains(step_id) {
            return EnqueueDecision::AlreadyQueued;
        }
        if self.attempts_for(step_id) + 1 > max_loops + 1 {
            return EnqueueDecision::LoopBudgetReached;
        }
        self.queued.insert(step_id.to_string());
        self.queue.push_back(QueueEntry {
            step_id: step_id.to_string(),
            queued_by: queued_by.map(|s| s.to_string()),
            reason,
        });
        EnqueueDecision::Queued
    }
}

fn condition_matches(condition: LinkCondition, outcome: WorkflowOutcome) -> bool {
    match condition {
        LinkCondition::Always => true,
        LinkCondition::OnPass => outcome == WorkflowOutcome::Pass,
        LinkCondition::OnFail => outcome == WorkflowOutcome::Fail,
    }
}

/// A step qualifies for the implicit remediation self-loop when it actually
/// emits artifacts a retry could fix.
fn step_emits_artifacts(flow: &Flow, step: &Step) -> bool {
    if !step.required_output_files.is_empty() {
        return true;
    }
    flow.quality_gates
        .iter()
        .any(|g| g.kind == GateKind::ArtifactExists && g.blocking && g.applies_to(&step.id))
}

pub struct RunWorker {
    store: Arc<RunStore>,
    executor: Arc<StepExecutor>,
    cancellations: CancellationRegistry,
    events: RunEvents,
    roots: StorageRoots,
    control_poll_ms: u64,
    global_cache_bypass: bool,
}

impl RunWorker {
    pub fn new(
        store: Arc<RunStore>,
        executor: Arc<StepExecutor>,
        cancellations: CancellationRegistry,
        events: RunEvents,
        roots: StorageRoots,
        control_poll_ms: u64,
        global_cache_bypass: bool,
    ) -> Self {
        Self {
            store,
            executor,
            cancellations,
            events,
            roots,
            control_poll_ms,
            global_cache_bypass,
        }
    }

    pub async fn run(&self, run_id: &str) -> anyhow::Result<()> {
        let handle = match self.cancellations.get(run_id).await {
            Some(handle) => handle,
            None => self.cancellations.create(run_id).await,
        };
        let result = self.run_inner(run_id, &handle).await;
        self.cancellations.remove_matching(run_id, &handle).await;
        if let Err(err) = &result {
            self.store
                .append_log(run_id, format!("[runtime-startup-error] {err:#}"))
                .await;
            self.set_status(run_id, RunStatus::Failed).await;
        }
        result
    }

    async fn run_inner(&self, run_id: &str, handle: &RunCancelHandle) -> anyhow::Result<()> {
        let Some(run) = self.store.get_run(run_id).await else {
            anyhow::bail!("run `{run_id}` not found");
        };
        if run.status.is_terminal() {
            return Ok(());
        }
        let flow = run.pipeline.clone();
        let limits = flow.runtime.clamped();

        let mut state = SchedulerState::default();
        for step_run in &run.steps {
            state.attempts.insert(step_run.step_id.clone(), step_run.attempts);
            state.executed += step_run.attempts;
            if step_run.attempts > 0 {
                state.visited.insert(step_run.step_id.clone());
            }
            if !step_run.output.is_empty() {
                state
                    .outputs
                    .insert(step_run.step_id.clone(), step_run.output.clone());
                state.last_output = step_run.output.clone();
            }
        }

        self.seed_queue(&run, &flow, &mut state, limits.max_loops).await;
        if matches!(run.status, RunStatus::Queued | RunStatus::Running) {
            self.set_status(run_id, RunStatus::Running).await;
        }
        self.store.append_log(run_id, "run worker attached").await;

        loop {
            // Park while paused or awaiting approvals; a stopped handle wins.
            loop {
                if handle.is_stopped() {
                    return self.finalize_stop(run_id, handle, None).await;
                }
                let Some(current) = self.store.get_run(run_id).await else {
                    anyhow::bail!("run `{run_id}` disappeared from the store");
                };
                if current.status.is_terminal() {
                    return Ok(());
                }
                if current.status == RunStatus::Paused {
                    tokio::time::sleep(Duration::from_millis(self.control_poll_ms)).await;
                    continue;
                }
                if current.status == RunStatus::AwaitingApproval {
                    if current.pending_approvals().is_empty() {
                        self.set_status(run_id, RunStatus::Running).await;
                        self.store
                            .append_log(run_id, "approvals resolved; run resumed")
                            .await;
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(self.control_poll_ms)).await;
                    continue;
                }
                if current.status == RunStatus::Queued {
                    self.set_status(run_id, RunStatus::Running).await;
                }
                break;
            }

            let Some(entry) = state.queue.pop_front() else {
                if let Some(step) = flow.steps.iter().find(|s| {
                    !state.visited.contains(&s.id)
                        && !state.in_flight.contains(&s.id)
                        && !state.queued.contains(&s.id)
                }) {
                    self.store
                        .append_log(
                            run_id,
                            format!(
                                "queue drained; enqueuing disconnected step `{}`",
                                step.display_name()
                            ),
                        )
                        .await;
                    state.enqueue(
                        &step.id,
                        None,
                        QueueReason::DisconnectedFallback,
                        limits.max_loops,
                    );
                    continue;
                }
                return self.finalize_drained(run_id).await;
            };
            state.queued.remove(&entry.step_id);

            let Some(step) = flow.step(&entry.step_id).cloned() else {
                self.store
                    .append_log(run_id, format!("unknown step `{}` dropped", entry.step_id))
                    .await;
                continue;
            };
            let prior_attempts = state.attempts_for(&step.id);
            if prior_attempts + 1 > limits.max_loops + 1 {
                self.store
                    .append_log(
                        run_id,
                        format!("Skipped {}: max loop count reached", step.display_name()),
                    )
                    .await;
                continue;
            }
            if state.executed >= limits.max_step_executions {
                self.store
                    .append_log(
                        run_id,
                        format!(
                            "Skipped {}: max step executions reached",
                            step.display_name()
                        ),
                    )
                    .await;
                continue;
            }

            state.in_flight.insert(step.id.clone());
            let mut step_run = run
                .step_run(&step.id)
                .cloned()
                .unwrap_or_else(|| StepRun::new(&step.id, entry.queued_by.as_deref(), entry.reason));
            step_run.triggered_by_step_id = entry.queued_by.clone();
            step_run.triggered_by_reason = entry.reason;
            step_run.status = StepRunStatus::Running;
            step_run.attempts = prior_attempts + 1;
            step_run.started_at = Some(Utc::now());
            step_run.finished_at = None;
            step_run.error = None;
            self.store.record_step_attempt(run_id, step_run.clone()).await;

            let (log_tx, mut log_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
            let forwarder = {
                let store = self.store.clone();
                let run_id = run_id.to_string();
                tokio::spawn(async move {
                    while let Some(line) = log_rx.recv().await {
                        store.append_log(&run_id, line).await;
                    }
                })
            };

            let previous_output = entry
                .queued_by
                .as_deref()
                .and_then(|q| state.outputs.get(q).cloned())
                .unwrap_or_else(|| state.last_output.clone());
            let orchestrator_prompt = orchestrator_prompt_for(&flow, &entry, &step.id);
            let attempt_input = AttemptInput {
                run_id,
                pipeline_id: &run.pipeline_id,
                task: &run.task,
                inputs: &run.inputs,
                flow: &flow,
                step: &step,
                previous_output: &previous_output,
                orchestrator_prompt: orchestrator_prompt.as_deref(),
                global_cache_bypass: self.global_cache_bypass,
            };
            let mut result = self
                .executor
                .execute_attempt(&attempt_input, handle.token(), log_tx.clone())
                .await;
            drop(log_tx);
            let _ = forwarder.await;
            state.in_flight.remove(&step.id);

            if result.aborted {
                return self
                    .finalize_stop(run_id, handle, Some((step_run, prior_attempts)))
                    .await;
            }

            state.attempts.insert(step.id.clone(), prior_attempts + 1);
            state.executed += 1;
            state.visited.insert(step.id.clone());
            state.outputs.insert(step.id.clone(), result.output.clone());
            state.last_output = result.output.clone();

            step_run.status = result.status;
            step_run.workflow_outcome = result.outcome;
            step_run.input_context = result.input_context.clone();
            step_run.output = result.output.clone();
            step_run.quality_gate_results = result.gate_results.clone();
            step_run.finished_at = Some(Utc::now());
            step_run.error = result.error.clone();
            self.store.record_step_attempt(run_id, step_run.clone()).await;
            self.store
                .append_log(
                    run_id,
                    format!(
                        "step `{}` attempt {} {}: {}",
                        step.display_name(),
                        prior_attempts + 1,
                        match result.status {
                            StepRunStatus::Completed => "completed",
                            _ => "failed",
                        },
                        result.summary
                    ),
                )
                .await;

            if let Some(detail) = &result.provider_fatal {
                emit_event(
                    Level::ERROR,
                    ProcessKind::Engine,
                    ObservabilityEvent::run("provider.fatal", "scheduler", run_id)
                        .with_step(&step.id)
                        .with_detail(detail),
                );
                self.store
                    .append_log(
                        run_id,
                        format!(
                            "Run failed: provider error on {}: {detail}",
                            step.display_name()
                        ),
                    )
                    .await;
                self.store
                    .update_run(run_id, |r| {
                        r.failure_reason = Some(json!({
                            "type": "provider_error",
                            "step_id": step.id,
                            "detail": detail,
                        }));
                    })
                    .await;
                return self.finalize_terminal(run_id, RunStatus::Failed).await;
            }

            if !result.manual_gates.is_empty()
                && self
                    .wait_for_approvals(run_id, handle, &step, &mut result, &mut step_run)
                    .await?
            {
                // Stop signal arrived while waiting.
                return Ok(());
            }

            if result.should_stop_for_input {
                self.store
                    .append_log(
                        run_id,
                        format!("{} requires user input", step.display_name()),
                    )
                    .await;
                let requests: Vec<_> = result
                    .input_requests
                    .iter()
                    .map(|r| json!({ "key": r.key, "question": r.question }))
                    .collect();
                self.store
                    .update_run(run_id, |r| {
                        r.failure_reason = Some(json!({
                            "type": "input_needed",
                            "step_id": step.id,
                            "requests": requests,
                        }));
                    })
                    .await;
                self.store
                    .append_log(
                        run_id,
                        "Run failed: awaiting user input; start a new run with the requested inputs",
                    )
                    .await;
                return self.finalize_terminal(run_id, RunStatus::Failed).await;
            }

            if result.delivery_complete && !result.blocking_failure {
                self.store
                    .append_log(run_id, "Delivery contract met; run completed")
                    .await;
                return self.finalize_terminal(run_id, RunStatus::Completed).await;
            }

            self.route_result(run_id, &flow, &step, &result, &mut state, limits.max_loops)
                .await;
        }
    }

    async fn seed_queue(
        &self,
        run: &Run,
        flow: &Flow,
        state: &mut SchedulerState,
        max_loops: u32,
    ) {
        let pending: Vec<&StepRun> = run
            .steps
            .iter()
            .filter(|s| s.status == StepRunStatus::Pending)
            .collect();
        if !pending.is_empty() {
            for step_run in pending {
                state.enqueue(
                    &step_run.step_id,
                    step_run.triggered_by_step_id.as_deref(),
                    step_run.triggered_by_reason,
                    max_loops,
                );
            }
            return;
        }
        if !state.visited.is_empty() {
            return;
        }
        if let Some(entry_step) = flow
            .steps
            .iter()
            .find(|s| !flow.has_incoming_links(&s.id))
        {
            state.enqueue(&entry_step.id, None, QueueReason::EntryStep, max_loops);
            return;
        }
        if let Some(first) = flow.steps.first() {
            self.store
                .append_log(
                    &run.id,
                    format!(
                        "flow is fully cyclic; bootstrapping at `{}`",
                        first.display_name()
                    ),
                )
                .await;
            state.enqueue(&first.id, None, QueueReason::CycleBootstrap, max_loops);
        }
    }

    /// Translates one step result into enqueue decisions.
    async fn route_result(
        &self,
        run_id: &str,
        flow: &Flow,
        step: &Step,
        result: &StepAttemptResult,
        state: &mut SchedulerState,
        max_loops: u32,
    ) {
        let links = flow.outgoing_links(&step.id);
        if result.blocking_failure {
            let failures = result
                .gate_results
                .iter()
                .filter(|g| g.is_blocking_failure())
                .map(|g| g.message.clone())
                .collect::<Vec<_>>()
                .join("; ");
            self.store
                .append_log(
                    run_id,
                    format!("Blocking gate failure on {}: {failures}", step.display_name()),
                )
                .await;
        }

        let matched: Vec<&Link> = links
            .iter()
            .copied()
            .filter(|l| condition_matches(l.condition, result.outcome))
            .collect();
        for link in &matched {
            let decision = state.enqueue(
                &link.target_step_id,
                Some(&step.id),
                QueueReason::Route,
                max_loops,
            );
            if decision == EnqueueDecision::LoopBudgetReached {
                if let Some(target) = flow.step(&link.target_step_id) {
                    self.store
                        .append_log(
                            run_id,
                            format!("Skipped {}: max loop count reached", target.display_name()),
                        )
                        .await;
                }
            }
        }

        let mut self_looped = false;
        let has_explicit_on_fail = links.iter().any(|l| l.condition == LinkCondition::OnFail);
        if result.blocking_failure
            && step.role != StepRole::Orchestrator
            && !has_explicit_on_fail
            && step_emits_artifacts(flow, step)
        {
            match state.enqueue(&step.id, Some(&step.id), QueueReason::Route, max_loops) {
                EnqueueDecision::Queued => {
                    self_looped = true;
                    self.store
                        .append_log(
                            run_id,
                            format!(
                                "re-queuing {} to remediate blocking failure",
                                step.display_name()
                            ),
                        )
                        .await;
                }
                EnqueueDecision::LoopBudgetReached => {
                    self.store
                        .append_log(
                            run_id,
                            format!("Skipped {}: max loop count reached", step.display_name()),
                        )
                        .await;
                }
                EnqueueDecision::AlreadyQueued => {}
            }
        }

        if !links.is_empty() && matched.is_empty() && !self_looped {
            self.store
                .append_log(
                    run_id,
                    format!(
                        "no route matched from {} (outcome={})",
                        step.display_name(),
                        result.outcome.as_str()
                    ),
                )
                .await;
        }
    }

    /// Raises approvals for manual gates, parks the run, and folds rejected
    /// blocking approvals back into the step result as blocking failures.
    /// Returns `true` when a stop signal ended the run while waiting.
    async fn wait_for_approvals(
        &self,
        run_id: &str,
        handle: &RunCancelHandle,
        step: &Step,
        result: &mut StepAttemptResult,
        step_run: &mut StepRun,
    ) -> anyhow::Result<bool> {
        let mut approval_ids = Vec::new();
        for gate in &result.manual_gates {
            let approval = Approval {
                id: Uuid::new_v4().to_string(),
                gate_id: gate.id.clone(),
                gate_name: gate.display_name().to_string(),
                step_id: step.id.clone(),
                step_name: step.display_name().to_string(),
                status: ApprovalStatus::Pending,
                blocking: gate.blocking,
                message: gate.message.clone(),
                requested_at: Utc::now(),
                resolved_at: None,
                note: None,
            };
            approval_ids.push(approval.id.clone());
            self.store.add_approval(run_id, approval).await;
            self.store
                .append_log(
                    run_id,
                    format!(
                        "manual approval requested: `{}` on {}",
                        gate.display_name(),
                        step.display_name()
                    ),
                )
                .await;
        }
        self.set_status(run_id, RunStatus::AwaitingApproval).await;

        loop {
            if handle.is_stopped() {
                self.finalize_stop(run_id, handle, None).await?;
                return Ok(true);
            }
            let Some(current) = self.store.get_run(run_id).await else {
                anyhow::bail!("run `{run_id}` disappeared while awaiting approval");
            };
            if current.pending_approvals().is_empty() {
                let rejected: Vec<Approval> = current
                    .approvals
                    .iter()
                    .filter(|a| approval_ids.contains(&a.id))
                    .filter(|a| a.status == ApprovalStatus::Rejected && a.blocking)
                    .cloned()
                    .collect();
                self.set_status(run_id, RunStatus::Running).await;
                self.store
                    .append_log(run_id, "approvals resolved; run resumed")
                    .await;
                for approval in rejected {
                    result.gate_results.push(GateResult::fail(
                        &format!("approval:{}", approval.gate_id),
                        &approval.gate_name,
                        GateKind::ManualApproval,
                        true,
                        format!(
                            "manual approval rejected{}",
                            approval
                                .note
                                .as_deref()
                                .map(|n| format!(": {n}"))
                                .unwrap_or_default()
                        ),
                    ));
                }
                if result
                    .gate_results
                    .iter()
                    .any(|g| g.kind == GateKind::ManualApproval && g.status == GateResultStatus::Fail)
                {
                    result.blocking_failure = true;
                    result.outcome = WorkflowOutcome::Fail;
                    result.status = StepRunStatus::Failed;
                    result.delivery_complete = false;
                    step_run.status = StepRunStatus::Failed;
                    step_run.workflow_outcome = WorkflowOutcome::Fail;
                    step_run.quality_gate_results = result.gate_results.clone();
                    self.store.record_step_attempt(run_id, step_run.clone()).await;
                }
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(self.control_poll_ms)).await;
        }
    }

    /// A stop signal arrived: distinguish pause from cancel, persist a
    /// snapshot, and end the worker.
    async fn finalize_stop(
        &self,
        run_id: &str,
        handle: &RunCancelHandle,
        interrupted: Option<(StepRun, u32)>,
    ) -> anyhow::Result<()> {
        let cause = handle.cause().await.unwrap_or(StopCause::Cancel);
        match cause {
            StopCause::Pause => {
                if let Some((mut step_run, prior_attempts)) = interrupted {
                    step_run.status = StepRunStatus::Pending;
                    step_run.attempts = prior_attempts;
                    step_run.started_at = None;
                    step_run.finished_at = None;
                    self.store.record_step_attempt(run_id, step_run).await;
                }
                self.store.append_log(run_id, "Paused by user").await;
                self.set_status(run_id, RunStatus::Paused).await;
            }
            StopCause::Cancel => {
                if let Some((mut step_run, _)) = interrupted {
                    step_run.status = StepRunStatus::Failed;
                    step_run.error = Some("Stopped by user".to_string());
                    step_run.finished_at = Some(Utc::now());
                    self.store.record_step_attempt(run_id, step_run).await;
                }
                self.store.append_log(run_id, "Run cancelled by user").await;
                self.set_status(run_id, RunStatus::Cancelled).await;
            }
        }
        if let Err(err) = self.store.snapshot_run_state(run_id, &self.roots).await {
            tracing::warn!(target: "fyreflow.scheduler", "snapshot failed for {run_id}: {err:#}");
        }
        Ok(())
    }

    async fn finalize_drained(&self, run_id: &str) -> anyhow::Result<()> {
        let Some(run) = self.store.get_run(run_id).await else {
            anyhow::bail!("run `{run_id}` not found at completion");
        };
        let any_failed = run
            .steps
            .iter()
            .any(|s| s.status == StepRunStatus::Failed);
        if any_failed {
            self.store
                .append_log(
                    run_id,
                    "Run failed: loop budget exhausted before quality gates passed",
                )
                .await;
            self.finalize_terminal(run_id, RunStatus::Failed).await
        } else {
            self.store.append_log(run_id, "Run completed").await;
            self.finalize_terminal(run_id, RunStatus::Completed).await
        }
    }

    async fn finalize_terminal(&self, run_id: &str, status: RunStatus) -> anyhow::Result<()> {
        self.set_status(run_id, status).await;
        if let Err(err) = self.store.snapshot_run_state(run_id, &self.roots).await {
            tracing::warn!(target: "fyreflow.scheduler", "snapshot failed for {run_id}: {err:#}");
        }
        Ok(())
    }

    async fn set_status(&self, run_id: &str, status: RunStatus) {
        self.store.set_status(run_id, status).await;
        self.events.run_status_changed(run_id, status);
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent::run("run.status", "scheduler", run_id)
                .with_status(status.as_str()),
        );
    }
}

fn orchestrator_prompt_for(flow: &Flow, entry: &QueueEntry, step_id: &str) -> Option<String> {
    if let Some(queued_by) = entry.queued_by.as_deref() {
        if let Some(source) = flow.step(queued_by) {
            if source.role == StepRole::Orchestrator {
                return Some(source.prompt.clone());
            }
        }
    }
    flow.links
        .iter()
        .filter(|l| l.target_step_id == step_id)
        .find_map(|l| {
            flow.step(&l.source_step_id)
                .filter(|s| s.role == StepRole::Orchestrator)
                .map(|s| s.prompt.clone())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(json: serde_json::Value) -> Flow {
        serde_json::from_value(json).expect("flow")
    }

    #[test]
    fn always_links_match_every_outcome() {
        for outcome in [
            WorkflowOutcome::Pass,
            WorkflowOutcome::Fail,
            WorkflowOutcome::Neutral,
        ] {
            assert!(condition_matches(LinkCondition::Always, outcome));
        }
        assert!(condition_matches(LinkCondition::OnPass, WorkflowOutcome::Pass));
        assert!(!condition_matches(LinkCondition::OnPass, WorkflowOutcome::Neutral));
        assert!(condition_matches(LinkCondition::OnFail, WorkflowOutcome::Fail));
        assert!(!condition_matches(LinkCondition::OnFail, WorkflowOutcome::Pass));
    }

    #[test]
    fn enqueue_dedupes_and_respects_loop_budget() {
        let mut state = SchedulerState::default();
        assert_eq!(
            state.enqueue("a", None, QueueReason::EntryStep, 1),
            EnqueueDecision::Queued
        );
        assert_eq!(
            state.enqueue("a", None, QueueReason::Route, 1),
            EnqueueDecision::AlreadyQueued
        );
        state.queued.clear();
        state.attempts.insert("a".to_string(), 2);
        assert_eq!(
            state.enqueue("a", None, QueueReason::Route, 1),
            EnqueueDecision::LoopBudgetReached
        );
    }

    #[test]
    fn artifact_emitting_step_qualifies_for_self_loop() {
        let f = flow(serde_json::json!({
            "id": "f",
            "steps": [
                { "id": "builder", "required_output_files": ["deck.html"] },
                { "id": "bare" },
            ],
            "links": [],
            "quality_gates": [
                { "id": "g1", "kind": "artifact_exists", "artifact_path": "deck.html",
                  "target_step_id": "bare", "blocking": true },
            ],
        }));
        assert!(step_emits_artifacts(&f, f.step("builder").unwrap()));
        // `bare` declares nothing itself but a blocking artifact gate watches it.
        assert!(step_emits_artifacts(&f, f.step("bare").unwrap()));
    }

    #[test]
    fn orchestrator_prompt_resolves_through_trigger_or_links() {
        let f = flow(serde_json::json!({
            "id": "f",
            "steps": [
                { "id": "orc", "role": "orchestrator", "prompt": "drive the build" },
                { "id": "worker", "role": "executor" },
            ],
            "links": [
                { "source_step_id": "orc", "target_step_id": "worker" },
            ],
        }));
        let entry = QueueEntry {
            step_id: "worker".to_string(),
            queued_by: Some("orc".to_string()),
            reason: QueueReason::Route,
        };
        assert_eq!(
            orchestrator_prompt_for(&f, &entry, "worker").as_deref(),
            Some("drive the build")
        );
        let fallback_entry = QueueEntry {
            step_id: "worker".to_string(),
            queued_by: None,
            reason: QueueReason::DisconnectedFallback,
        };
        assert_eq!(
            orchestrator_prompt_for(&f, &fallback_entry, "worker").as_deref(),
            Some("drive the build")
        );
    }
}
