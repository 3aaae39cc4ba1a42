//! Composition root: wires the store, provider invoker, policy registry, and
//! per-run workers together, and owns run lifecycle control (start, stop,
//! pause, resume, approval resolution, crash recovery).

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::broadcast;

use fyreflow_providers::{DefaultProviderInvoker, ProviderCatalog, ProviderInvoker};
use fyreflow_types::{
    EngineEvent, Run, RunStatus, StartRunRequest, ValidationIssue, SECURE_INPUT_SENTINEL,
};

use crate::cancellation::{CancellationRegistry, StopCause};
use crate::config::{load_provider_settings, EngineConfig};
use crate::executor::StepExecutor;
use crate::policy::PolicyRegistry;
use crate::scheduler::RunWorker;
use crate::storage_paths::StorageRoots;
use crate::store::RunStore;

pub enum StartRunOutcome {
    Created(Run),
    PipelineNotFound,
    Invalid(Vec<ValidationIssue>),
}

/// Wakes realtime pollers ahead of their next tick when a run changes
/// status. Delivery stays poll-based: a lagging receiver misses only the
/// early wakeup, never data, because subscribers re-read the store.
#[derive(Clone)]
pub struct RunEvents {
    tx: broadcast::Sender<EngineEvent>,
}

impl RunEvents {
    pub fn new() -> Self {
        // Sized for a burst of terminal transitions across concurrent runs;
        // status changes are the only producer on this channel.
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn run_status_changed(&self, run_id: &str, status: RunStatus) {
        let event = EngineEvent::new(
            "run.status",
            json!({ "runId": run_id, "status": status.as_str() }),
        );
        let _ = self.tx.send(event);
    }
}

impl Default for RunEvents {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct PipelineEngine {
    config: EngineConfig,
    store: Arc<RunStore>,
    events: RunEvents,
    cancellations: CancellationRegistry,
    executor: Arc<StepExecutor>,
    roots: StorageRoots,
    catalog: ProviderCatalog,
}

impl PipelineEngine {
    /// Boots the engine from disk: store, provider catalog, default invoker.
    pub async fn init(config: EngineConfig) -> anyhow::Result<Self> {
        let store = Arc::new(RunStore::new(&config.data_dir).await?);
        let providers = load_provider_settings(&config.data_dir).await?;
        let catalog = ProviderCatalog::new(providers);
        let invoker: Arc<dyn ProviderInvoker> = Arc::new(DefaultProviderInvoker::new(
            catalog.clone(),
            config.cli_options.clone(),
        ));
        Ok(Self::with_invoker(config, store, catalog, invoker))
    }

    /// Assembly seam used by tests to swap in a scripted invoker.
    pub fn with_invoker(
        config: EngineConfig,
        store: Arc<RunStore>,
        catalog: ProviderCatalog,
        invoker: Arc<dyn ProviderInvoker>,
    ) -> Self {
        let roots = StorageRoots::new(&config.data_dir);
        let executor = Arc::new(StepExecutor::new(
            invoker,
            catalog.clone(),
            PolicyRegistry::with_builtins(),
            roots.clone(),
        ));
        Self {
            config,
            store,
            events: RunEvents::new(),
            cancellations: CancellationRegistry::new(),
            executor,
            roots,
            catalog,
        }
    }

    pub fn store(&self) -> Arc<RunStore> {
        self.store.clone()
    }

    pub fn events(&self) -> RunEvents {
        self.events.clone()
    }

    pub fn catalog(&self) -> ProviderCatalog {
        self.catalog.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn roots(&self) -> &StorageRoots {
        &self.roots
    }

    /// Validates the request, substitutes secure inputs, creates the run in
    /// `queued`, and attaches a worker.
    pub async fn start_run(
        &self,
        pipeline_id: &str,
        request: StartRunRequest,
    ) -> anyhow::Result<StartRunOutcome> {
        let issues = request.validate();
        if !issues.is_empty() {
            return Ok(StartRunOutcome::Invalid(issues));
        }
        let Some(pipeline) = self.store.get_pipeline(pipeline_id).await else {
            return Ok(StartRunOutcome::PipelineNotFound);
        };

        let mut inputs = request.normalized_inputs();
        let secure = self.store.secure_inputs_for(pipeline_id).await;
        for (key, value) in inputs.iter_mut() {
            if value == SECURE_INPUT_SENTINEL {
                if let Some(stored) = secure.get(key) {
                    *value = stored.clone();
                }
            }
        }

        let run = self
            .store
            .create_run(
                pipeline,
                request.task.trim().to_string(),
                inputs,
                request.scenario.clone(),
            )
            .await?;
        self.store
            .append_log(&run.id, format!("run created for pipeline `{}`", pipeline_id))
            .await;
        self.spawn_worker(&run.id).await;
        Ok(StartRunOutcome::Created(run))
    }

    pub async fn spawn_worker(&self, run_id: &str) {
        self.cancellations.create(run_id).await;
        let worker = RunWorker::new(
            self.store.clone(),
            self.executor.clone(),
            self.cancellations.clone(),
            self.events.clone(),
            self.roots.clone(),
            self.config.run_control_poll_ms,
            self.config.disable_step_cache,
        );
        let run_id = run_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = worker.run(&run_id).await {
                tracing::error!(target: "fyreflow.engine", "run {run_id} worker failed: {err:#}");
            }
        });
    }

    /// Cancel is terminal; pause leaves the run resumable.
    pub async fn stop_run(&self, run_id: &str) -> bool {
        self.signal_run(run_id, StopCause::Cancel, RunStatus::Cancelled)
            .await
    }

    pub async fn pause_run(&self, run_id: &str) -> bool {
        self.signal_run(run_id, StopCause::Pause, RunStatus::Paused)
            .await
    }

    async fn signal_run(&self, run_id: &str, cause: StopCause, fallback: RunStatus) -> bool {
        let Some(run) = self.store.get_run(run_id).await else {
            return false;
        };
        if run.status.is_terminal() {
            return false;
        }
        if let Some(handle) = self.cancellations.get(run_id).await {
            handle.stop(cause).await;
            return true;
        }
        // No live worker; settle the status directly.
        self.store.set_status(run_id, fallback).await;
        true
    }

    pub async fn resume_run(&self, run_id: &str) -> bool {
        let Some(run) = self.store.get_run(run_id).await else {
            return false;
        };
        if run.status != RunStatus::Paused {
            return false;
        }
        self.store.set_status(run_id, RunStatus::Queued).await;
        self.store.append_log(run_id, "resumed by user").await;
        // A parked worker (crash recovery attaches one to paused runs) picks
        // the queued status up on its next control poll.
        match self.cancellations.get(run_id).await {
            Some(handle) if !handle.is_stopped() => {}
            _ => self.spawn_worker(run_id).await,
        }
        true
    }

    pub async fn resolve_approval(
        &self,
        run_id: &str,
        approval_id: &str,
        approve: bool,
        note: Option<String>,
    ) -> anyhow::Result<Run> {
        self.store
            .resolve_approval(run_id, approval_id, approve, note)
            .await
    }

    pub async fn set_secure_inputs(
        &self,
        pipeline_id: &str,
        values: HashMap<String, String>,
    ) -> anyhow::Result<()> {
        self.store.set_secure_inputs(pipeline_id, values).await
    }

    /// Recovery on process start: reattach a worker to every live run whose
    /// owner died with the previous process.
    pub async fn reattach_orphans(&self) -> Vec<String> {
        let owned = self.cancellations.owned_ids().await;
        let orphans = self.store.orphaned_live_runs(&owned).await;
        let mut reattached = Vec::new();
        for run_id in orphans {
            if self.cancellations.contains(&run_id).await {
                continue;
            }
            if self.store.prepare_reattach(&run_id).await.is_some() {
                self.spawn_worker(&run_id).await;
                reattached.push(run_id);
            }
        }
        reattached
    }
}
