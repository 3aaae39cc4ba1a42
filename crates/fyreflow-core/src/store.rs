//! JSON-backed persistence for pipelines, runs, and per-pipeline secure
//! inputs. In-memory maps are the source of truth and are flushed to disk on
//! every mutation; a per-run snapshot blob additionally lands under the run's
//! storage root so recovery does not depend on the central file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use tokio::fs;
use tokio::sync::RwLock;

use fyreflow_types::{
    normalize_flow, Approval, ApprovalStatus, Flow, Run, RunStatus, StepRun, StepRunStatus,
};

use crate::storage_paths::StorageRoots;

pub struct RunStore {
    base: PathBuf,
    pipelines: RwLock<HashMap<String, Flow>>,
    runs: RwLock<HashMap<String, Run>>,
    secure_inputs: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl RunStore {
    pub async fn new(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;
        let pipelines = read_json_map::<Flow>(&base.join("pipelines.json")).await;
        let runs = read_json_map::<Run>(&base.join("runs.json")).await;
        let secure_inputs =
            read_json_map::<HashMap<String, String>>(&base.join("secure_inputs.json")).await;
        Ok(Self {
            base,
            pipelines: RwLock::new(pipelines),
            runs: RwLock::new(runs),
            secure_inputs: RwLock::new(secure_inputs),
        })
    }

    pub async fn list_pipelines(&self) -> Vec<Flow> {
        let mut pipelines: Vec<Flow> = self.pipelines.read().await.values().cloned().collect();
        pipelines.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        pipelines
    }

    pub async fn get_pipeline(&self, id: &str) -> Option<Flow> {
        self.pipelines.read().await.get(id).cloned()
    }

    /// Persists a flow. Normalization (and with it delivery-gate retargeting)
    /// runs on every mutation.
    pub async fn upsert_pipeline(&self, mut flow: Flow) -> anyhow::Result<Flow> {
        normalize_flow(&mut flow);
        self.pipelines
            .write()
            .await
            .insert(flow.id.clone(), flow.clone());
        self.flush_pipelines().await?;
        Ok(flow)
    }

    pub async fn delete_pipeline(&self, id: &str) -> anyhow::Result<bool> {
        let removed = self.pipelines.write().await.remove(id).is_some();
        if removed {
            self.flush_pipelines().await?;
        }
        Ok(removed)
    }

    pub async fn set_secure_inputs(
        &self,
        pipeline_id: &str,
        values: HashMap<String, String>,
    ) -> anyhow::Result<()> {
        self.secure_inputs
            .write()
            .await
            .insert(pipeline_id.to_string(), values);
        self.flush_secure_inputs().await
    }

    pub async fn secure_inputs_for(&self, pipeline_id: &str) -> HashMap<String, String> {
        self.secure_inputs
            .read()
            .await
            .get(pipeline_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn create_run(
        &self,
        pipeline: Flow,
        task: String,
        inputs: HashMap<String, String>,
        scenario: Option<String>,
    ) -> anyhow::Result<Run> {
        let run = Run::new(pipeline, task, inputs, scenario);
        self.runs
            .write()
            .await
            .insert(run.id.clone(), run.clone());
        self.flush_runs().await?;
        Ok(run)
    }

    pub async fn get_run(&self, id: &str) -> Option<Run> {
        self.runs.read().await.get(id).cloned()
    }

    pub async fn list_runs(&self, limit: usize) -> Vec<Run> {
        let mut runs: Vec<Run> = self.runs.read().await.values().cloned().collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        runs
    }

    /// Applies `update` to the run and flushes. Returns the updated run.
    pub async fn update_run<F>(&self, id: &str, update: F) -> Option<Run>
    where
        F: FnOnce(&mut Run),
    {
        let updated = {
            let mut runs = self.runs.write().await;
            let run = runs.get_mut(id)?;
            update(run);
            run.clone()
        };
        if let Err(err) = self.flush_runs().await {
            tracing::error!(target: "fyreflow.store", "failed to flush runs: {err:#}");
        }
        Some(updated)
    }

    pub async fn append_log(&self, id: &str, line: impl AsRef<str>) {
        let stamped = format!("[{}] {}", Utc::now().format("%H:%M:%S%.3f"), line.as_ref());
        self.update_run(id, |run| run.logs.push(stamped)).await;
    }

    pub async fn set_status(&self, id: &str, status: RunStatus) -> Option<Run> {
        self.update_run(id, |run| {
            if run.status.is_terminal() {
                return;
            }
            run.status = status;
            if status.is_terminal() {
                run.finished_at = Some(Utc::now());
            }
        })
        .await
    }

    /// Upserts the step-run record for one step.
    pub async fn record_step_attempt(&self, id: &str, step_run: StepRun) -> Option<Run> {
        self.update_run(id, |run| {
            match run.step_run_mut(&step_run.step_id) {
                Some(existing) => *existing = step_run,
                None => run.steps.push(step_run),
            }
        })
        .await
    }

    pub async fn add_approval(&self, id: &str, approval: Approval) -> Option<Run> {
        self.update_run(id, |run| run.approvals.push(approval)).await
    }

    pub async fn resolve_approval(
        &self,
        run_id: &str,
        approval_id: &str,
        approve: bool,
        note: Option<String>,
    ) -> anyhow::Result<Run> {
        let updated = self
            .update_run(run_id, |run| {
                if let Some(approval) = run.approvals.iter_mut().find(|a| a.id == approval_id) {
                    if approval.status == ApprovalStatus::Pending {
                        approval.status = if approve {
                            ApprovalStatus::Approved
                        } else {
                            ApprovalStatus::Rejected
                        };
                        approval.resolved_at = Some(Utc::now());
                        approval.note = note;
                    }
                }
            })
            .await
            .with_context(|| format!("run `{run_id}` not found"))?;
        if !updated.approvals.iter().any(|a| a.id == approval_id) {
            anyhow::bail!("approval `{approval_id}` not found on run `{run_id}`");
        }
        Ok(updated)
    }

    /// Flushes the run to its snapshot blob under the run storage root.
    pub async fn snapshot_run_state(&self, id: &str, roots: &StorageRoots) -> anyhow::Result<()> {
        let Some(run) = self.get_run(id).await else {
            anyhow::bail!("run `{id}` not found");
        };
        let path = roots.run_state_path(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, serde_json::to_string_pretty(&run)?)
            .await
            .with_context(|| format!("writing run snapshot to {}", path.display()))?;
        Ok(())
    }

    /// Runs that should have a live worker but do not (their owner died with
    /// the previous process).
    pub async fn orphaned_live_runs(&self, owned_run_ids: &[String]) -> Vec<String> {
        self.runs
            .read()
            .await
            .values()
            .filter(|run| run.status.is_live())
            .filter(|run| !owned_run_ids.contains(&run.id))
            .map(|run| run.id.clone())
            .collect()
    }

    /// Rewinds crash-interrupted step attempts so the rebuilt scheduler can
    /// pick them up: running steps become pending with attempts preserved.
    pub async fn prepare_reattach(&self, id: &str) -> Option<Run> {
        let updated = self
            .update_run(id, |run| {
                for step in &mut run.steps {
                    if step.status == StepRunStatus::Running {
                        step.status = StepRunStatus::Pending;
                        step.finished_at = None;
                    }
                }
                if run.status == RunStatus::Running {
                    run.status = RunStatus::Queued;
                }
            })
            .await?;
        self.append_log(id, "reattached worker after process restart")
            .await;
        Some(updated)
    }

    async fn flush_pipelines(&self) -> anyhow::Result<()> {
        let pipelines = self.pipelines.read().await.clone();
        write_json_map(&self.base.join("pipelines.json"), &pipelines).await
    }

    async fn flush_runs(&self) -> anyhow::Result<()> {
        let runs = self.runs.read().await.clone();
        write_json_map(&self.base.join("runs.json"), &runs).await
    }

    async fn flush_secure_inputs(&self) -> anyhow::Result<()> {
        let secure = self.secure_inputs.read().await.clone();
        write_json_map(&self.base.join("secure_inputs.json"), &secure).await
    }
}

async fn read_json_map<T: serde::de::DeserializeOwned>(path: &Path) -> HashMap<String, T> {
    if !path.exists() {
        return HashMap::new();
    }
    match fs::read_to_string(path).await {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => HashMap::new(),
    }
}

async fn write_json_map<T: serde::Serialize>(
    path: &Path,
    map: &HashMap<String, T>,
) -> anyhow::Result<()> {
    let raw = serde_json::to_string_pretty(map)?;
    fs::write(path, raw)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
