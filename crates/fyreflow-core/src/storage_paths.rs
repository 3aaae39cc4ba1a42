use std::path::PathBuf;

use fyreflow_types::Step;

/// Layout of the artifact tree. Per-run storage is isolated under
/// `runs/<run_id>/`; deliberate sharing happens under `shared/<pipeline_id>/`.
#[derive(Debug, Clone)]
pub struct StorageRoots {
    data_dir: PathBuf,
}

impl StorageRoots {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    pub fn run_root(&self, run_id: &str) -> PathBuf {
        self.data_dir.join("runs").join(run_id)
    }

    pub fn shared_root(&self, pipeline_id: &str) -> PathBuf {
        self.data_dir.join("shared").join(pipeline_id)
    }

    pub fn isolated_root(&self, run_id: &str, step_id: &str) -> PathBuf {
        self.run_root(run_id).join("isolated").join(step_id)
    }

    /// Persistent snapshot blob the recovery path reads after a crash.
    pub fn run_state_path(&self, run_id: &str) -> PathBuf {
        self.run_root(run_id).join("run-state.json")
    }
}

/// Storage roots one step may touch, with disabled modes resolved to `None`.
#[derive(Debug, Clone)]
pub struct StepStoragePaths {
    pub shared: Option<PathBuf>,
    pub isolated: Option<PathBuf>,
    pub run: PathBuf,
}

impl StepStoragePaths {
    pub fn for_step(roots: &StorageRoots, run_id: &str, pipeline_id: &str, step: &Step) -> Self {
        Self {
            shared: step
                .enable_shared_storage
                .then(|| roots.shared_root(pipeline_id)),
            isolated: step
                .enable_isolated_storage
                .then(|| roots.isolated_root(run_id, &step.id)),
            run: roots.run_root(run_id),
        }
    }

    /// Candidate roots for bare relative templates, shared-first.
    pub fn probe_order(&self) -> Vec<PathBuf> {
        let mut order = Vec::new();
        if let Some(shared) = &self.shared {
            order.push(shared.clone());
        }
        if let Some(isolated) = &self.isolated {
            order.push(isolated.clone());
        }
        order.push(self.run.clone());
        order
    }
}
