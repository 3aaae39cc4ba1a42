//! Artifact template resolution. Templates name files relative to one of the
//! step's storage roots, either explicitly (`{{shared_storage_path}}/x.json`)
//! or as bare relative paths probed shared-first.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

use crate::storage_paths::StepStoragePaths;

pub const SHARED_STORAGE_TEMPLATE: &str = "{{shared_storage_path}}";
pub const ISOLATED_STORAGE_TEMPLATE: &str = "{{isolated_storage_path}}";
pub const RUN_STORAGE_TEMPLATE: &str = "{{run_storage_path}}";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactResolution {
    pub template: String,
    pub candidate_paths: Vec<PathBuf>,
    pub found_path: Option<PathBuf>,
    pub exists: bool,
    pub size_bytes: Option<u64>,
    pub mtime_ms: Option<u64>,
    /// The template referenced a storage mode the step has disabled; nothing
    /// was probed.
    pub disabled_storage: bool,
}

/// Substitutes `{{input.<key>}}` placeholders. Keys are matched after
/// normalization, so templates may use either spelling.
fn substitute_inputs(template: &str, inputs: &HashMap<String, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in inputs {
        let needle = format!("{{{{input.{key}}}}}");
        if out.contains(&needle) {
            out = out.replace(&needle, value);
        }
    }
    out
}

/// Resolves a template against the step's storage roots. Resolution depends
/// only on its inputs and the current filesystem.
pub fn resolve(
    template: &str,
    paths: &StepStoragePaths,
    inputs: &HashMap<String, String>,
) -> ArtifactResolution {
    let substituted = substitute_inputs(template, inputs);
    let mut resolution = ArtifactResolution {
        template: template.to_string(),
        candidate_paths: Vec::new(),
        found_path: None,
        exists: false,
        size_bytes: None,
        mtime_ms: None,
        disabled_storage: false,
    };

    if substituted.contains(SHARED_STORAGE_TEMPLATE) {
        let Some(shared) = &paths.shared else {
            resolution.disabled_storage = true;
            return resolution;
        };
        let expanded = substituted.replace(SHARED_STORAGE_TEMPLATE, &shared.to_string_lossy());
        resolution.candidate_paths.push(PathBuf::from(expanded));
    } else if substituted.contains(ISOLATED_STORAGE_TEMPLATE) {
        let Some(isolated) = &paths.isolated else {
            resolution.disabled_storage = true;
            return resolution;
        };
        let expanded = substituted.replace(ISOLATED_STORAGE_TEMPLATE, &isolated.to_string_lossy());
        resolution.candidate_paths.push(PathBuf::from(expanded));
    } else if substituted.contains(RUN_STORAGE_TEMPLATE) {
        let expanded = substituted.replace(RUN_STORAGE_TEMPLATE, &paths.run.to_string_lossy());
        resolution.candidate_paths.push(PathBuf::from(expanded));
    } else {
        for root in paths.probe_order() {
            resolution.candidate_paths.push(root.join(&substituted));
        }
    }

    for candidate in &resolution.candidate_paths {
        let Ok(meta) = std::fs::metadata(candidate) else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        resolution.found_path = Some(candidate.clone());
        resolution.exists = true;
        resolution.size_bytes = Some(meta.len());
        resolution.mtime_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64);
        break;
    }
    resolution
}

/// Point-in-time view of one artifact, captured before and after a step
/// attempt to drive freshness and immutability checks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactSnapshot {
    pub template: String,
    pub path: Option<PathBuf>,
    pub exists: bool,
    pub size_bytes: Option<u64>,
    pub mtime_ms: Option<u64>,
    pub disabled_storage: bool,
}

impl ArtifactSnapshot {
    pub fn capture(
        template: &str,
        paths: &StepStoragePaths,
        inputs: &HashMap<String, String>,
    ) -> Self {
        let resolution = resolve(template, paths, inputs);
        Self {
            template: template.to_string(),
            path: resolution.found_path,
            exists: resolution.exists,
            size_bytes: resolution.size_bytes,
            mtime_ms: resolution.mtime_ms,
            disabled_storage: resolution.disabled_storage,
        }
    }

    pub fn changed_since(&self, before: &ArtifactSnapshot) -> bool {
        self.size_bytes != before.size_bytes || self.mtime_ms != before.mtime_ms
    }
}

pub fn capture_all(
    templates: &[String],
    paths: &StepStoragePaths,
    inputs: &HashMap<String, String>,
) -> Vec<ArtifactSnapshot> {
    templates
        .iter()
        .map(|t| ArtifactSnapshot::capture(t, paths, inputs))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_paths::StorageRoots;
    use fyreflow_types::Step;

    fn paths(dir: &std::path::Path, shared: bool, isolated: bool) -> StepStoragePaths {
        let roots = StorageRoots::new(dir);
        let step: Step = serde_json::from_value(serde_json::json!({
            "id": "s1",
            "enable_shared_storage": shared,
            "enable_isolated_storage": isolated,
        }))
        .expect("step");
        StepStoragePaths::for_step(&roots, "r1", "p1", &step)
    }

    #[test]
    fn shared_template_with_disabled_shared_storage_is_marked() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resolution = resolve(
            "{{shared_storage_path}}/frame-map.json",
            &paths(dir.path(), false, false),
            &HashMap::new(),
        );
        assert!(resolution.disabled_storage);
        assert!(resolution.candidate_paths.is_empty());
        assert!(!resolution.exists);
    }

    #[test]
    fn bare_template_probes_shared_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = paths(dir.path(), true, true);
        let shared_dir = paths.shared.clone().expect("shared root");
        std::fs::create_dir_all(&shared_dir).expect("mkdir");
        std::fs::write(shared_dir.join("report.md"), "hello").expect("write");
        let resolution = resolve("report.md", &paths, &HashMap::new());
        assert!(resolution.exists);
        assert_eq!(resolution.found_path, Some(shared_dir.join("report.md")));
        assert_eq!(resolution.size_bytes, Some(5));
        assert_eq!(resolution.candidate_paths.len(), 3);
    }

    #[test]
    fn input_placeholders_are_substituted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = paths(dir.path(), true, false);
        let run_dir = paths.run.clone();
        std::fs::create_dir_all(&run_dir).expect("mkdir");
        std::fs::write(run_dir.join("deck-v2.html"), "<html>").expect("write");
        let mut inputs = HashMap::new();
        inputs.insert("version".to_string(), "v2".to_string());
        let resolution = resolve(
            "{{run_storage_path}}/deck-{{input.version}}.html",
            &paths,
            &inputs,
        );
        assert!(resolution.exists);
    }

    #[test]
    fn resolution_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = paths(dir.path(), true, false);
        let first = resolve("missing.json", &paths, &HashMap::new());
        let second = resolve("missing.json", &paths, &HashMap::new());
        assert_eq!(first, second);
    }

    #[test]
    fn snapshot_change_detection_tracks_size_and_mtime() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = paths(dir.path(), false, false);
        std::fs::create_dir_all(&paths.run).expect("mkdir");
        let file = paths.run.join("out.json");
        std::fs::write(&file, "{}").expect("write");
        let before = ArtifactSnapshot::capture("out.json", &paths, &HashMap::new());
        std::fs::write(&file, "{\"frames\": []}").expect("write");
        let after = ArtifactSnapshot::capture("out.json", &paths, &HashMap::new());
        assert!(after.changed_since(&before));
        assert!(!before.changed_since(&before));
    }
}
