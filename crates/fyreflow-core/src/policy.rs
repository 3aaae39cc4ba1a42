//! Policy profiles: declarative per-role artifact contracts, plus the core
//! guards that apply regardless of which profiles are registered.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use serde_json::{json, Value};

use fyreflow_types::{Flow, GateKind, GateResult, Step};

use crate::artifacts::ArtifactSnapshot;
use crate::storage_paths::StepStoragePaths;

const MANIFEST_MAX_BYTES: u64 = 8 * 1024 * 1024;
const FRAME_MAP_MIN_BYTES: u64 = 256;

#[derive(Debug, Clone)]
pub struct SkipValidation {
    pub ok: bool,
    pub reason: Option<String>,
}

impl SkipValidation {
    pub fn ok() -> Self {
        Self {
            ok: true,
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: Some(reason.into()),
        }
    }
}

pub trait PolicyProfile: Send + Sync {
    fn id(&self) -> &str;

    /// Heuristic attachment when the step declares no explicit profile ids.
    fn infer_from_step(&self, _step: &Step) -> bool {
        false
    }

    fn default_cache_bypass_input_keys(&self) -> Vec<String> {
        Vec::new()
    }

    fn default_cache_bypass_orchestrator_prompt_patterns(&self) -> Vec<String> {
        Vec::new()
    }

    /// Consulted before `skip_if_artifacts` is honored.
    fn validate_skip_if_artifacts(
        &self,
        _step: &Step,
        _snapshots: &[ArtifactSnapshot],
    ) -> SkipValidation {
        SkipValidation::ok()
    }

    /// Post-execution contract check. May repair an artifact in place; the
    /// rewritten state is reflected before pass/fail is reported.
    fn evaluate_artifact_contracts(
        &self,
        _step: &Step,
        _after: &[ArtifactSnapshot],
    ) -> Vec<GateResult> {
        Vec::new()
    }
}

#[derive(Clone, Default)]
pub struct PolicyRegistry {
    profiles: Vec<Arc<dyn PolicyProfile>>,
}

impl PolicyRegistry {
    pub fn with_builtins() -> Self {
        Self {
            profiles: vec![Arc::new(DesignDeckAssets)],
        }
    }

    pub fn register(&mut self, profile: Arc<dyn PolicyProfile>) {
        self.profiles.push(profile);
    }

    pub fn profiles_for_step(&self, step: &Step) -> Vec<Arc<dyn PolicyProfile>> {
        if !step.policy_profile_ids.is_empty() {
            return self
                .profiles
                .iter()
                .filter(|p| step.policy_profile_ids.iter().any(|id| id == p.id()))
                .cloned()
                .collect();
        }
        self.profiles
            .iter()
            .filter(|p| p.infer_from_step(step))
            .cloned()
            .collect()
    }

    /// Step keys merged with profile defaults: trimmed, lowercased, deduped.
    pub fn merged_cache_bypass_input_keys(
        &self,
        step: &Step,
        profiles: &[Arc<dyn PolicyProfile>],
    ) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut merged = Vec::new();
        let candidates = step
            .cache_bypass_input_keys
            .iter()
            .cloned()
            .chain(profiles.iter().flat_map(|p| p.default_cache_bypass_input_keys()));
        for key in candidates {
            let normalized = key.trim().to_lowercase();
            if !normalized.is_empty() && seen.insert(normalized.clone()) {
                merged.push(normalized);
            }
        }
        merged
    }

    pub fn merged_orchestrator_prompt_patterns(
        &self,
        step: &Step,
        profiles: &[Arc<dyn PolicyProfile>],
    ) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut merged = Vec::new();
        let candidates = step
            .cache_bypass_orchestrator_prompt_patterns
            .iter()
            .cloned()
            .chain(
                profiles
                    .iter()
                    .flat_map(|p| p.default_cache_bypass_orchestrator_prompt_patterns()),
            );
        for pattern in candidates {
            let trimmed = pattern.trim().to_string();
            if !trimmed.is_empty() && seen.insert(trimmed.clone()) {
                merged.push(trimmed);
            }
        }
        merged
    }
}

/// Artifact contracts for the deck-assets toolchain: the frame map must carry
/// a parseable frame count, and the asset manifest must stay file-backed.
pub struct DesignDeckAssets;

impl DesignDeckAssets {
    fn frame_count(value: &Value) -> Option<u64> {
        if let Some(frames) = value.get("frames").and_then(|v| v.as_array()) {
            return Some(frames.len() as u64);
        }
        value.get("frame_count").and_then(|v| v.as_u64())
    }
}

impl PolicyProfile for DesignDeckAssets {
    fn id(&self) -> &str {
        "design_deck_assets"
    }

    fn infer_from_step(&self, step: &Step) -> bool {
        let mentions = |needle: &str| {
            step.prompt.contains(needle)
                || step.required_output_files.iter().any(|t| t.contains(needle))
                || step.skip_if_artifacts.iter().any(|t| t.contains(needle))
        };
        mentions("frame-map.json") && mentions("assets-manifest.json")
    }

    fn default_cache_bypass_input_keys(&self) -> Vec<String> {
        vec!["force_rebuild".to_string(), "refresh_assets".to_string()]
    }

    fn default_cache_bypass_orchestrator_prompt_patterns(&self) -> Vec<String> {
        vec![r"(?i)re-?extract\s+frames".to_string()]
    }

    fn validate_skip_if_artifacts(
        &self,
        _step: &Step,
        snapshots: &[ArtifactSnapshot],
    ) -> SkipValidation {
        for snapshot in snapshots {
            if snapshot.template.contains("frame-map.json") {
                let Some(path) = &snapshot.path else {
                    return SkipValidation::reject("frame map missing on disk");
                };
                if snapshot.size_bytes.unwrap_or(0) < FRAME_MAP_MIN_BYTES {
                    return SkipValidation::reject(format!(
                        "frame map below {FRAME_MAP_MIN_BYTES} bytes; treating as stale"
                    ));
                }
                let Ok(raw) = std::fs::read_to_string(path) else {
                    return SkipValidation::reject("frame map unreadable");
                };
                let Ok(parsed) = serde_json::from_str::<Value>(&raw) else {
                    return SkipValidation::reject("frame map is not valid JSON");
                };
                if Self::frame_count(&parsed).is_none() {
                    return SkipValidation::reject("frame map carries no frame count");
                }
            }
            if snapshot.template.contains("assets-manifest.json") {
                let Some(path) = &snapshot.path else {
                    return SkipValidation::reject("asset manifest missing on disk");
                };
                if snapshot.size_bytes.unwrap_or(0) > MANIFEST_MAX_BYTES {
                    return SkipValidation::reject("asset manifest exceeds 8 MB");
                }
                let Ok(raw) = std::fs::read_to_string(path) else {
                    return SkipValidation::reject("asset manifest unreadable");
                };
                if raw.contains("data:image/") {
                    return SkipValidation::reject("asset manifest carries inline image payloads");
                }
                if !raw.contains("assets/frame-") {
                    return SkipValidation::reject(
                        "asset manifest has no reusable assets/frame-* references",
                    );
                }
            }
        }
        SkipValidation::ok()
    }

    fn evaluate_artifact_contracts(
        &self,
        _step: &Step,
        after: &[ArtifactSnapshot],
    ) -> Vec<GateResult> {
        let mut results = Vec::new();
        for snapshot in after {
            if !snapshot.template.contains("assets-manifest.json") {
                continue;
            }
            let Some(path) = snapshot.path.clone() else {
                continue;
            };
            let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            if size > MANIFEST_MAX_BYTES {
                results.push(
                    GateResult::fail(
                        "policy:design_deck_assets:manifest_size",
                        "asset manifest size contract",
                        GateKind::ArtifactExists,
                        true,
                        format!("assets-manifest.json is {size} bytes; limit is 8 MB"),
                    )
                    .with_details(json!({ "path": path, "size_bytes": size })),
                );
                continue;
            }
            let Ok(raw) = std::fs::read_to_string(&path) else {
                continue;
            };
            if raw.contains("data:image/") {
                match rewrite_inline_assets(&path, &raw) {
                    Ok(rewritten) => results.push(
                        GateResult::pass(
                            "policy:design_deck_assets:inline_payloads",
                            "asset manifest payload contract",
                            GateKind::ArtifactExists,
                            format!(
                                "rewrote {rewritten} inline image payloads into file-backed assets"
                            ),
                        )
                        .with_details(json!({ "path": path, "rewritten": rewritten })),
                    ),
                    Err(err) => results.push(
                        GateResult::fail(
                            "policy:design_deck_assets:inline_payloads",
                            "asset manifest payload contract",
                            GateKind::ArtifactExists,
                            true,
                            format!("assets-manifest.json carries inline image payloads: {err}"),
                        )
                        .with_details(json!({ "path": path })),
                    ),
                }
            }
        }
        results
    }
}

/// Rewrites `data:image/<ext>;base64,<payload>` strings in the manifest into
/// files under `assets/` next to it, returning how many were rewritten.
fn rewrite_inline_assets(manifest_path: &Path, raw: &str) -> anyhow::Result<usize> {
    let mut value: Value = serde_json::from_str(raw)?;
    let assets_dir = manifest_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("assets");
    std::fs::create_dir_all(&assets_dir)?;
    let mut counter = 0usize;
    rewrite_value(&mut value, &assets_dir, &mut counter)?;
    if counter > 0 {
        std::fs::write(manifest_path, serde_json::to_string_pretty(&value)?)?;
    }
    Ok(counter)
}

fn rewrite_value(value: &mut Value, assets_dir: &Path, counter: &mut usize) -> anyhow::Result<()> {
    match value {
        Value::String(text) => {
            if let Some(rest) = text.strip_prefix("data:image/") {
                let (ext, payload) = rest
                    .split_once(";base64,")
                    .ok_or_else(|| anyhow::anyhow!("unsupported data URI encoding"))?;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(payload.trim())
                    .map_err(|err| anyhow::anyhow!("base64 decode failed: {err}"))?;
                *counter += 1;
                let file_name = format!("frame-asset-{counter}.{ext}");
                std::fs::write(assets_dir.join(&file_name), bytes)?;
                *text = format!("assets/{file_name}");
            }
        }
        Value::Array(items) => {
            for item in items {
                rewrite_value(item, assets_dir, counter)?;
            }
        }
        Value::Object(map) => {
            for child in map.values_mut() {
                rewrite_value(child, assets_dir, counter)?;
            }
        }
        _ => {}
    }
    Ok(())
}

const HELPER_SCRIPT_EXTENSIONS: [&str; 4] = ["py", "sh", "js", "ts"];

/// Lists helper-script files currently present under the step's writable
/// shared/isolated roots.
pub fn scan_helper_scripts(paths: &StepStoragePaths) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for root in [paths.shared.as_ref(), paths.isolated.as_ref()].into_iter().flatten() {
        collect_scripts(root, 0, &mut found);
    }
    found.sort();
    found
}

fn collect_scripts(dir: &Path, depth: usize, out: &mut Vec<PathBuf>) {
    if depth > 6 {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_scripts(&path, depth + 1, out);
            continue;
        }
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        if HELPER_SCRIPT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
            out.push(path);
        }
    }
}

/// Blocks a step that dropped an undeclared helper script into storage.
pub fn evaluate_helper_script_guard(
    step: &Step,
    scripts_before: &[PathBuf],
    scripts_after: &[PathBuf],
) -> Option<GateResult> {
    let before: HashSet<&PathBuf> = scripts_before.iter().collect();
    let unexpected: Vec<&PathBuf> = scripts_after
        .iter()
        .filter(|path| !before.contains(path))
        .filter(|path| {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            !step
                .required_output_files
                .iter()
                .any(|template| template.contains(name))
        })
        .collect();
    if unexpected.is_empty() {
        return None;
    }
    Some(
        GateResult::fail(
            "guard:helper_scripts",
            "unexpected helper script",
            GateKind::ArtifactExists,
            true,
            format!(
                "step wrote undeclared helper scripts: {}",
                unexpected
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        )
        .with_details(json!({ "scripts": unexpected })),
    )
}

/// Templates owned by analysis steps elsewhere in the flow; a non-owner
/// mutating one of them is blocked.
pub fn immutable_monitored_templates(flow: &Flow, step: &Step) -> Vec<String> {
    let mut templates = Vec::new();
    for owner in &flow.steps {
        if owner.id == step.id || !owner.role.owns_immutable_artifacts() {
            continue;
        }
        for template in &owner.required_output_files {
            if !templates.contains(template) {
                templates.push(template.clone());
            }
        }
    }
    templates
}

pub fn evaluate_immutable_guard(
    step: &Step,
    before: &[ArtifactSnapshot],
    after: &[ArtifactSnapshot],
) -> Vec<GateResult> {
    let mut results = Vec::new();
    for after_snapshot in after {
        let Some(before_snapshot) = before
            .iter()
            .find(|s| s.template == after_snapshot.template)
        else {
            continue;
        };
        if before_snapshot.exists && after_snapshot.changed_since(before_snapshot) {
            results.push(
                GateResult::fail(
                    &format!("guard:immutable:{}", after_snapshot.template),
                    "immutable artifact guard",
                    GateKind::ArtifactExists,
                    true,
                    format!(
                        "step `{}` mutated `{}`, which is owned by an upstream analysis step",
                        step.id, after_snapshot.template
                    ),
                )
                .with_details(json!({
                    "before": before_snapshot,
                    "after": after_snapshot,
                })),
            );
        }
    }
    results
}

/// Freshness of the step's own declared artifacts across the attempt.
pub fn evaluate_freshness_guard(
    before: &[ArtifactSnapshot],
    after: &[ArtifactSnapshot],
) -> Vec<GateResult> {
    let mut results = Vec::new();
    for after_snapshot in after {
        let gate_id = format!("guard:freshness:{}", after_snapshot.template);
        let before_snapshot = before
            .iter()
            .find(|s| s.template == after_snapshot.template);
        if !after_snapshot.exists {
            results.push(GateResult::fail(
                &gate_id,
                "required artifact freshness",
                GateKind::ArtifactExists,
                true,
                format!("artifact `{}` absent after execution", after_snapshot.template),
            ));
            continue;
        }
        let changed = before_snapshot
            .map(|b| after_snapshot.changed_since(b))
            .unwrap_or(true);
        if changed {
            results.push(GateResult::pass(
                &gate_id,
                "required artifact freshness",
                GateKind::ArtifactExists,
                format!("artifact `{}` updated this attempt", after_snapshot.template),
            ));
        } else {
            results.push(GateResult::pass(
                &gate_id,
                "required artifact freshness",
                GateKind::ArtifactExists,
                format!("artifact `{}` already up-to-date", after_snapshot.template),
            ));
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_paths::StorageRoots;

    fn step(json: serde_json::Value) -> Step {
        serde_json::from_value(json).expect("step")
    }

    fn snapshot_for(path: &Path, template: &str) -> ArtifactSnapshot {
        let meta = std::fs::metadata(path).ok();
        ArtifactSnapshot {
            template: template.to_string(),
            path: Some(path.to_path_buf()),
            exists: meta.is_some(),
            size_bytes: meta.as_ref().map(|m| m.len()),
            mtime_ms: Some(0),
            disabled_storage: false,
        }
    }

    #[test]
    fn profile_is_inferred_from_deck_artifacts() {
        let registry = PolicyRegistry::with_builtins();
        let s = step(serde_json::json!({
            "id": "s1",
            "required_output_files": ["frame-map.json", "assets-manifest.json"],
        }));
        let profiles = registry.profiles_for_step(&s);
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].id(), "design_deck_assets");
    }

    #[test]
    fn cache_bypass_keys_merge_dedup_and_lowercase() {
        let registry = PolicyRegistry::with_builtins();
        let s = step(serde_json::json!({
            "id": "s1",
            "policy_profile_ids": ["design_deck_assets"],
            "cache_bypass_input_keys": [" Force_Rebuild ", "custom_key"],
        }));
        let profiles = registry.profiles_for_step(&s);
        let keys = registry.merged_cache_bypass_input_keys(&s, &profiles);
        assert_eq!(keys, vec!["force_rebuild", "custom_key", "refresh_assets"]);
    }

    #[test]
    fn undersized_frame_map_rejects_skip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("frame-map.json");
        std::fs::write(&path, "{}").expect("write");
        let validation = DesignDeckAssets.validate_skip_if_artifacts(
            &step(serde_json::json!({ "id": "s1" })),
            &[snapshot_for(&path, "frame-map.json")],
        );
        assert!(!validation.ok);
        assert!(validation.reason.unwrap().contains("bytes"));
    }

    #[test]
    fn valid_frame_map_and_manifest_allow_skip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let frame_map = dir.path().join("frame-map.json");
        let frames: Vec<Value> = (0..12)
            .map(|i| serde_json::json!({ "index": i, "source": format!("slide-{i}.png") }))
            .collect();
        std::fs::write(
            &frame_map,
            serde_json::to_string_pretty(&serde_json::json!({ "frames": frames })).unwrap(),
        )
        .expect("write");
        let manifest = dir.path().join("assets-manifest.json");
        std::fs::write(
            &manifest,
            r#"{"assets": ["assets/frame-1.png", "assets/frame-2.png"]}"#,
        )
        .expect("write");
        let validation = DesignDeckAssets.validate_skip_if_artifacts(
            &step(serde_json::json!({ "id": "s1" })),
            &[
                snapshot_for(&frame_map, "frame-map.json"),
                snapshot_for(&manifest, "assets-manifest.json"),
            ],
        );
        assert!(validation.ok, "{:?}", validation.reason);
    }

    #[test]
    fn inline_payloads_are_rewritten_to_file_backed_assets() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manifest = dir.path().join("assets-manifest.json");
        // A 1x1 transparent PNG.
        let payload = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";
        std::fs::write(
            &manifest,
            format!(r#"{{"frames": [{{"image": "data:image/png;base64,{payload}"}}]}}"#),
        )
        .expect("write");
        let results = DesignDeckAssets.evaluate_artifact_contracts(
            &step(serde_json::json!({ "id": "s1" })),
            &[snapshot_for(&manifest, "assets-manifest.json")],
        );
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, fyreflow_types::GateResultStatus::Pass);
        let rewritten = std::fs::read_to_string(&manifest).expect("read");
        assert!(rewritten.contains("assets/frame-asset-1.png"));
        assert!(!rewritten.contains("data:image/"));
        assert!(dir.path().join("assets/frame-asset-1.png").exists());
    }

    #[test]
    fn undeclared_helper_script_blocks_step() {
        let s = step(serde_json::json!({
            "id": "s1",
            "required_output_files": ["{{shared_storage_path}}/export.py"],
        }));
        let before = vec![];
        let after = vec![
            PathBuf::from("/shared/export.py"),
            PathBuf::from("/shared/sneaky-fix.sh"),
        ];
        let result = evaluate_helper_script_guard(&s, &before, &after).expect("blocked");
        assert!(result.is_blocking_failure());
        assert!(result.message.contains("sneaky-fix.sh"));
        assert!(!result.message.contains("export.py"));
    }

    #[test]
    fn helper_scripts_present_before_attempt_do_not_block() {
        let s = step(serde_json::json!({ "id": "s1" }));
        let scripts = vec![PathBuf::from("/shared/legacy.py")];
        assert!(evaluate_helper_script_guard(&s, &scripts, &scripts).is_none());
    }

    #[test]
    fn mutating_an_upstream_artifact_blocks() {
        let s = step(serde_json::json!({ "id": "writer" }));
        let before = vec![ArtifactSnapshot {
            template: "frame-map.json".to_string(),
            path: Some(PathBuf::from("/shared/frame-map.json")),
            exists: true,
            size_bytes: Some(500),
            mtime_ms: Some(1_000),
            disabled_storage: false,
        }];
        let mut after = before.clone();
        after[0].mtime_ms = Some(2_000);
        let results = evaluate_immutable_guard(&s, &before, &after);
        assert_eq!(results.len(), 1);
        assert!(results[0].is_blocking_failure());
    }

    #[test]
    fn unchanged_preexisting_artifact_is_already_up_to_date() {
        let snapshot = ArtifactSnapshot {
            template: "report.md".to_string(),
            path: Some(PathBuf::from("/run/report.md")),
            exists: true,
            size_bytes: Some(10),
            mtime_ms: Some(1),
            disabled_storage: false,
        };
        let results = evaluate_freshness_guard(&[snapshot.clone()], &[snapshot]);
        assert_eq!(results[0].status, fyreflow_types::GateResultStatus::Pass);
        assert!(results[0].message.contains("already up-to-date"));
    }

    #[test]
    fn absent_artifact_after_attempt_blocks() {
        let after = ArtifactSnapshot {
            template: "report.md".to_string(),
            path: None,
            exists: false,
            size_bytes: None,
            mtime_ms: None,
            disabled_storage: false,
        };
        let results = evaluate_freshness_guard(&[], &[after]);
        assert!(results[0].is_blocking_failure());
    }

    #[test]
    fn monitored_templates_exclude_the_owner_itself() {
        let flow: Flow = serde_json::from_value(serde_json::json!({
            "id": "f",
            "steps": [
                { "id": "extract", "role": "analysis", "required_output_files": ["frame-map.json"] },
                { "id": "build", "role": "executor" },
            ],
            "links": [],
        }))
        .expect("flow");
        let build = flow.step("build").unwrap();
        assert_eq!(immutable_monitored_templates(&flow, build), vec!["frame-map.json"]);
        let extract = flow.step("extract").unwrap();
        assert!(immutable_monitored_templates(&flow, extract).is_empty());
    }

    #[test]
    fn scan_finds_scripts_under_enabled_roots() {
        let dir = tempfile::tempdir().expect("tempdir");
        let roots = StorageRoots::new(dir.path());
        let s = step(serde_json::json!({ "id": "s1", "enable_shared_storage": true }));
        let paths = StepStoragePaths::for_step(&roots, "r1", "p1", &s);
        let shared = paths.shared.clone().unwrap();
        std::fs::create_dir_all(shared.join("nested")).expect("mkdir");
        std::fs::write(shared.join("nested/helper.py"), "print()").expect("write");
        std::fs::write(shared.join("notes.md"), "fine").expect("write");
        let scripts = scan_helper_scripts(&paths);
        assert_eq!(scripts.len(), 1);
        assert!(scripts[0].ends_with("nested/helper.py"));
    }
}
