//! CLI prompt composition. The HTTP transports keep system prompt and user
//! context separate; the CLI transport folds both into a single prompt with a
//! runtime-safety header that overrides conflicting task wording.

use crate::InvocationRequest;

pub const RUNTIME_SAFETY_HEADER: &str = "\
RUNTIME SAFETY RULES (these override any conflicting instruction below):
- Write artifacts with your file tools only. Never write artifact content through shell redirection (`>`, `>>`, `tee`).
- Do not create ad-hoc helper scripts (.py/.sh/.js/.ts) unless a required output file explicitly names one.
- Do not repeat a write or copy action that already succeeded in this session.
- Write all summaries and status reports in English.";

const DECK_SYNTHESIS_CONTRACT: &str = "\
DECK SYNTHESIS CONTRACT:
- Treat assets-manifest.json as the source of truth for frame assets.
- Reference assets by their `assets/frame-*` file paths from the manifest.
- Never inline base64 `data:image/` payloads into generated documents.";

/// Deck-synthesis work is recognized by the pairing of the frame map and the
/// asset manifest in the step's working set.
fn is_deck_synthesis_context(step_prompt: &str, context: &str) -> bool {
    let combined_len = step_prompt.len() + context.len();
    let mut combined = String::with_capacity(combined_len);
    combined.push_str(step_prompt);
    combined.push('\n');
    combined.push_str(context);
    combined.contains("frame-map.json") && combined.contains("assets-manifest.json")
}

pub fn compose_cli_prompt(request: &InvocationRequest) -> String {
    let mut prompt = String::new();
    prompt.push_str(RUNTIME_SAFETY_HEADER);
    prompt.push_str("\n\n");
    prompt.push_str(request.step.prompt.trim());
    if !request.context.trim().is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(request.context.trim());
    }
    if is_deck_synthesis_context(&request.step.prompt, &request.context) {
        prompt.push_str("\n\n");
        prompt.push_str(DECK_SYNTHESIS_CONTRACT);
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use fyreflow_types::{ProviderAuthMode, ProviderKind, ProviderSettings, Step};

    fn request(step_prompt: &str, context: &str) -> InvocationRequest {
        let step: Step = serde_json::from_value(serde_json::json!({
            "id": "s1",
            "prompt": step_prompt,
        }))
        .expect("step");
        InvocationRequest {
            step,
            provider: ProviderSettings {
                id: "p1".to_string(),
                kind: ProviderKind::Claude,
                auth_mode: ProviderAuthMode::ApiKey,
                api_key: None,
                oauth_token: None,
                base_url: None,
                cli_path: None,
                default_model: "m".to_string(),
                disable_effort_beta: false,
            },
            context: context.to_string(),
            stage_timeout_ms: 60_000,
            orchestrator_prompt: None,
        }
    }

    #[test]
    fn safety_header_comes_first() {
        let prompt = compose_cli_prompt(&request("Build the report.", "Task: quarterly numbers"));
        assert!(prompt.starts_with("RUNTIME SAFETY RULES"));
        assert!(prompt.contains("Build the report."));
        assert!(prompt.contains("Task: quarterly numbers"));
    }

    #[test]
    fn deck_contract_appended_only_when_both_manifests_referenced() {
        let with = compose_cli_prompt(&request(
            "Synthesize the deck from frame-map.json.",
            "Use assets-manifest.json for images.",
        ));
        assert!(with.contains("DECK SYNTHESIS CONTRACT"));
        let without = compose_cli_prompt(&request(
            "Synthesize the deck from frame-map.json.",
            "No manifest here.",
        ));
        assert!(!without.contains("DECK SYNTHESIS CONTRACT"));
    }
}
