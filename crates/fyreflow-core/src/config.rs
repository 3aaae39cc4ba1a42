//! Engine configuration from the environment, plus the provider settings
//! file under the data dir.

use std::path::PathBuf;

use fyreflow_providers::{CliOptions, PermissionMode};
use fyreflow_types::ProviderSettings;

pub const DEFAULT_PORT: u16 = 4280;
pub const DEFAULT_RUN_POLL_INTERVAL_MS: u64 = 200;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_RUN_CONTROL_POLL_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub api_auth_token: Option<String>,
    pub secrets_key_present: bool,
    pub remote_mode: bool,
    pub cors_origins: Vec<String>,
    pub run_poll_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub run_control_poll_ms: u64,
    /// Global "disable cache for all steps" directive.
    pub disable_step_cache: bool,
    pub cli_options: CliOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            data_dir: PathBuf::from("fyreflow-data"),
            api_auth_token: None,
            secrets_key_present: false,
            remote_mode: false,
            cors_origins: Vec::new(),
            run_poll_interval_ms: DEFAULT_RUN_POLL_INTERVAL_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            run_control_poll_ms: DEFAULT_RUN_CONTROL_POLL_MS,
            disable_step_cache: false,
            cli_options: CliOptions::default(),
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_u64(name: &str, default: u64) -> u64 {
    env_string(name)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    match env_string(name).as_deref() {
        Some("0") | Some("false") => false,
        Some(_) => true,
        None => default,
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let secrets_key_present = env_string("DASHBOARD_SECRETS_KEY").is_some();
        let remote_mode = env_flag("FYREFLOW_REMOTE_MODE", false);
        if remote_mode && !secrets_key_present {
            tracing::warn!(
                target: "fyreflow.config",
                "DASHBOARD_SECRETS_KEY is not set in remote mode; provider credentials will not persist encrypted"
            );
        }
        Self {
            port: env_string("PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            data_dir: env_string("FYREFLOW_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("fyreflow-data")),
            api_auth_token: env_string("API_AUTH_TOKEN"),
            secrets_key_present,
            remote_mode,
            cors_origins: env_string("FYREFLOW_CORS_ORIGINS")
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            run_poll_interval_ms: env_u64(
                "FYREFLOW_RUN_POLL_INTERVAL_MS",
                DEFAULT_RUN_POLL_INTERVAL_MS,
            ),
            heartbeat_interval_ms: env_u64(
                "FYREFLOW_HEARTBEAT_INTERVAL_MS",
                DEFAULT_HEARTBEAT_INTERVAL_MS,
            ),
            run_control_poll_ms: env_u64(
                "FYREFLOW_RUN_CONTROL_POLL_MS",
                DEFAULT_RUN_CONTROL_POLL_MS,
            ),
            disable_step_cache: env_flag("FYREFLOW_DISABLE_STEP_CACHE", false),
            cli_options: cli_options_from_env(),
        }
    }
}

fn cli_options_from_env() -> CliOptions {
    CliOptions {
        codex_path: env_string("CODEX_CLI_PATH").map(PathBuf::from),
        claude_path: env_string("CLAUDE_CLI_PATH").map(PathBuf::from),
        skip_permissions: env_flag("CLAUDE_CLI_SKIP_PERMISSIONS", true),
        strict_mcp: env_flag("CLAUDE_CLI_STRICT_MCP", true),
        disable_slash_commands: env_flag("CLAUDE_CLI_DISABLE_SLASH_COMMANDS", true),
        setting_sources: env_string("CLAUDE_CLI_SETTING_SOURCES")
            .unwrap_or_else(|| "user".to_string()),
        permission_mode: env_string("CLAUDE_CLI_PERMISSION_MODE")
            .as_deref()
            .and_then(PermissionMode::parse),
    }
}

/// Reads `providers.json` from the data dir; a missing file means no
/// providers are configured yet.
pub async fn load_provider_settings(data_dir: &PathBuf) -> anyhow::Result<Vec<ProviderSettings>> {
    let path = data_dir.join("providers.json");
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = tokio::fs::read_to_string(&path).await?;
    let providers = serde_json::from_str::<Vec<ProviderSettings>>(&raw)?;
    Ok(providers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_numeric_options_fall_back_to_defaults() {
        assert_eq!(env_u64("FYREFLOW_TEST_UNSET_U64", 42), 42);
    }

    #[tokio::test]
    async fn missing_providers_file_is_empty_catalog() {
        let dir = tempfile::tempdir().expect("tempdir");
        let providers = load_provider_settings(&dir.path().to_path_buf())
            .await
            .expect("load");
        assert!(providers.is_empty());
    }

    #[tokio::test]
    async fn providers_file_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("providers.json");
        tokio::fs::write(
            &path,
            r#"[{"id":"claude-main","kind":"claude","auth_mode":"oauth","oauth_token":"sk-ant-oat01-x","default_model":"claude-sonnet-4"}]"#,
        )
        .await
        .expect("write");
        let providers = load_provider_settings(&dir.path().to_path_buf())
            .await
            .expect("load");
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].id, "claude-main");
    }
}
