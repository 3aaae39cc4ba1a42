//! Provider invocation: transport selection, retry policy, and the concrete
//! HTTP and CLI transports behind one trait.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use fyreflow_types::{
    is_claude_setup_token, looks_encrypted, ProviderAuthMode, ProviderKind, ProviderSettings, Step,
};

mod cli;
mod http;
mod prompt;

pub use cli::{extract_tool_calls, CliOptions, PermissionMode, ToolCallSummary};
pub use prompt::{compose_cli_prompt, RUNTIME_SAFETY_HEADER};

/// Channel the invoker streams human-readable progress lines into; the
/// scheduler drains it into the run log.
pub type RunLogSender = UnboundedSender<String>;

#[derive(Debug, Clone, Error)]
#[error("provider api error: status {status}: {detail}")]
pub struct ProviderApiError {
    pub status: u16,
    pub retry_after_ms: Option<u64>,
    pub detail: String,
}

impl ProviderApiError {
    pub fn is_retryable(&self) -> bool {
        matches!(self.status, 408 | 409 | 425 | 429 | 500 | 502 | 503 | 504)
    }
}

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error(transparent)]
    Api(#[from] ProviderApiError),
    #[error("provider failure: {0}")]
    Fatal(String),
    #[error("provider call timed out after {elapsed_ms} ms")]
    Timeout { elapsed_ms: u64 },
    #[error("provider call aborted")]
    Aborted,
}

impl InvokeError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Api(err) => err.is_retryable(),
            Self::Timeout { .. } => true,
            Self::Fatal(_) | Self::Aborted => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub step: Step,
    pub provider: ProviderSettings,
    pub context: String,
    pub stage_timeout_ms: u64,
    /// Prompt of the orchestrator this step hangs off, when any; consulted by
    /// cache-bypass patterns and the CLI safety header.
    pub orchestrator_prompt: Option<String>,
}

#[async_trait]
pub trait ProviderInvoker: Send + Sync {
    async fn invoke(
        &self,
        request: &InvocationRequest,
        cancel: CancellationToken,
        log: RunLogSender,
    ) -> Result<String, InvokeError>;
}

/// Configured providers, loadable from `providers.json` and reloadable at
/// runtime.
#[derive(Clone, Default)]
pub struct ProviderCatalog {
    providers: Arc<RwLock<Vec<ProviderSettings>>>,
}

impl ProviderCatalog {
    pub fn new(providers: Vec<ProviderSettings>) -> Self {
        Self {
            providers: Arc::new(RwLock::new(providers)),
        }
    }

    pub async fn reload(&self, providers: Vec<ProviderSettings>) {
        *self.providers.write().await = providers;
    }

    pub async fn list(&self) -> Vec<ProviderSettings> {
        self.providers.read().await.clone()
    }

    pub async fn get(&self, provider_id: &str) -> Option<ProviderSettings> {
        self.providers
            .read()
            .await
            .iter()
            .find(|p| p.id == provider_id)
            .cloned()
    }

    /// Resolves the step's provider, falling back to the first configured one.
    pub async fn resolve(&self, provider_id: &str) -> anyhow::Result<ProviderSettings> {
        let providers = self.providers.read().await;
        if !provider_id.trim().is_empty() {
            if let Some(found) = providers.iter().find(|p| p.id == provider_id) {
                return Ok(found.clone());
            }
            let available = providers.iter().map(|p| p.id.clone()).collect::<Vec<_>>();
            anyhow::bail!(
                "provider `{}` is not configured. configured providers: {}",
                provider_id,
                available.join(", ")
            );
        }
        providers
            .first()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No provider configured."))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    Http,
    Cli,
}

/// Picks HTTP when a usable credential exists, otherwise falls back to the
/// CLI transport. Credential shape problems fail fast rather than falling
/// through to a transport that would fail later.
fn select_transport(provider: &ProviderSettings) -> Result<Transport, InvokeError> {
    if provider.auth_mode == ProviderAuthMode::ApiKey {
        if let Some(key) = provider.usable_api_key() {
            if looks_encrypted(key) {
                return Err(InvokeError::Fatal(format!(
                    "provider `{}` credential cannot be decrypted; check the secrets key",
                    provider.id
                )));
            }
            return Ok(Transport::Http);
        }
    }
    if let Some(token) = provider.usable_oauth_token() {
        if looks_encrypted(token) {
            return Err(InvokeError::Fatal(format!(
                "provider `{}` credential cannot be decrypted; check the secrets key",
                provider.id
            )));
        }
        if provider.kind == ProviderKind::Claude && !is_claude_setup_token(token) {
            return Err(InvokeError::Fatal(format!(
                "provider `{}` OAuth value is not a sk-ant-oat01 setup-token",
                provider.id
            )));
        }
        return Ok(Transport::Http);
    }
    Ok(Transport::Cli)
}

/// `fast_mode` is only honored for API-key transports with a key present.
fn effective_fast_mode(step: &Step, provider: &ProviderSettings, log: &RunLogSender) -> bool {
    if !step.fast_mode {
        return false;
    }
    let api_key_backed =
        provider.auth_mode == ProviderAuthMode::ApiKey && provider.usable_api_key().is_some();
    if !api_key_backed {
        let _ = log.send(format!(
            "fast_mode disabled for step `{}`: provider `{}` is not API-key backed",
            step.id, provider.id
        ));
        return false;
    }
    true
}

const RETRY_MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 500;
const RETRY_MAX_DELAY_MS: u64 = 8_000;

fn backoff_delay_ms(attempt: u32, retry_after_ms: Option<u64>) -> u64 {
    if let Some(hinted) = retry_after_ms {
        return hinted.min(RETRY_MAX_DELAY_MS);
    }
    (RETRY_BASE_DELAY_MS << attempt.min(4)).min(RETRY_MAX_DELAY_MS)
}

pub struct DefaultProviderInvoker {
    catalog: ProviderCatalog,
    http: reqwest::Client,
    cli_options: CliOptions,
}

impl DefaultProviderInvoker {
    pub fn new(catalog: ProviderCatalog, cli_options: CliOptions) -> Self {
        Self {
            catalog,
            http: reqwest::Client::new(),
            cli_options,
        }
    }

    pub fn catalog(&self) -> &ProviderCatalog {
        &self.catalog
    }

    async fn invoke_once(
        &self,
        request: &InvocationRequest,
        transport: Transport,
        fast_mode: bool,
        cancel: &CancellationToken,
        log: &RunLogSender,
    ) -> Result<String, InvokeError> {
        match transport {
            Transport::Http => {
                http::invoke_http(&self.http, request, fast_mode, cancel, log).await
            }
            Transport::Cli => {
                cli::invoke_cli(&self.cli_options, request, cancel, log).await
            }
        }
    }
}

#[async_trait]
impl ProviderInvoker for DefaultProviderInvoker {
    async fn invoke(
        &self,
        request: &InvocationRequest,
        cancel: CancellationToken,
        log: RunLogSender,
    ) -> Result<String, InvokeError> {
        let transport = select_transport(&request.provider)?;
        let fast_mode = effective_fast_mode(&request.step, &request.provider, &log);
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(InvokeError::Aborted);
            }
            match self
                .invoke_once(request, transport, fast_mode, &cancel, &log)
                .await
            {
                Ok(output) => return Ok(output),
                Err(err) if err.is_retryable() && attempt + 1 < RETRY_MAX_ATTEMPTS => {
                    let retry_after = match &err {
                        InvokeError::Api(api) => api.retry_after_ms,
                        _ => None,
                    };
                    let delay = backoff_delay_ms(attempt, retry_after);
                    let _ = log.send(format!(
                        "provider `{}` transient failure ({}); retrying in {} ms",
                        request.provider.id, err, delay
                    ));
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                        _ = cancel.cancelled() => return Err(InvokeError::Aborted),
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(auth_mode: ProviderAuthMode, kind: ProviderKind) -> ProviderSettings {
        ProviderSettings {
            id: "p1".to_string(),
            kind,
            auth_mode,
            api_key: None,
            oauth_token: None,
            base_url: None,
            cli_path: None,
            default_model: "m".to_string(),
            disable_effort_beta: false,
        }
    }

    #[test]
    fn api_key_provider_uses_http() {
        let mut p = provider(ProviderAuthMode::ApiKey, ProviderKind::Openai);
        p.api_key = Some("sk-live".to_string());
        assert_eq!(select_transport(&p).unwrap(), Transport::Http);
    }

    #[test]
    fn undecrypted_api_key_fails_fast() {
        let mut p = provider(ProviderAuthMode::ApiKey, ProviderKind::Openai);
        p.api_key = Some("enc:v1:deadbeef".to_string());
        let err = select_transport(&p).unwrap_err();
        assert!(err.to_string().contains("cannot be decrypted"));
    }

    #[test]
    fn claude_oauth_requires_setup_token_shape() {
        let mut p = provider(ProviderAuthMode::Oauth, ProviderKind::Claude);
        p.oauth_token = Some("sk-ant-api03-regular".to_string());
        assert!(select_transport(&p).is_err());
        p.oauth_token = Some("sk-ant-oat01-setup".to_string());
        assert_eq!(select_transport(&p).unwrap(), Transport::Http);
    }

    #[test]
    fn missing_credentials_fall_back_to_cli() {
        let p = provider(ProviderAuthMode::ApiKey, ProviderKind::Claude);
        assert_eq!(select_transport(&p).unwrap(), Transport::Cli);
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_delay_ms(0, None), 500);
        assert_eq!(backoff_delay_ms(1, None), 1_000);
        assert_eq!(backoff_delay_ms(2, None), 2_000);
        assert_eq!(backoff_delay_ms(5, None), 8_000);
        assert_eq!(backoff_delay_ms(0, Some(250)), 250);
        assert_eq!(backoff_delay_ms(0, Some(60_000)), 8_000);
    }

    #[test]
    fn retryable_statuses_match_policy() {
        for status in [408, 409, 425, 429, 500, 502, 503, 504] {
            let err = ProviderApiError {
                status,
                retry_after_ms: None,
                detail: String::new(),
            };
            assert!(err.is_retryable(), "{status} should be retryable");
        }
        for status in [400, 401, 403, 404, 422] {
            let err = ProviderApiError {
                status,
                retry_after_ms: None,
                detail: String::new(),
            };
            assert!(!err.is_retryable(), "{status} should be fatal");
        }
    }

    #[tokio::test]
    async fn fast_mode_is_forced_off_without_api_key() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let step: Step = serde_json::from_value(serde_json::json!({
            "id": "s1",
            "fast_mode": true
        }))
        .expect("step");
        let p = provider(ProviderAuthMode::Oauth, ProviderKind::Claude);
        assert!(!effective_fast_mode(&step, &p, &tx));
        let line = rx.recv().await.expect("log line");
        assert!(line.contains("fast_mode disabled"));
    }
}
