//! Native HTTP transports. OpenAI speaks `/v1/responses`, Claude speaks
//! `/v1/messages`; both stream Server-Sent Events that are folded into one
//! output string.

use std::str;
use std::time::{Duration, Instant};

use futures::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use fyreflow_types::{is_claude_setup_token, ProviderAuthMode, ProviderKind, ProviderSettings};

use crate::{InvocationRequest, InvokeError, ProviderApiError, RunLogSender};

const OPENAI_DEFAULT_BASE: &str = "https://api.openai.com";
const CLAUDE_DEFAULT_BASE: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const EFFORT_BETA: &str = "effort-2025-11-24";
const CONTEXT_1M_BETA: &str = "context-1m-2025-08-07";

pub(crate) async fn invoke_http(
    client: &Client,
    request: &InvocationRequest,
    fast_mode: bool,
    cancel: &CancellationToken,
    log: &RunLogSender,
) -> Result<String, InvokeError> {
    let started = Instant::now();
    let call = async {
        match request.provider.kind {
            ProviderKind::Openai => invoke_openai(client, request, fast_mode, cancel, log).await,
            ProviderKind::Claude => invoke_claude(client, request, cancel, log).await,
        }
    };
    match tokio::time::timeout(Duration::from_millis(request.stage_timeout_ms), call).await {
        Ok(result) => result,
        Err(_) => Err(InvokeError::Timeout {
            elapsed_ms: started.elapsed().as_millis() as u64,
        }),
    }
}

fn base_url(provider: &ProviderSettings, default: &str) -> String {
    provider
        .base_url
        .as_deref()
        .map(|u| u.trim_end_matches('/').to_string())
        .unwrap_or_else(|| default.to_string())
}

fn model_for(request: &InvocationRequest) -> String {
    let model = request.step.model.trim();
    if model.is_empty() {
        request.provider.default_model.clone()
    } else {
        model.to_string()
    }
}

fn retry_after_ms(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| secs * 1_000)
}

async fn api_error(response: Response) -> InvokeError {
    let status = response.status().as_u16();
    let retry_after = retry_after_ms(response.headers());
    let body = response.text().await.unwrap_or_default();
    let detail = crate::cli::truncate_text(&body, 500);
    InvokeError::Api(ProviderApiError {
        status,
        retry_after_ms: retry_after,
        detail,
    })
}

async fn invoke_openai(
    client: &Client,
    request: &InvocationRequest,
    fast_mode: bool,
    cancel: &CancellationToken,
    log: &RunLogSender,
) -> Result<String, InvokeError> {
    let url = format!("{}/v1/responses", base_url(&request.provider, OPENAI_DEFAULT_BASE));
    let mut body = json!({
        "model": model_for(request),
        "stream": true,
        "input": [
            {"role": "system", "content": request.step.prompt},
            {"role": "user", "content": request.context},
        ],
    });
    let effort = if fast_mode {
        "low".to_string()
    } else {
        request.step.reasoning_effort.trim().to_string()
    };
    if !effort.is_empty() {
        body["reasoning"] = json!({ "effort": effort });
    }

    let token = request
        .provider
        .usable_api_key()
        .or_else(|| request.provider.usable_oauth_token())
        .ok_or_else(|| InvokeError::Fatal("no usable OpenAI credential".to_string()))?;
    let req = client.post(&url).bearer_auth(token).json(&body);

    let response = send(req).await?;
    if !response.status().is_success() {
        return Err(api_error(response).await);
    }
    drain_openai_stream(response, cancel, log).await
}

async fn invoke_claude(
    client: &Client,
    request: &InvocationRequest,
    cancel: &CancellationToken,
    log: &RunLogSender,
) -> Result<String, InvokeError> {
    let url = format!("{}/v1/messages", base_url(&request.provider, CLAUDE_DEFAULT_BASE));
    let max_tokens = ((request.step.context_window_tokens as f64 * 0.02) as u64).clamp(1_200, 6_400);
    let body = json!({
        "model": model_for(request),
        "max_tokens": max_tokens,
        "stream": true,
        "system": request.step.prompt,
        "messages": [{"role": "user", "content": request.context}],
    });

    let mut betas: Vec<&str> = Vec::new();
    if !request.provider.disable_effort_beta {
        betas.push(EFFORT_BETA);
    }
    if request.step.use_1m_context {
        betas.push(CONTEXT_1M_BETA);
    }

    let build = |auth_header: ClaudeAuth<'_>| {
        let mut req = client
            .post(&url)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);
        if !betas.is_empty() {
            req = req.header("anthropic-beta", betas.join(","));
        }
        match auth_header {
            ClaudeAuth::ApiKey(key) => req.header("x-api-key", key),
            ClaudeAuth::Bearer(token) => req.bearer_auth(token),
        }
    };

    if let Some(key) = request.provider.usable_api_key() {
        if request.provider.auth_mode == ProviderAuthMode::ApiKey {
            let response = send(build(ClaudeAuth::ApiKey(key))).await?;
            if !response.status().is_success() {
                return Err(api_error(response).await);
            }
            return drain_claude_stream(response, cancel, log).await;
        }
    }

    let token = request
        .provider
        .usable_oauth_token()
        .ok_or_else(|| InvokeError::Fatal("no usable Claude credential".to_string()))?;
    let response = send(build(ClaudeAuth::Bearer(token))).await?;
    if response.status() == StatusCode::UNAUTHORIZED && is_claude_setup_token(token) {
        let detail = response.text().await.unwrap_or_default();
        if detail.to_ascii_lowercase().contains("bearer") {
            // Setup-tokens are accepted on the x-api-key header by some
            // gateway deployments; retry once before giving up.
            let _ = log.send("claude bearer auth rejected; retrying with x-api-key".to_string());
            let retried = send(build(ClaudeAuth::ApiKey(token))).await?;
            if !retried.status().is_success() {
                return Err(api_error(retried).await);
            }
            return drain_claude_stream(retried, cancel, log).await;
        }
        return Err(InvokeError::Api(ProviderApiError {
            status: 401,
            retry_after_ms: None,
            detail: crate::cli::truncate_text(&detail, 500),
        }));
    }
    if !response.status().is_success() {
        return Err(api_error(response).await);
    }
    drain_claude_stream(response, cancel, log).await
}

enum ClaudeAuth<'a> {
    ApiKey(&'a str),
    Bearer(&'a str),
}

async fn send(req: RequestBuilder) -> Result<Response, InvokeError> {
    req.send()
        .await
        .map_err(|err| InvokeError::Fatal(format!("provider request failed: {err}")))
}

async fn drain_openai_stream(
    response: Response,
    cancel: &CancellationToken,
    log: &RunLogSender,
) -> Result<String, InvokeError> {
    let mut output = String::new();
    for_each_sse_payload(response, cancel, |value| {
        match value.get("type").and_then(|v| v.as_str()).unwrap_or_default() {
            "response.created" => {
                if let Some(id) = value
                    .get("response")
                    .and_then(|r| r.get("id"))
                    .and_then(|v| v.as_str())
                {
                    let _ = log.send(format!("openai request id: {id}"));
                }
            }
            "response.output_text.delta" => {
                if let Some(delta) = value.get("delta").and_then(|v| v.as_str()) {
                    output.push_str(delta);
                }
            }
            "response.failed" => {
                let detail = value
                    .get("response")
                    .and_then(|r| r.get("error"))
                    .and_then(|e| e.get("message"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("response failed")
                    .to_string();
                return Some(InvokeError::Fatal(detail));
            }
            _ => {}
        }
        None
    })
    .await?;
    Ok(output)
}

async fn drain_claude_stream(
    response: Response,
    cancel: &CancellationToken,
    log: &RunLogSender,
) -> Result<String, InvokeError> {
    let mut output = String::new();
    for_each_sse_payload(response, cancel, |value| {
        match value.get("type").and_then(|v| v.as_str()).unwrap_or_default() {
            "message_start" => {
                if let Some(id) = value
                    .get("message")
                    .and_then(|m| m.get("id"))
                    .and_then(|v| v.as_str())
                {
                    let _ = log.send(format!("claude request id: {id}"));
                }
            }
            "content_block_delta" => {
                if let Some(text) = value
                    .get("delta")
                    .and_then(|d| d.get("text"))
                    .and_then(|v| v.as_str())
                {
                    output.push_str(text);
                }
            }
            "ping" => {
                tracing::debug!(target: "fyreflow.providers", "claude stream heartbeat");
            }
            "error" => {
                let detail = value
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("stream error")
                    .to_string();
                return Some(InvokeError::Fatal(detail));
            }
            _ => {}
        }
        None
    })
    .await?;
    Ok(output)
}

/// Frames the byte stream on blank lines and feeds every `data:` payload that
/// parses as JSON to `handle`. `handle` may short-circuit with an error.
/// Waiting for the next chunk races the cancel signal, so a server that
/// holds the connection open without sending cannot pin the run.
async fn for_each_sse_payload(
    response: Response,
    cancel: &CancellationToken,
    mut handle: impl FnMut(&Value) -> Option<InvokeError>,
) -> Result<(), InvokeError> {
    let mut bytes = response.bytes_stream();
    let mut buffer = String::new();
    loop {
        let chunk = tokio::select! {
            chunk = bytes.next() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
            _ = cancel.cancelled() => return Err(InvokeError::Aborted),
        };
        let chunk = chunk.map_err(|err| InvokeError::Fatal(format!("stream read failed: {err}")))?;
        buffer.push_str(str::from_utf8(&chunk).unwrap_or_default());

        while let Some(pos) = buffer.find("\n\n") {
            let frame = buffer[..pos].to_string();
            buffer = buffer[pos + 2..].to_string();
            for line in frame.lines() {
                let Some(payload) = line.strip_prefix("data: ") else {
                    continue;
                };
                let payload = payload.trim();
                if payload == "[DONE]" {
                    return Ok(());
                }
                let Ok(value) = serde_json::from_str::<Value>(payload) else {
                    continue;
                };
                if let Some(err) = handle(&value) {
                    return Err(err);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_max_tokens_clamps_to_budget_window() {
        let clamp = |cwt: u64| ((cwt as f64 * 0.02) as u64).clamp(1_200, 6_400);
        assert_eq!(clamp(0), 1_200);
        assert_eq!(clamp(200_000), 4_000);
        assert_eq!(clamp(1_000_000), 6_400);
    }

    #[test]
    fn retry_after_header_parses_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", "7".parse().unwrap());
        assert_eq!(retry_after_ms(&headers), Some(7_000));
        headers.insert("retry-after", "soon".parse().unwrap());
        assert_eq!(retry_after_ms(&headers), None);
    }

    #[tokio::test]
    async fn stalled_sse_stream_aborts_on_cancel() {
        // A server that accepts the request and then never sends a chunk.
        let stalled = futures::stream::pending::<Result<bytes::Bytes, std::io::Error>>();
        let response = Response::from(http::Response::new(reqwest::Body::wrap_stream(stalled)));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let (log_tx, _log_rx) = tokio::sync::mpsc::unbounded_channel();
        let result = drain_claude_stream(response, &cancel, &log_tx).await;
        assert!(matches!(result, Err(InvokeError::Aborted)));
    }
}
