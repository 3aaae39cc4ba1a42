//! Realtime fan-out over WebSocket. The runtime never receives pushes from
//! the engine; it polls the store on an interval and emits diffs per
//! subscribed run: status changes, new log lines past the subscriber's
//! cursor, and step fingerprint changes. Heartbeats tick independently.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use serde_json::{json, Value};

use fyreflow_types::{Run, RunStatus};

use crate::http::extract_bearer_token;
use crate::AppState;

pub const REALTIME_SUBPROTOCOL: &str = "fyreflow.realtime.v1";
const AUTH_SUBPROTOCOL_PREFIX: &str = "fyreflow-auth.";

pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    if let Some(expected) = state.config.api_auth_token.as_deref() {
        if !ws_authenticated(&headers, expected) {
            return (StatusCode::UNAUTHORIZED, "websocket auth failed").into_response();
        }
    }
    // Only the realtime subprotocol is offered back; the auth subprotocol
    // must never be echoed in the response.
    ws.protocols([REALTIME_SUBPROTOCOL])
        .on_upgrade(move |socket| ws_session(socket, state))
}

fn ws_authenticated(headers: &HeaderMap, expected: &str) -> bool {
    if extract_bearer_token(headers).as_deref() == Some(expected) {
        return true;
    }
    let Some(raw) = headers
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    raw.split(',')
        .map(str::trim)
        .filter_map(|p| p.strip_prefix(AUTH_SUBPROTOCOL_PREFIX))
        .any(|encoded| decode_auth_payload(encoded).as_deref() == Some(expected))
}

fn decode_auth_payload(encoded: &str) -> Option<String> {
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(encoded)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE.decode(encoded))
        .ok()?;
    String::from_utf8(bytes).ok()
}

#[derive(Default)]
struct RunSubscription {
    next_log_index: usize,
    last_status: Option<RunStatus>,
    step_fingerprints: HashMap<String, String>,
    /// The final `run_status` was sent; the subscription is dropped after one
    /// more poll interval.
    terminal_grace: bool,
}

async fn ws_session(mut socket: WebSocket, state: AppState) {
    if send_frame(&mut socket, json!({ "type": "hello" }))
        .await
        .is_err()
    {
        return;
    }

    let mut subscriptions: HashMap<String, RunSubscription> = HashMap::new();
    let mut pairing_sessions: HashSet<String> = HashSet::new();
    let mut poll = tokio::time::interval(Duration::from_millis(
        state.config.run_poll_interval_ms.max(50),
    ));
    let mut heartbeat = tokio::time::interval(Duration::from_millis(
        state.config.heartbeat_interval_ms.max(1_000),
    ));
    // Status transitions wake the poll early; the store stays authoritative.
    let mut engine_events = state.engine.events().subscribe();

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let Some(Ok(message)) = incoming else {
                    return;
                };
                let WsMessage::Text(text) = message else {
                    continue;
                };
                let Ok(value) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                match value.get("type").and_then(|v| v.as_str()).unwrap_or_default() {
                    "subscribe_run" => {
                        let Some(run_id) = value.get("runId").and_then(|v| v.as_str()) else {
                            continue;
                        };
                        let cursor = value
                            .get("cursor")
                            .and_then(|v| v.as_u64())
                            .unwrap_or(0) as usize;
                        subscriptions.insert(
                            run_id.to_string(),
                            RunSubscription {
                                next_log_index: cursor,
                                ..Default::default()
                            },
                        );
                        if send_frame(
                            &mut socket,
                            json!({ "type": "subscribed", "runId": run_id }),
                        )
                        .await
                        .is_err()
                        {
                            return;
                        }
                    }
                    "subscribe_pairing" => {
                        let Some(session_id) = value.get("sessionId").and_then(|v| v.as_str())
                        else {
                            continue;
                        };
                        pairing_sessions.insert(session_id.to_string());
                        if send_frame(
                            &mut socket,
                            json!({ "type": "pairing_subscribed", "sessionId": session_id }),
                        )
                        .await
                        .is_err()
                        {
                            return;
                        }
                    }
                    _ => {}
                }
            }
            _ = poll.tick() => {
                if poll_runs(&mut socket, &state, &mut subscriptions).await.is_err() {
                    return;
                }
            }
            event = engine_events.recv() => {
                let Ok(event) = event else {
                    // A lagged receiver only missed wakeups; the next poll
                    // tick re-reads everything.
                    continue;
                };
                let touched = event
                    .properties
                    .get("runId")
                    .and_then(|v| v.as_str())
                    .map(|id| subscriptions.contains_key(id))
                    .unwrap_or(false);
                if touched
                    && poll_runs(&mut socket, &state, &mut subscriptions).await.is_err()
                {
                    return;
                }
            }
            _ = heartbeat.tick() => {
                if send_frame(&mut socket, json!({ "type": "ping" })).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn poll_runs(
    socket: &mut WebSocket,
    state: &AppState,
    subscriptions: &mut HashMap<String, RunSubscription>,
) -> Result<(), ()> {
    let run_ids: Vec<String> = subscriptions.keys().cloned().collect();
    let mut drop_after_grace = Vec::new();
    for run_id in run_ids {
        let Some(sub) = subscriptions.get_mut(&run_id) else {
            continue;
        };
        if sub.terminal_grace {
            drop_after_grace.push(run_id.clone());
            continue;
        }
        let Some(run) = state.store.get_run(&run_id).await else {
            continue;
        };
        for frame in diff_run(&run, sub) {
            send_frame(socket, frame).await?;
        }
    }
    for run_id in drop_after_grace {
        subscriptions.remove(&run_id);
    }
    Ok(())
}

/// Computes the frames one poll owes a subscriber and advances its cursors.
fn diff_run(run: &Run, sub: &mut RunSubscription) -> Vec<Value> {
    let mut frames = Vec::new();
    if sub.last_status != Some(run.status) {
        sub.last_status = Some(run.status);
        frames.push(json!({
            "type": "run_status",
            "runId": run.id,
            "status": run.status.as_str(),
        }));
        if run.status.is_terminal() {
            sub.terminal_grace = true;
        }
    }
    for (index, message) in run.logs.iter().enumerate().skip(sub.next_log_index) {
        frames.push(json!({
            "type": "run_log",
            "runId": run.id,
            "index": index,
            "message": message,
        }));
    }
    sub.next_log_index = run.logs.len();
    for step in &run.steps {
        let fingerprint = step.fingerprint();
        let known = sub.step_fingerprints.get(&step.step_id);
        if known.map(|f| f == &fingerprint).unwrap_or(false) {
            continue;
        }
        sub.step_fingerprints
            .insert(step.step_id.clone(), fingerprint);
        frames.push(json!({
            "type": "run_step",
            "runId": run.id,
            "stepId": step.step_id,
            "status": step.status,
            "attempts": step.attempts,
            "outputLength": step.output.len(),
            "finishedAt": step.finished_at,
        }));
    }
    frames
}

async fn send_frame(socket: &mut WebSocket, frame: Value) -> Result<(), ()> {
    socket
        .send(WsMessage::Text(frame.to_string().into()))
        .await
        .map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fyreflow_types::{Flow, QueueReason, StepRun, StepRunStatus};
    use std::collections::HashMap as StdHashMap;

    fn auth_headers(protocols: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("sec-websocket-protocol", protocols.parse().unwrap());
        headers
    }

    fn encode(token: &str) -> String {
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(token)
    }

    #[test]
    fn subprotocol_auth_accepts_the_encoded_token() {
        let headers = auth_headers(&format!(
            "{REALTIME_SUBPROTOCOL}, {AUTH_SUBPROTOCOL_PREFIX}{}",
            encode("sekrit")
        ));
        assert!(ws_authenticated(&headers, "sekrit"));
        assert!(!ws_authenticated(&headers, "other-token"));
    }

    #[test]
    fn bearer_header_also_authenticates() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer sekrit".parse().unwrap());
        assert!(ws_authenticated(&headers, "sekrit"));
    }

    #[test]
    fn missing_auth_is_rejected() {
        let headers = auth_headers(REALTIME_SUBPROTOCOL);
        assert!(!ws_authenticated(&headers, "sekrit"));
    }

    fn sample_run() -> Run {
        let flow: Flow = serde_json::from_value(serde_json::json!({
            "id": "p1",
            "steps": [{ "id": "a" }],
            "links": [],
        }))
        .expect("flow");
        Run::new(flow, "task".to_string(), StdHashMap::new(), None)
    }

    #[test]
    fn diff_emits_status_then_logs_then_steps_once() {
        let mut run = sample_run();
        run.status = RunStatus::Running;
        run.logs.push("line one".to_string());
        let mut step = StepRun::new("a", None, QueueReason::EntryStep);
        step.status = StepRunStatus::Running;
        step.attempts = 1;
        run.steps.push(step);

        let mut sub = RunSubscription::default();
        let frames = diff_run(&run, &mut sub);
        let kinds: Vec<&str> = frames
            .iter()
            .map(|f| f["type"].as_str().unwrap())
            .collect();
        assert_eq!(kinds, vec!["run_status", "run_log", "run_step"]);

        // Nothing changed: a second poll owes nothing.
        assert!(diff_run(&run, &mut sub).is_empty());

        run.logs.push("line two".to_string());
        let frames = diff_run(&run, &mut sub);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["index"], 1);
    }

    #[test]
    fn cursor_skips_already_seen_logs() {
        let mut run = sample_run();
        run.status = RunStatus::Running;
        run.logs.push("old".to_string());
        run.logs.push("new".to_string());
        let mut sub = RunSubscription {
            next_log_index: 1,
            ..Default::default()
        };
        let frames = diff_run(&run, &mut sub);
        let logs: Vec<&Value> = frames
            .iter()
            .filter(|f| f["type"] == "run_log")
            .collect();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0]["message"], "new");
    }

    #[test]
    fn terminal_status_sets_the_grace_flag() {
        let mut run = sample_run();
        run.status = RunStatus::Cancelled;
        let mut sub = RunSubscription::default();
        let frames = diff_run(&run, &mut sub);
        assert_eq!(frames[0]["status"], "cancelled");
        assert!(sub.terminal_grace);
    }
}
