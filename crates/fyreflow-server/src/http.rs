//! REST surface. Validation failures return a 400 with `{errors: [...]}`;
//! everything else uses the `{error, code?}` envelope. Auth is a bearer
//! token gate over every route except health and the WS upgrade, which
//! authenticates at session establishment.

use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tower_http::cors::{Any, CorsLayer};

use fyreflow_core::StartRunOutcome;
use fyreflow_types::{
    normalize_flow, normalize_input_key, validate_flow, Flow, StartRunRequest, ValidationIssue,
};

use crate::{ws, AppState};

#[derive(Debug, serde::Serialize)]
pub struct ErrorEnvelope {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

fn error_response(status: StatusCode, error: &str, code: Option<&str>) -> Response {
    (
        status,
        Json(ErrorEnvelope {
            error: error.to_string(),
            code: code.map(|c| c.to_string()),
        }),
    )
        .into_response()
}

fn validation_response(errors: Vec<ValidationIssue>) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "errors": errors }))).into_response()
}

pub fn build_router(state: AppState) -> Router {
    let cors = if state.config.cors_origins.is_empty() {
        CorsLayer::new()
            .allow_methods(Any)
            .allow_headers(Any)
            .allow_origin(Any)
    } else {
        let origins: Vec<axum::http::HeaderValue> = state
            .config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_methods(Any)
            .allow_headers(Any)
            .allow_origin(origins)
    };

    Router::new()
        .route("/api/health", get(health))
        .route("/api/pipelines", get(list_pipelines).post(create_pipeline))
        .route(
            "/api/pipelines/{id}",
            get(get_pipeline)
                .put(put_pipeline)
                .delete(delete_pipeline),
        )
        .route("/api/pipelines/{id}/runs", post(create_run))
        .route("/api/pipelines/{id}/secure-inputs", put(put_secure_inputs))
        .route("/api/runs", get(list_runs))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/stop", post(stop_run))
        .route("/api/runs/{id}/pause", post(pause_run))
        .route("/api/runs/{id}/resume", post(resume_run))
        .route("/api/runs/{id}/approvals/{approval_id}", post(resolve_approval))
        .route("/api/providers", get(list_providers))
        .route("/api/ws", get(ws::ws_upgrade))
        .layer(cors)
        .layer(middleware::from_fn_with_state(state.clone(), auth_gate))
        .with_state(state)
}

async fn auth_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }
    let path = request.uri().path();
    if path == "/api/health" || path == "/api/ws" {
        return next.run(request).await;
    }
    let Some(expected) = state.config.api_auth_token.as_deref() else {
        return next.run(request).await;
    };
    if extract_bearer_token(request.headers()).as_deref() == Some(expected) {
        return next.run(request).await;
    }
    error_response(
        StatusCode::UNAUTHORIZED,
        "Unauthorized: missing or invalid API token",
        Some("AUTH_REQUIRED"),
    )
}

pub(crate) fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())?;
    let trimmed = auth.trim();
    let bearer = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?;
    let token = bearer.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "healthy": true,
        "version": env!("CARGO_PKG_VERSION"),
        "apiTokenRequired": state.config.api_auth_token.is_some(),
        "dataDir": state.config.data_dir.display().to_string(),
    }))
}

async fn list_pipelines(State(state): State<AppState>) -> Json<Vec<Flow>> {
    Json(state.store.list_pipelines().await)
}

async fn get_pipeline(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.get_pipeline(&id).await {
        Some(flow) => Json(flow).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "pipeline not found", None),
    }
}

async fn create_pipeline(State(state): State<AppState>, Json(flow): Json<Flow>) -> Response {
    upsert_flow(state, flow).await
}

async fn put_pipeline(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut flow): Json<Flow>,
) -> Response {
    flow.id = id;
    upsert_flow(state, flow).await
}

async fn upsert_flow(state: AppState, mut flow: Flow) -> Response {
    normalize_flow(&mut flow);
    let issues = validate_flow(&flow);
    if !issues.is_empty() {
        return validation_response(issues);
    }
    match state.store.upsert_pipeline(flow).await {
        Ok(saved) => Json(saved).into_response(),
        Err(err) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("failed to persist pipeline: {err:#}"),
            None,
        ),
    }
}

async fn delete_pipeline(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.delete_pipeline(&id).await {
        Ok(true) => Json(json!({ "ok": true })).into_response(),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "pipeline not found", None),
        Err(err) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("failed to delete pipeline: {err:#}"),
            None,
        ),
    }
}

async fn create_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<StartRunRequest>,
) -> Response {
    match state.engine.start_run(&id, request).await {
        Ok(StartRunOutcome::Created(run)) => (StatusCode::CREATED, Json(run)).into_response(),
        Ok(StartRunOutcome::PipelineNotFound) => {
            error_response(StatusCode::NOT_FOUND, "pipeline not found", None)
        }
        Ok(StartRunOutcome::Invalid(issues)) => validation_response(issues),
        Err(err) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("failed to start run: {err:#}"),
            None,
        ),
    }
}

async fn put_secure_inputs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(values): Json<HashMap<String, String>>,
) -> Response {
    if state.store.get_pipeline(&id).await.is_none() {
        return error_response(StatusCode::NOT_FOUND, "pipeline not found", None);
    }
    let normalized: HashMap<String, String> = values
        .into_iter()
        .map(|(k, v)| (normalize_input_key(&k), v))
        .collect();
    match state.engine.set_secure_inputs(&id, normalized).await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(err) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("failed to store secure inputs: {err:#}"),
            None,
        ),
    }
}

#[derive(Debug, Deserialize, Default)]
struct ListRunsQuery {
    limit: Option<usize>,
}

async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Json<Value> {
    let limit = query.limit.unwrap_or(50).min(500);
    let runs = state.store.list_runs(limit).await;
    Json(json!({ "runs": runs, "count": runs.len() }))
}

async fn get_run(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.get_run(&id).await {
        Some(run) => Json(run).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "run not found", None),
    }
}

async fn stop_run(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    run_control(state, &id, "stop").await
}

async fn pause_run(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    run_control(state, &id, "pause").await
}

async fn resume_run(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    run_control(state, &id, "resume").await
}

async fn run_control(state: AppState, id: &str, action: &str) -> Response {
    if state.store.get_run(id).await.is_none() {
        return error_response(StatusCode::NOT_FOUND, "run not found", None);
    }
    let ok = match action {
        "stop" => state.engine.stop_run(id).await,
        "pause" => state.engine.pause_run(id).await,
        _ => state.engine.resume_run(id).await,
    };
    Json(json!({ "ok": ok })).into_response()
}

#[derive(Debug, Deserialize)]
struct ApprovalInput {
    decision: String,
    note: Option<String>,
}

async fn resolve_approval(
    State(state): State<AppState>,
    Path((run_id, approval_id)): Path<(String, String)>,
    Json(input): Json<ApprovalInput>,
) -> Response {
    let decision = input.decision.trim().to_ascii_lowercase();
    let approve = matches!(decision.as_str(), "approve" | "approved" | "accept" | "yes");
    if !approve && !matches!(decision.as_str(), "reject" | "rejected" | "deny" | "no") {
        return validation_response(vec![ValidationIssue::new(
            "decision",
            "decision must be `approved` or `rejected`",
        )]);
    }
    match state
        .engine
        .resolve_approval(&run_id, &approval_id, approve, input.note)
        .await
    {
        Ok(run) => Json(run).into_response(),
        Err(err) => error_response(StatusCode::NOT_FOUND, &format!("{err:#}"), None),
    }
}

async fn list_providers(State(state): State<AppState>) -> Json<Value> {
    let providers = state.engine.catalog().list().await;
    let rows: Vec<Value> = providers
        .iter()
        .map(|p| {
            json!({
                "id": p.id,
                "kind": p.kind.as_str(),
                "authMode": p.auth_mode,
                "defaultModel": p.default_model,
                "hasApiKey": p.usable_api_key().is_some(),
                "hasOauthToken": p.usable_oauth_token().is_some(),
            })
        })
        .collect();
    Json(json!({ "providers": rows, "count": rows.len() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    use fyreflow_core::{EngineConfig, PipelineEngine, RunStore};
    use fyreflow_providers::{
        InvocationRequest, InvokeError, ProviderCatalog, ProviderInvoker, RunLogSender,
    };
    use tokio_util::sync::CancellationToken;

    struct EchoInvoker;

    #[async_trait::async_trait]
    impl ProviderInvoker for EchoInvoker {
        async fn invoke(
            &self,
            _request: &InvocationRequest,
            _cancel: CancellationToken,
            _log: RunLogSender,
        ) -> Result<String, InvokeError> {
            Ok("WORKFLOW_STATUS: PASS".to_string())
        }
    }

    async fn test_state(token: Option<&str>) -> AppState {
        let dir = tempfile::tempdir().expect("tempdir").into_path();
        let mut config = EngineConfig::default();
        config.data_dir = dir;
        config.api_auth_token = token.map(|t| t.to_string());
        let store = Arc::new(RunStore::new(&config.data_dir).await.expect("store"));
        let engine = PipelineEngine::with_invoker(
            config,
            store,
            ProviderCatalog::default(),
            Arc::new(EchoInvoker),
        );
        AppState::new(engine)
    }

    fn request(method: &str, path: &str, token: Option<&str>, body: Option<Value>) -> Request {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        match body {
            Some(value) => builder
                .header("content-type", "application/json")
                .body(Body::from(value.to_string()))
                .expect("request"),
            None => builder.body(Body::empty()).expect("request"),
        }
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn health_is_public() {
        let router = build_router(test_state(Some("sekrit")).await);
        let response = router
            .oneshot(request("GET", "/api/health", None, None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["apiTokenRequired"], true);
    }

    #[tokio::test]
    async fn pipelines_require_the_token() {
        let router = build_router(test_state(Some("sekrit")).await);
        let denied = router
            .clone()
            .oneshot(request("GET", "/api/pipelines", None, None))
            .await
            .expect("response");
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
        let allowed = router
            .oneshot(request("GET", "/api/pipelines", Some("sekrit"), None))
            .await
            .expect("response");
        assert_eq!(allowed.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn invalid_flow_returns_field_level_errors() {
        let router = build_router(test_state(None).await);
        let response = router
            .oneshot(request(
                "POST",
                "/api/pipelines",
                None,
                Some(json!({
                    "id": "p1",
                    "steps": [{ "id": "a" }],
                    "links": [
                        { "source_step_id": "a", "target_step_id": "ghost" },
                    ],
                })),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["errors"][0]["path"], "links[0].target_step_id");
    }

    #[tokio::test]
    async fn run_start_validates_task_length() {
        let state = test_state(None).await;
        state
            .store
            .upsert_pipeline(
                serde_json::from_value(json!({
                    "id": "p1",
                    "steps": [{ "id": "a" }],
                    "links": [],
                }))
                .expect("flow"),
            )
            .await
            .expect("upsert");
        let router = build_router(state);
        let response = router
            .oneshot(request(
                "POST",
                "/api/pipelines/p1/runs",
                None,
                Some(json!({ "task": "x".repeat(16_001) })),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_run_is_a_404() {
        let router = build_router(test_state(None).await);
        let response = router
            .oneshot(request("GET", "/api/runs/missing", None, None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
