use anyhow::Result;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tower_http::cors::{Any, CorsLayer};

use super::types::*;
use crate::tier::{
    self, check_usage, extract_caller_from_headers, increment_usage, ActionType, SharedUsageStore,
    SubscriptionPlan, Tier, UsageError, UsageErrorResponse, UsageStatus,
};

const RPC_PARSE_ERROR: i64 = -32700;
const RPC_METHOD_ERROR: i64 = -32000;
const RPC_LIMIT_REACHED: i64 = -32029;

#[derive(Clone)]
pub struct AppState {
    pub usage_store: SharedUsageStore,
}

impl AppState {
    pub fn open(data_dir: &Path) -> Result<Arc<Self>> {
        std::fs::create_dir_all(data_dir)?;
        let usage_store = tier::create_shared_store(data_dir.to_path_buf())?;
        Ok(Arc::new(Self { usage_store }))
    }
}

pub fn create_app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/plans", get(plans_list))
        .route("/api/usage/check", post(usage_check))
        .route("/api/usage/increment", post(usage_increment))
        .route("/api/usage/summary", get(usage_summary))
        .route("/api/analytics/track", post(analytics_track))
        .layer(cors)
        .with_state(state)
}

pub async fn run_http_server(host: &str, port: u16, data_dir: &Path) -> Result<()> {
    let state = AppState::open(data_dir)?;
    let app = create_app(state);

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("HTTP server listening on {}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}

pub async fn run_stdio_server(data_dir: &Path) -> Result<()> {
    let state = AppState::open(data_dir)?;
    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut reader = BufReader::new(stdin);

    tracing::info!("JSON-RPC server running on stdio");

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            break;
        }

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = handle_jsonrpc_request(&state, line).await;

        stdout.write_all(response.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }

    Ok(())
}

async fn health_check() -> &'static str {
    "ok"
}

async fn plans_list() -> impl IntoResponse {
    Json(PlansResponse {
        plans: SubscriptionPlan::catalog().to_vec(),
    })
}

#[allow(clippy::result_large_err)]
fn parse_action(raw: &str) -> Result<ActionType, UsageErrorResponse> {
    raw.parse::<ActionType>()
        .map_err(|e| UsageErrorResponse::invalid_action(e.to_string()))
}

fn payload(status: UsageStatus) -> UsagePayload {
    UsagePayload {
        status,
        resets_at: Some(tier::usage::UsageStore::next_reset()),
    }
}

async fn usage_check(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    Json(request): Json<UsageRequest>,
) -> Response {
    let caller = extract_caller_from_headers(&headers);
    let action = match parse_action(&request.action_type) {
        Ok(action) => action,
        Err(err) => return err.into_response(),
    };

    let status = check_usage(&caller, &state.usage_store, action).await;
    (StatusCode::OK, Json(payload(status))).into_response()
}

async fn usage_increment(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    Json(request): Json<UsageRequest>,
) -> Response {
    let caller = extract_caller_from_headers(&headers);
    let action = match parse_action(&request.action_type) {
        Ok(action) => action,
        Err(err) => return err.into_response(),
    };

    match increment_usage(&caller, &state.usage_store, action).await {
        Ok(status) => (StatusCode::OK, Json(payload(status))).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn usage_summary(headers: HeaderMap, State(state): State<Arc<AppState>>) -> Response {
    let caller = extract_caller_from_headers(&headers);
    let store = state.usage_store.read().await;
    let summary = store.summary(&caller.user_id, caller.tier);
    (StatusCode::OK, Json(summary)).into_response()
}

async fn analytics_track(Json(event): Json<AnalyticsEvent>) -> impl IntoResponse {
    tracing::info!(
        session_id = %event.session_id,
        event_type = %event.event_type,
        category = event.event_category.as_deref().unwrap_or("-"),
        success = ?event.success,
        processing_ms = ?event.processing_time,
        error = event.error_message.as_deref().unwrap_or(""),
        "Analytics event"
    );
    Json(TrackResponse { success: true })
}

async fn handle_jsonrpc_request(state: &AppState, request: &str) -> String {
    let parsed: Result<serde_json::Value, _> = serde_json::from_str(request);

    match parsed {
        Ok(json) => {
            let method = json.get("method").and_then(|m| m.as_str()).unwrap_or("");
            let params = json
                .get("params")
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            let id = json.get("id").cloned().unwrap_or(serde_json::Value::Null);

            match dispatch_method(state, method, params).await {
                Ok(value) => serde_json::json!({
                    "jsonrpc": "2.0",
                    "result": value,
                    "id": id
                })
                .to_string(),
                Err(e) => {
                    let code = match e.downcast_ref::<UsageError>() {
                        Some(UsageError::LimitReached { .. }) => RPC_LIMIT_REACHED,
                        _ => RPC_METHOD_ERROR,
                    };
                    serde_json::json!({
                        "jsonrpc": "2.0",
                        "error": {
                            "code": code,
                            "message": e.to_string()
                        },
                        "id": id
                    })
                    .to_string()
                }
            }
        }
        Err(e) => serde_json::json!({
            "jsonrpc": "2.0",
            "error": {
                "code": RPC_PARSE_ERROR,
                "message": format!("Parse error: {}", e)
            },
            "id": null
        })
        .to_string(),
    }
}

fn rpc_params(params: serde_json::Value) -> Result<(tier::Caller, Option<ActionType>)> {
    let params: RpcUsageParams = if params.is_null() {
        RpcUsageParams::default()
    } else {
        serde_json::from_value(params)?
    };

    let mut caller = tier::Caller::default();
    if let Some(user_id) = params.user_id.filter(|u| !u.trim().is_empty()) {
        caller.user_id = user_id;
    }
    if let Some(name) = params.tier {
        caller.tier = Tier::from_name(&name);
    }

    let action = params
        .action_type
        .map(|raw| raw.parse::<ActionType>())
        .transpose()?;
    Ok((caller, action))
}

async fn dispatch_method(
    state: &AppState,
    method: &str,
    params: serde_json::Value,
) -> Result<serde_json::Value> {
    match method {
        "plans.list" => Ok(serde_json::to_value(PlansResponse {
            plans: SubscriptionPlan::catalog().to_vec(),
        })?),
        "usage.check" => {
            let (caller, action) = rpc_params(params)?;
            let action = action.ok_or_else(|| anyhow::anyhow!("Missing actionType"))?;
            let status = check_usage(&caller, &state.usage_store, action).await;
            Ok(serde_json::to_value(payload(status))?)
        }
        "usage.increment" => {
            let (caller, action) = rpc_params(params)?;
            let action = action.ok_or_else(|| anyhow::anyhow!("Missing actionType"))?;
            let mut store = state.usage_store.write().await;
            let status = store.increment(&caller.user_id, caller.tier, action)?;
            Ok(serde_json::to_value(payload(status))?)
        }
        "usage.summary" => {
            let (caller, _) = rpc_params(params)?;
            let store = state.usage_store.read().await;
            Ok(serde_json::to_value(
                store.summary(&caller.user_id, caller.tier),
            )?)
        }
        _ => anyhow::bail!("Unknown method: {}", method),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn state() -> (tempfile::TempDir, Arc<AppState>) {
        let dir = tempdir().unwrap();
        let state = AppState::open(dir.path()).unwrap();
        (dir, state)
    }

    async fn call(state: &AppState, request: serde_json::Value) -> serde_json::Value {
        let response = handle_jsonrpc_request(state, &request.to_string()).await;
        serde_json::from_str(&response).unwrap()
    }

    #[tokio::test]
    async fn test_rpc_parse_error() {
        let (_dir, state) = state();
        let response = handle_jsonrpc_request(&state, "{not json").await;
        let json: serde_json::Value = serde_json::from_str(&response).unwrap();
        assert_eq!(json["error"]["code"], RPC_PARSE_ERROR);
    }

    #[tokio::test]
    async fn test_rpc_increment_until_limit() {
        let (_dir, state) = state();
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "usage.increment",
            "params": {"userId": "erin", "tier": "free", "actionType": "conversion"},
            "id": 1
        });

        for expected in 1..=5 {
            let json = call(&state, request.clone()).await;
            assert_eq!(json["result"]["used"], expected);
        }

        let json = call(&state, request).await;
        assert_eq!(json["error"]["code"], RPC_LIMIT_REACHED);
        assert_eq!(json["id"], 1);

        let check = call(
            &state,
            serde_json::json!({
                "jsonrpc": "2.0",
                "method": "usage.check",
                "params": {"userId": "erin", "actionType": "conversion"},
                "id": 2
            }),
        )
        .await;
        assert_eq!(check["result"]["used"], 5);
        assert_eq!(check["result"]["limitReached"], true);
    }

    #[tokio::test]
    async fn test_rpc_unknown_method_and_action() {
        let (_dir, state) = state();

        let json = call(
            &state,
            serde_json::json!({"jsonrpc": "2.0", "method": "usage.reset", "id": 3}),
        )
        .await;
        assert_eq!(json["error"]["code"], RPC_METHOD_ERROR);

        let json = call(
            &state,
            serde_json::json!({
                "jsonrpc": "2.0",
                "method": "usage.check",
                "params": {"actionType": "teleport"},
                "id": 4
            }),
        )
        .await;
        assert_eq!(json["error"]["code"], RPC_METHOD_ERROR);
    }

    #[tokio::test]
    async fn test_rpc_plans_list() {
        let (_dir, state) = state();
        let json = call(
            &state,
            serde_json::json!({"jsonrpc": "2.0", "method": "plans.list", "id": 5}),
        )
        .await;
        let plans = json["result"]["plans"].as_array().unwrap();
        assert_eq!(plans.len(), 4);
        assert_eq!(plans[0]["tier"], "free");
    }

    #[tokio::test]
    async fn test_http_endpoints() {
        let (_dir, state) = state();
        let app = create_app(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = reqwest::Client::new();
        let base = format!("http://{}", addr);

        let health = client
            .get(format!("{}/health", base))
            .send()
            .await
            .unwrap();
        assert_eq!(health.text().await.unwrap(), "ok");

        let bad = client
            .post(format!("{}/api/usage/check", base))
            .json(&serde_json::json!({"actionType": "teleport"}))
            .send()
            .await
            .unwrap();
        assert_eq!(bad.status(), reqwest::StatusCode::BAD_REQUEST);

        let summary: serde_json::Value = client
            .get(format!("{}/api/usage/summary", base))
            .header(crate::tier::middleware::TIER_HEADER, "pro")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(summary["tier"], "pro");
        assert_eq!(
            summary["actions"].as_array().unwrap().len(),
            ActionType::ALL.len()
        );

        let tracked: serde_json::Value = client
            .post(format!("{}/api/analytics/track", base))
            .json(&serde_json::json!({
                "sessionId": "abc",
                "eventType": "tool_usage",
                "timestamp": "2026-01-01T00:00:00Z"
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(tracked["success"], true);
    }
}
