//! Caller identity extraction and quota error responses for axum

use axum::{
    http::{header::HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use super::action::ActionType;
use super::limits::Tier;
use super::usage::{SharedUsageStore, UsageError, UsageStatus, UsageStore};

pub const USER_HEADER: &str = "x-gartools-user";
pub const TIER_HEADER: &str = "x-gartools-tier";
pub const ANONYMOUS_USER: &str = "anonymous";

/// Who is asking, as established by the auth layer in front of the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub tier: Tier,
}

impl Default for Caller {
    fn default() -> Self {
        Self {
            user_id: ANONYMOUS_USER.to_string(),
            tier: Tier::Free,
        }
    }
}

pub fn extract_caller_from_headers(headers: &HeaderMap) -> Caller {
    let user_id = headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(ANONYMOUS_USER)
        .to_string();

    let tier = headers
        .get(TIER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(Tier::from_name)
        .unwrap_or_default();

    Caller { user_id, tier }
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UsageErrorCode {
    LimitReached,
    InvalidAction,
    Storage,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageErrorResponse {
    pub error: String,
    pub code: UsageErrorCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_type: Option<ActionType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resets_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrade_url: Option<String>,
}

impl UsageErrorResponse {
    pub const UPGRADE_URL: &'static str = "https://gartools.com/pricing";

    pub fn invalid_action(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code: UsageErrorCode::InvalidAction,
            action_type: None,
            used: None,
            limit: None,
            resets_at: None,
            upgrade_url: None,
        }
    }

    pub fn from_error(err: UsageError) -> Self {
        match err {
            UsageError::LimitReached {
                action,
                used,
                limit,
            } => Self {
                error: format!(
                    "Daily {} limit reached ({}/{}). Upgrade your plan for more.",
                    action, used, limit
                ),
                code: UsageErrorCode::LimitReached,
                action_type: Some(action),
                used: Some(used),
                limit: Some(limit),
                resets_at: Some(UsageStore::next_reset().to_rfc3339()),
                upgrade_url: Some(Self::UPGRADE_URL.to_string()),
            },
            other => {
                tracing::error!("Usage store failure: {}", other);
                Self {
                    error: "Failed to record usage".to_string(),
                    code: UsageErrorCode::Storage,
                    action_type: None,
                    used: None,
                    limit: None,
                    resets_at: None,
                    upgrade_url: None,
                }
            }
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self.code {
            UsageErrorCode::LimitReached => StatusCode::TOO_MANY_REQUESTS,
            UsageErrorCode::InvalidAction => StatusCode::BAD_REQUEST,
            UsageErrorCode::Storage => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for UsageErrorResponse {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self)).into_response()
    }
}

pub async fn check_usage(
    caller: &Caller,
    store: &SharedUsageStore,
    action: ActionType,
) -> UsageStatus {
    let store = store.read().await;
    store.check(&caller.user_id, caller.tier, action)
}

#[allow(clippy::result_large_err)]
pub async fn increment_usage(
    caller: &Caller,
    store: &SharedUsageStore,
    action: ActionType,
) -> Result<UsageStatus, UsageErrorResponse> {
    let mut store = store.write().await;
    store
        .increment(&caller.user_id, caller.tier, action)
        .map_err(UsageErrorResponse::from_error)
}
