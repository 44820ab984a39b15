//! Transport for the usage check/increment endpoints

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::rpc::{ErrorBody, UsagePayload, UsageRequest};
use crate::tier::middleware::{TIER_HEADER, USER_HEADER};
use crate::tier::usage::UsageStore;
use crate::tier::{ActionType, Caller, SharedUsageStore, UsageError};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    LimitReached(String),
    #[error("Server returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Invalid server URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("{0}")]
    Local(String),
}

#[async_trait]
pub trait UsageApi: Send + Sync {
    async fn check(&self, action: ActionType) -> Result<UsagePayload, ApiError>;
    async fn increment(&self, action: ActionType) -> Result<UsagePayload, ApiError>;
}

pub struct HttpUsageApi {
    base_url: Url,
    caller: Caller,
    client: reqwest::Client,
}

impl HttpUsageApi {
    pub fn new(base_url: &str, caller: Caller, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: Url::parse(base_url)?,
            caller,
            client,
        })
    }

    async fn post(&self, path: &str, action: ActionType) -> Result<UsagePayload, ApiError> {
        let url = self.base_url.join(path)?;
        let response = self
            .client
            .post(url)
            .header(USER_HEADER, &self.caller.user_id)
            .header(TIER_HEADER, self.caller.tier.as_str())
            .json(&UsageRequest {
                action_type: action.as_str().to_string(),
            })
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|body| body.error)
            .unwrap_or_else(|_| {
                if text.is_empty() {
                    status.to_string()
                } else {
                    text
                }
            });

        if status == StatusCode::TOO_MANY_REQUESTS {
            Err(ApiError::LimitReached(message))
        } else {
            Err(ApiError::Status {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[async_trait]
impl UsageApi for HttpUsageApi {
    async fn check(&self, action: ActionType) -> Result<UsagePayload, ApiError> {
        self.post("/api/usage/check", action).await
    }

    async fn increment(&self, action: ActionType) -> Result<UsagePayload, ApiError> {
        self.post("/api/usage/increment", action).await
    }
}

/// Talks to an in-process store instead of the network
pub struct LocalUsageApi {
    store: SharedUsageStore,
    caller: Caller,
}

impl LocalUsageApi {
    pub fn new(store: SharedUsageStore, caller: Caller) -> Self {
        Self { store, caller }
    }
}

#[async_trait]
impl UsageApi for LocalUsageApi {
    async fn check(&self, action: ActionType) -> Result<UsagePayload, ApiError> {
        let store = self.store.read().await;
        Ok(UsagePayload {
            status: store.check(&self.caller.user_id, self.caller.tier, action),
            resets_at: Some(UsageStore::next_reset()),
        })
    }

    async fn increment(&self, action: ActionType) -> Result<UsagePayload, ApiError> {
        let mut store = self.store.write().await;
        match store.increment(&self.caller.user_id, self.caller.tier, action) {
            Ok(status) => Ok(UsagePayload {
                status,
                resets_at: Some(UsageStore::next_reset()),
            }),
            Err(err @ UsageError::LimitReached { .. }) => {
                Err(ApiError::LimitReached(err.to_string()))
            }
            Err(err) => Err(ApiError::Local(err.to_string())),
        }
    }
}
