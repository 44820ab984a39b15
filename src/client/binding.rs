use crate::rpc::UsagePayload;
use crate::tier::ActionType;

use super::store::{ClientUsageStatus, IncrementOutcome, UsageLimitsStore};

/// One consumer's handle on the shared usage state, fixed to an action type
#[derive(Clone)]
pub struct UsageLimit {
    store: UsageLimitsStore,
    action: ActionType,
}

impl UsageLimit {
    /// Bind to `action` and run the initial check
    pub async fn bind(store: UsageLimitsStore, action: ActionType) -> Self {
        let binding = Self::unchecked(store, action);
        binding.check_usage().await;
        binding
    }

    /// Bind without the initial check; the status stays loading until one runs
    pub fn unchecked(store: UsageLimitsStore, action: ActionType) -> Self {
        Self { store, action }
    }

    pub fn action(&self) -> ActionType {
        self.action
    }

    pub fn status(&self) -> ClientUsageStatus {
        self.store.get_status(self.action)
    }

    pub async fn check_usage(&self) -> Option<UsagePayload> {
        self.store.check_usage(self.action).await
    }

    /// The only way past a quota gate. Never retried here.
    pub async fn increment_usage(&self) -> IncrementOutcome {
        self.store.increment_usage(self.action).await
    }

    pub async fn refresh(&self) -> Option<UsagePayload> {
        self.store.refresh(self.action).await
    }
}
