pub mod action;
pub mod limits;
pub mod middleware;
pub mod usage;

pub use action::ActionType;
pub use limits::{Limit, PlanLimits, SubscriptionPlan, Tier};
pub use middleware::{
    check_usage, extract_caller_from_headers, increment_usage, Caller, UsageErrorResponse,
};
pub use usage::{create_shared_store, SharedUsageStore, UsageError, UsageStatus};
