//! Client side of the quota flow: a cached usage state per action type,
//! the banner derived from it, and the gated tool controller that spends
//! quota before calling a processing endpoint.

pub mod analytics;
pub mod api;
pub mod banner;
pub mod binding;
pub mod controller;
pub mod store;
pub mod tools;

pub use analytics::HttpAnalytics;
pub use api::HttpUsageApi;
pub use banner::Banner;
pub use binding::UsageLimit;
pub use controller::{SubmitOutcome, ToolController};
pub use store::UsageLimitsStore;
pub use tools::{HttpProcessor, SelectedFile, Tool, ToolOptions};
