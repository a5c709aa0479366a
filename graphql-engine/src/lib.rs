//! Fetches data source responses for GraphQL operations and fans out
//! subscription events.
//!
//! Identical concurrent fetches share one upstream call, batches of inputs are
//! sent as one request and split back per input, and subscriptions with the
//! same upstream identity share one stream.

#![warn(unreachable_pub)]

pub mod buf_pair;
mod configuration;
pub mod context;
pub mod error;
pub mod fetcher;
pub mod hooks;
pub mod query_planner;
mod response;
pub mod subscription;

pub use buf_pair::BufPair;
pub use configuration::Configuration;
pub use configuration::ConfigurationError;
pub use configuration::FetchConfig;
pub use configuration::IdleStreamPolicy;
pub use configuration::SubscriptionConfig;
pub use context::Context;
pub use context::Path;
pub use error::FetchError;
pub use error::SubscriptionError;
pub use fetcher::Fetcher;
pub use hooks::FetchHooks;
pub use hooks::HookContext;
pub use query_planner::PlanNode;
pub use response::Response;
pub use subscription::StreamManager;
pub use subscription::resolve_subscription;
