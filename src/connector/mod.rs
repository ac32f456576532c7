// src/connector/mod.rs

mod cache;
#[allow(clippy::module_inception)]
mod connector;
mod pool;
pub mod retry;

pub use cache::RecentIds;
pub use connector::{Connector, ConnectorSettings, Outcome, PendingOutcome};
pub use pool::{ConnectorPool, PaperSessionFactory, SessionFactory};
pub use retry::{Backoff, RetryPolicy};
