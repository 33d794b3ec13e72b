//! Stream proxy core: channel filtering, per-source concurrency accounting
//! and upstream selection with failover.

pub mod concurrency;
pub mod filter_engine;
pub mod load_balancer;

pub use concurrency::{ConcurrencyManager, ReleaseGuard};
pub use filter_engine::FilterEngine;
pub use load_balancer::{BalanceResult, LoadBalancer};
