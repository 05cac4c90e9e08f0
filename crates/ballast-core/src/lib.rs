//! ballast-core
//!
//! A least-loaded worker pool.
//!
//! # Modules
//! - **task**: work item + one-shot outcome slot (`Task`, `TaskHandle`)
//! - **worker**: per-worker inbound queue and processing loop
//! - **pool**: min-heap of workers keyed by pending count, with O(log n)
//!   removal from any position
//! - **balancer**: the dispatcher (sole writer of the pool) and the public
//!   submission API
//! - **config** / **status** / **error**: sizing, snapshots, error types

pub mod balancer;
pub mod config;
pub mod error;
pub mod pool;
pub mod status;
pub mod task;
pub mod worker;

pub use self::balancer::{Balancer, Submitter};
pub use self::config::BalancerConfig;
pub use self::error::BalancerError;
pub use self::pool::{Loaded, Pool, PoolError, WorkerId};
pub use self::status::BalancerStatus;
pub use self::task::{Task, TaskHandle};
