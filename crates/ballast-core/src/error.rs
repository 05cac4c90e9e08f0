use thiserror::Error;

/// Errors surfaced by the balancer itself.
///
/// Failures produced by a task's work callable never show up here; they are
/// delivered untouched through the task's outcome slot.
#[derive(Debug, Error)]
pub enum BalancerError {
    #[error("worker count must be positive, got {0}")]
    InvalidWorkerCount(usize),

    #[error("invalid balancer config: {0}")]
    InvalidConfig(String),

    #[error("balancer is shut down")]
    Closed,

    #[error("ingress queue is full")]
    Saturated,

    #[error("task outcome was lost before delivery")]
    OutcomeLost,

    #[error("dispatcher failed: {0}")]
    DispatcherFailed(String),
}
