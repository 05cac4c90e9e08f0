//! Task - an opaque unit of work plus its one-shot outcome slot.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::BalancerError;

type Work<T, E> = Box<dyn FnOnce() -> Result<T, E> + Send + 'static>;

/// Work item handed to the balancer.
///
/// The balancer never looks at what `work` computes or at the value it
/// returns; it only cares about when it starts and when it finishes.
pub struct Task<T, E> {
    work: Work<T, E>,
    outcome: oneshot::Sender<Result<T, E>>,
}

/// What happened to a task's outcome after the work ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Delivered,
    /// The submitter dropped its handle before the outcome arrived.
    Abandoned,
    /// The work callable panicked; the slot was dropped unwritten.
    Panicked,
}

impl<T, E> Task<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Wrap a callable, returning the task and the submitter's end of its
    /// outcome slot.
    pub fn new<F>(work: F) -> (Self, TaskHandle<T, E>)
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let task = Self {
            work: Box::new(work),
            outcome: tx,
        };
        (task, TaskHandle { rx })
    }

    /// Run the work on the blocking pool and write its outcome.
    pub(crate) async fn run(self) -> Delivery {
        let Self { work, outcome } = self;
        match tokio::task::spawn_blocking(work).await {
            Ok(result) => match outcome.send(result) {
                Ok(()) => Delivery::Delivered,
                Err(_) => Delivery::Abandoned,
            },
            Err(_) => Delivery::Panicked,
        }
    }
}

/// Submitter's end of a task's outcome slot.
///
/// Resolves to the work's own `Result<T, E>`, untouched. The outer
/// [`BalancerError::OutcomeLost`] only shows up when the work panicked.
///
/// There is no built-in timeout; race the handle against a timer if you
/// need one:
/// ```ignore
/// let outcome = tokio::time::timeout(Duration::from_secs(1), handle).await;
/// ```
#[derive(Debug)]
pub struct TaskHandle<T, E> {
    rx: oneshot::Receiver<Result<T, E>>,
}

impl<T, E> TaskHandle<T, E> {
    /// Wait for the outcome.
    pub async fn outcome(self) -> Result<Result<T, E>, BalancerError> {
        self.await
    }

    /// Non-blocking check; `None` while the task is still queued or running.
    pub fn try_outcome(&mut self) -> Option<Result<Result<T, E>, BalancerError>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(Ok(outcome)),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(BalancerError::OutcomeLost)),
        }
    }
}

impl<T, E> Future for TaskHandle<T, E> {
    type Output = Result<Result<T, E>, BalancerError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.rx)
            .poll(cx)
            .map(|received| received.map_err(|_| BalancerError::OutcomeLost))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_delivers_success() {
        let (task, handle) = Task::<u8, String>::new(|| Ok(7));
        assert_eq!(task.run().await, Delivery::Delivered);
        assert_eq!(handle.outcome().await.unwrap(), Ok(7));
    }

    #[tokio::test]
    async fn run_delivers_failure_unchanged() {
        let (task, handle) = Task::<u8, String>::new(|| Err("bad input".to_string()));
        task.run().await;
        assert_eq!(handle.await.unwrap(), Err("bad input".to_string()));
    }

    #[tokio::test]
    async fn dropped_handle_is_reported_as_abandoned() {
        let (task, handle) = Task::<u8, String>::new(|| Ok(1));
        drop(handle);
        assert_eq!(task.run().await, Delivery::Abandoned);
    }

    #[tokio::test]
    async fn panicking_work_loses_outcome() {
        let (task, handle) = Task::<u8, String>::new(|| panic!("boom"));
        assert_eq!(task.run().await, Delivery::Panicked);
        assert!(matches!(handle.await, Err(BalancerError::OutcomeLost)));
    }

    #[tokio::test]
    async fn try_outcome_is_none_until_run() {
        let (task, mut handle) = Task::<u8, String>::new(|| Ok(3));
        assert!(handle.try_outcome().is_none());
        task.run().await;
        assert!(matches!(handle.try_outcome(), Some(Ok(Ok(3)))));
    }
}
