//! Worker - one execution lane with its own bounded inbound queue.
//!
//! The dispatcher keeps a [`WorkerHandle`] per worker inside the pool; the
//! worker itself is a tokio task running [`worker_loop`]. The two only talk
//! through channels: tasks go in over `inbound`, the worker id comes back over
//! the completion queue once the task's outcome is written.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::pool::{Loaded, WorkerId};
use crate::task::{Delivery, Task};

/// Dispatcher-side record of a worker.
pub struct WorkerHandle<T, E> {
    id: WorkerId,
    inbound: Option<mpsc::Sender<Task<T, E>>>,
    pending: usize,
    heap_index: Option<usize>,
    join: Option<JoinHandle<()>>,
}

impl<T, E> WorkerHandle<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Spawn a worker task with an inbound queue of `inbound_capacity`.
    pub(crate) fn spawn(
        id: WorkerId,
        inbound_capacity: usize,
        done: mpsc::Sender<WorkerId>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(inbound_capacity);
        let join = tokio::spawn(worker_loop(id, rx, done));
        Self::new(id, tx, Some(join))
    }

    pub(crate) fn new(
        id: WorkerId,
        inbound: mpsc::Sender<Task<T, E>>,
        join: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            id,
            inbound: Some(inbound),
            pending: 0,
            heap_index: None,
            join,
        }
    }
}

impl<T, E> WorkerHandle<T, E> {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Tasks assigned to this worker that have not signaled completion.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// `None` once the dispatcher has closed the queue for shutdown.
    pub(crate) fn inbound(&self) -> Option<&mpsc::Sender<Task<T, E>>> {
        self.inbound.as_ref()
    }

    pub(crate) fn inc_load(&mut self) {
        self.pending += 1;
    }

    pub(crate) fn dec_load(&mut self) {
        assert!(self.pending > 0, "{} completed more tasks than it was given", self.id);
        self.pending -= 1;
    }

    /// Drop the inbound sender; the worker exits after its queue drains.
    pub(crate) fn close(&mut self) {
        self.inbound = None;
    }

    pub(crate) fn take_join(&mut self) -> Option<JoinHandle<()>> {
        self.join.take()
    }
}

impl<T, E> Loaded for WorkerHandle<T, E> {
    fn load(&self) -> usize {
        self.pending
    }

    fn heap_index(&self) -> Option<usize> {
        self.heap_index
    }

    fn set_heap_index(&mut self, index: Option<usize>) {
        self.heap_index = index;
    }
}

/// Worker core loop.
///
/// ```text
/// while let Some(task) = inbound.recv() {
///     run task, write outcome
///     done.send(id)
/// }
/// ```
/// Tasks run one at a time in arrival order. The loop ends when the inbound
/// queue is closed and empty, or when the dispatcher is gone.
pub(crate) async fn worker_loop<T, E>(
    id: WorkerId,
    mut inbound: mpsc::Receiver<Task<T, E>>,
    done: mpsc::Sender<WorkerId>,
) where
    T: Send + 'static,
    E: Send + 'static,
{
    debug!(worker = %id, "worker started");

    while let Some(task) = inbound.recv().await {
        match task.run().await {
            Delivery::Delivered => {}
            Delivery::Abandoned => {
                debug!(worker = %id, "outcome dropped: submitter no longer waiting");
            }
            Delivery::Panicked => {
                warn!(worker = %id, "task panicked; outcome lost");
            }
        }

        // completion counts regardless of how the task ended
        if done.send(id).await.is_err() {
            warn!(worker = %id, "completion queue closed; stopping");
            break;
        }
    }

    debug!(worker = %id, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn worker_runs_task_and_signals_completion() {
        let (done_tx, mut done_rx) = mpsc::channel(1);
        let mut worker = WorkerHandle::<u8, String>::spawn(WorkerId::new(3), 4, done_tx);

        let (task, handle) = Task::new(|| Ok(1));
        worker.inbound().unwrap().send(task).await.unwrap();

        assert_eq!(handle.outcome().await.unwrap(), Ok(1));
        assert_eq!(done_rx.recv().await, Some(WorkerId::new(3)));

        worker.close();
        worker.take_join().unwrap().await.unwrap();
    }

    #[tokio::test]
    async fn worker_keeps_fifo_order() {
        let (done_tx, mut done_rx) = mpsc::channel(8);
        let mut worker = WorkerHandle::<usize, String>::spawn(WorkerId::new(0), 8, done_tx);
        let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for n in 0..8 {
            let order = order.clone();
            let (task, handle) = Task::new(move || {
                // later tasks are quicker; FIFO must still hold
                std::thread::sleep(Duration::from_millis((8 - n) as u64));
                order.lock().unwrap().push(n);
                Ok(n)
            });
            worker.inbound().unwrap().send(task).await.unwrap();
            handles.push(handle);
        }

        for handle in handles {
            handle.outcome().await.unwrap().unwrap();
        }
        for _ in 0..8 {
            assert_eq!(done_rx.recv().await, Some(WorkerId::new(0)));
        }
        assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());

        worker.close();
        worker.take_join().unwrap().await.unwrap();
    }

    #[tokio::test]
    async fn worker_signals_completion_after_panic() {
        let (done_tx, mut done_rx) = mpsc::channel(1);
        let worker = WorkerHandle::<u8, String>::spawn(WorkerId::new(1), 1, done_tx);

        let (task, handle) = Task::new(|| panic!("boom"));
        worker.inbound().unwrap().send(task).await.unwrap();

        assert!(handle.outcome().await.is_err());
        assert_eq!(done_rx.recv().await, Some(WorkerId::new(1)));
    }

    #[tokio::test]
    async fn worker_stops_when_inbound_closes() {
        let (done_tx, mut done_rx) = mpsc::channel(1);
        let mut worker = WorkerHandle::<u8, String>::spawn(WorkerId::new(0), 1, done_tx);

        worker.close();
        worker.take_join().unwrap().await.unwrap();
        // the only completion sender lived in the worker
        assert_eq!(done_rx.recv().await, None);
    }

    #[test]
    #[should_panic(expected = "completed more tasks")]
    fn dec_load_below_zero_panics() {
        let (tx, _rx) = mpsc::channel(1);
        let mut worker = WorkerHandle::<u8, String>::new(WorkerId::new(0), tx, None);
        worker.dec_load();
    }
}
