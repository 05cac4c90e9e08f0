//! Balancer - least-loaded dispatch over a fixed set of workers.
//!
//! # Flow
//! 1. `submit()` puts a task on the bounded ingress queue
//! 2. the dispatcher pops the least-loaded worker from the pool, hands it the
//!    task, bumps its pending count and puts it back
//! 3. the worker runs the task, writes the outcome, reports its id on the
//!    completion queue
//! 4. the dispatcher drops that worker's pending count and repositions it
//!
//! The dispatcher task is the only code that touches the pool. Workers and
//! submitters reach it through channels only, so the heap needs no lock.

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::BalancerConfig;
use crate::error::BalancerError;
use crate::pool::{Pool, WorkerId};
use crate::status::BalancerStatus;
use crate::task::{Task, TaskHandle};
use crate::worker::WorkerHandle;

/// Cloneable submission handle.
pub struct Submitter<T, E> {
    ingress: mpsc::Sender<Task<T, E>>,
}

impl<T, E> Clone for Submitter<T, E> {
    fn clone(&self) -> Self {
        Self {
            ingress: self.ingress.clone(),
        }
    }
}

impl<T, E> Submitter<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Queue `work` for dispatch.
    ///
    /// Waits while the ingress queue is full. Returns once the task is
    /// accepted, not once it has run; await the returned handle for that.
    pub async fn submit<F>(&self, work: F) -> Result<TaskHandle<T, E>, BalancerError>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        let (task, handle) = Task::new(work);
        self.submit_task(task).await?;
        Ok(handle)
    }

    /// Queue a task built with [`Task::new`].
    pub async fn submit_task(&self, task: Task<T, E>) -> Result<(), BalancerError> {
        self.ingress
            .send(task)
            .await
            .map_err(|_| BalancerError::Closed)
    }

    /// Like [`Submitter::submit`] but fails with
    /// [`BalancerError::Saturated`] instead of waiting.
    pub fn try_submit<F>(&self, work: F) -> Result<TaskHandle<T, E>, BalancerError>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        let (task, handle) = Task::new(work);
        match self.ingress.try_send(task) {
            Ok(()) => Ok(handle),
            Err(mpsc::error::TrySendError::Full(_)) => Err(BalancerError::Saturated),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(BalancerError::Closed),
        }
    }
}

/// Load balancer owning the worker pool and its dispatcher.
///
/// Must be created inside a tokio runtime. Dropping it without calling
/// [`Balancer::shutdown`] still stops the dispatcher and lets queued work
/// drain in the background.
///
/// # Example
/// ```ignore
/// let balancer = Balancer::<u64, String>::new(4)?;
/// let handle = balancer.submit(|| Ok(6 * 7)).await?;
/// assert_eq!(handle.outcome().await?, Ok(42));
/// balancer.shutdown().await?;
/// ```
pub struct Balancer<T, E> {
    submitter: Submitter<T, E>,
    shutdown_tx: watch::Sender<bool>,
    status_rx: watch::Receiver<BalancerStatus>,
    dispatcher: JoinHandle<BalancerStatus>,
}

impl<T, E> Balancer<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Start `workers` workers with default queue sizes.
    pub fn new(workers: usize) -> Result<Self, BalancerError> {
        Self::with_config(BalancerConfig::with_workers(workers))
    }

    /// Start a balancer from `config`.
    ///
    /// The config is validated before anything is spawned, so an error means
    /// no worker or dispatcher was started.
    pub fn with_config(config: BalancerConfig) -> Result<Self, BalancerError> {
        config.validate()?;

        let (ingress_tx, ingress_rx) = mpsc::channel(config.ingress_capacity());
        let (done_tx, done_rx) = mpsc::channel(config.completion_capacity());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let workers = (0..config.workers)
            .map(|n| WorkerHandle::spawn(WorkerId::new(n), config.inbound_capacity, done_tx.clone()))
            .collect();
        // workers hold the only completion senders; the queue closes once they all exit
        drop(done_tx);

        let dispatcher = Dispatcher::new(Pool::filled(workers));
        let (status_tx, status_rx) = watch::channel(dispatcher.snapshot());
        let dispatcher = tokio::spawn(dispatcher.run(ingress_rx, done_rx, shutdown_rx, status_tx));

        info!(
            workers = config.workers,
            ingress = config.ingress_capacity(),
            inbound = config.inbound_capacity,
            "balancer started"
        );

        Ok(Self {
            submitter: Submitter {
                ingress: ingress_tx,
            },
            shutdown_tx,
            status_rx,
            dispatcher,
        })
    }

    pub async fn submit<F>(&self, work: F) -> Result<TaskHandle<T, E>, BalancerError>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        self.submitter.submit(work).await
    }

    pub async fn submit_task(&self, task: Task<T, E>) -> Result<(), BalancerError> {
        self.submitter.submit_task(task).await
    }

    pub fn try_submit<F>(&self, work: F) -> Result<TaskHandle<T, E>, BalancerError>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        self.submitter.try_submit(work)
    }

    /// A handle other tasks can submit through.
    pub fn submitter(&self) -> Submitter<T, E> {
        self.submitter.clone()
    }

    /// Latest published snapshot.
    pub fn status(&self) -> BalancerStatus {
        self.status_rx.borrow().clone()
    }

    /// Receiver that updates after every dispatch and completion.
    pub fn watch_status(&self) -> watch::Receiver<BalancerStatus> {
        self.status_rx.clone()
    }

    /// Stop accepting work, finish everything already accepted, join all
    /// workers and return the final status.
    pub async fn shutdown(self) -> Result<BalancerStatus, BalancerError> {
        // receiver lives in the dispatcher; a send error means it already stopped
        let _ = self.shutdown_tx.send(true);
        self.dispatcher
            .await
            .map_err(|e| BalancerError::DispatcherFailed(e.to_string()))
    }
}

enum Event<T, E> {
    Arrived(Task<T, E>),
    Completed(WorkerId),
    Stop,
}

/// Single writer of the pool.
pub(crate) struct Dispatcher<T, E> {
    pool: Pool<WorkerHandle<T, E>>,
    dispatched: u64,
    completed: u64,
}

impl<T, E> Dispatcher<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub(crate) fn new(pool: Pool<WorkerHandle<T, E>>) -> Self {
        Self {
            pool,
            dispatched: 0,
            completed: 0,
        }
    }

    pub(crate) fn snapshot(&self) -> BalancerStatus {
        BalancerStatus::new(self.pool.loads(), self.dispatched, self.completed)
    }

    async fn run(
        mut self,
        mut ingress: mpsc::Receiver<Task<T, E>>,
        mut done: mpsc::Receiver<WorkerId>,
        mut shutdown: watch::Receiver<bool>,
        status: watch::Sender<BalancerStatus>,
    ) -> BalancerStatus {
        loop {
            if *shutdown.borrow() {
                break;
            }

            // completions first so the heap is current before the next pick
            let event = tokio::select! {
                biased;
                _ = shutdown.changed() => Event::Stop,
                Some(id) = done.recv() => Event::Completed(id),
                task = ingress.recv() => match task {
                    Some(task) => Event::Arrived(task),
                    None => Event::Stop,
                },
            };

            match event {
                Event::Arrived(task) => self.dispatch(task, &mut done).await,
                Event::Completed(id) => self.complete(id),
                Event::Stop => break,
            }
            status.send_replace(self.snapshot());
        }

        let final_status = self.drain(ingress, done, &status).await;
        status.send_replace(final_status.clone());
        final_status
    }

    /// Hand `task` to the least-loaded worker.
    ///
    /// While waiting for room in that worker's inbound queue, completion
    /// signals keep being collected and are applied once the worker is back
    /// in the pool. Without this a worker blocked on a full completion queue
    /// could never free up the inbound slot the dispatcher is waiting for.
    pub(crate) async fn dispatch(&mut self, task: Task<T, E>, done: &mut mpsc::Receiver<WorkerId>) {
        let Some(id) = self.pool.pop_min() else {
            error!("no worker left in the pool; dropping task");
            return;
        };
        let Some(inbound) = self.pool.member(id).and_then(WorkerHandle::inbound).cloned() else {
            error!(worker = %id, "inbound queue already closed; dropping task");
            self.pool.insert(id);
            return;
        };

        let mut deferred = Vec::new();
        let permit = loop {
            tokio::select! {
                biased;
                permit = inbound.reserve() => break permit,
                Some(done_id) = done.recv() => deferred.push(done_id),
            }
        };

        match permit {
            Ok(permit) => {
                permit.send(task);
                if let Some(worker) = self.pool.member_mut(id) {
                    worker.inc_load();
                }
                self.pool.insert(id);
                self.dispatched += 1;
                debug!(worker = %id, pending = self.pool.member(id).map_or(0, |w| w.pending()), "dispatched");
            }
            Err(_) => {
                // worker task is gone; keep it out of rotation
                error!(worker = %id, "worker stopped unexpectedly; retiring it");
            }
        }

        for done_id in deferred {
            self.complete(done_id);
        }
        debug_assert_eq!(self.pool.check_invariants(), Ok(()));
    }

    /// Account for one finished task on `id`.
    pub(crate) fn complete(&mut self, id: WorkerId) {
        let Some(worker) = self.pool.member_mut(id) else {
            warn!(worker = %id, "completion from unknown worker");
            return;
        };
        worker.dec_load();
        if self.pool.contains(id) {
            self.pool.reposition(id);
        }
        self.completed += 1;
        debug_assert_eq!(self.pool.check_invariants(), Ok(()));
    }

    /// Shutdown: close ingress, dispatch what it still holds, close every
    /// inbound queue, collect the remaining completions, join the workers.
    async fn drain(
        &mut self,
        mut ingress: mpsc::Receiver<Task<T, E>>,
        mut done: mpsc::Receiver<WorkerId>,
        status: &watch::Sender<BalancerStatus>,
    ) -> BalancerStatus {
        ingress.close();
        let mut flushed = 0usize;
        while let Some(task) = ingress.recv().await {
            self.dispatch(task, &mut done).await;
            flushed += 1;
            status.send_replace(self.snapshot());
        }
        info!(flushed, in_flight = self.snapshot().in_flight, "balancer draining");

        for (_, worker) in self.pool.members_mut() {
            worker.close();
        }
        while let Some(id) = done.recv().await {
            self.complete(id);
            status.send_replace(self.snapshot());
        }

        let joins: Vec<_> = self
            .pool
            .members_mut()
            .filter_map(|(id, worker)| worker.take_join().map(|join| (id, join)))
            .collect();
        for (id, join) in joins {
            if let Err(e) = join.await {
                warn!(worker = %id, error = %e, "worker did not stop cleanly");
            }
        }

        let final_status = self.snapshot();
        info!(
            dispatched = final_status.dispatched,
            completed = final_status.completed,
            "balancer stopped"
        );
        final_status
    }
}
