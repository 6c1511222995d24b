//! Worker dispatch pool
//!
//! A fixed set of worker tasks, each draining its own bounded queue. Work is
//! routed by an FNV hash of the client id, so every item from one client is
//! handled by one worker in the order it was read while different clients
//! run in parallel.

use std::any::Any;
use std::hash::Hasher;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use fnv::FnvHasher;
use futures_util::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, error};

use super::connection::{self, Connection};
use super::Broker;
use crate::pool::{ObjectPool, Reset};
use crate::protocol::Packet;

/// What a worker should do for a connection
#[derive(Debug)]
pub(crate) enum Job {
    /// A decoded packet, in read order
    Packet(Packet),
    /// The read side failed (timeout, EOF, malformed input)
    Lost,
}

/// Pooled unit of work
#[derive(Default)]
pub(crate) struct WorkItem {
    conn: Option<Arc<Connection>>,
    job: Option<Job>,
}

impl Reset for WorkItem {
    fn reset(&mut self) {
        self.conn = None;
        self.job = None;
    }
}

/// Dispatch error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    /// The worker for this client has stopped
    Stopped,
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::Stopped => write!(f, "dispatch worker stopped"),
        }
    }
}

impl std::error::Error for DispatchError {}

pub(crate) struct Dispatcher {
    queues: Vec<mpsc::Sender<WorkItem>>,
    items: Arc<ObjectPool<WorkItem>>,
}

impl Dispatcher {
    /// Spawn `workers` tasks; must be called inside a tokio runtime
    pub(crate) fn new(
        workers: usize,
        queue_capacity: usize,
        pool_capacity: usize,
        broker: Weak<Broker>,
    ) -> Self {
        let items = Arc::new(ObjectPool::with_capacity(pool_capacity));
        let queues = (0..workers.max(1))
            .map(|id| {
                let (tx, rx) = mpsc::channel(queue_capacity.max(1));
                tokio::spawn(worker(id, rx, broker.clone(), items.clone()));
                tx
            })
            .collect();

        Self { queues, items }
    }

    pub(crate) fn workers(&self) -> usize {
        self.queues.len()
    }

    fn slot(&self, client_id: &str) -> usize {
        let mut hasher = FnvHasher::default();
        hasher.write(client_id.as_bytes());
        (hasher.finish() % self.queues.len() as u64) as usize
    }

    /// Queue `job` for `conn`, waiting while the worker's queue is full
    pub(crate) async fn submit(
        &self,
        conn: &Arc<Connection>,
        job: Job,
    ) -> Result<(), DispatchError> {
        let mut item = self.items.get();
        item.conn = Some(conn.clone());
        item.job = Some(job);

        let slot = self.slot(conn.client_id());
        self.queues[slot]
            .send(item)
            .await
            .map_err(|_| DispatchError::Stopped)
    }
}

async fn worker(
    id: usize,
    mut rx: mpsc::Receiver<WorkItem>,
    broker: Weak<Broker>,
    items: Arc<ObjectPool<WorkItem>>,
) {
    while let Some(mut item) = rx.recv().await {
        let (conn, job) = (item.conn.take(), item.job.take());
        items.put(item);

        let (Some(conn), Some(job)) = (conn, job) else {
            continue;
        };
        let Some(broker) = broker.upgrade() else {
            break;
        };

        let outcome = AssertUnwindSafe(connection::handle(&broker, &conn, job))
            .catch_unwind()
            .await;

        if let Err(panic) = outcome {
            error!(
                worker = id,
                client_id = %conn.client_id(),
                "handler panicked: {}",
                panic_message(&panic)
            );
            conn.close(&broker).await;
        }
    }
    debug!(worker = id, "dispatch worker stopped");
}

fn panic_message(panic: &Box<dyn Any + Send>) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
