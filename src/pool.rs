//! Fixed-size pool of supervised workers
//!
//! The pool owns an ordered set of [`Worker`]s, selects one per incoming
//! request (preferring ready workers, falling back to round-robin),
//! aggregates their output streams, and folds their lifecycle events into
//! pool-level `ready`/`exit` edges.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::body::Body;
use hyper::{Request, Response};
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::client::MetaVariables;
use crate::error::WorkerError;
use crate::logs::AggregateStream;
use crate::worker::{Worker, WorkerEvent, WorkerOptions, WorkerState};

/// Capacity of the pool-level event channel.
const EVENT_CAPACITY: usize = 256;

/// Options for constructing a pool.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Number of workers created up front. Must be at least 1.
    pub size: usize,
    /// Per-worker idle timeout before a graceful quit
    pub idle: Option<Duration>,
    /// Working directory for worker children
    pub cwd: Option<PathBuf>,
    /// Environment overrides for worker children
    pub env: HashMap<String, String>,
    /// Pass `--debug` to worker children
    pub debug: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            size: 1,
            idle: None,
            cwd: None,
            env: HashMap::new(),
            debug: false,
        }
    }
}

/// Pool-level notifications.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// Ready-count crossed from zero to positive
    Ready,
    /// Alive-count returned to zero
    Exit,
    /// A worker event, tagged with the worker's pool id
    Worker(usize, WorkerEvent),
}

struct PoolWorker {
    id: usize,
    worker: Arc<Worker>,
}

/// A supervised collection of workers sharing one scheduling policy.
///
/// Returned as `Arc<Self>` because the event loop and log pumps run as
/// background tasks holding a reference. Must be created inside a tokio
/// runtime.
pub struct Pool {
    config: PathBuf,
    options: PoolOptions,
    workers: RwLock<Vec<PoolWorker>>,
    cursor: AtomicUsize,
    next_id: AtomicUsize,
    events: broadcast::Sender<PoolEvent>,
    event_tx: mpsc::UnboundedSender<(usize, WorkerEvent)>,
    stdout: AggregateStream,
    stderr: AggregateStream,
}

impl Pool {
    /// Create `options.size` workers against the given runtime config.
    /// None are spawned; call [`spawn`](Pool::spawn) or let
    /// [`proxy`](Pool::proxy) spawn them on demand.
    pub fn new(config: impl AsRef<Path>, options: PoolOptions) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let size = options.size.max(1);

        let pool = Arc::new(Self {
            config: config.as_ref().to_path_buf(),
            options,
            workers: RwLock::new(Vec::with_capacity(size)),
            cursor: AtomicUsize::new(0),
            next_id: AtomicUsize::new(0),
            events,
            event_tx,
            stdout: AggregateStream::new(),
            stderr: AggregateStream::new(),
        });

        for _ in 0..size {
            pool.add_worker();
        }
        let this = Arc::clone(&pool);
        tokio::spawn(async move { this.event_loop(event_rx).await });

        info!(config = %pool.config.display(), size, "worker pool created");
        pool
    }

    /// Number of workers currently owned by the pool.
    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.read().is_empty()
    }

    /// Snapshot of the workers in insertion order.
    pub fn workers(&self) -> Vec<Arc<Worker>> {
        self.workers
            .read()
            .iter()
            .map(|entry| Arc::clone(&entry.worker))
            .collect()
    }

    /// Workers currently in the `ready` state.
    pub fn ready_count(&self) -> usize {
        self.workers
            .read()
            .iter()
            .filter(|entry| entry.worker.state() == WorkerState::Ready)
            .count()
    }

    /// Workers with a live child process.
    pub fn alive_count(&self) -> usize {
        self.workers
            .read()
            .iter()
            .filter(|entry| entry.worker.is_alive())
            .count()
    }

    /// Subscribe to pool-level events.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Aggregated stdout of every worker, tagged by pool id.
    pub fn stdout(&self) -> &AggregateStream {
        &self.stdout
    }

    /// Aggregated stderr of every worker, tagged by pool id.
    pub fn stderr(&self) -> &AggregateStream {
        &self.stderr
    }

    fn add_worker(self: &Arc<Self>) -> Arc<Worker> {
        let worker = Worker::new(
            &self.config,
            WorkerOptions {
                cwd: self.options.cwd.clone(),
                env: self.options.env.clone(),
                idle: self.options.idle,
                debug: self.options.debug,
            },
        );
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        // Forward every worker event into the pool's single consumer loop.
        let mut events = worker.subscribe();
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if tx.send((id, event)).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(worker = id, skipped, "worker event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.workers.write().push(PoolWorker {
            id,
            worker: Arc::clone(&worker),
        });
        worker
    }

    fn worker_by_id(&self, id: usize) -> Option<Arc<Worker>> {
        self.workers
            .read()
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| Arc::clone(&entry.worker))
    }

    /// Single consumer of all worker events. Owns the ready/alive counts,
    /// so the 0->1 and ->0 edges are computed race-free.
    async fn event_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<(usize, WorkerEvent)>) {
        let mut states: HashMap<usize, WorkerState> = HashMap::new();
        let mut ready = 0usize;
        let mut alive = 0usize;

        while let Some((id, event)) = rx.recv().await {
            let prev_ready = ready;
            let prev_alive = alive;

            match &event {
                WorkerEvent::Spawning => {
                    states.insert(id, WorkerState::Spawning);
                }
                WorkerEvent::Spawned => {
                    // The child is up; route its output into the aggregates.
                    if let Some(worker) = self.worker_by_id(id) {
                        if let Some(stdout) = worker.take_stdout() {
                            self.stdout.add(stdout, format!("worker.{}", id));
                        }
                        if let Some(stderr) = worker.take_stderr() {
                            self.stderr.add(stderr, format!("worker.{}", id));
                        }
                    }
                }
                WorkerEvent::Ready => {
                    states.insert(id, WorkerState::Ready);
                }
                WorkerEvent::Busy => {
                    states.insert(id, WorkerState::Busy);
                }
                WorkerEvent::Quitting => {
                    states.insert(id, WorkerState::Quitting);
                }
                WorkerEvent::Exit(code) => {
                    debug!(worker = id, code = ?code, "worker exited");
                    states.remove(&id);
                }
                WorkerEvent::Error(e) => {
                    warn!(worker = id, error = %e, "worker error");
                    // A spawn that failed before a child existed never
                    // produces an exit; drop the entry once the worker has
                    // reverted to absent.
                    let reverted = match self.worker_by_id(id) {
                        Some(worker) => worker.state() == WorkerState::Absent,
                        None => matches!(
                            e,
                            WorkerError::ConfigMissing(_) | WorkerError::ProgramMissing
                        ),
                    };
                    if reverted {
                        states.remove(&id);
                    }
                }
                WorkerEvent::Idle => {}
            }

            ready = states
                .values()
                .filter(|state| **state == WorkerState::Ready)
                .count();
            alive = states.len();

            let _ = self.events.send(PoolEvent::Worker(id, event));
            if prev_ready == 0 && ready > 0 {
                info!(config = %self.config.display(), "pool ready");
                let _ = self.events.send(PoolEvent::Ready);
            }
            if prev_alive > 0 && alive == 0 {
                info!(config = %self.config.display(), "pool exited");
                let _ = self.events.send(PoolEvent::Exit);
            }
        }
    }

    /// Select the worker for the next exchange: the first ready worker in
    /// insertion order, or the worker at the round-robin cursor when none
    /// is ready.
    pub fn next_worker(&self) -> Option<Arc<Worker>> {
        let workers = self.workers.read();
        if workers.is_empty() {
            return None;
        }
        if let Some(entry) = workers
            .iter()
            .find(|entry| entry.worker.state() == WorkerState::Ready)
        {
            return Some(Arc::clone(&entry.worker));
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % workers.len();
        Some(Arc::clone(&workers[idx].worker))
    }

    /// Spawn every worker. Returns the first spawn error after attempting
    /// all of them.
    pub async fn spawn(&self) -> Result<(), WorkerError> {
        let workers = self.workers();
        let mut first_err = None;
        for worker in workers {
            if let Err(e) = worker.spawn().await {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Ask every worker to finish its current request and exit.
    pub fn quit(&self) {
        for worker in self.workers() {
            worker.quit();
        }
    }

    /// Force every worker to exit immediately.
    pub fn terminate(&self) {
        for worker in self.workers() {
            worker.terminate();
        }
    }

    /// Grow the pool by one worker.
    pub fn increment(self: &Arc<Self>) -> Arc<Worker> {
        let worker = self.add_worker();
        debug!(size = self.len(), "pool grown");
        worker
    }

    /// Shrink the pool: remove the head worker and ask it to quit.
    pub fn decrement(&self) {
        let removed = {
            let mut workers = self.workers.write();
            if workers.is_empty() {
                None
            } else {
                Some(workers.remove(0))
            }
        };
        if let Some(entry) = removed {
            debug!(worker = entry.id, size = self.len(), "pool shrunk");
            entry.worker.quit();
        }
    }

    /// Cycle every live worker. Resolves as soon as one worker reports
    /// ready again; returns immediately when none are alive.
    pub async fn restart(&self) {
        let live: Vec<_> = self
            .workers
            .read()
            .iter()
            .filter(|entry| entry.worker.is_alive())
            .map(|entry| Arc::clone(&entry.worker))
            .collect();
        if live.is_empty() {
            return;
        }

        let mut events = self.subscribe();
        for worker in live {
            tokio::spawn(async move {
                if let Err(e) = worker.restart().await {
                    warn!(error = %e, "worker restart failed");
                }
            });
        }

        loop {
            match events.recv().await {
                Ok(PoolEvent::Worker(_, WorkerEvent::Ready)) => break,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Dispatch one HTTP exchange to the next worker.
    pub async fn proxy<B>(
        &self,
        req: Request<B>,
        meta: &MetaVariables,
    ) -> Result<Response<BoxBody<Bytes, WorkerError>>, WorkerError>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Send,
    {
        let worker = self
            .next_worker()
            .ok_or(WorkerError::InvalidState("pool has no workers"))?;
        let connection = worker.create_connection().await?;
        connection.proxy_request(req, meta).await
    }
}
