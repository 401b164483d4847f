//! Engine - worker threads and the affinity model
//!
//! ```text
//!               EngineHandle (Clone, Send)
//!                 |  post / run_on
//!                 v
//!     +----------------+    +----------------+    +----------------+
//!     |   worker 0     |    |   worker 1     |    |   worker N     |
//!     |  mailbox(FIFO) |    |  mailbox(FIFO) |    |  mailbox(FIFO) |
//!     |  buffer pool   |    |  buffer pool   |    |  buffer pool   |
//!     |  idle table    |    |  idle table    |    |  idle table    |
//!     |  pipe ends     |    |  pipe ends     |    |  pipe ends     |
//!     +----------------+    +----------------+    +----------------+
//! ```
//!
//! Every line is affinitized to exactly one worker and only that
//! worker's thread may touch it. Cross-worker communication goes through
//! mailboxes (closures via [`EngineHandle::post`], pipe traffic via the
//! pipe layer); the mailbox preserves FIFO order per sender, which is
//! what the pipe relies on for payload-before-finish ordering.

mod idle;
mod worker;

pub use idle::{IdleCallback, IdleKey, IdleTable};
pub use worker::WorkerCtx;
pub(crate) use worker::WorkerMsg;

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use tracing::info;

use crate::chain::Chain;
use crate::error::{Error, Result};
use crate::line::WorkerId;

// ============================================================================
// Engine
// ============================================================================

/// Owns the worker threads running one [`Chain`]. Dropping (or calling
/// [`Engine::shutdown`]) stops the workers and joins them.
pub struct Engine {
    handle: EngineHandle,
    threads: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Spawn `workers` threads for `chain` and run the chain's start
    /// walk on worker 0. Blocks until the walk completes.
    pub fn new(chain: Chain, workers: usize) -> Result<Engine> {
        if workers == 0 {
            return Err(Error::Config("engine needs at least one worker".into()));
        }
        let chain = Arc::new(chain);

        let mut senders = Vec::with_capacity(workers);
        let mut receivers = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, rx) = crossbeam_channel::unbounded();
            senders.push(tx);
            receivers.push(rx);
        }
        let handle = EngineHandle { chain, senders: Arc::new(senders) };

        let mut threads = Vec::with_capacity(workers);
        for (id, mailbox) in receivers.into_iter().enumerate() {
            let handle = handle.clone();
            let thread = std::thread::Builder::new()
                .name(format!("weir-worker-{}", id))
                .spawn(move || worker::run(WorkerCtx::new(id, handle), mailbox))
                .map_err(Error::Io)?;
            threads.push(thread);
        }

        let engine = Engine { handle, threads };
        engine.handle.run_on(0, |w| {
            let chain = Arc::clone(w.chain());
            chain.start(w);
        })?;
        info!(workers, "engine running");
        Ok(engine)
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    pub fn chain(&self) -> &Arc<Chain> {
        self.handle.chain()
    }

    pub fn workers(&self) -> usize {
        self.handle.workers()
    }

    /// See [`EngineHandle::post`].
    pub fn post<F>(&self, worker: WorkerId, task: F) -> Result<()>
    where
        F: FnOnce(&WorkerCtx) + Send + 'static,
    {
        self.handle.post(worker, task)
    }

    /// See [`EngineHandle::run_on`].
    pub fn run_on<R, F>(&self, worker: WorkerId, task: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&WorkerCtx) -> R + Send + 'static,
    {
        self.handle.run_on(worker, task)
    }

    /// Stop every worker and join the threads.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        for tx in self.handle.senders.iter() {
            let _ = tx.send(WorkerMsg::Shutdown);
        }
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
        info!("engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.stop();
        }
    }
}

// ============================================================================
// EngineHandle
// ============================================================================

/// Cheap clonable handle for posting work into the engine from any
/// thread. Adapters hold one inside their external ports.
#[derive(Clone)]
pub struct EngineHandle {
    chain: Arc<Chain>,
    senders: Arc<Vec<Sender<WorkerMsg>>>,
}

impl EngineHandle {
    pub fn chain(&self) -> &Arc<Chain> {
        &self.chain
    }

    pub fn workers(&self) -> usize {
        self.senders.len()
    }

    pub(crate) fn send(&self, worker: WorkerId, msg: WorkerMsg) -> Result<()> {
        let tx = self
            .senders
            .get(worker)
            .ok_or(Error::WorkerUnavailable(worker))?;
        tx.send(msg).map_err(|_| Error::EngineClosed)
    }

    /// Post a closure to run on `worker`'s thread. Returns as soon as
    /// the closure is enqueued.
    pub fn post<F>(&self, worker: WorkerId, task: F) -> Result<()>
    where
        F: FnOnce(&WorkerCtx) + Send + 'static,
    {
        self.send(worker, WorkerMsg::Run(Box::new(task)))
    }

    /// Run a closure on `worker`'s thread and wait for its result.
    ///
    /// Calling this from a worker thread targeting itself deadlocks;
    /// worker code should call the closure directly instead.
    pub fn run_on<R, F>(&self, worker: WorkerId, task: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&WorkerCtx) -> R + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.post(worker, move |w| {
            let _ = tx.send(task(w));
        })?;
        rx.recv().map_err(|_| Error::WorkerUnavailable(worker))
    }
}
