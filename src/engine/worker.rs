//! Worker thread internals
//!
//! Each worker owns a mailbox and a [`WorkerCtx`] that never leaves its
//! thread: the buffer pool, the idle table, per-stage local storage and
//! the registry of pipe ends parked on this worker. Everything reachable
//! from the context is single-threaded by construction, which is what
//! lets lines use plain `Cell`/`RefCell` instead of locks.

use std::any::Any;
use std::cell::{RefCell, RefMut};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::debug;

use crate::buffer::BufferPool;
use crate::chain::Chain;
use crate::line::{LineId, WorkerId};
use crate::pipe::{PipeCore, PipeEnd, PipeId, PipeMsg, Side};

use super::idle::{IdleCallback, IdleKey, IdleTable};
use super::EngineHandle;

/// Poll granularity when the idle table is empty.
const IDLE_TICK: Duration = Duration::from_millis(100);

/// A message in a worker's mailbox. Senders are the engine handle and
/// peer workers; each mailbox preserves per-sender FIFO order.
pub(crate) enum WorkerMsg {
    /// Run a closure on the worker thread.
    Run(Box<dyn FnOnce(&WorkerCtx) + Send>),
    /// Traffic arriving over a cross-worker pipe.
    Pipe(PipeMsg),
    /// Drain nothing further and exit.
    Shutdown,
}

#[derive(Default)]
struct PipeRegistry {
    by_id: HashMap<PipeId, PipeEnd>,
    /// Keyed by (line, splicing stage): a line can be the right end of
    /// one pipe and the left end of the next when several stages move it
    /// onward, but never two ends at the same stage.
    by_line: HashMap<(LineId, usize), PipeId>,
}

/// Thread-local execution context of one worker. Handed by reference
/// into every task and entry point that runs on the worker; never
/// crosses threads.
pub struct WorkerCtx {
    id: WorkerId,
    engine: EngineHandle,
    pool: RefCell<BufferPool>,
    idle: RefCell<IdleTable>,
    pipes: RefCell<PipeRegistry>,
    locals: RefCell<HashMap<usize, Rc<dyn Any>>>,
}

impl WorkerCtx {
    pub(crate) fn new(id: WorkerId, engine: EngineHandle) -> Self {
        WorkerCtx {
            id,
            engine,
            pool: RefCell::new(BufferPool::new()),
            idle: RefCell::new(IdleTable::new()),
            pipes: RefCell::new(PipeRegistry::default()),
            locals: RefCell::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn chain(&self) -> &Arc<Chain> {
        self.engine.chain()
    }

    /// Handle for posting work to other workers.
    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    /// This worker's buffer pool. Drop the borrow before invoking chain
    /// entry points; stages reclaim buffers through the same cell.
    pub fn pool(&self) -> RefMut<'_, BufferPool> {
        self.pool.borrow_mut()
    }

    // ---- idle table --------------------------------------------------------

    /// Track `key`; on expiry the callback runs on this worker.
    pub fn idle_insert(&self, key: IdleKey, ttl: Duration, callback: IdleCallback) {
        self.idle.borrow_mut().insert(key, ttl, callback);
    }

    pub fn idle_keep_alive(&self, key: IdleKey, ttl: Duration) -> bool {
        self.idle.borrow_mut().keep_alive(key, ttl)
    }

    pub fn idle_remove(&self, key: IdleKey) -> bool {
        self.idle.borrow_mut().remove(key)
    }

    fn fire_due_idle(&self) {
        let due = self.idle.borrow_mut().pop_due(Instant::now());
        for (key, callback) in due {
            callback(self, key);
        }
    }

    // ---- per-stage worker-local storage ------------------------------------

    /// Shared storage of the stage at `index` on this worker, created on
    /// first use. A stage must always request the same `T` here.
    pub fn stage_local<T: Default + 'static>(&self, index: usize) -> Rc<RefCell<T>> {
        let mut locals = self.locals.borrow_mut();
        let slot = locals
            .entry(index)
            .or_insert_with(|| Rc::new(RefCell::new(T::default())) as Rc<dyn Any>);
        Rc::clone(slot).downcast::<RefCell<T>>().unwrap_or_else(|_| {
            panic!("stage {} requested worker-local storage with two different types", index)
        })
    }

    // ---- pipe end registry -------------------------------------------------

    pub(crate) fn register_pipe_end(&self, end: PipeEnd) {
        let mut pipes = self.pipes.borrow_mut();
        let prior = pipes
            .by_line
            .insert((end.line.id(), end.core.stage()), end.core.id());
        assert!(
            prior.is_none(),
            "{} already has a pipe end at stage {}",
            end.line.id(),
            end.core.stage()
        );
        pipes.by_id.insert(end.core.id(), end);
    }

    pub(crate) fn unregister_pipe(&self, id: PipeId) -> Option<PipeEnd> {
        let mut pipes = self.pipes.borrow_mut();
        let end = pipes.by_id.remove(&id)?;
        pipes.by_line.remove(&(end.line.id(), end.core.stage()));
        Some(end)
    }

    pub(crate) fn pipe_end(&self, id: PipeId) -> Option<PipeEnd> {
        self.pipes.borrow().by_id.get(&id).cloned()
    }

    /// The pipe end `line` has at the splicing stage `stage`, if any.
    pub(crate) fn pipe_at(&self, line: LineId, stage: usize) -> Option<(Arc<PipeCore>, Side)> {
        let pipes = self.pipes.borrow();
        let id = pipes.by_line.get(&(line, stage))?;
        let end = &pipes.by_id[id];
        Some((Arc::clone(&end.core), end.side))
    }
}

/// The worker loop: drain the mailbox, fire due idle items, repeat.
pub(crate) fn run(ctx: WorkerCtx, mailbox: Receiver<WorkerMsg>) {
    debug!(worker = ctx.id(), "worker online");
    loop {
        let timeout = ctx
            .idle
            .borrow_mut()
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .unwrap_or(IDLE_TICK);
        match mailbox.recv_timeout(timeout) {
            Ok(WorkerMsg::Run(task)) => task(&ctx),
            Ok(WorkerMsg::Pipe(msg)) => crate::pipe::handle(&ctx, msg),
            Ok(WorkerMsg::Shutdown) => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        ctx.fire_due_idle();
    }
    debug!(worker = ctx.id(), "worker offline");
}
