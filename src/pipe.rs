//! Pipe - splicing one logical connection across two workers
//!
//! ```text
//!      worker A (left)                         worker B (right)
//!   ... --> [handoff] ==== mailbox msgs ====> [handoff] --> ...
//!            left line                         right line
//! ```
//!
//! A pipe joins two lines, one per worker, each obeying its own worker's
//! affinity rules. The shared [`PipeCore`] carries only what both sides
//! may touch: the pipe id, the worker pair, the splicing stage's index
//! and a closed flag. Everything else (the local line, the local side)
//! lives in the owning worker's pipe registry.
//!
//! Teardown is first-come: whichever side finishes first flips the
//! closed flag with a compare-exchange and notifies the peer. A side
//! that loses the race closes quietly and sends nothing, so no message
//! ever chases a dead pipe. Messages already in flight land after the
//! local end is unregistered and are dropped (payloads go back to the
//! receiving worker's pool).
//!
//! Ordering: both directions of one pipe are fed by a single sender into
//! a FIFO mailbox, so payloads delivered cross-worker keep their order
//! and a finish never overtakes a payload sent before it.

use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::buffer::Buffer;
use crate::engine::{WorkerCtx, WorkerMsg};
use crate::line::{Line, WorkerId};
use crate::tunnel::{Direction, StageCtx};

pub type PipeId = u64;

static NEXT_PIPE_ID: AtomicU64 = AtomicU64::new(1);

/// Which end of a pipe a line is. Left is the side that opened it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// State shared by both ends of one pipe.
pub struct PipeCore {
    id: PipeId,
    stage: usize,
    left_worker: WorkerId,
    right_worker: WorkerId,
    closed: AtomicBool,
}

impl PipeCore {
    pub fn id(&self) -> PipeId {
        self.id
    }

    /// Chain index of the stage that spliced this pipe in.
    pub fn stage(&self) -> usize {
        self.stage
    }

    pub fn left_worker(&self) -> WorkerId {
        self.left_worker
    }

    pub fn right_worker(&self) -> WorkerId {
        self.right_worker
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flip to closed. True for exactly one caller.
    fn close(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn peer_worker(&self, side: Side) -> WorkerId {
        match side {
            Side::Left => self.right_worker,
            Side::Right => self.left_worker,
        }
    }
}

/// One worker's end of a pipe, held in its registry.
#[derive(Clone)]
pub(crate) struct PipeEnd {
    pub(crate) core: Arc<PipeCore>,
    pub(crate) line: Rc<Line>,
    pub(crate) side: Side,
}

/// Pipe traffic in a worker mailbox.
pub(crate) enum PipeMsg {
    /// Materialize the right-side line and replay `init` into the chain.
    InitRight { core: Arc<PipeCore> },
    Payload { id: PipeId, dir: Direction, payload: Buffer },
    Established { id: PipeId, dir: Direction },
    Flow { id: PipeId, dir: Direction, pause: bool },
    /// The peer side finished; tear down the local end.
    Finish { id: PipeId },
}

// ============================================================================
// Sending side
// ============================================================================

/// Splice `line` to a fresh line on `target`, from the stage in `cx`.
/// The caller stops forwarding locally; the peer worker materializes the
/// right side and replays `init` there.
pub fn pipe_to(cx: &StageCtx<'_>, line: &Rc<Line>, target: WorkerId) -> Arc<PipeCore> {
    let worker = cx.worker();
    assert_ne!(worker.id(), target, "pipe target must be a different worker");
    let core = Arc::new(PipeCore {
        id: NEXT_PIPE_ID.fetch_add(1, Ordering::Relaxed),
        stage: cx.index(),
        left_worker: worker.id(),
        right_worker: target,
        closed: AtomicBool::new(false),
    });
    worker.register_pipe_end(PipeEnd {
        core: Arc::clone(&core),
        line: Rc::clone(line),
        side: Side::Left,
    });
    let init = WorkerMsg::Pipe(PipeMsg::InitRight { core: Arc::clone(&core) });
    if worker.engine().send(target, init).is_err() {
        // target gone (shutdown); nothing will answer, close now
        core.closed.store(true, Ordering::Release);
    }
    debug!(pipe = core.id, from = worker.id(), to = target, "pipe opened");
    core
}

/// Move a payload to the peer side. On a closed pipe the buffer goes
/// straight back to the local pool.
pub(crate) fn send_payload(
    worker: &WorkerCtx,
    core: &Arc<PipeCore>,
    side: Side,
    dir: Direction,
    payload: Buffer,
) {
    if core.is_closed() {
        worker.pool().reuse(payload);
        return;
    }
    // the buffer leaves this worker; its accounting goes with it
    worker.pool().transfer_out();
    let msg = WorkerMsg::Pipe(PipeMsg::Payload { id: core.id, dir, payload });
    let _ = worker.engine().send(core.peer_worker(side), msg);
}

pub(crate) fn send_established(
    worker: &WorkerCtx,
    core: &Arc<PipeCore>,
    side: Side,
    dir: Direction,
) {
    if core.is_closed() {
        return;
    }
    let msg = WorkerMsg::Pipe(PipeMsg::Established { id: core.id, dir });
    let _ = worker.engine().send(core.peer_worker(side), msg);
}

pub(crate) fn send_flow(
    worker: &WorkerCtx,
    core: &Arc<PipeCore>,
    side: Side,
    dir: Direction,
    pause: bool,
) {
    if core.is_closed() {
        return;
    }
    let msg = WorkerMsg::Pipe(PipeMsg::Flow { id: core.id, dir, pause });
    let _ = worker.engine().send(core.peer_worker(side), msg);
}

/// The local end finished. Unregisters it, closes the pipe and notifies
/// the peer unless it already closed first. The right-side line belongs
/// to the pipe and is destroyed here; the left-side line belongs to its
/// creator.
pub(crate) fn finish(worker: &WorkerCtx, core: &Arc<PipeCore>, side: Side) {
    let end = worker.unregister_pipe(core.id);
    if core.close() {
        let msg = WorkerMsg::Pipe(PipeMsg::Finish { id: core.id });
        let _ = worker.engine().send(core.peer_worker(side), msg);
        trace!(pipe = core.id, ?side, "pipe finished, peer notified");
    } else {
        trace!(pipe = core.id, ?side, "pipe finished quietly, peer raced");
    }
    if side == Side::Right {
        if let Some(end) = end {
            end.line.destroy();
        }
    }
}

// ============================================================================
// Receiving side
// ============================================================================

/// Apply one pipe message on the receiving worker.
pub(crate) fn handle(worker: &WorkerCtx, msg: PipeMsg) {
    match msg {
        PipeMsg::InitRight { core } => {
            if core.is_closed() {
                trace!(pipe = core.id, "init for a pipe that already closed");
                return;
            }
            let chain = Arc::clone(worker.chain());
            let line = chain.new_line(worker.id());
            debug!(pipe = core.id, line = %line.id(), "right side materialized");
            let stage = core.stage;
            worker.register_pipe_end(PipeEnd {
                core,
                line: Rc::clone(&line),
                side: Side::Right,
            });
            let guard = line.lock();
            chain.deliver(worker, Direction::Up, stage).init(&line);
            drop(guard);
        }

        PipeMsg::Payload { id, dir, payload } => {
            worker.pool().transfer_in();
            let Some(end) = worker.pipe_end(id) else {
                worker.pool().reuse(payload);
                return;
            };
            if !end.line.is_alive() {
                worker.pool().reuse(payload);
                return;
            }
            let chain = Arc::clone(worker.chain());
            let guard = end.line.lock();
            chain.deliver(worker, dir, end.core.stage).payload(&end.line, payload);
            drop(guard);
        }

        PipeMsg::Established { id, dir } => {
            let Some(end) = worker.pipe_end(id) else { return };
            if !end.line.is_alive() {
                return;
            }
            let chain = Arc::clone(worker.chain());
            let guard = end.line.lock();
            chain.deliver(worker, dir, end.core.stage).established(&end.line);
            drop(guard);
        }

        PipeMsg::Flow { id, dir, pause } => {
            let Some(end) = worker.pipe_end(id) else { return };
            let chain = Arc::clone(worker.chain());
            let guard = end.line.lock();
            let hop = chain.deliver(worker, dir, end.core.stage);
            if pause {
                hop.pause(&end.line);
            } else {
                hop.resume(&end.line);
            }
            drop(guard);
        }

        PipeMsg::Finish { id } => {
            // the peer won the close race; local end may already be gone
            let Some(end) = worker.unregister_pipe(id) else { return };
            trace!(pipe = id, side = ?end.side, "peer finished, tearing down local end");
            let chain = Arc::clone(worker.chain());
            let guard = end.line.lock();
            if end.line.is_alive() {
                end.line.close();
            }
            match end.side {
                Side::Right => {
                    chain
                        .deliver(worker, Direction::Up, end.core.stage)
                        .finish(&end.line);
                    drop(guard);
                    end.line.destroy();
                }
                Side::Left => {
                    // creator observes both directions finished and destroys
                    chain
                        .deliver(worker, Direction::Down, end.core.stage)
                        .finish(&end.line);
                    drop(guard);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> PipeCore {
        PipeCore {
            id: 1,
            stage: 0,
            left_worker: 0,
            right_worker: 1,
            closed: AtomicBool::new(false),
        }
    }

    #[test]
    fn test_close_is_first_come() {
        let core = core();
        assert!(!core.is_closed());
        assert!(core.close());
        assert!(!core.close());
        assert!(core.is_closed());
    }

    #[test]
    fn test_peer_worker() {
        let core = core();
        assert_eq!(core.peer_worker(Side::Left), 1);
        assert_eq!(core.peer_worker(Side::Right), 0);
    }
}
