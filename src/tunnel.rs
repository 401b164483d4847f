//! Tunnel - one pipeline stage and its dispatch machinery
//!
//! ```text
//!     ----------------------------- a chain -------------------------------
//!
//!     ---------------            ---------------            ---------------
//!     |             | --- up --> |             | --- up --> |             |
//!     |   stage 0   |            |   stage 1   |            |   stage 2   |
//!     |             | <- down -- |             | <- down -- |             |
//!     ---------------            ---------------            ---------------
//! ```
//!
//! A stage implements [`Tunnel`]: six upstream entry points and six
//! mirrored downstream ones. Every default implementation forwards the
//! signal to the neighbor, so a stage only overrides what it transforms.
//! The stages at the chain ends (adapters) perform real I/O and must
//! override the direction that has no neighbor; the default there is a
//! deliberate panic, because a signal falling off the end of a chain is
//! a topology bug, not a runtime condition.
//!
//! Signals and the direction they travel:
//!
//! - `init`, `established`, `finish`, `payload` exist per direction.
//! - `on_up_pause`/`on_up_resume` travel toward the tail and throttle
//!   the tail-side producer (the *down* flow); `on_down_pause`/
//!   `on_down_resume` travel toward the head and throttle the *up* flow.
//!
//! Dispatch is index-based over the chain's stage vector; there are no
//! neighbor pointers. A [`StageCtx`] carries (chain, worker, own index)
//! into every entry point, and [`StageCtx::up`]/[`StageCtx::down`]
//! produce the [`Hop`] used to forward.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::trace;

use crate::buffer::Buffer;
use crate::chain::Chain;
use crate::engine::WorkerCtx;
use crate::line::{Line, StateLayout};

/// Direction a signal travels through the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Head → tail.
    Up,
    /// Tail → head.
    Down,
}

impl Direction {
    pub fn flip(self) -> Direction {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
        }
    }
}

/// Assigned position of a stage, handed out once chaining completes.
#[derive(Debug, Clone, Copy)]
pub struct StageBinding {
    /// The stage's fixed index in the chain.
    pub index: usize,
    /// Total number of stages.
    pub chain_len: usize,
}

/// One pipeline stage.
///
/// Implementations are shared chain-wide and invoked from every worker
/// thread, hence `Send + Sync`; anything per-connection belongs in the
/// line state slot declared by [`Tunnel::state_layout`]. Borrows of that
/// slot must be dropped before invoking a neighbor, since the neighbor
/// may reenter this stage on the same line.
pub trait Tunnel: Send + Sync {
    /// Stage name for diagnostics and registry lookups.
    fn name(&self) -> &str;

    /// Per-line state slot this stage needs. Stateless by default.
    fn state_layout(&self) -> StateLayout {
        StateLayout::none()
    }

    /// Called once, after both build passes assigned indices and
    /// offsets. The chain topology is final at this point.
    fn on_chain_complete(&self, binding: StageBinding) {
        let _ = binding;
    }

    /// Called once per stage when the engine starts, on a live worker;
    /// the place to open resources that depend on final topology.
    fn on_chain_start(&self, cx: &StageCtx<'_>) {
        let _ = cx;
    }

    // ---- upstream entry points (travel head → tail) -----------------------

    fn on_up_init(&self, cx: &StageCtx<'_>, line: &Rc<Line>) {
        cx.up().init(line);
    }

    fn on_up_established(&self, cx: &StageCtx<'_>, line: &Rc<Line>) {
        cx.up().established(line);
    }

    fn on_up_finish(&self, cx: &StageCtx<'_>, line: &Rc<Line>) {
        cx.up().finish(line);
    }

    fn on_up_payload(&self, cx: &StageCtx<'_>, line: &Rc<Line>, payload: Buffer) {
        cx.up().payload(line, payload);
    }

    fn on_up_pause(&self, cx: &StageCtx<'_>, line: &Rc<Line>) {
        cx.up().pause(line);
    }

    fn on_up_resume(&self, cx: &StageCtx<'_>, line: &Rc<Line>) {
        cx.up().resume(line);
    }

    // ---- downstream entry points (travel tail → head) ---------------------

    fn on_down_init(&self, cx: &StageCtx<'_>, line: &Rc<Line>) {
        cx.down().init(line);
    }

    fn on_down_established(&self, cx: &StageCtx<'_>, line: &Rc<Line>) {
        cx.down().established(line);
    }

    fn on_down_finish(&self, cx: &StageCtx<'_>, line: &Rc<Line>) {
        cx.down().finish(line);
    }

    fn on_down_payload(&self, cx: &StageCtx<'_>, line: &Rc<Line>, payload: Buffer) {
        cx.down().payload(line, payload);
    }

    fn on_down_pause(&self, cx: &StageCtx<'_>, line: &Rc<Line>) {
        cx.down().pause(line);
    }

    fn on_down_resume(&self, cx: &StageCtx<'_>, line: &Rc<Line>) {
        cx.down().resume(line);
    }
}

// ============================================================================
// StageCtx
// ============================================================================

/// Execution context of one entry-point invocation: which chain, which
/// worker thread, which stage.
pub struct StageCtx<'a> {
    chain: &'a Chain,
    worker: &'a WorkerCtx,
    index: usize,
}

impl<'a> StageCtx<'a> {
    pub(crate) fn new(chain: &'a Chain, worker: &'a WorkerCtx, index: usize) -> Self {
        StageCtx { chain, worker, index }
    }

    pub fn chain(&self) -> &'a Chain {
        self.chain
    }

    pub fn worker(&self) -> &'a WorkerCtx {
        self.worker
    }

    pub fn index(&self) -> usize {
        self.index
    }

    fn stage(&self) -> &'a dyn Tunnel {
        self.chain.stage(self.index)
    }

    pub fn has_up(&self) -> bool {
        self.index + 1 < self.chain.len()
    }

    pub fn has_down(&self) -> bool {
        self.index > 0
    }

    /// Hop toward the tail.
    ///
    /// # Panics
    /// Panics when called by the tail stage: an adapter must override
    /// the entry points of the direction it terminates.
    pub fn up(&self) -> Hop<'a> {
        assert!(
            self.has_up(),
            "stage '{}' is the chain tail and must override upstream entry points",
            self.stage().name()
        );
        Hop {
            chain: self.chain,
            worker: self.worker,
            dir: Direction::Up,
            target: self.index + 1,
        }
    }

    /// Hop toward the head.
    ///
    /// # Panics
    /// Panics when called by the head stage.
    pub fn down(&self) -> Hop<'a> {
        assert!(
            self.has_down(),
            "stage '{}' is the chain head and must override downstream entry points",
            self.stage().name()
        );
        Hop {
            chain: self.chain,
            worker: self.worker,
            dir: Direction::Down,
            target: self.index - 1,
        }
    }

    /// This stage's typed state slot on `line`.
    pub fn state<T: 'static>(&self, line: &'a Line) -> &'a RefCell<T> {
        line.slot::<T>(self.index, self.stage().name())
    }

    /// This stage's worker-local shared storage (one value per stage per
    /// worker; think of it as the Rust rendition of the per-thread
    /// tables the engine keeps for adapters).
    pub fn local<T: Default + 'static>(&self) -> Rc<RefCell<T>> {
        self.worker.stage_local::<T>(self.index)
    }
}

// ============================================================================
// Hop
// ============================================================================

/// A directed edge to a neighboring stage. All chain traversal funnels
/// through here, which is where the engine enforces worker affinity,
/// liveness and the per-direction teardown bookkeeping.
pub struct Hop<'a> {
    chain: &'a Chain,
    worker: &'a WorkerCtx,
    dir: Direction,
    target: usize,
}

impl<'a> Hop<'a> {
    /// Entry hop used by adapters and the pipe to (re)inject a signal at
    /// `index` directly, as if it had arrived locally.
    pub(crate) fn deliver_at(
        chain: &'a Chain,
        worker: &'a WorkerCtx,
        dir: Direction,
        index: usize,
    ) -> Self {
        Hop { chain, worker, dir, target: index }
    }

    pub fn direction(&self) -> Direction {
        self.dir
    }

    fn cx(&self) -> StageCtx<'a> {
        StageCtx::new(self.chain, self.worker, self.target)
    }

    fn check(&self, line: &Line, signal: &str) {
        assert_eq!(
            line.worker(),
            self.worker.id(),
            "{} touched from worker {} but is affinitized to worker {}",
            line.id(),
            self.worker.id(),
            line.worker()
        );
        let _ = signal;
    }

    pub fn init(&self, line: &Rc<Line>) {
        self.check(line, "init");
        assert!(line.is_alive(), "init on dead {}", line.id());
        trace!(line = %line.id(), dir = ?self.dir, stage = self.target, "init");
        let cx = self.cx();
        match self.dir {
            Direction::Up => cx.stage().on_up_init(&cx, line),
            Direction::Down => cx.stage().on_down_init(&cx, line),
        }
    }

    pub fn established(&self, line: &Rc<Line>) {
        self.check(line, "established");
        assert!(line.is_alive(), "established on dead {}", line.id());
        let cx = self.cx();
        match self.dir {
            Direction::Up => cx.stage().on_up_established(&cx, line),
            Direction::Down => cx.stage().on_down_established(&cx, line),
        }
    }

    /// Propagate `finish`. Legal on a dead line: teardown-inducing
    /// stages clear liveness *before* calling this. A repeated finish
    /// in a direction that already finished is dropped here, so every
    /// stage sees at most one finish per direction.
    pub fn finish(&self, line: &Rc<Line>) {
        self.check(line, "finish");
        let advanced = match self.dir {
            Direction::Up => line.advance_up_finish(self.target),
            Direction::Down => line.advance_down_finish(self.target),
        };
        if !advanced {
            trace!(line = %line.id(), dir = ?self.dir, stage = self.target, "duplicate finish dropped");
            return;
        }
        trace!(line = %line.id(), dir = ?self.dir, stage = self.target, "finish");
        let cx = self.cx();
        match self.dir {
            Direction::Up => cx.stage().on_up_finish(&cx, line),
            Direction::Down => cx.stage().on_down_finish(&cx, line),
        }
    }

    /// Hand `payload` to the next stage. Ownership moves; the caller
    /// keeps nothing.
    ///
    /// # Panics
    /// Calling this on a dead line is a stage defect and aborts.
    pub fn payload(&self, line: &Rc<Line>, payload: Buffer) {
        self.check(line, "payload");
        assert!(line.is_alive(), "payload on dead {}", line.id());
        trace!(
            line = %line.id(),
            dir = ?self.dir,
            stage = self.target,
            len = payload.len(),
            "payload"
        );
        let cx = self.cx();
        match self.dir {
            Direction::Up => cx.stage().on_up_payload(&cx, line, payload),
            Direction::Down => cx.stage().on_down_payload(&cx, line, payload),
        }
    }

    /// Propagate `pause`. A pause traveling up throttles the down flow
    /// and vice versa. No-op on a dead line; a pause repeating one the
    /// flow already observed is dropped here, so duplicates never reach
    /// the stages.
    pub fn pause(&self, line: &Rc<Line>) {
        self.check(line, "pause");
        if !line.is_alive() {
            trace!(line = %line.id(), "pause dropped, line dead");
            return;
        }
        let advanced = match self.dir {
            Direction::Up => line.advance_down_flow(true, self.target),
            Direction::Down => line.advance_up_flow(true, self.target),
        };
        if !advanced {
            trace!(line = %line.id(), dir = ?self.dir, "duplicate pause dropped");
            return;
        }
        let cx = self.cx();
        match self.dir {
            Direction::Up => cx.stage().on_up_pause(&cx, line),
            Direction::Down => cx.stage().on_down_pause(&cx, line),
        }
    }

    /// Propagate `resume`. No-op on a dead line; a resume of a flow
    /// that is not paused is dropped the same way repeated pauses are.
    pub fn resume(&self, line: &Rc<Line>) {
        self.check(line, "resume");
        if !line.is_alive() {
            trace!(line = %line.id(), "resume dropped, line dead");
            return;
        }
        let advanced = match self.dir {
            Direction::Up => line.advance_down_flow(false, self.target),
            Direction::Down => line.advance_up_flow(false, self.target),
        };
        if !advanced {
            trace!(line = %line.id(), dir = ?self.dir, "duplicate resume dropped");
            return;
        }
        let cx = self.cx();
        match self.dir {
            Direction::Up => cx.stage().on_up_resume(&cx, line),
            Direction::Down => cx.stage().on_down_resume(&cx, line),
        }
    }
}
