//! Line - per-connection state container
//!
//! A `Line` represents one logical connection as it flows through a
//! chain. It carries:
//!
//! - worker affinity: only the owning worker's thread may touch it
//!   (`Line` is neither `Send` nor `Sync`; cross-worker hand-off goes
//!   through [`crate::pipe`], which builds a *new* line on the target),
//! - a liveness flag that moves true→false exactly once,
//! - an explicit refcount bracketing reentrant call sequences
//!   ([`Line::lock`] / [`LineGuard`]),
//! - per-flow pause waves and per-direction finish fronts, which let
//!   dispatch drop repeated signals while a traversal is in flight,
//! - source/destination routing addresses,
//! - one state slot per stage in the chain, laid out once at chain-build
//!   time in a single cache-line-aligned allocation.
//!
//! ## The lock protocol
//!
//! A stage that synchronously invokes a neighbor may not assume the line
//! survived the call: the neighbor can trigger full teardown reentrantly.
//! The guard keeps the refcount (and therefore the teardown bookkeeping)
//! honest across such sequences:
//!
//! ```ignore
//! let guard = line.lock();
//! cx.up().payload(&line, buf);
//! if !guard.is_alive() {
//!     return; // stop touching the line immediately
//! }
//! ```
//!
//! Dropping the guard on *every* exit path is what the borrow checker
//! already enforces; the refcount exists so that the final release can
//! assert the teardown contract (a line must be destroyed before its
//! last reference goes away).

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::any::{type_name, TypeId};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::common::Address;

/// Index of a worker thread.
pub type WorkerId = usize;

/// Rounding unit for state slot offsets, so two stages never share a
/// cache line.
pub const CACHE_LINE: usize = 64;

static NEXT_LINE_ID: AtomicU64 = AtomicU64::new(1);

/// Globally unique line identity, usable as a map key across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LineId(pub u64);

impl std::fmt::Display for LineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line#{}", self.0)
    }
}

// ============================================================================
// State slot layout
// ============================================================================

/// Per-line state declaration of one stage: size/alignment plus the
/// monomorphized construct/teardown hooks for the slot.
///
/// Slots hold `RefCell<T>` so that reentrant access to the *same* slot
/// (a genuine stage defect) trips a deterministic borrow panic instead
/// of aliasing.
#[derive(Clone, Copy)]
pub struct StateLayout {
    layout: Layout,
    type_id: TypeId,
    type_name: &'static str,
    init: unsafe fn(*mut u8),
    drop: unsafe fn(*mut u8),
}

impl StateLayout {
    /// Declare a slot of type `T`, default-initialized per line.
    pub fn of<T: Default + 'static>() -> Self {
        unsafe fn init_slot<T: Default>(p: *mut u8) {
            p.cast::<RefCell<T>>().write(RefCell::new(T::default()));
        }
        unsafe fn drop_slot<T>(p: *mut u8) {
            std::ptr::drop_in_place(p.cast::<RefCell<T>>());
        }
        StateLayout {
            layout: Layout::new::<RefCell<T>>(),
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            init: init_slot::<T>,
            drop: drop_slot::<T>,
        }
    }

    /// The slot of a stateless stage.
    pub fn none() -> Self {
        Self::of::<()>()
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }
}

impl std::fmt::Debug for StateLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateLayout")
            .field("type", &self.type_name)
            .field("size", &self.layout.size())
            .finish()
    }
}

/// One assigned slot: the stage's declaration plus its byte offset into
/// the line arena.
#[derive(Debug, Clone, Copy)]
pub struct SlotInfo {
    pub offset: usize,
    pub state: StateLayout,
}

impl SlotInfo {
    /// Byte range this slot occupies.
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.state.size()
    }
}

/// The fixed per-line layout of an assembled chain: one slot per stage,
/// offsets monotonically increasing and cache-line rounded.
#[derive(Debug)]
pub struct LineLayout {
    slots: Vec<SlotInfo>,
    size: usize,
    align: usize,
}

impl LineLayout {
    /// Single pass, head to tail. Called once at chain build.
    pub(crate) fn assign(declared: Vec<StateLayout>) -> LineLayout {
        let mut slots = Vec::with_capacity(declared.len());
        let mut align = CACHE_LINE;
        let mut cursor = 0usize;
        for state in declared {
            align = align.max(state.layout.align());
            cursor = round_up(cursor, CACHE_LINE.max(state.layout.align()));
            slots.push(SlotInfo { offset: cursor, state });
            cursor += state.layout.size();
        }
        LineLayout {
            slots,
            size: round_up(cursor, align),
            align,
        }
    }

    /// Total bytes allocated per line.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn slots(&self) -> &[SlotInfo] {
        &self.slots
    }
}

fn round_up(n: usize, to: usize) -> usize {
    (n + to - 1) & !(to - 1)
}

// ============================================================================
// State arena
// ============================================================================

/// The single allocation backing all state slots of one line.
struct StateArena {
    ptr: *mut u8,
    layout: Arc<LineLayout>,
}

impl StateArena {
    fn new(layout: Arc<LineLayout>) -> StateArena {
        let ptr = if layout.size == 0 {
            std::ptr::null_mut()
        } else {
            let alloc_layout = Layout::from_size_align(layout.size, layout.align)
                .expect("line layout is a valid allocation layout");
            // SAFETY: size is non-zero; every slot is constructed exactly
            // once right below, at the offset the layout pass assigned.
            unsafe {
                let ptr = alloc_zeroed(alloc_layout);
                if ptr.is_null() {
                    handle_alloc_error(alloc_layout);
                }
                for slot in &layout.slots {
                    (slot.state.init)(ptr.add(slot.offset));
                }
                ptr
            }
        };
        StateArena { ptr, layout }
    }

    fn slot<T: 'static>(&self, index: usize, stage: &str) -> &RefCell<T> {
        let slot = &self.layout.slots[index];
        assert_eq!(
            slot.state.type_id,
            TypeId::of::<T>(),
            "stage '{}' accessed slot {} as {} but it holds {}",
            stage,
            index,
            type_name::<T>(),
            slot.state.type_name,
        );
        // SAFETY: the type was just checked against the layout the slot
        // was constructed with, and the offset is within the allocation.
        unsafe { &*self.ptr.add(slot.offset).cast::<RefCell<T>>() }
    }
}

impl Drop for StateArena {
    fn drop(&mut self) {
        if self.ptr.is_null() {
            return;
        }
        // SAFETY: slots were constructed in new(); each is dropped once.
        unsafe {
            for slot in &self.layout.slots {
                (slot.state.drop)(self.ptr.add(slot.offset));
            }
            let alloc_layout = Layout::from_size_align(self.layout.size, self.layout.align)
                .expect("line layout is a valid allocation layout");
            dealloc(self.ptr, alloc_layout);
        }
    }
}

// ============================================================================
// Line
// ============================================================================

/// Pause state of one payload flow, together with the furthest stage
/// the current pause or resume wave has reached. The front lets
/// dispatch tell a traversal moving forward from a re-injected repeat.
#[derive(Clone, Copy, Default)]
struct FlowWave {
    paused: bool,
    front: Option<usize>,
}

impl FlowWave {
    /// Accept or reject a pause/resume signal hitting `stage`. A signal
    /// flipping the pause state starts a new wave; one repeating it is
    /// only accepted while it keeps moving past the recorded front. A
    /// resume before any pause has nothing to undo and is rejected.
    fn advance(cell: &Cell<FlowWave>, pause: bool, stage: usize, toward_head: bool) -> bool {
        let wave = cell.get();
        let accept = if wave.paused != pause {
            wave.front.is_some() || pause
        } else {
            match wave.front {
                None => pause,
                Some(front) if toward_head => stage < front,
                Some(front) => stage > front,
            }
        };
        if accept {
            cell.set(FlowWave { paused: pause, front: Some(stage) });
        }
        accept
    }
}

/// Per-connection state container. See module docs for the ownership
/// and locking protocol.
pub struct Line {
    id: LineId,
    worker: WorkerId,
    alive: Cell<bool>,
    destroyed: Cell<bool>,
    refs: Cell<usize>,
    up_flow: Cell<FlowWave>,
    down_flow: Cell<FlowWave>,
    /// Furthest stage index an up-traveling `finish` has reached, if one
    /// is traversing. The matching down front moves toward the head.
    up_finish_front: Cell<Option<usize>>,
    down_finish_front: Cell<Option<usize>>,
    src: RefCell<Address>,
    dst: RefCell<Address>,
    arena: StateArena,
}

impl Line {
    /// Create a line affinitized to `worker`, with one zero-initialized
    /// state slot per stage of `layout`. Refcount starts at one, held by
    /// the creating adapter; liveness starts true.
    pub fn new(layout: Arc<LineLayout>, worker: WorkerId) -> Rc<Line> {
        let id = LineId(NEXT_LINE_ID.fetch_add(1, Ordering::Relaxed));
        trace!(%id, worker, "line created");
        Rc::new(Line {
            id,
            worker,
            alive: Cell::new(true),
            destroyed: Cell::new(false),
            refs: Cell::new(1),
            up_flow: Cell::new(FlowWave::default()),
            down_flow: Cell::new(FlowWave::default()),
            up_finish_front: Cell::new(None),
            down_finish_front: Cell::new(None),
            src: RefCell::new(Address::unspecified()),
            dst: RefCell::new(Address::unspecified()),
            arena: StateArena::new(layout),
        })
    }

    pub fn id(&self) -> LineId {
        self.id
    }

    /// Worker whose thread exclusively owns this line.
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Single truth source for whether further calls on this line are
    /// legal. Transitions true→false at most once, never back.
    pub fn is_alive(&self) -> bool {
        self.alive.get()
    }

    /// Mark the line dead. A stage that induces teardown must call this
    /// *before* propagating `finish`, so concurrently locked holders
    /// observe it. Idempotent.
    pub fn close(&self) {
        if self.alive.replace(false) {
            trace!(id = %self.id, "line closed");
        }
    }

    /// Bracket a reentrant call sequence. Balanced automatically when
    /// the returned guard drops.
    pub fn lock(self: &Rc<Self>) -> LineGuard {
        self.refs.set(self.refs.get() + 1);
        LineGuard { line: Rc::clone(self) }
    }

    /// Release the line. Exactly one owner calls this, after it has
    /// observed both directions finished.
    ///
    /// # Panics
    /// Panics on double destroy.
    pub fn destroy(&self) {
        assert!(
            !self.destroyed.replace(true),
            "{} destroyed twice",
            self.id
        );
        self.close();
        trace!(id = %self.id, "line destroyed");
        self.unref();
    }

    fn unref(&self) {
        let refs = self.refs.get();
        debug_assert!(refs > 0, "{} refcount underflow", self.id);
        self.refs.set(refs - 1);
        if refs == 1 {
            // Last reference gone: the owner must have destroyed us.
            assert!(
                !self.alive.get(),
                "{} reached zero refs while still alive (missing destroy)",
                self.id
            );
        }
    }

    /// Current refcount; exposed for balance assertions in tests.
    pub fn ref_count(&self) -> usize {
        self.refs.get()
    }

    // ---- flow bookkeeping -------------------------------------------------

    /// True while the head→tail payload flow is paused.
    pub fn up_flow_paused(&self) -> bool {
        self.up_flow.get().paused
    }

    /// True while the tail→head payload flow is paused.
    pub fn down_flow_paused(&self) -> bool {
        self.down_flow.get().paused
    }

    /// Record a pause/resume of the up flow reaching `stage`. These
    /// signals travel toward the head. False means the signal is a
    /// repeat of what the flow already observed and must be dropped.
    pub(crate) fn advance_up_flow(&self, pause: bool, stage: usize) -> bool {
        FlowWave::advance(&self.up_flow, pause, stage, true)
    }

    /// Down-flow twin; these signals travel toward the tail.
    pub(crate) fn advance_down_flow(&self, pause: bool, stage: usize) -> bool {
        FlowWave::advance(&self.down_flow, pause, stage, false)
    }

    /// True once a `finish` has begun traversing the upstream direction.
    pub fn up_finished(&self) -> bool {
        self.up_finish_front.get().is_some()
    }

    /// True once a `finish` has begun traversing the downstream direction.
    pub fn down_finished(&self) -> bool {
        self.down_finish_front.get().is_some()
    }

    /// Record an up-traveling `finish` reaching `stage`. False when the
    /// front already covers that stage; dispatch drops such repeats, so
    /// every stage observes at most one finish per direction while the
    /// original traversal keeps moving toward the tail.
    pub(crate) fn advance_up_finish(&self, stage: usize) -> bool {
        match self.up_finish_front.get() {
            Some(front) if stage <= front => false,
            _ => {
                self.up_finish_front.set(Some(stage));
                true
            }
        }
    }

    /// Down-direction twin; the front moves toward the head.
    pub(crate) fn advance_down_finish(&self, stage: usize) -> bool {
        match self.down_finish_front.get() {
            Some(front) if stage >= front => false,
            _ => {
                self.down_finish_front.set(Some(stage));
                true
            }
        }
    }

    // ---- routing metadata -------------------------------------------------

    pub fn src(&self) -> Address {
        self.src.borrow().clone()
    }

    pub fn dst(&self) -> Address {
        self.dst.borrow().clone()
    }

    pub fn set_src(&self, addr: Address) {
        *self.src.borrow_mut() = addr;
    }

    pub fn set_dst(&self, addr: Address) {
        *self.dst.borrow_mut() = addr;
    }

    // ---- state slots ------------------------------------------------------

    /// Typed access to the state slot at `index`. Only the stage that
    /// declared the slot may use this; the engine routes access through
    /// [`crate::tunnel::StageCtx::state`] so the index is always the
    /// caller's own.
    pub(crate) fn slot<T: 'static>(&self, index: usize, stage: &str) -> &RefCell<T> {
        self.arena.slot::<T>(index, stage)
    }
}

impl std::fmt::Debug for Line {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Line")
            .field("id", &self.id)
            .field("worker", &self.worker)
            .field("alive", &self.alive.get())
            .field("refs", &self.refs.get())
            .finish()
    }
}

/// RAII lock on a [`Line`]; see module docs.
pub struct LineGuard {
    line: Rc<Line>,
}

impl LineGuard {
    /// Check liveness after a reentrant call. If this returns false the
    /// holder must stop touching the line immediately.
    pub fn is_alive(&self) -> bool {
        self.line.is_alive()
    }

    pub fn line(&self) -> &Rc<Line> {
        &self.line
    }
}

impl Drop for LineGuard {
    fn drop(&mut self) {
        self.line.unref();
    }
}
