//! Channel adapters - in-process chain endpoints
//!
//! `ChanSource` is a head adapter and `ChanSink` a tail adapter; each
//! comes with a detached *port* that external threads use to drive the
//! chain and observe what falls out of it:
//!
//! ```text
//!   SourcePort ==> [chan-source] --> ... --> [chan-sink] ==> SinkPort
//!              <==              <-- ... <--              <==
//! ```
//!
//! Ports never touch lines directly. Every operation is posted to the
//! owning worker's mailbox and runs there; payloads are copied into
//! pool buffers on the worker, and inbound payloads are copied out to
//! plain `Vec<u8>` events. The only cross-thread state is the
//! conn→worker routing table, guarded by a mutex.
//!
//! A port-initiated `finish` tears the whole connection down: the line
//! is closed before the signal propagates, and the creating side
//! destroys it. A second finish for the same connection finds nothing
//! registered and is a no-op.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::buffer::{Buffer, SMALL_BUFFER_SIZE};
use crate::engine::{EngineHandle, WorkerCtx};
use crate::error::{Error, Result};
use crate::line::{Line, LineId, WorkerId};
use crate::tunnel::{StageBinding, StageCtx, Tunnel};

/// Identity of one connection opened through a [`SourcePort`].
pub type ConnId = u64;

fn buffer_from(worker: &WorkerCtx, data: &[u8]) -> Buffer {
    let mut pool = worker.pool();
    let mut buffer = if data.len() <= SMALL_BUFFER_SIZE {
        pool.get_small()
    } else {
        pool.get_large()
    };
    drop(pool);
    buffer.extend_from_slice(data);
    buffer
}

// ============================================================================
// Source
// ============================================================================

/// What the chain pushed back out of its head.
#[derive(Debug, PartialEq, Eq)]
pub enum SourceEvent {
    Established { conn: ConnId },
    Payload { conn: ConnId, data: Vec<u8> },
    /// The chain asked the producer to stop sending.
    Paused { conn: ConnId },
    Resumed { conn: ConnId },
    /// The connection is gone; the line has been torn down.
    Finished { conn: ConnId },
}

struct SourceShared {
    binding: OnceLock<StageBinding>,
    events: Sender<SourceEvent>,
    /// conn → owning worker; written by ports, read by ports.
    routes: Mutex<HashMap<ConnId, WorkerId>>,
    idle_timeout: Option<Duration>,
    next_conn: AtomicU64,
}

/// Worker-local: the lines this worker's source currently owns.
#[derive(Default)]
struct SourceLines {
    by_conn: HashMap<ConnId, Rc<Line>>,
    by_line: HashMap<LineId, ConnId>,
}

/// Head adapter fed through a [`SourcePort`].
pub struct ChanSource {
    shared: Arc<SourceShared>,
}

impl ChanSource {
    pub fn new() -> (ChanSource, SourcePort) {
        Self::build(None)
    }

    /// Source that tears down connections idle for longer than `ttl`.
    /// Any payload in either direction counts as activity.
    pub fn with_idle_timeout(ttl: Duration) -> (ChanSource, SourcePort) {
        Self::build(Some(ttl))
    }

    fn build(idle_timeout: Option<Duration>) -> (ChanSource, SourcePort) {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(SourceShared {
            binding: OnceLock::new(),
            events: events_tx,
            routes: Mutex::new(HashMap::new()),
            idle_timeout,
            next_conn: AtomicU64::new(1),
        });
        let port = SourcePort { shared: Arc::clone(&shared), events: events_rx };
        (ChanSource { shared }, port)
    }

    fn conn_of(&self, cx: &StageCtx<'_>, line: &Line) -> Option<ConnId> {
        let local = cx.local::<SourceLines>();
        let conn = local.borrow().by_line.get(&line.id()).copied();
        conn
    }
}

/// Drop every trace of `line` on this worker and release it. Keyed off
/// the registry entry, so calling it twice is harmless.
fn source_teardown(shared: &SourceShared, worker: &WorkerCtx, index: usize, line: &Rc<Line>) {
    let local = worker.stage_local::<SourceLines>(index);
    let conn = {
        let mut local = local.borrow_mut();
        let conn = local.by_line.remove(&line.id());
        if let Some(conn) = conn {
            local.by_conn.remove(&conn);
        }
        conn
    };
    let Some(conn) = conn else { return };
    shared.routes.lock().remove(&conn);
    worker.idle_remove(line.id().0);
    debug!(conn, line = %line.id(), "source connection torn down");
    line.close();
    line.destroy();
}

fn source_idle_expired(shared: &Arc<SourceShared>, worker: &WorkerCtx, index: usize, key: u64) {
    let local = worker.stage_local::<SourceLines>(index);
    let found = {
        let local = local.borrow();
        local
            .by_line
            .get(&LineId(key))
            .and_then(|conn| local.by_conn.get(conn).map(|line| (*conn, Rc::clone(line))))
    };
    let Some((conn, line)) = found else { return };
    debug!(conn, line = %line.id(), "idle timeout");
    line.close();
    let chain = Arc::clone(worker.chain());
    let cx = chain.stage_ctx(worker, index);
    let guard = line.lock();
    cx.up().finish(&line);
    drop(guard);
    let _ = shared.events.send(SourceEvent::Finished { conn });
    source_teardown(shared, worker, index, &line);
}

impl Tunnel for ChanSource {
    fn name(&self) -> &str {
        "chan-source"
    }

    fn on_chain_complete(&self, binding: StageBinding) {
        assert_eq!(binding.index, 0, "chan-source must be the chain head");
        let _ = self.shared.binding.set(binding);
    }

    fn on_down_established(&self, cx: &StageCtx<'_>, line: &Rc<Line>) {
        if let Some(conn) = self.conn_of(cx, line) {
            let _ = self.shared.events.send(SourceEvent::Established { conn });
        }
    }

    fn on_down_payload(&self, cx: &StageCtx<'_>, line: &Rc<Line>, payload: Buffer) {
        let Some(conn) = self.conn_of(cx, line) else {
            cx.worker().pool().reuse(payload);
            return;
        };
        if let Some(ttl) = self.shared.idle_timeout {
            cx.worker().idle_keep_alive(line.id().0, ttl);
        }
        let data = payload.as_slice().to_vec();
        cx.worker().pool().reuse(payload);
        let _ = self.shared.events.send(SourceEvent::Payload { conn, data });
    }

    fn on_down_pause(&self, cx: &StageCtx<'_>, line: &Rc<Line>) {
        if let Some(conn) = self.conn_of(cx, line) {
            let _ = self.shared.events.send(SourceEvent::Paused { conn });
        }
    }

    fn on_down_resume(&self, cx: &StageCtx<'_>, line: &Rc<Line>) {
        if let Some(conn) = self.conn_of(cx, line) {
            let _ = self.shared.events.send(SourceEvent::Resumed { conn });
        }
    }

    /// A finish reaching the head is terminal; the originator closed the
    /// line before propagating it.
    fn on_down_finish(&self, cx: &StageCtx<'_>, line: &Rc<Line>) {
        let Some(conn) = self.conn_of(cx, line) else { return };
        let _ = self.shared.events.send(SourceEvent::Finished { conn });
        source_teardown(&self.shared, cx.worker(), cx.index(), line);
    }
}

/// External handle to a [`ChanSource`]. Clonable only through the conns
/// it hands out; events arrive on [`SourcePort::events`].
pub struct SourcePort {
    shared: Arc<SourceShared>,
    events: Receiver<SourceEvent>,
}

impl SourcePort {
    /// Open a connection on `worker`: creates the line there and runs
    /// `init` through the chain.
    pub fn open(&self, engine: &EngineHandle, worker: WorkerId) -> Result<SourceConn> {
        let binding = *self
            .shared
            .binding
            .get()
            .ok_or_else(|| Error::Config("chan-source is not part of an assembled chain".into()))?;
        if worker >= engine.workers() {
            return Err(Error::WorkerUnavailable(worker));
        }
        let conn = self.shared.next_conn.fetch_add(1, Ordering::Relaxed);
        self.shared.routes.lock().insert(conn, worker);
        let shared = Arc::clone(&self.shared);
        engine.post(worker, move |w| {
            let chain = Arc::clone(w.chain());
            let line = chain.new_line(w.id());
            trace!(conn, line = %line.id(), "source connection opened");
            {
                let local = w.stage_local::<SourceLines>(binding.index);
                let mut local = local.borrow_mut();
                local.by_conn.insert(conn, Rc::clone(&line));
                local.by_line.insert(line.id(), conn);
            }
            if let Some(ttl) = shared.idle_timeout {
                let shared = Arc::clone(&shared);
                w.idle_insert(
                    line.id().0,
                    ttl,
                    Box::new(move |w, key| source_idle_expired(&shared, w, binding.index, key)),
                );
            }
            let cx = chain.stage_ctx(w, binding.index);
            let guard = line.lock();
            cx.up().init(&line);
            drop(guard);
        })?;
        Ok(SourceConn {
            shared: Arc::clone(&self.shared),
            engine: engine.clone(),
            index: binding.index,
            conn,
            worker,
        })
    }

    /// Events pushed back out of the chain head.
    pub fn events(&self) -> &Receiver<SourceEvent> {
        &self.events
    }
}

/// One open connection through a [`SourcePort`].
pub struct SourceConn {
    shared: Arc<SourceShared>,
    engine: EngineHandle,
    index: usize,
    conn: ConnId,
    worker: WorkerId,
}

impl SourceConn {
    pub fn id(&self) -> ConnId {
        self.conn
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    fn with_line<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce(&WorkerCtx, &StageCtx<'_>, &Rc<Line>) + Send + 'static,
    {
        let conn = self.conn;
        let index = self.index;
        self.engine.post(self.worker, move |w| {
            let line = {
                let local = w.stage_local::<SourceLines>(index);
                let local = local.borrow();
                local.by_conn.get(&conn).cloned()
            };
            let Some(line) = line else { return };
            if !line.is_alive() {
                return;
            }
            let chain = Arc::clone(w.chain());
            let cx = chain.stage_ctx(w, index);
            task(w, &cx, &line);
        })
    }

    /// Inject a payload at the chain head.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        let data = data.to_vec();
        let ttl = self.shared.idle_timeout;
        self.with_line(move |w, cx, line| {
            if let Some(ttl) = ttl {
                w.idle_keep_alive(line.id().0, ttl);
            }
            let buffer = buffer_from(w, &data);
            let guard = line.lock();
            cx.up().payload(line, buffer);
            drop(guard);
        })
    }

    /// Tear the connection down. Closes the line, runs `finish` through
    /// the chain and releases the line. Safe to call more than once.
    pub fn finish(&self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let index = self.index;
        self.with_line(move |w, cx, line| {
            line.close();
            let guard = line.lock();
            cx.up().finish(line);
            drop(guard);
            source_teardown(&shared, w, index, line);
        })
    }

    /// Ask the chain to stop pushing payloads toward this port.
    pub fn pause(&self) -> Result<()> {
        self.with_line(|_, cx, line| {
            let guard = line.lock();
            cx.up().pause(line);
            drop(guard);
        })
    }

    pub fn resume(&self) -> Result<()> {
        self.with_line(|_, cx, line| {
            let guard = line.lock();
            cx.up().resume(line);
            drop(guard);
        })
    }
}

// ============================================================================
// Sink
// ============================================================================

/// What arrived at the chain tail.
#[derive(Debug, PartialEq, Eq)]
pub enum SinkEvent {
    /// A new line reached the tail.
    Opened { line: LineId },
    Established { line: LineId },
    Payload { line: LineId, data: Vec<u8> },
    /// The chain asked the consumer side to stop producing.
    Paused { line: LineId },
    Resumed { line: LineId },
    /// The line is gone.
    Finished { line: LineId },
}

struct SinkShared {
    binding: OnceLock<StageBinding>,
    events: Sender<SinkEvent>,
    routes: Mutex<HashMap<LineId, WorkerId>>,
}

type SinkLines = HashMap<LineId, Rc<Line>>;

/// Tail adapter draining into a [`SinkPort`].
pub struct ChanSink {
    shared: Arc<SinkShared>,
}

impl ChanSink {
    pub fn new() -> (ChanSink, SinkPort) {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(SinkShared {
            binding: OnceLock::new(),
            events: events_tx,
            routes: Mutex::new(HashMap::new()),
        });
        let port = SinkPort { shared: Arc::clone(&shared), events: events_rx };
        (ChanSink { shared }, port)
    }
}

fn sink_forget(shared: &SinkShared, worker: &WorkerCtx, index: usize, line: LineId) {
    let local = worker.stage_local::<SinkLines>(index);
    local.borrow_mut().remove(&line);
    shared.routes.lock().remove(&line);
}

impl Tunnel for ChanSink {
    fn name(&self) -> &str {
        "chan-sink"
    }

    fn on_chain_complete(&self, binding: StageBinding) {
        assert_eq!(
            binding.index,
            binding.chain_len - 1,
            "chan-sink must be the chain tail"
        );
        let _ = self.shared.binding.set(binding);
    }

    fn on_up_init(&self, cx: &StageCtx<'_>, line: &Rc<Line>) {
        let local = cx.local::<SinkLines>();
        local.borrow_mut().insert(line.id(), Rc::clone(line));
        self.shared.routes.lock().insert(line.id(), cx.worker().id());
        trace!(line = %line.id(), "line reached sink");
        let _ = self.shared.events.send(SinkEvent::Opened { line: line.id() });
    }

    fn on_up_established(&self, cx: &StageCtx<'_>, line: &Rc<Line>) {
        let _ = cx;
        let _ = self
            .shared
            .events
            .send(SinkEvent::Established { line: line.id() });
    }

    fn on_up_payload(&self, cx: &StageCtx<'_>, line: &Rc<Line>, payload: Buffer) {
        let data = payload.as_slice().to_vec();
        cx.worker().pool().reuse(payload);
        let _ = self
            .shared
            .events
            .send(SinkEvent::Payload { line: line.id(), data });
    }

    fn on_up_pause(&self, cx: &StageCtx<'_>, line: &Rc<Line>) {
        let _ = cx;
        let _ = self.shared.events.send(SinkEvent::Paused { line: line.id() });
    }

    fn on_up_resume(&self, cx: &StageCtx<'_>, line: &Rc<Line>) {
        let _ = cx;
        let _ = self.shared.events.send(SinkEvent::Resumed { line: line.id() });
    }

    /// Terminal for this line; the sink holds no further claim on it.
    fn on_up_finish(&self, cx: &StageCtx<'_>, line: &Rc<Line>) {
        let _ = self.shared.events.send(SinkEvent::Finished { line: line.id() });
        sink_forget(&self.shared, cx.worker(), cx.index(), line.id());
    }
}

/// External handle to a [`ChanSink`]. Line ids come from
/// [`SinkEvent::Opened`]; operations on lines the sink no longer knows
/// are silently dropped, mirroring writes to a connection the peer
/// already closed.
pub struct SinkPort {
    shared: Arc<SinkShared>,
    events: Receiver<SinkEvent>,
}

impl SinkPort {
    pub fn events(&self) -> &Receiver<SinkEvent> {
        &self.events
    }

    fn with_line<F>(&self, engine: &EngineHandle, line: LineId, task: F) -> Result<()>
    where
        F: FnOnce(&WorkerCtx, &StageCtx<'_>, &Rc<Line>) + Send + 'static,
    {
        let Some(binding) = self.shared.binding.get().copied() else {
            return Err(Error::Config("chan-sink is not part of an assembled chain".into()));
        };
        let Some(worker) = self.shared.routes.lock().get(&line).copied() else {
            return Ok(());
        };
        engine.post(worker, move |w| {
            let found = {
                let local = w.stage_local::<SinkLines>(binding.index);
                let local = local.borrow();
                local.get(&line).cloned()
            };
            let Some(line) = found else { return };
            if !line.is_alive() {
                return;
            }
            let chain = Arc::clone(w.chain());
            let cx = chain.stage_ctx(w, binding.index);
            task(w, &cx, &line);
        })
    }

    /// Acknowledge a line as established, toward the head.
    pub fn established(&self, engine: &EngineHandle, line: LineId) -> Result<()> {
        self.with_line(engine, line, |_, cx, line| {
            let guard = line.lock();
            cx.down().established(line);
            drop(guard);
        })
    }

    /// Inject a payload at the chain tail, toward the head.
    pub fn send(&self, engine: &EngineHandle, line: LineId, data: &[u8]) -> Result<()> {
        let data = data.to_vec();
        self.with_line(engine, line, move |w, cx, line| {
            let buffer = buffer_from(w, &data);
            let guard = line.lock();
            cx.down().payload(line, buffer);
            drop(guard);
        })
    }

    /// Tear the line down from the tail side.
    pub fn finish(&self, engine: &EngineHandle, line: LineId) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        self.with_line(engine, line, move |w, cx, line| {
            line.close();
            let guard = line.lock();
            cx.down().finish(line);
            drop(guard);
            sink_forget(&shared, w, cx.index(), line.id());
        })
    }

    /// Ask the chain to stop pushing payloads toward this port.
    pub fn pause(&self, engine: &EngineHandle, line: LineId) -> Result<()> {
        self.with_line(engine, line, |_, cx, line| {
            let guard = line.lock();
            cx.down().pause(line);
            drop(guard);
        })
    }

    pub fn resume(&self, engine: &EngineHandle, line: LineId) -> Result<()> {
        self.with_line(engine, line, |_, cx, line| {
            let guard = line.lock();
            cx.down().resume(line);
            drop(guard);
        })
    }
}
