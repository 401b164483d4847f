//! End-to-end engine behavior: lifecycle signals, flow control,
//! cross-worker handoff and teardown.

use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use weir::buffer::Buffer;
use weir::chain::Chain;
use weir::engine::Engine;
use weir::stages::{
    ChanSink, ChanSource, Handoff, Passthrough, SinkEvent, SinkPort, SourceEvent, SourcePort,
};
use weir::tunnel::{StageCtx, Tunnel};
use weir::{Error, Line, LineId};

const EVENT_WAIT: Duration = Duration::from_secs(2);
/// Long enough to be sure nothing was delivered, short enough to keep
/// the suite quick.
const QUIET_WAIT: Duration = Duration::from_millis(150);

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_test_writer()
        .try_init();
}

fn sink_event(port: &SinkPort) -> SinkEvent {
    port.events().recv_timeout(EVENT_WAIT).expect("expected a sink event")
}

fn source_event(port: &SourcePort) -> SourceEvent {
    port.events()
        .recv_timeout(EVENT_WAIT)
        .expect("expected a source event")
}

fn opened_line(port: &SinkPort) -> LineId {
    match sink_event(port) {
        SinkEvent::Opened { line } => line,
        other => panic!("expected Opened, got {:?}", other),
    }
}

fn local_engine() -> (Engine, SourcePort, SinkPort) {
    init_logging();
    let (source, source_port) = ChanSource::new();
    let (sink, sink_port) = ChanSink::new();
    let chain = Chain::builder()
        .push(source)
        .push(Passthrough::new())
        .push(sink)
        .build()
        .unwrap();
    (Engine::new(chain, 1).unwrap(), source_port, sink_port)
}

fn piped_engine() -> (Engine, SourcePort, SinkPort) {
    init_logging();
    let (source, source_port) = ChanSource::new();
    let (sink, sink_port) = ChanSink::new();
    let chain = Chain::builder()
        .push(source)
        .push(Handoff::to_worker(1))
        .push(Passthrough::new())
        .push(sink)
        .build()
        .unwrap();
    (Engine::new(chain, 2).unwrap(), source_port, sink_port)
}

// ============================================================================
// Local chain
// ============================================================================

#[test]
fn test_local_full_lifecycle() {
    let (engine, sp, kp) = local_engine();
    let handle = engine.handle();

    let conn = sp.open(&handle, 0).unwrap();
    let line = opened_line(&kp);

    kp.established(&handle, line).unwrap();
    assert_eq!(source_event(&sp), SourceEvent::Established { conn: conn.id() });

    conn.send(b"one").unwrap();
    conn.send(b"two").unwrap();
    assert_eq!(sink_event(&kp), SinkEvent::Payload { line, data: b"one".to_vec() });
    assert_eq!(sink_event(&kp), SinkEvent::Payload { line, data: b"two".to_vec() });

    kp.send(&handle, line, b"reply").unwrap();
    assert_eq!(
        source_event(&sp),
        SourceEvent::Payload { conn: conn.id(), data: b"reply".to_vec() }
    );

    conn.finish().unwrap();
    assert_eq!(sink_event(&kp), SinkEvent::Finished { line });

    // every payload buffer must be back in the pool
    let outstanding = engine.run_on(0, |w| w.pool().outstanding()).unwrap();
    assert_eq!(outstanding, 0);
    engine.shutdown();
}

#[test]
fn test_pause_queues_payloads_until_resume() {
    let (engine, sp, kp) = local_engine();
    let handle = engine.handle();

    let conn = sp.open(&handle, 0).unwrap();
    let line = opened_line(&kp);

    kp.pause(&handle, line).unwrap();
    assert_eq!(source_event(&sp), SourceEvent::Paused { conn: conn.id() });

    conn.send(b"x").unwrap();
    conn.send(b"y").unwrap();
    assert!(
        kp.events().recv_timeout(QUIET_WAIT).is_err(),
        "payload leaked through a paused flow"
    );

    kp.resume(&handle, line).unwrap();
    assert_eq!(sink_event(&kp), SinkEvent::Payload { line, data: b"x".to_vec() });
    assert_eq!(sink_event(&kp), SinkEvent::Payload { line, data: b"y".to_vec() });
    assert_eq!(source_event(&sp), SourceEvent::Resumed { conn: conn.id() });

    conn.finish().unwrap();
    assert_eq!(sink_event(&kp), SinkEvent::Finished { line });
    let outstanding = engine.run_on(0, |w| w.pool().outstanding()).unwrap();
    assert_eq!(outstanding, 0);
    engine.shutdown();
}

#[test]
fn test_repeated_pause_and_resume_are_dropped() {
    let (engine, sp, kp) = local_engine();
    let handle = engine.handle();

    let conn = sp.open(&handle, 0).unwrap();
    let line = opened_line(&kp);

    kp.pause(&handle, line).unwrap();
    assert_eq!(source_event(&sp), SourceEvent::Paused { conn: conn.id() });
    // pausing an already paused flow goes nowhere
    kp.pause(&handle, line).unwrap();
    assert!(sp.events().recv_timeout(QUIET_WAIT).is_err());

    kp.resume(&handle, line).unwrap();
    assert_eq!(source_event(&sp), SourceEvent::Resumed { conn: conn.id() });
    kp.resume(&handle, line).unwrap();
    assert!(sp.events().recv_timeout(QUIET_WAIT).is_err());

    // the flow still works after the noise
    conn.send(b"still flowing").unwrap();
    assert_eq!(
        sink_event(&kp),
        SinkEvent::Payload { line, data: b"still flowing".to_vec() }
    );
    conn.finish().unwrap();
    assert_eq!(sink_event(&kp), SinkEvent::Finished { line });
    engine.shutdown();
}

#[test]
fn test_finish_reclaims_queued_payloads() {
    let (engine, sp, kp) = local_engine();
    let handle = engine.handle();

    let conn = sp.open(&handle, 0).unwrap();
    let line = opened_line(&kp);

    kp.pause(&handle, line).unwrap();
    assert_eq!(source_event(&sp), SourceEvent::Paused { conn: conn.id() });
    conn.send(b"parked").unwrap();

    // teardown without ever resuming; the queued buffer must not leak
    conn.finish().unwrap();
    assert_eq!(sink_event(&kp), SinkEvent::Finished { line });
    let outstanding = engine.run_on(0, |w| w.pool().outstanding()).unwrap();
    assert_eq!(outstanding, 0);
    engine.shutdown();
}

#[test]
fn test_second_finish_is_noop() {
    let (engine, sp, kp) = local_engine();
    let handle = engine.handle();

    let conn = sp.open(&handle, 0).unwrap();
    let line = opened_line(&kp);
    conn.finish().unwrap();
    conn.finish().unwrap();
    assert_eq!(sink_event(&kp), SinkEvent::Finished { line });
    assert!(kp.events().recv_timeout(QUIET_WAIT).is_err());

    // the engine must still service new connections
    let conn2 = sp.open(&handle, 0).unwrap();
    let line2 = opened_line(&kp);
    conn2.send(b"still here").unwrap();
    assert_eq!(
        sink_event(&kp),
        SinkEvent::Payload { line: line2, data: b"still here".to_vec() }
    );
    conn2.finish().unwrap();
    engine.shutdown();
}

/// A stage that forwards every `finish` twice over.
struct DoubleFinish;

impl Tunnel for DoubleFinish {
    fn name(&self) -> &str {
        "double-finish"
    }

    fn on_up_finish(&self, cx: &StageCtx<'_>, line: &Rc<Line>) {
        cx.up().finish(line);
        cx.up().finish(line);
    }
}

#[test]
fn test_repeated_finish_is_delivered_once() {
    init_logging();
    let (source, sp) = ChanSource::new();
    let (sink, kp) = ChanSink::new();
    let chain = Chain::builder()
        .push(source)
        .push(DoubleFinish)
        .push(sink)
        .build()
        .unwrap();
    let engine = Engine::new(chain, 1).unwrap();
    let handle = engine.handle();

    let conn = sp.open(&handle, 0).unwrap();
    let line = opened_line(&kp);

    conn.finish().unwrap();
    assert_eq!(sink_event(&kp), SinkEvent::Finished { line });
    assert!(
        kp.events().recv_timeout(QUIET_WAIT).is_err(),
        "a repeated finish leaked past dispatch"
    );
    engine.shutdown();
}

#[test]
fn test_sink_initiated_teardown() {
    let (engine, sp, kp) = local_engine();
    let handle = engine.handle();

    let conn = sp.open(&handle, 0).unwrap();
    let line = opened_line(&kp);

    kp.finish(&handle, line).unwrap();
    assert_eq!(source_event(&sp), SourceEvent::Finished { conn: conn.id() });

    // writes to a line the sink already closed are silently dropped
    kp.send(&handle, line, b"late").unwrap();
    conn.send(b"late too").unwrap();
    assert!(sp.events().recv_timeout(QUIET_WAIT).is_err());
    assert!(kp.events().recv_timeout(QUIET_WAIT).is_err());
    engine.shutdown();
}

#[test]
fn test_idle_timeout_synthesizes_finish() {
    init_logging();
    let (source, sp) = ChanSource::with_idle_timeout(Duration::from_millis(80));
    let (sink, kp) = ChanSink::new();
    let chain = Chain::builder()
        .push(source)
        .push(Passthrough::new())
        .push(sink)
        .build()
        .unwrap();
    let engine = Engine::new(chain, 1).unwrap();

    let conn = sp.open(&engine.handle(), 0).unwrap();
    let line = opened_line(&kp);

    // no traffic: the source must give up on the connection by itself
    assert_eq!(source_event(&sp), SourceEvent::Finished { conn: conn.id() });
    assert_eq!(sink_event(&kp), SinkEvent::Finished { line });
    engine.shutdown();
}

// ============================================================================
// Cross-worker handoff
// ============================================================================

#[test]
fn test_handoff_roundtrip_across_workers() {
    let (engine, sp, kp) = piped_engine();
    let handle = engine.handle();

    let conn = sp.open(&handle, 0).unwrap();
    let line = opened_line(&kp);

    kp.established(&handle, line).unwrap();
    assert_eq!(source_event(&sp), SourceEvent::Established { conn: conn.id() });

    for chunk in [&b"alpha"[..], b"beta", b"gamma"] {
        conn.send(chunk).unwrap();
    }
    for chunk in [&b"alpha"[..], b"beta", b"gamma"] {
        assert_eq!(sink_event(&kp), SinkEvent::Payload { line, data: chunk.to_vec() });
    }

    kp.send(&handle, line, b"ack").unwrap();
    assert_eq!(
        source_event(&sp),
        SourceEvent::Payload { conn: conn.id(), data: b"ack".to_vec() }
    );

    conn.finish().unwrap();
    assert_eq!(sink_event(&kp), SinkEvent::Finished { line });
    // payload accounting crossed the pipe with the buffers
    for worker in 0..2 {
        let outstanding = engine.run_on(worker, |w| w.pool().outstanding()).unwrap();
        assert_eq!(outstanding, 0, "worker {} leaked buffers", worker);
    }
    engine.shutdown();
}

#[test]
fn test_flow_control_crosses_the_pipe() {
    let (engine, sp, kp) = piped_engine();
    let handle = engine.handle();

    let conn = sp.open(&handle, 0).unwrap();
    let line = opened_line(&kp);

    // pause lands on the far worker's queueing stage before crossing
    // back; once the source observes it, sends are guaranteed to park
    kp.pause(&handle, line).unwrap();
    assert_eq!(source_event(&sp), SourceEvent::Paused { conn: conn.id() });

    conn.send(b"1").unwrap();
    conn.send(b"2").unwrap();
    conn.send(b"3").unwrap();
    assert!(
        kp.events().recv_timeout(QUIET_WAIT).is_err(),
        "payload leaked through a paused flow"
    );

    kp.resume(&handle, line).unwrap();
    for chunk in [&b"1"[..], b"2", b"3"] {
        assert_eq!(sink_event(&kp), SinkEvent::Payload { line, data: chunk.to_vec() });
    }
    assert_eq!(source_event(&sp), SourceEvent::Resumed { conn: conn.id() });

    conn.finish().unwrap();
    assert_eq!(sink_event(&kp), SinkEvent::Finished { line });
    for worker in 0..2 {
        let outstanding = engine.run_on(worker, |w| w.pool().outstanding()).unwrap();
        assert_eq!(outstanding, 0, "worker {} leaked buffers", worker);
    }
    engine.shutdown();
}

#[test]
fn test_sink_teardown_crosses_the_pipe() {
    let (engine, sp, kp) = piped_engine();
    let handle = engine.handle();

    let conn = sp.open(&handle, 0).unwrap();
    let line = opened_line(&kp);

    kp.finish(&handle, line).unwrap();
    assert_eq!(source_event(&sp), SourceEvent::Finished { conn: conn.id() });

    conn.send(b"into the void").unwrap();
    assert!(kp.events().recv_timeout(QUIET_WAIT).is_err());
    engine.shutdown();
}

#[test]
fn test_finish_race_between_both_ends() {
    let (engine, sp, kp) = piped_engine();
    let handle = engine.handle();

    let conn = sp.open(&handle, 0).unwrap();
    let line = opened_line(&kp);

    // fire from both ends at once; whoever loses the race closes quietly
    conn.finish().unwrap();
    kp.finish(&handle, line).unwrap();

    // drain whatever notifications made it out; at most one per port
    let _ = sp.events().recv_timeout(QUIET_WAIT);
    let _ = kp.events().recv_timeout(QUIET_WAIT);
    assert!(sp.events().recv_timeout(QUIET_WAIT).is_err());
    assert!(kp.events().recv_timeout(QUIET_WAIT).is_err());

    // and the engine is still healthy
    let conn2 = sp.open(&handle, 0).unwrap();
    let line2 = opened_line(&kp);
    conn2.send(b"fresh").unwrap();
    assert_eq!(sink_event(&kp), SinkEvent::Payload { line: line2, data: b"fresh".to_vec() });
    conn2.finish().unwrap();
    engine.shutdown();
}

#[test]
fn test_round_robin_handoff() {
    init_logging();
    let (source, sp) = ChanSource::new();
    let (sink, kp) = ChanSink::new();
    let chain = Chain::builder()
        .push(source)
        .push(Handoff::round_robin())
        .push(sink)
        .build()
        .unwrap();
    let engine = Engine::new(chain, 2).unwrap();
    let handle = engine.handle();

    // one connection stays local, the next is spliced; both must work
    let conns: Vec<_> = (0..2).map(|_| sp.open(&handle, 0).unwrap()).collect();
    let lines: Vec<_> = (0..2).map(|_| opened_line(&kp)).collect();
    for conn in &conns {
        conn.send(b"ping").unwrap();
    }
    for _ in 0..2 {
        match sink_event(&kp) {
            SinkEvent::Payload { line, data } => {
                assert!(lines.contains(&line));
                assert_eq!(data, b"ping");
            }
            other => panic!("expected Payload, got {:?}", other),
        }
    }
    for conn in &conns {
        conn.finish().unwrap();
    }
    engine.shutdown();
}

/// Records which worker each upstream payload was delivered on.
struct WorkerTap {
    seen: Arc<Mutex<Vec<usize>>>,
}

impl Tunnel for WorkerTap {
    fn name(&self) -> &str {
        "worker-tap"
    }

    fn on_up_payload(&self, cx: &StageCtx<'_>, line: &Rc<Line>, payload: Buffer) {
        self.seen.lock().unwrap().push(cx.worker().id());
        cx.up().payload(line, payload);
    }
}

#[test]
fn test_chained_handoffs_migrate_twice() {
    init_logging();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (source, sp) = ChanSource::new();
    let (sink, kp) = ChanSink::new();
    let chain = Chain::builder()
        .push(source)
        .push(Handoff::to_worker(1))
        .push(Handoff::to_worker(2))
        .push(WorkerTap { seen: Arc::clone(&seen) })
        .push(sink)
        .build()
        .unwrap();
    let engine = Engine::new(chain, 3).unwrap();
    let handle = engine.handle();

    let conn = sp.open(&handle, 0).unwrap();
    let line = opened_line(&kp);

    conn.send(b"hop hop").unwrap();
    assert_eq!(sink_event(&kp), SinkEvent::Payload { line, data: b"hop hop".to_vec() });
    // the payload must ride both pipes, not stop after the first
    assert_eq!(*seen.lock().unwrap(), vec![2]);

    kp.send(&handle, line, b"back").unwrap();
    assert_eq!(
        source_event(&sp),
        SourceEvent::Payload { conn: conn.id(), data: b"back".to_vec() }
    );

    conn.finish().unwrap();
    assert_eq!(sink_event(&kp), SinkEvent::Finished { line });
    for worker in 0..3 {
        let outstanding = engine.run_on(worker, |w| w.pool().outstanding()).unwrap();
        assert_eq!(outstanding, 0, "worker {} leaked buffers", worker);
    }
    engine.shutdown();
}

// ============================================================================
// Engine surface
// ============================================================================

#[test]
fn test_engine_requires_at_least_one_worker() {
    init_logging();
    let chain = Chain::builder().push(Passthrough::new()).build().unwrap();
    assert!(matches!(Engine::new(chain, 0), Err(Error::Config(_))));
}

#[test]
fn test_post_to_unknown_worker() {
    init_logging();
    let chain = Chain::builder().push(Passthrough::new()).build().unwrap();
    let engine = Engine::new(chain, 1).unwrap();
    let err = engine.post(5, |_| {}).unwrap_err();
    assert!(matches!(err, Error::WorkerUnavailable(5)));
    engine.shutdown();
}

#[test]
fn test_run_on_returns_worker_result() {
    init_logging();
    let chain = Chain::builder().push(Passthrough::new()).build().unwrap();
    let engine = Engine::new(chain, 3).unwrap();
    for id in 0..3 {
        assert_eq!(engine.run_on(id, |w| w.id()).unwrap(), id);
    }
    engine.shutdown();
}
