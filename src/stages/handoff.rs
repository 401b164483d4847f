//! Handoff - move a connection to another worker mid-chain
//!
//! On `init` the stage picks a target worker. If the target is the
//! local worker the stage is a no-op; otherwise it splices in a pipe
//! and from then on routes every signal by which pipe side the line is:
//!
//! - left side (the opener): up-traveling signals cross the pipe,
//!   down-traveling ones continue locally toward the head;
//! - right side (the materialized peer): down-traveling signals cross
//!   the pipe, up-traveling ones continue locally toward the tail.
//!
//! Lines the stage never spliced are forwarded untouched, so a chain
//! can keep some connections local and move others. Pipe lookups are
//! scoped to this stage's own index; several handoffs in one chain can
//! therefore migrate the same connection in turn, each through its own
//! pipe.

use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use crate::buffer::Buffer;
use crate::line::{Line, WorkerId};
use crate::pipe::{self, Side};
use crate::tunnel::{Direction, StageCtx, Tunnel};

enum Target {
    /// Always splice to this worker.
    Fixed(WorkerId),
    /// Spread connections across all workers in turn.
    RoundRobin(AtomicUsize),
}

pub struct Handoff {
    target: Target,
}

impl Handoff {
    /// Handoff every connection to one worker.
    pub fn to_worker(worker: WorkerId) -> Self {
        Handoff { target: Target::Fixed(worker) }
    }

    /// Distribute connections round-robin over all workers.
    pub fn round_robin() -> Self {
        Handoff { target: Target::RoundRobin(AtomicUsize::new(0)) }
    }

    fn pick(&self, cx: &StageCtx<'_>) -> WorkerId {
        match &self.target {
            Target::Fixed(worker) => *worker,
            Target::RoundRobin(next) => {
                next.fetch_add(1, Ordering::Relaxed) % cx.worker().engine().workers()
            }
        }
    }
}

impl Tunnel for Handoff {
    fn name(&self) -> &str {
        "handoff"
    }

    fn on_up_init(&self, cx: &StageCtx<'_>, line: &Rc<Line>) {
        // a pipe registered at this stage means this is the replayed
        // init of a materialized right side; a pipe another handoff
        // registered does not count, the line still has to migrate here
        if cx.worker().pipe_at(line.id(), cx.index()).is_some() {
            cx.up().init(line);
            return;
        }
        let target = self.pick(cx);
        if target == cx.worker().id() {
            debug!(line = %line.id(), worker = target, "target is local, no splice");
            cx.up().init(line);
        } else {
            pipe::pipe_to(cx, line, target);
        }
    }

    fn on_up_established(&self, cx: &StageCtx<'_>, line: &Rc<Line>) {
        match cx.worker().pipe_at(line.id(), cx.index()) {
            Some((core, Side::Left)) => {
                pipe::send_established(cx.worker(), &core, Side::Left, Direction::Up)
            }
            _ => cx.up().established(line),
        }
    }

    fn on_down_established(&self, cx: &StageCtx<'_>, line: &Rc<Line>) {
        match cx.worker().pipe_at(line.id(), cx.index()) {
            Some((core, Side::Right)) => {
                pipe::send_established(cx.worker(), &core, Side::Right, Direction::Down)
            }
            _ => cx.down().established(line),
        }
    }

    fn on_up_payload(&self, cx: &StageCtx<'_>, line: &Rc<Line>, payload: Buffer) {
        match cx.worker().pipe_at(line.id(), cx.index()) {
            Some((core, Side::Left)) => {
                pipe::send_payload(cx.worker(), &core, Side::Left, Direction::Up, payload)
            }
            _ => cx.up().payload(line, payload),
        }
    }

    fn on_down_payload(&self, cx: &StageCtx<'_>, line: &Rc<Line>, payload: Buffer) {
        match cx.worker().pipe_at(line.id(), cx.index()) {
            Some((core, Side::Right)) => {
                pipe::send_payload(cx.worker(), &core, Side::Right, Direction::Down, payload)
            }
            _ => cx.down().payload(line, payload),
        }
    }

    fn on_up_pause(&self, cx: &StageCtx<'_>, line: &Rc<Line>) {
        match cx.worker().pipe_at(line.id(), cx.index()) {
            Some((core, Side::Left)) => {
                pipe::send_flow(cx.worker(), &core, Side::Left, Direction::Up, true)
            }
            _ => cx.up().pause(line),
        }
    }

    fn on_up_resume(&self, cx: &StageCtx<'_>, line: &Rc<Line>) {
        match cx.worker().pipe_at(line.id(), cx.index()) {
            Some((core, Side::Left)) => {
                pipe::send_flow(cx.worker(), &core, Side::Left, Direction::Up, false)
            }
            _ => cx.up().resume(line),
        }
    }

    fn on_down_pause(&self, cx: &StageCtx<'_>, line: &Rc<Line>) {
        match cx.worker().pipe_at(line.id(), cx.index()) {
            Some((core, Side::Right)) => {
                pipe::send_flow(cx.worker(), &core, Side::Right, Direction::Down, true)
            }
            _ => cx.down().pause(line),
        }
    }

    fn on_down_resume(&self, cx: &StageCtx<'_>, line: &Rc<Line>) {
        match cx.worker().pipe_at(line.id(), cx.index()) {
            Some((core, Side::Right)) => {
                pipe::send_flow(cx.worker(), &core, Side::Right, Direction::Down, false)
            }
            _ => cx.down().resume(line),
        }
    }

    fn on_up_finish(&self, cx: &StageCtx<'_>, line: &Rc<Line>) {
        match cx.worker().pipe_at(line.id(), cx.index()) {
            Some((core, Side::Left)) => pipe::finish(cx.worker(), &core, Side::Left),
            _ => cx.up().finish(line),
        }
    }

    fn on_down_finish(&self, cx: &StageCtx<'_>, line: &Rc<Line>) {
        match cx.worker().pipe_at(line.id(), cx.index()) {
            Some((core, Side::Right)) => pipe::finish(cx.worker(), &core, Side::Right),
            _ => cx.down().finish(line),
        }
    }
}
