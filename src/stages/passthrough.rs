//! Passthrough - the identity stage, plus honest flow control
//!
//! Forwards every signal unchanged, but respects pause: payloads that
//! arrive for a throttled flow are queued in the line's state slot and
//! drained, in order, when the matching resume comes through. The
//! resume is only forwarded onward once the queue is empty, so a
//! throttled producer never sees resume while data is still parked
//! here. Mostly useful as a template for transforming stages and as the
//! filler stage in tests and configs.

use std::collections::VecDeque;
use std::rc::Rc;

use tracing::trace;

use crate::buffer::Buffer;
use crate::line::{Line, StateLayout};
use crate::tunnel::{StageCtx, Tunnel};

#[derive(Default)]
struct PassQueues {
    /// Payloads heading toward the tail, parked while the up flow is
    /// paused.
    up: VecDeque<Buffer>,
    /// Payloads heading toward the head, parked while the down flow is
    /// paused.
    down: VecDeque<Buffer>,
}

pub struct Passthrough {
    name: String,
}

impl Passthrough {
    pub fn new() -> Self {
        Passthrough { name: "passthrough".to_string() }
    }
}

impl Default for Passthrough {
    fn default() -> Self {
        Self::new()
    }
}

impl Passthrough {
    /// Give every queued buffer back to the worker pool. Used when the
    /// flow they were waiting for will never resume.
    fn reclaim(cx: &StageCtx<'_>, queue: &mut VecDeque<Buffer>) {
        let mut pool = cx.worker().pool();
        for buffer in queue.drain(..) {
            pool.reuse(buffer);
        }
    }
}

impl Tunnel for Passthrough {
    fn name(&self) -> &str {
        &self.name
    }

    fn state_layout(&self) -> StateLayout {
        StateLayout::of::<PassQueues>()
    }

    fn on_up_payload(&self, cx: &StageCtx<'_>, line: &Rc<Line>, payload: Buffer) {
        if line.up_flow_paused() {
            trace!(line = %line.id(), len = payload.len(), "up flow paused, queueing");
            cx.state::<PassQueues>(line).borrow_mut().up.push_back(payload);
            return;
        }
        cx.up().payload(line, payload);
    }

    fn on_down_payload(&self, cx: &StageCtx<'_>, line: &Rc<Line>, payload: Buffer) {
        if line.down_flow_paused() {
            trace!(line = %line.id(), len = payload.len(), "down flow paused, queueing");
            cx.state::<PassQueues>(line).borrow_mut().down.push_back(payload);
            return;
        }
        cx.down().payload(line, payload);
    }

    /// The up flow may move again: drain what we parked, oldest first,
    /// then let the resume continue toward the producer. A neighbor may
    /// re-pause (or kill the line) mid-drain; both stop the drain.
    fn on_down_resume(&self, cx: &StageCtx<'_>, line: &Rc<Line>) {
        loop {
            if !line.is_alive() || line.up_flow_paused() {
                break;
            }
            let next = cx.state::<PassQueues>(line).borrow_mut().up.pop_front();
            match next {
                Some(buffer) => cx.up().payload(line, buffer),
                None => break,
            }
        }
        if !line.is_alive() {
            let state = cx.state::<PassQueues>(line);
            Self::reclaim(cx, &mut state.borrow_mut().up);
            return;
        }
        if line.up_flow_paused() {
            // re-paused mid-drain; the next resume picks up the rest
            return;
        }
        cx.down().resume(line);
    }

    fn on_up_resume(&self, cx: &StageCtx<'_>, line: &Rc<Line>) {
        loop {
            if !line.is_alive() || line.down_flow_paused() {
                break;
            }
            let next = cx.state::<PassQueues>(line).borrow_mut().down.pop_front();
            match next {
                Some(buffer) => cx.down().payload(line, buffer),
                None => break,
            }
        }
        if !line.is_alive() {
            let state = cx.state::<PassQueues>(line);
            Self::reclaim(cx, &mut state.borrow_mut().down);
            return;
        }
        if line.down_flow_paused() {
            return;
        }
        cx.up().resume(line);
    }

    fn on_up_finish(&self, cx: &StageCtx<'_>, line: &Rc<Line>) {
        {
            let state = cx.state::<PassQueues>(line);
            let mut state = state.borrow_mut();
            Self::reclaim(cx, &mut state.up);
            if !line.is_alive() {
                Self::reclaim(cx, &mut state.down);
            }
        }
        cx.up().finish(line);
    }

    fn on_down_finish(&self, cx: &StageCtx<'_>, line: &Rc<Line>) {
        {
            let state = cx.state::<PassQueues>(line);
            let mut state = state.borrow_mut();
            Self::reclaim(cx, &mut state.down);
            if !line.is_alive() {
                Self::reclaim(cx, &mut state.up);
            }
        }
        cx.down().finish(line);
    }
}
