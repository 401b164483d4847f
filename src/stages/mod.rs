//! Built-in stages: the identity stage, the cross-worker handoff and
//! the in-process channel adapters used at chain ends.

mod chan;
mod handoff;
mod passthrough;

pub use chan::{
    ChanSink, ChanSource, ConnId, SinkEvent, SinkPort, SourceConn, SourceEvent, SourcePort,
};
pub use handoff::Handoff;
pub use passthrough::Passthrough;
