//! # weir
//!
//! A modular stream-processing engine: connections flow through an
//! ordered chain of stages, each stage transforming or routing the
//! traffic of both directions.
//!
//! ```text
//!   SourcePort ==> [chan-source] -> [stage] -> [stage] -> [chan-sink] ==> SinkPort
//!              <==               <-         <-         <-             <==
//! ```
//!
//! ## Core pieces
//!
//! - [`tunnel::Tunnel`] - one stage: twelve entry points (six per
//!   direction), every default forwards to the neighbor
//! - [`chain::Chain`] - the assembled stage sequence, immutable, shared
//!   read-only by all workers
//! - [`line::Line`] - one connection's state, affinitized to a single
//!   worker thread
//! - [`buffer::Buffer`] / [`buffer::BufferPool`] - pooled payload
//!   windows with cheap header prepend/strip
//! - [`engine::Engine`] - the worker threads and their mailboxes
//! - [`pipe`] - splices one connection across two workers
//!
//! ## Quick start
//!
//! ```
//! use weir::chain::Chain;
//! use weir::engine::Engine;
//! use weir::stages::{ChanSink, ChanSource, Passthrough, SinkEvent};
//!
//! # fn main() -> weir::Result<()> {
//! let (source, source_port) = ChanSource::new();
//! let (sink, sink_port) = ChanSink::new();
//! let chain = Chain::builder()
//!     .push(source)
//!     .push(Passthrough::new())
//!     .push(sink)
//!     .build()?;
//! let engine = Engine::new(chain, 2)?;
//!
//! let conn = source_port.open(&engine.handle(), 0)?;
//! conn.send(b"hello")?;
//!
//! let opened = sink_port.events().recv().unwrap();
//! let payload = sink_port.events().recv().unwrap();
//! assert!(matches!(opened, SinkEvent::Opened { .. }));
//! assert!(matches!(payload, SinkEvent::Payload { ref data, .. } if data == b"hello"));
//!
//! conn.finish()?;
//! engine.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod chain;
pub mod common;
pub mod config;
pub mod engine;
pub mod error;
pub mod line;
pub mod pipe;
pub mod stages;
pub mod tunnel;

pub use chain::{Chain, ChainBuilder, StageRegistry};
pub use config::{GraphConfig, NodeConfig};
pub use engine::{Engine, EngineHandle, WorkerCtx};
pub use error::{Error, Result};
pub use line::{Line, LineGuard, LineId, WorkerId};
pub use tunnel::{Direction, StageBinding, StageCtx, Tunnel};
