//! Chain - ordered stage sequence, built once, immutable after
//!
//! Assembly runs in two passes over the configuration graph:
//!
//! 1. **Link pass** — resolve every node's `next` reference, find the
//!    single head, and fatally reject cycles, dangling references,
//!    duplicate names and unreachable nodes. These are configuration
//!    mistakes; the process must refuse to run on an inconsistent chain.
//! 2. **Index/offset pass** — walk head→tail once, assigning each stage
//!    a consecutive index and a cache-line-rounded byte offset into the
//!    per-line state arena. The final total becomes the fixed line
//!    allocation size for this chain.
//!
//! After both passes, `on_chain_complete` walks the chain once so stages
//! can capture their binding; `Chain::start` (run by the engine on a
//! live worker) walks it again so they can open resources that depend on
//! final topology. Rebuilding a chain means discarding every line first:
//! lines hold the layout, not the chain, so the type system keeps the
//! two lifetimes honest.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::GraphConfig;
use crate::engine::WorkerCtx;
use crate::error::{Error, Result};
use crate::line::{Line, LineLayout, WorkerId};
use crate::tunnel::{Direction, Hop, StageBinding, StageCtx, Tunnel};

// ============================================================================
// Chain
// ============================================================================

/// An assembled, immutable pipeline. Shared read-only across workers.
pub struct Chain {
    stages: Vec<Box<dyn Tunnel>>,
    layout: Arc<LineLayout>,
}

impl Chain {
    pub fn builder() -> ChainBuilder {
        ChainBuilder { stages: Vec::new() }
    }

    /// Assemble from a configuration graph through a registry.
    pub fn from_graph(graph: &GraphConfig, registry: &StageRegistry) -> Result<Chain> {
        let mut builder = Chain::builder();
        for node in graph.ordered_walk()? {
            debug!(name = %node.name, kind = %node.kind, "instantiating stage");
            builder = builder.push_boxed(registry.create(&node.kind, &node.settings)?);
        }
        builder.build()
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Fixed per-line state layout of this chain.
    pub fn layout(&self) -> &Arc<LineLayout> {
        &self.layout
    }

    pub(crate) fn stage(&self, index: usize) -> &dyn Tunnel {
        self.stages[index].as_ref()
    }

    pub fn stage_name(&self, index: usize) -> &str {
        self.stages[index].name()
    }

    /// Create a line affinitized to `worker`, with this chain's slot
    /// layout.
    pub fn new_line(&self, worker: WorkerId) -> Rc<Line> {
        Line::new(Arc::clone(&self.layout), worker)
    }

    /// Context for the stage at `index`, for adapters injecting events
    /// at the chain ends.
    pub fn stage_ctx<'a>(&'a self, worker: &'a WorkerCtx, index: usize) -> StageCtx<'a> {
        StageCtx::new(self, worker, index)
    }

    /// A hop delivering directly to the stage at `index`, as if the
    /// signal had arrived from its `dir`-side neighbor. Used by the pipe
    /// to replay remote traffic into the chain.
    pub fn deliver<'a>(
        &'a self,
        worker: &'a WorkerCtx,
        dir: Direction,
        index: usize,
    ) -> Hop<'a> {
        Hop::deliver_at(self, worker, dir, index)
    }

    /// Run the `on_chain_start` walk. Invoked by the engine on a live
    /// worker, once.
    pub(crate) fn start(&self, worker: &WorkerCtx) {
        for index in 0..self.stages.len() {
            let cx = StageCtx::new(self, worker, index);
            self.stages[index].on_chain_start(&cx);
        }
        info!(stages = self.stages.len(), "chain started");
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.stages.iter().map(|s| s.name()).collect();
        f.debug_struct("Chain")
            .field("stages", &names)
            .field("line_size", &self.layout.size())
            .finish()
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Assembles a [`Chain`] from stages pushed head→tail.
pub struct ChainBuilder {
    stages: Vec<Box<dyn Tunnel>>,
}

impl ChainBuilder {
    /// Append a stage at the tail.
    pub fn push<T: Tunnel + 'static>(self, stage: T) -> Self {
        self.push_boxed(Box::new(stage))
    }

    pub fn push_boxed(mut self, stage: Box<dyn Tunnel>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Run the index/offset pass and finalize. The chain is immutable
    /// afterwards.
    pub fn build(self) -> Result<Chain> {
        if self.stages.is_empty() {
            return Err(Error::Topology("chain has no stages".into()));
        }
        let declared = self.stages.iter().map(|s| s.state_layout()).collect();
        let layout = Arc::new(LineLayout::assign(declared));
        let chain = Chain { stages: self.stages, layout };
        let chain_len = chain.stages.len();
        for (index, stage) in chain.stages.iter().enumerate() {
            stage.on_chain_complete(StageBinding { index, chain_len });
        }
        info!(
            stages = chain_len,
            line_size = chain.layout.size(),
            "chain assembled"
        );
        Ok(chain)
    }
}

// ============================================================================
// Registry
// ============================================================================

type StageFactory =
    Box<dyn Fn(&serde_json::Value) -> Result<Box<dyn Tunnel>> + Send + Sync>;

/// Maps configuration `kind` names to stage factories.
pub struct StageRegistry {
    factories: HashMap<String, StageFactory>,
}

impl StageRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        StageRegistry { factories: HashMap::new() }
    }

    /// Registry with the built-in stages registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("passthrough", |_| {
            Ok(Box::new(crate::stages::Passthrough::new()) as Box<dyn Tunnel>)
        });
        registry.register("handoff", |settings| {
            let target = settings
                .get("worker")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| {
                    Error::Config("handoff requires a numeric 'worker' setting".into())
                })?;
            Ok(Box::new(crate::stages::Handoff::to_worker(target as usize)) as Box<dyn Tunnel>)
        });
        registry
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&serde_json::Value) -> Result<Box<dyn Tunnel>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Box::new(factory));
    }

    pub fn create(&self, kind: &str, settings: &serde_json::Value) -> Result<Box<dyn Tunnel>> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| Error::UnknownStage(kind.to_string()))?;
        factory(settings)
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ============================================================================
// Link pass
// ============================================================================

impl GraphConfig {
    /// The link pass: resolve `next` references into a head→tail node
    /// order, rejecting malformed topologies.
    pub(crate) fn ordered_walk(&self) -> Result<Vec<&crate::config::NodeConfig>> {
        if self.nodes.is_empty() {
            return Err(Error::Topology("graph has no nodes".into()));
        }

        let mut by_name = HashMap::new();
        for node in &self.nodes {
            if by_name.insert(node.name.as_str(), node).is_some() {
                return Err(Error::Topology(format!(
                    "duplicate node name '{}'",
                    node.name
                )));
            }
        }

        let mut referenced = HashSet::new();
        for node in &self.nodes {
            if let Some(next) = &node.next {
                if !by_name.contains_key(next.as_str()) {
                    return Err(Error::Topology(format!(
                        "node '{}' chains to unknown node '{}'",
                        node.name, next
                    )));
                }
                if !referenced.insert(next.as_str()) {
                    return Err(Error::Topology(format!(
                        "node '{}' is chained to more than once",
                        next
                    )));
                }
            }
        }

        let mut heads = self
            .nodes
            .iter()
            .filter(|n| !referenced.contains(n.name.as_str()));
        let head = heads.next().ok_or_else(|| {
            Error::Topology("no head node: the graph is a cycle".into())
        })?;
        if let Some(extra) = heads.next() {
            return Err(Error::Topology(format!(
                "multiple heads: '{}' and '{}' are both unreferenced",
                head.name, extra.name
            )));
        }

        let mut order = Vec::with_capacity(self.nodes.len());
        let mut cursor = Some(head);
        while let Some(node) = cursor {
            order.push(node);
            cursor = node.next.as_deref().map(|n| by_name[n]);
        }
        if order.len() != self.nodes.len() {
            return Err(Error::Topology(format!(
                "{} node(s) unreachable from head '{}'",
                self.nodes.len() - order.len(),
                head.name
            )));
        }
        Ok(order)
    }
}
