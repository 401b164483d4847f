//! Chain assembly: the link pass over configuration graphs, the
//! index/offset pass, and registry resolution.

use std::sync::OnceLock;

use weir::chain::{Chain, StageRegistry};
use weir::config::GraphConfig;
use weir::line::{StateLayout, CACHE_LINE};
use weir::stages::Passthrough;
use weir::tunnel::{StageBinding, Tunnel};
use weir::Error;

fn build(json: &str) -> weir::Result<Chain> {
    let graph = GraphConfig::from_json(json).unwrap();
    Chain::from_graph(&graph, &StageRegistry::with_defaults())
}

#[test]
fn test_graph_is_ordered_by_links_not_listing() {
    // listed tail-first; the link pass must still find a -> b -> c
    let chain = build(
        r#"{ "nodes": [
            { "name": "c", "kind": "passthrough" },
            { "name": "a", "kind": "passthrough", "next": "b" },
            { "name": "b", "kind": "passthrough", "next": "c" }
        ]}"#,
    )
    .unwrap();
    assert_eq!(chain.len(), 3);
}

#[test]
fn test_empty_graph_rejected() {
    assert!(matches!(build(r#"{ "nodes": [] }"#), Err(Error::Topology(_))));
}

#[test]
fn test_duplicate_name_rejected() {
    let err = build(
        r#"{ "nodes": [
            { "name": "a", "kind": "passthrough", "next": "a" },
            { "name": "a", "kind": "passthrough" }
        ]}"#,
    )
    .unwrap_err();
    assert!(matches!(err, Error::Topology(ref m) if m.contains("duplicate")));
}

#[test]
fn test_dangling_next_rejected() {
    let err = build(
        r#"{ "nodes": [
            { "name": "a", "kind": "passthrough", "next": "ghost" }
        ]}"#,
    )
    .unwrap_err();
    assert!(matches!(err, Error::Topology(ref m) if m.contains("unknown")));
}

#[test]
fn test_cycle_rejected() {
    let err = build(
        r#"{ "nodes": [
            { "name": "a", "kind": "passthrough", "next": "b" },
            { "name": "b", "kind": "passthrough", "next": "a" }
        ]}"#,
    )
    .unwrap_err();
    assert!(matches!(err, Error::Topology(ref m) if m.contains("cycle")));
}

#[test]
fn test_multiple_heads_rejected() {
    let err = build(
        r#"{ "nodes": [
            { "name": "a", "kind": "passthrough", "next": "c" },
            { "name": "b", "kind": "passthrough" },
            { "name": "c", "kind": "passthrough" }
        ]}"#,
    )
    .unwrap_err();
    assert!(matches!(err, Error::Topology(ref m) if m.contains("heads")));
}

#[test]
fn test_fan_in_rejected() {
    let err = build(
        r#"{ "nodes": [
            { "name": "a", "kind": "passthrough", "next": "c" },
            { "name": "b", "kind": "passthrough", "next": "c" },
            { "name": "c", "kind": "passthrough" }
        ]}"#,
    )
    .unwrap_err();
    assert!(matches!(err, Error::Topology(ref m) if m.contains("more than once")));
}

#[test]
fn test_unknown_kind_rejected() {
    let err = build(r#"{ "nodes": [ { "name": "a", "kind": "warp-drive" } ] }"#).unwrap_err();
    assert!(matches!(err, Error::UnknownStage(ref k) if k == "warp-drive"));
}

#[test]
fn test_handoff_requires_worker_setting() {
    let err = build(r#"{ "nodes": [ { "name": "h", "kind": "handoff" } ] }"#).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn test_empty_builder_rejected() {
    assert!(matches!(Chain::builder().build(), Err(Error::Topology(_))));
}

// ============================================================================
// Index/offset pass
// ============================================================================

struct StatefulStage;

impl Tunnel for StatefulStage {
    fn name(&self) -> &str {
        "stateful"
    }

    fn state_layout(&self) -> StateLayout {
        StateLayout::of::<[u64; 20]>()
    }
}

#[test]
fn test_offsets_rounded_and_disjoint() {
    let chain = Chain::builder()
        .push(Passthrough::new())
        .push(StatefulStage)
        .push(Passthrough::new())
        .build()
        .unwrap();
    let layout = chain.layout();
    assert_eq!(layout.slots().len(), 3);
    for slot in layout.slots() {
        assert_eq!(slot.offset % CACHE_LINE, 0);
    }
    for pair in layout.slots().windows(2) {
        assert!(pair[0].range().end <= pair[1].range().start);
    }
    assert!(layout.size() >= layout.slots()[2].range().end);
}

#[test]
fn test_line_size_fixed_after_build() {
    let chain = Chain::builder()
        .push(StatefulStage)
        .push(StatefulStage)
        .build()
        .unwrap();
    let layout = chain.layout();
    assert_eq!(layout.slots().len(), 2);
    assert!(layout.size() >= layout.slots()[1].range().end);
    let a = chain.new_line(0);
    let b = chain.new_line(0);
    assert_ne!(a.id(), b.id());
    a.destroy();
    b.destroy();
}

// ============================================================================
// Binding walk
// ============================================================================

struct BindingRecorder {
    seen: OnceLock<StageBinding>,
}

impl Tunnel for &'static BindingRecorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn on_chain_complete(&self, binding: StageBinding) {
        self.seen.set(binding).expect("on_chain_complete runs once");
    }
}

#[test]
fn test_on_chain_complete_sees_final_indices() {
    static RECORDER: BindingRecorder = BindingRecorder { seen: OnceLock::new() };
    let chain = Chain::builder()
        .push(Passthrough::new())
        .push(&RECORDER)
        .push(Passthrough::new())
        .build()
        .unwrap();
    let binding = RECORDER.seen.get().expect("recorder was bound");
    assert_eq!(binding.index, 1);
    assert_eq!(binding.chain_len, 3);
    assert_eq!(chain.stage_name(1), "recorder");
}
