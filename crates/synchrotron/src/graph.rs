//! Node graph
//!
//! Owns node instances in petgraph's StableGraph arena together with their
//! per-tick evaluation state and published outputs. Validates port kinds and
//! fan-in at connection time. Cycles are allowed; the scheduler resolves them
//! with a one-tick delay.

use std::collections::{HashMap, HashSet};

use petgraph::algo::is_cyclic_directed;
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::node::BoxedNode;
use crate::primitives::{Exports, NodePorts, PortKind, PortSpec, PortValue};
use crate::scheduler::TickError;

/// An edge in the graph, connecting an output port to an input port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub source_port: usize,
    pub dest_port: usize,
}

/// Errors that can occur during graph operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("node not found: {0}")]
    NodeNotFound(Uuid),

    #[error("no node named `{0}`")]
    NodeNameNotFound(String),

    #[error("a node named `{0}` already exists")]
    DuplicateName(String),

    #[error("port not found: {node}.{port}")]
    PortNotFound { node: String, port: String },

    #[error("port kind mismatch: {output} output cannot feed {input} input")]
    KindMismatch { output: PortKind, input: PortKind },

    #[error("input {node}.{port} is already connected")]
    InputAlreadyConnected { node: String, port: String },

    #[error("invalid render context: sample_rate={sample_rate}, buffer_size={buffer_size}")]
    InvalidContext {
        sample_rate: u32,
        buffer_size: usize,
    },
}

/// Where a node stands in the current tick's evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EvalState {
    Idle,
    Evaluating,
    Done(u64),
    /// Render failed this tick; later reads get the cached error.
    Failed(u64),
}

/// One output port's published value.
#[derive(Debug, Default)]
pub(crate) struct OutputSlot {
    pub(crate) value: Option<PortValue>,
    /// Tick the value was published in.
    pub(crate) computed: Option<u64>,
    /// Value and tick before the latest publish, restored if that tick aborts.
    pub(crate) prior: Option<(Option<PortValue>, Option<u64>)>,
}

/// Arena entry: a node plus everything the scheduler tracks about it.
pub(crate) struct NodeSlot {
    pub(crate) id: Uuid,
    pub(crate) name: String,
    pub(crate) ports: &'static NodePorts,
    /// Taken out while the node renders.
    pub(crate) node: Option<BoxedNode>,
    pub(crate) state: EvalState,
    pub(crate) failure: Option<TickError>,
    pub(crate) outputs: Vec<OutputSlot>,
    pub(crate) exports: Exports,
}

/// Serializable description of one port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortSnapshot {
    pub name: String,
    pub kind: PortKind,
}

/// Serializable snapshot of a graph node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: Uuid,
    pub name: String,
    pub type_id: String,
    pub inputs: Vec<PortSnapshot>,
    pub outputs: Vec<PortSnapshot>,
    pub exports: Exports,
}

/// Serializable snapshot of a graph edge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSnapshot {
    pub source_id: Uuid,
    pub source_port: String,
    pub dest_id: Uuid,
    pub dest_port: String,
}

/// Serializable snapshot of the entire graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<NodeSnapshot>,
    pub edges: Vec<EdgeSnapshot>,
}

/// The node graph
///
/// Wraps petgraph's StableGraph with Uuid and name lookup.
#[derive(Default)]
pub struct Graph {
    inner: StableGraph<NodeSlot, Edge>,
    index_map: HashMap<Uuid, NodeIndex>,
    name_map: HashMap<String, Uuid>,
    /// First render failure of the tick in progress
    tick_failure: Option<TickError>,
}

impl Graph {
    /// Create a new empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node under a unique name
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        node: BoxedNode,
    ) -> Result<Uuid, GraphError> {
        let name = name.into();
        if self.name_map.contains_key(&name) {
            return Err(GraphError::DuplicateName(name));
        }

        let id = Uuid::new_v4();
        let ports = node.ports();
        let outputs = ports.outputs.iter().map(|_| OutputSlot::default()).collect();

        let index = self.inner.add_node(NodeSlot {
            id,
            name: name.clone(),
            ports,
            node: Some(node),
            state: EvalState::Idle,
            failure: None,
            outputs,
            exports: Exports::new(),
        });

        tracing::debug!(node = %name, type_id = ports.type_id, "node added");
        self.index_map.insert(id, index);
        self.name_map.insert(name, id);
        Ok(id)
    }

    /// Remove a node and all its edges, handing it back to the caller
    pub fn remove_node(&mut self, id: Uuid) -> Option<BoxedNode> {
        let index = self.index_map.remove(&id)?;
        let slot = self.inner.remove_node(index)?;
        self.name_map.remove(&slot.name);
        slot.node
    }

    /// Connect an output port to an input port
    pub fn connect(
        &mut self,
        source_id: Uuid,
        source_port: &str,
        dest_id: Uuid,
        dest_port: &str,
    ) -> Result<EdgeIndex, GraphError> {
        let source_idx = self.require(source_id)?;
        let dest_idx = self.require(dest_id)?;

        let edge = self.validate_connection(source_idx, source_port, dest_idx, dest_port)?;
        let edge_idx = self.inner.add_edge(source_idx, dest_idx, edge);

        tracing::debug!(
            from = %format!("{}.{}", self.inner[source_idx].name, source_port),
            to = %format!("{}.{}", self.inner[dest_idx].name, dest_port),
            "connected"
        );
        Ok(edge_idx)
    }

    /// Connect by node names instead of ids
    pub fn connect_named(
        &mut self,
        source: &str,
        source_port: &str,
        dest: &str,
        dest_port: &str,
    ) -> Result<EdgeIndex, GraphError> {
        let source_id = self
            .id_of(source)
            .ok_or_else(|| GraphError::NodeNameNotFound(source.to_string()))?;
        let dest_id = self
            .id_of(dest)
            .ok_or_else(|| GraphError::NodeNameNotFound(dest.to_string()))?;
        self.connect(source_id, source_port, dest_id, dest_port)
    }

    fn validate_connection(
        &self,
        source_idx: NodeIndex,
        source_port: &str,
        dest_idx: NodeIndex,
        dest_port: &str,
    ) -> Result<Edge, GraphError> {
        let source = &self.inner[source_idx];
        let dest = &self.inner[dest_idx];

        let out_index =
            source
                .ports
                .output_index(source_port)
                .ok_or_else(|| GraphError::PortNotFound {
                    node: source.name.clone(),
                    port: source_port.to_string(),
                })?;
        let in_index =
            dest.ports
                .input_index(dest_port)
                .ok_or_else(|| GraphError::PortNotFound {
                    node: dest.name.clone(),
                    port: dest_port.to_string(),
                })?;

        let output = source.ports.outputs[out_index].kind;
        let input = dest.ports.inputs[in_index].kind;
        if output != input {
            return Err(GraphError::KindMismatch { output, input });
        }

        if self.source_of(dest_idx, in_index).is_some() {
            return Err(GraphError::InputAlreadyConnected {
                node: dest.name.clone(),
                port: dest_port.to_string(),
            });
        }

        Ok(Edge {
            source_port: out_index,
            dest_port: in_index,
        })
    }

    /// Disconnect whatever feeds an input port
    pub fn disconnect(&mut self, dest_id: Uuid, dest_port: &str) -> bool {
        let Some(&dest_idx) = self.index_map.get(&dest_id) else {
            return false;
        };
        let Some(in_index) = self.inner[dest_idx].ports.input_index(dest_port) else {
            return false;
        };

        let edge = self
            .inner
            .edges_directed(dest_idx, Direction::Incoming)
            .find(|e| e.weight().dest_port == in_index)
            .map(|e| e.id());

        match edge {
            Some(edge_idx) => {
                self.inner.remove_edge(edge_idx);
                true
            }
            None => false,
        }
    }

    /// Look up a node id by name
    pub fn id_of(&self, name: &str) -> Option<Uuid> {
        self.name_map.get(name).copied()
    }

    /// Name of a node
    pub fn name_of(&self, id: Uuid) -> Option<&str> {
        let index = self.index_map.get(&id)?;
        Some(self.inner[*index].name.as_str())
    }

    /// Port table of a node
    pub fn ports_of(&self, id: Uuid) -> Option<&'static NodePorts> {
        let index = self.index_map.get(&id)?;
        Some(self.inner[*index].ports)
    }

    /// Get all node UUIDs in the graph
    pub fn node_ids(&self) -> Vec<Uuid> {
        self.inner.node_weights().map(|slot| slot.id).collect()
    }

    pub fn node_count(&self) -> usize {
        self.inner.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.edge_count()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.index_map.contains_key(&id)
    }

    /// True if any cycle exists; such cycles evaluate with a one-tick delay
    pub fn has_feedback(&self) -> bool {
        is_cyclic_directed(&self.inner)
    }

    /// Most recently published value of an output port
    pub fn output(&self, id: Uuid, port: &str) -> Option<&PortValue> {
        let slot = &self.inner[*self.index_map.get(&id)?];
        let index = slot.ports.output_index(port)?;
        slot.outputs[index].value.as_ref()
    }

    /// Tick in which an output port was last published
    pub fn output_tick(&self, id: Uuid, port: &str) -> Option<u64> {
        let slot = &self.inner[*self.index_map.get(&id)?];
        let index = slot.ports.output_index(port)?;
        slot.outputs[index].computed
    }

    /// A node's introspection map as of its last successful render
    pub fn exports(&self, id: Uuid) -> Option<&Exports> {
        let index = self.index_map.get(&id)?;
        Some(&self.inner[*index].exports)
    }

    /// Get all nodes upstream of the given node (feeding into it)
    pub fn upstream(&self, id: Uuid) -> Vec<Uuid> {
        self.walk(id, Direction::Incoming)
    }

    fn walk(&self, id: Uuid, direction: Direction) -> Vec<Uuid> {
        let Some(start_idx) = self.index_map.get(&id) else {
            return vec![];
        };

        let mut result = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![*start_idx];

        while let Some(idx) = stack.pop() {
            for neighbor in self.inner.neighbors_directed(idx, direction) {
                if visited.insert(neighbor) {
                    result.push(self.inner[neighbor].id);
                    stack.push(neighbor);
                }
            }
        }

        result
    }

    /// Create a serializable snapshot of the graph
    pub fn snapshot(&self) -> GraphSnapshot {
        let ports = |specs: &[PortSpec]| -> Vec<PortSnapshot> {
            specs
                .iter()
                .map(|p| PortSnapshot {
                    name: p.name.to_string(),
                    kind: p.kind,
                })
                .collect()
        };

        let nodes = self
            .inner
            .node_weights()
            .map(|slot| NodeSnapshot {
                id: slot.id,
                name: slot.name.clone(),
                type_id: slot.ports.type_id.to_string(),
                inputs: ports(slot.ports.inputs),
                outputs: ports(slot.ports.outputs),
                exports: slot.exports.clone(),
            })
            .collect();

        let edges = self
            .inner
            .edge_references()
            .map(|e| {
                let source = &self.inner[e.source()];
                let dest = &self.inner[e.target()];
                EdgeSnapshot {
                    source_id: source.id,
                    source_port: source.ports.outputs[e.weight().source_port].name.to_string(),
                    dest_id: dest.id,
                    dest_port: dest.ports.inputs[e.weight().dest_port].name.to_string(),
                }
            })
            .collect();

        GraphSnapshot { nodes, edges }
    }

    // -------------------------------------------------------------------------
    // Scheduler access
    // -------------------------------------------------------------------------

    pub(crate) fn index_of(&self, id: Uuid) -> Option<NodeIndex> {
        self.index_map.get(&id).copied()
    }

    pub(crate) fn slot(&self, index: NodeIndex) -> &NodeSlot {
        &self.inner[index]
    }

    pub(crate) fn slot_mut(&mut self, index: NodeIndex) -> &mut NodeSlot {
        &mut self.inner[index]
    }

    pub(crate) fn slots_mut(&mut self) -> impl Iterator<Item = &mut NodeSlot> {
        self.inner.node_weights_mut()
    }

    pub(crate) fn slots(&self) -> impl Iterator<Item = &NodeSlot> {
        self.inner.node_weights()
    }

    /// Remember a failure unless an earlier one already aborted this tick.
    pub(crate) fn record_failure(&mut self, failure: &TickError) {
        if self.tick_failure.is_none() {
            self.tick_failure = Some(failure.clone());
        }
    }

    pub(crate) fn take_failure(&mut self) -> Option<TickError> {
        self.tick_failure.take()
    }

    /// Undo every output published during `tick`.
    pub(crate) fn roll_back(&mut self, tick: u64) {
        for slot in self.inner.node_weights_mut() {
            for out in &mut slot.outputs {
                if out.computed != Some(tick) {
                    continue;
                }
                if let Some((value, computed)) = out.prior.take() {
                    out.value = value;
                    out.computed = computed;
                }
            }
        }
    }

    /// The output feeding input port `input` of `index`, if connected
    pub(crate) fn source_of(&self, index: NodeIndex, input: usize) -> Option<(NodeIndex, usize)> {
        self.inner
            .edges_directed(index, Direction::Incoming)
            .find(|e| e.weight().dest_port == input)
            .map(|e| (e.source(), e.weight().source_port))
    }

    fn require(&self, id: Uuid) -> Result<NodeIndex, GraphError> {
        self.index_of(id).ok_or(GraphError::NodeNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Node, RenderError};
    use crate::scheduler::RenderCx;

    static SOURCE_PORTS: NodePorts = NodePorts {
        type_id: "test.source",
        inputs: &[],
        outputs: &[PortSpec::stream("out"), PortSpec::midi("notes")],
    };

    static SINK_PORTS: NodePorts = NodePorts {
        type_id: "test.sink",
        inputs: &[PortSpec::stream("in"), PortSpec::midi("notes")],
        outputs: &[PortSpec::stream("out")],
    };

    struct TestNode(&'static NodePorts);

    impl Node for TestNode {
        fn ports(&self) -> &'static NodePorts {
            self.0
        }

        fn render(&mut self, _cx: &mut RenderCx<'_>) -> Result<(), RenderError> {
            Ok(())
        }
    }

    fn source() -> BoxedNode {
        Box::new(TestNode(&SOURCE_PORTS))
    }

    fn sink() -> BoxedNode {
        Box::new(TestNode(&SINK_PORTS))
    }

    #[test]
    fn test_add_and_connect() {
        let mut graph = Graph::new();
        let a = graph.add_node("a", source()).unwrap();
        let b = graph.add_node("b", sink()).unwrap();

        graph.connect(a, "out", b, "in").unwrap();
        graph.connect(a, "notes", b, "notes").unwrap();

        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 2);
        assert_eq!(graph.upstream(b), vec![a]);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut graph = Graph::new();
        graph.add_node("a", source()).unwrap();
        let err = graph.add_node("a", sink()).unwrap_err();
        assert_eq!(err, GraphError::DuplicateName("a".into()));
    }

    #[test]
    fn test_kind_mismatch() {
        let mut graph = Graph::new();
        let a = graph.add_node("a", source()).unwrap();
        let b = graph.add_node("b", sink()).unwrap();

        let err = graph.connect(a, "notes", b, "in").unwrap_err();
        assert_eq!(
            err,
            GraphError::KindMismatch {
                output: PortKind::Midi,
                input: PortKind::Stream
            }
        );
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_port_not_found() {
        let mut graph = Graph::new();
        let a = graph.add_node("a", source()).unwrap();
        let b = graph.add_node("b", sink()).unwrap();

        let err = graph.connect(a, "missing", b, "in").unwrap_err();
        assert!(matches!(err, GraphError::PortNotFound { ref port, .. } if port == "missing"));
    }

    #[test]
    fn test_fan_in_rejected_fan_out_allowed() {
        let mut graph = Graph::new();
        let a = graph.add_node("a", source()).unwrap();
        let a2 = graph.add_node("a2", source()).unwrap();
        let b = graph.add_node("b", sink()).unwrap();
        let c = graph.add_node("c", sink()).unwrap();

        graph.connect(a, "out", b, "in").unwrap();
        graph.connect(a, "out", c, "in").unwrap();

        let err = graph.connect(a2, "out", b, "in").unwrap_err();
        assert!(matches!(err, GraphError::InputAlreadyConnected { .. }));
    }

    #[test]
    fn test_cycles_allowed() {
        let mut graph = Graph::new();
        let a = graph.add_node("a", sink()).unwrap();
        let b = graph.add_node("b", sink()).unwrap();

        graph.connect(a, "out", b, "in").unwrap();
        assert!(!graph.has_feedback());
        graph.connect(b, "out", a, "in").unwrap();
        assert!(graph.has_feedback());
    }

    #[test]
    fn test_disconnect_frees_input() {
        let mut graph = Graph::new();
        let a = graph.add_node("a", source()).unwrap();
        let a2 = graph.add_node("a2", source()).unwrap();
        let b = graph.add_node("b", sink()).unwrap();

        graph.connect(a, "out", b, "in").unwrap();
        assert!(graph.disconnect(b, "in"));
        assert!(!graph.disconnect(b, "in"));
        graph.connect(a2, "out", b, "in").unwrap();
    }

    #[test]
    fn test_remove_node() {
        let mut graph = Graph::new();
        let a = graph.add_node("a", source()).unwrap();
        let b = graph.add_node("b", sink()).unwrap();
        graph.connect(a, "out", b, "in").unwrap();

        assert!(graph.remove_node(a).is_some());
        assert_eq!(graph.edge_count(), 0);
        assert_eq!(graph.id_of("a"), None);
        assert!(graph.add_node("a", source()).is_ok());
    }

    #[test]
    fn test_snapshot_serializes() {
        let mut graph = Graph::new();
        let a = graph.add_node("a", source()).unwrap();
        let b = graph.add_node("b", sink()).unwrap();
        graph.connect_named("a", "out", "b", "in").unwrap();

        let snapshot = graph.snapshot();
        assert_eq!(snapshot.nodes.len(), 2);
        assert_eq!(snapshot.edges.len(), 1);
        assert_eq!(snapshot.edges[0].source_id, a);
        assert_eq!(snapshot.edges[0].dest_id, b);
        assert_eq!(snapshot.edges[0].dest_port, "in");

        let json = serde_json::to_string(&snapshot).unwrap();
        let back: GraphSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }
}
