//! Render engine
//!
//! Pull-based, memoized evaluation. Each tick the scheduler asks the
//! always-render set for their outputs; every input read pulls its upstream
//! node on demand. A node renders at most once per tick no matter how many
//! readers it has.
//!
//! Feedback: reading from a node that is still rendering (a cycle) yields
//! that node's output from the previous tick, or the reader's default before
//! the first tick completes. No recursion happens.

use std::collections::HashSet;
use std::sync::Arc;

use petgraph::stable_graph::NodeIndex;
use thiserror::Error;
use uuid::Uuid;

use crate::graph::{EvalState, Graph, GraphError};
use crate::midi::MidiBuffer;
use crate::node::{ErrorKind, NodeError, RenderError};
use crate::primitives::{DataValue, Exports, PortKind, PortValue, RenderContext, Stream};

/// A tick aborted because a node failed to render.
#[derive(Debug, Clone, Error)]
#[error("node `{node}` ({type_id}) failed in tick {tick}: {error}")]
pub struct TickError {
    pub node: String,
    pub type_id: &'static str,
    pub tick: u64,
    #[source]
    pub error: RenderError,
}

impl TickError {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

/// Outcome of one successful tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
    pub nodes_rendered: usize,
}

/// Outcome of tearing the graph down
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub nodes: usize,
    pub failures: Vec<(String, NodeError)>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Drives a [`Graph`] one tick at a time.
pub struct Scheduler {
    graph: Graph,
    ctx: RenderContext,
    always_render: Vec<Uuid>,
    torn_down: bool,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("ctx", &self.ctx)
            .field("always_render", &self.always_render)
            .field("torn_down", &self.torn_down)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(graph: Graph, sample_rate: u32, buffer_size: usize) -> Result<Self, GraphError> {
        if sample_rate == 0 || buffer_size == 0 {
            return Err(GraphError::InvalidContext {
                sample_rate,
                buffer_size,
            });
        }

        Ok(Self {
            graph,
            ctx: RenderContext::new(sample_rate, buffer_size),
            always_render: Vec::new(),
            torn_down: false,
        })
    }

    /// Add a node to the set rendered every tick
    pub fn always_render(&mut self, id: Uuid) -> Result<(), GraphError> {
        if !self.graph.contains(id) {
            return Err(GraphError::NodeNotFound(id));
        }
        if !self.always_render.contains(&id) {
            self.always_render.push(id);
        }
        Ok(())
    }

    /// Context the next tick will render with
    pub fn context(&self) -> RenderContext {
        self.ctx
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Mutable graph access between ticks
    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    /// Nodes no tick will render: neither in the always-render set nor
    /// upstream of it.
    pub fn idle_nodes(&self) -> Vec<Uuid> {
        let mut reached: HashSet<Uuid> = self.always_render.iter().copied().collect();
        for &id in &self.always_render {
            reached.extend(self.graph.upstream(id));
        }
        self.graph
            .node_ids()
            .into_iter()
            .filter(|id| !reached.contains(id))
            .collect()
    }

    pub fn exports(&self, id: Uuid) -> Option<&Exports> {
        self.graph.exports(id)
    }

    pub fn output(&self, id: Uuid, port: &str) -> Option<&PortValue> {
        self.graph.output(id, port)
    }

    /// Render one tick.
    ///
    /// The tick counter advances even when the tick fails, so a driver that
    /// skips failures keeps stream time moving.
    ///
    /// Any node failing aborts the tick, even if every reader tolerated the
    /// error. Outputs published earlier in an aborted tick are rolled back.
    pub fn render_tick(&mut self) -> Result<TickReport, TickError> {
        let ctx = self.ctx;
        self.ctx.tick += 1;

        for id in &self.always_render {
            let Some(index) = self.graph.index_of(*id) else {
                continue;
            };
            if evaluate(&mut self.graph, index, &ctx).is_err() {
                break;
            }
        }

        if let Some(e) = self.graph.take_failure() {
            self.graph.roll_back(ctx.tick);
            tracing::error!(
                node = %e.node,
                tick = ctx.tick,
                kind = %e.kind(),
                "tick aborted: {}",
                e.error
            );
            return Err(e);
        }

        let nodes_rendered = self
            .graph
            .slots()
            .filter(|slot| slot.state == EvalState::Done(ctx.tick))
            .count();

        tracing::trace!(tick = ctx.tick, nodes_rendered, "tick complete");
        Ok(TickReport {
            tick: ctx.tick,
            nodes_rendered,
        })
    }

    /// Tear down every node exactly once. Later calls do nothing.
    pub fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.torn_down {
            return report;
        }
        self.torn_down = true;

        for slot in self.graph.slots_mut() {
            let Some(node) = slot.node.as_mut() else {
                continue;
            };
            report.nodes += 1;
            if let Err(e) = node.teardown() {
                tracing::error!(node = %slot.name, "teardown failed: {}", e);
                report.failures.push((slot.name.clone(), e));
            }
        }

        tracing::debug!(
            nodes = report.nodes,
            failures = report.failures.len(),
            "graph torn down"
        );
        report
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.torn_down {
            self.teardown();
        }
    }
}

/// Render `index` for `ctx.tick` unless it already has, or is rendering now.
pub(crate) fn evaluate(
    graph: &mut Graph,
    index: NodeIndex,
    ctx: &RenderContext,
) -> Result<(), TickError> {
    let slot = graph.slot_mut(index);
    match slot.state {
        EvalState::Done(tick) if tick == ctx.tick => return Ok(()),
        EvalState::Failed(tick) if tick == ctx.tick => {
            if let Some(failure) = &slot.failure {
                return Err(failure.clone());
            }
        }
        EvalState::Evaluating => {
            tracing::trace!(node = %slot.name, tick = ctx.tick, "feedback read, using previous tick");
            return Ok(());
        }
        _ => {}
    }

    let Some(mut node) = slot.node.take() else {
        return Ok(());
    };
    slot.state = EvalState::Evaluating;
    let output_count = slot.outputs.len();

    let mut cx = RenderCx {
        graph: &mut *graph,
        ctx,
        index,
        pending: vec![None; output_count],
    };
    let result = node.render(&mut cx);
    let pending = cx.pending;

    let slot = graph.slot_mut(index);
    match result {
        Ok(()) => {
            for (port, (out, value)) in slot.outputs.iter_mut().zip(pending).enumerate() {
                let value = match value {
                    Some(v) => v,
                    None => {
                        let spec = &slot.ports.outputs[port];
                        tracing::trace!(node = %slot.name, port = spec.name, "output not written");
                        match spec.kind {
                            PortKind::Stream => {
                                PortValue::Stream(vec![0.0; ctx.buffer_size].into())
                            }
                            PortKind::Midi => {
                                PortValue::Midi(Arc::new(MidiBuffer::new(ctx.buffer_size)))
                            }
                            PortKind::Data => {
                                out.prior = Some((out.value.clone(), out.computed));
                                out.computed = Some(ctx.tick);
                                continue;
                            }
                        }
                    }
                };
                out.prior = Some((out.value.replace(value), out.computed));
                out.computed = Some(ctx.tick);
            }
            node.export(&mut slot.exports);
            slot.node = Some(node);
            slot.state = EvalState::Done(ctx.tick);
            Ok(())
        }
        Err(error) => {
            let failure = match error {
                RenderError::Upstream(inner) => *inner,
                error => TickError {
                    node: slot.name.clone(),
                    type_id: slot.ports.type_id,
                    tick: ctx.tick,
                    error,
                },
            };
            slot.node = Some(node);
            slot.state = EvalState::Failed(ctx.tick);
            slot.failure = Some(failure.clone());
            graph.record_failure(&failure);
            Err(failure)
        }
    }
}

/// Handle a node renders through: reads inputs (pulling upstream nodes on
/// demand) and stages outputs, which are published when `render` returns.
pub struct RenderCx<'a> {
    graph: &'a mut Graph,
    ctx: &'a RenderContext,
    index: NodeIndex,
    pending: Vec<Option<PortValue>>,
}

impl<'a> RenderCx<'a> {
    pub fn context(&self) -> &RenderContext {
        self.ctx
    }

    pub fn sample_rate(&self) -> u32 {
        self.ctx.sample_rate
    }

    pub fn buffer_size(&self) -> usize {
        self.ctx.buffer_size
    }

    pub fn tick(&self) -> u64 {
        self.ctx.tick
    }

    /// Name the rendering node was added under
    pub fn node_name(&self) -> &str {
        &self.graph.slot(self.index).name
    }

    pub fn is_connected(&self, port: &str) -> bool {
        let slot = self.graph.slot(self.index);
        slot.ports
            .input_index(port)
            .map(|input| self.graph.source_of(self.index, input).is_some())
            .unwrap_or(false)
    }

    /// Stream input, or silence when unconnected
    pub fn read_stream(&mut self, port: &str) -> Result<Stream, RenderError> {
        self.read_stream_or(port, 0.0)
    }

    /// Stream input, or `buffer_size` copies of `default` when unconnected
    /// or when a feedback read finds nothing published yet
    pub fn read_stream_or(&mut self, port: &str, default: f32) -> Result<Stream, RenderError> {
        match self.pull(port, PortKind::Stream)? {
            Some(PortValue::Stream(s)) => Ok(s),
            _ => Ok(vec![default; self.ctx.buffer_size].into()),
        }
    }

    /// MIDI input, or an empty buffer when unconnected
    pub fn read_midi(&mut self, port: &str) -> Result<Arc<MidiBuffer>, RenderError> {
        match self.pull(port, PortKind::Midi)? {
            Some(PortValue::Midi(m)) => Ok(m),
            _ => Ok(Arc::new(MidiBuffer::new(self.ctx.buffer_size))),
        }
    }

    /// Upstream's last published data value, if any
    pub fn read_data(&mut self, port: &str) -> Result<Option<DataValue>, RenderError> {
        match self.pull(port, PortKind::Data)? {
            Some(PortValue::Data(d)) => Ok(Some(d)),
            _ => Ok(None),
        }
    }

    pub fn read_data_or(
        &mut self,
        port: &str,
        default: impl Into<DataValue>,
    ) -> Result<DataValue, RenderError> {
        Ok(self.read_data(port)?.unwrap_or_else(|| default.into()))
    }

    /// Numeric data input with a fallback for unconnected or non-numeric values
    pub fn read_number_or(&mut self, port: &str, default: f64) -> Result<f64, RenderError> {
        Ok(self
            .read_data(port)?
            .and_then(|v| v.as_f64())
            .unwrap_or(default))
    }

    /// Publish a stream output. A second write in the same render overwrites.
    pub fn write_stream(&mut self, port: &str, samples: impl Into<Stream>) -> Result<(), RenderError> {
        let samples: Stream = samples.into();
        if samples.len() != self.ctx.buffer_size {
            return Err(RenderError::BufferLength {
                port: port.to_string(),
                expected: self.ctx.buffer_size,
                got: samples.len(),
            });
        }
        self.stage(port, PortValue::Stream(samples))
    }

    /// Publish a MIDI output. The buffer must span exactly `buffer_size`.
    pub fn write_midi(&mut self, port: &str, buffer: MidiBuffer) -> Result<(), RenderError> {
        if buffer.len() != self.ctx.buffer_size {
            return Err(RenderError::BufferLength {
                port: port.to_string(),
                expected: self.ctx.buffer_size,
                got: buffer.len(),
            });
        }
        self.stage(port, PortValue::Midi(Arc::new(buffer)))
    }

    pub fn write_data(&mut self, port: &str, value: impl Into<DataValue>) -> Result<(), RenderError> {
        self.stage(port, PortValue::Data(value.into()))
    }

    fn stage(&mut self, port: &str, value: PortValue) -> Result<(), RenderError> {
        let ports = self.graph.slot(self.index).ports;
        let index = ports
            .output_index(port)
            .ok_or_else(|| RenderError::UnknownPort {
                direction: "output",
                port: port.to_string(),
            })?;
        let actual = ports.outputs[index].kind;
        if actual != value.kind() {
            return Err(RenderError::WrongKind {
                port: port.to_string(),
                requested: value.kind(),
                actual,
            });
        }
        self.pending[index] = Some(value);
        Ok(())
    }

    fn pull(&mut self, port: &str, kind: PortKind) -> Result<Option<PortValue>, RenderError> {
        let ports = self.graph.slot(self.index).ports;
        let input = ports
            .input_index(port)
            .ok_or_else(|| RenderError::UnknownPort {
                direction: "input",
                port: port.to_string(),
            })?;
        let actual = ports.inputs[input].kind;
        if actual != kind {
            return Err(RenderError::WrongKind {
                port: port.to_string(),
                requested: kind,
                actual,
            });
        }

        let Some((source, output)) = self.graph.source_of(self.index, input) else {
            return Ok(None);
        };

        evaluate(self.graph, source, self.ctx).map_err(|e| RenderError::Upstream(Box::new(e)))?;

        Ok(self.graph.slot(source).outputs[output].value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{BoxedNode, Node};
    use crate::primitives::{NodePorts, PortSpec};
    use std::sync::atomic::{AtomicUsize, Ordering};

    static GEN_PORTS: NodePorts = NodePorts {
        type_id: "test.counter",
        inputs: &[],
        outputs: &[PortSpec::stream("out"), PortSpec::data("count")],
    };

    static PASS_PORTS: NodePorts = NodePorts {
        type_id: "test.pass",
        inputs: &[PortSpec::stream("in")],
        outputs: &[PortSpec::stream("out")],
    };

    /// Writes the tick number as a constant stream and counts renders.
    struct Counter {
        renders: Arc<AtomicUsize>,
    }

    impl Node for Counter {
        fn ports(&self) -> &'static NodePorts {
            &GEN_PORTS
        }

        fn render(&mut self, cx: &mut RenderCx<'_>) -> Result<(), RenderError> {
            let n = self.renders.fetch_add(1, Ordering::SeqCst) + 1;
            cx.write_stream("out", vec![cx.tick() as f32; cx.buffer_size()])?;
            cx.write_data("count", n as f64)?;
            Ok(())
        }

        fn export(&self, exports: &mut Exports) {
            exports.set("renders", self.renders.load(Ordering::SeqCst) as f64);
        }
    }

    /// Adds one to its input.
    struct Pass;

    impl Node for Pass {
        fn ports(&self) -> &'static NodePorts {
            &PASS_PORTS
        }

        fn render(&mut self, cx: &mut RenderCx<'_>) -> Result<(), RenderError> {
            let input = cx.read_stream_or("in", -1.0)?;
            let out: Vec<f32> = input.iter().map(|x| x + 1.0).collect();
            cx.write_stream("out", out)
        }
    }

    /// Writes a buffer of the wrong length.
    struct Broken;

    impl Node for Broken {
        fn ports(&self) -> &'static NodePorts {
            &GEN_PORTS
        }

        fn render(&mut self, cx: &mut RenderCx<'_>) -> Result<(), RenderError> {
            cx.write_stream("out", vec![0.0; cx.buffer_size() + 1])
        }
    }

    fn counter() -> (BoxedNode, Arc<AtomicUsize>) {
        let renders = Arc::new(AtomicUsize::new(0));
        (
            Box::new(Counter {
                renders: renders.clone(),
            }),
            renders,
        )
    }

    fn stream_of(scheduler: &Scheduler, id: Uuid, port: &str) -> Vec<f32> {
        scheduler
            .output(id, port)
            .and_then(|v| v.as_stream())
            .map(|s| s.to_vec())
            .unwrap()
    }

    #[test]
    fn test_rejects_zero_context() {
        assert!(Scheduler::new(Graph::new(), 0, 64).is_err());
        assert!(Scheduler::new(Graph::new(), 48000, 0).is_err());
    }

    #[test]
    fn test_unreached_nodes_do_not_render() {
        let mut graph = Graph::new();
        let (node, renders) = counter();
        let idle = graph.add_node("idle", node).unwrap();

        let mut scheduler = Scheduler::new(graph, 48000, 4).unwrap();
        assert_eq!(scheduler.idle_nodes(), vec![idle]);
        let report = scheduler.render_tick().unwrap();
        assert_eq!(report.nodes_rendered, 0);
        assert_eq!(renders.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_chain_pulls_upstream() {
        let mut graph = Graph::new();
        let (node, renders) = counter();
        let src = graph.add_node("src", node).unwrap();
        let pass = graph.add_node("pass", Box::new(Pass)).unwrap();
        graph.connect(src, "out", pass, "in").unwrap();

        let mut scheduler = Scheduler::new(graph, 48000, 4).unwrap();
        scheduler.always_render(pass).unwrap();

        scheduler.render_tick().unwrap();
        assert_eq!(stream_of(&scheduler, pass, "out"), vec![1.0; 4]);
        let report = scheduler.render_tick().unwrap();
        assert_eq!(report.tick, 1);
        assert_eq!(report.nodes_rendered, 2);
        assert_eq!(stream_of(&scheduler, pass, "out"), vec![2.0; 4]);
        assert_eq!(renders.load(Ordering::SeqCst), 2);
        assert_eq!(
            scheduler.exports(src).unwrap().get("renders"),
            Some(&crate::primitives::ExportValue::Number(2.0))
        );
    }

    #[test]
    fn test_self_feedback_sees_previous_tick() {
        let mut graph = Graph::new();
        let pass = graph.add_node("loop", Box::new(Pass)).unwrap();
        graph.connect(pass, "out", pass, "in").unwrap();

        let mut scheduler = Scheduler::new(graph, 48000, 2).unwrap();
        scheduler.always_render(pass).unwrap();

        // Tick 0 reads the default (-1), later ticks read their own last output.
        scheduler.render_tick().unwrap();
        assert_eq!(stream_of(&scheduler, pass, "out"), vec![0.0; 2]);
        scheduler.render_tick().unwrap();
        assert_eq!(stream_of(&scheduler, pass, "out"), vec![1.0; 2]);
        scheduler.render_tick().unwrap();
        assert_eq!(stream_of(&scheduler, pass, "out"), vec![2.0; 2]);
    }

    #[test]
    fn test_error_carries_failing_node() {
        let mut graph = Graph::new();
        let broken = graph.add_node("broken", Box::new(Broken)).unwrap();
        let pass = graph.add_node("pass", Box::new(Pass)).unwrap();
        graph.connect(broken, "out", pass, "in").unwrap();

        let mut scheduler = Scheduler::new(graph, 48000, 4).unwrap();
        scheduler.always_render(pass).unwrap();

        let err = scheduler.render_tick().unwrap_err();
        assert_eq!(err.node, "broken");
        assert_eq!(err.type_id, "test.counter");
        assert_eq!(err.tick, 0);
        assert_eq!(err.kind(), ErrorKind::Port);
        assert!(matches!(err.error, RenderError::BufferLength { expected: 4, got: 5, .. }));
        assert!(scheduler.output(pass, "out").is_none());

        // Tick counter still advances.
        assert_eq!(scheduler.context().tick, 1);
    }

    #[test]
    fn test_unknown_port_is_error() {
        static BAD_PORTS: NodePorts = NodePorts {
            type_id: "test.bad",
            inputs: &[],
            outputs: &[],
        };

        struct Bad;
        impl Node for Bad {
            fn ports(&self) -> &'static NodePorts {
                &BAD_PORTS
            }
            fn render(&mut self, cx: &mut RenderCx<'_>) -> Result<(), RenderError> {
                cx.read_stream("nope")?;
                Ok(())
            }
        }

        let mut graph = Graph::new();
        let bad = graph.add_node("bad", Box::new(Bad)).unwrap();
        let mut scheduler = Scheduler::new(graph, 48000, 4).unwrap();
        scheduler.always_render(bad).unwrap();

        let err = scheduler.render_tick().unwrap_err();
        assert!(matches!(err.error, RenderError::UnknownPort { direction: "input", .. }));
    }

    #[test]
    fn test_unwritten_outputs() {
        static QUIET_PORTS: NodePorts = NodePorts {
            type_id: "test.quiet",
            inputs: &[],
            outputs: &[
                PortSpec::stream("audio"),
                PortSpec::midi("notes"),
                PortSpec::data("value"),
            ],
        };

        struct Quiet {
            ticks: u32,
        }
        impl Node for Quiet {
            fn ports(&self) -> &'static NodePorts {
                &QUIET_PORTS
            }
            fn render(&mut self, cx: &mut RenderCx<'_>) -> Result<(), RenderError> {
                if self.ticks == 0 {
                    cx.write_data("value", 7.0)?;
                }
                self.ticks += 1;
                Ok(())
            }
        }

        let mut graph = Graph::new();
        let quiet = graph.add_node("quiet", Box::new(Quiet { ticks: 0 })).unwrap();
        let mut scheduler = Scheduler::new(graph, 48000, 3).unwrap();
        scheduler.always_render(quiet).unwrap();

        scheduler.render_tick().unwrap();
        scheduler.render_tick().unwrap();

        assert_eq!(stream_of(&scheduler, quiet, "audio"), vec![0.0; 3]);
        let midi = scheduler.output(quiet, "notes").unwrap().as_midi().unwrap();
        assert!(midi.is_empty());
        assert_eq!(
            scheduler.output(quiet, "value").unwrap().as_data(),
            Some(&DataValue::Number(7.0))
        );
        assert_eq!(scheduler.graph().output_tick(quiet, "value"), Some(1));
    }

    #[test]
    fn test_teardown_once() {
        static PORTS: NodePorts = NodePorts {
            type_id: "test.teardown",
            inputs: &[],
            outputs: &[],
        };

        struct Counted(Arc<AtomicUsize>);
        impl Node for Counted {
            fn ports(&self) -> &'static NodePorts {
                &PORTS
            }
            fn render(&mut self, _cx: &mut RenderCx<'_>) -> Result<(), RenderError> {
                Ok(())
            }
            fn teardown(&mut self) -> Result<(), NodeError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let count = Arc::new(AtomicUsize::new(0));
        let mut graph = Graph::new();
        graph.add_node("a", Box::new(Counted(count.clone()))).unwrap();
        graph.add_node("b", Box::new(Counted(count.clone()))).unwrap();

        let mut scheduler = Scheduler::new(graph, 48000, 4).unwrap();
        let report = scheduler.teardown();
        assert_eq!(report.nodes, 2);
        assert!(report.is_clean());
        assert_eq!(scheduler.teardown().nodes, 0);
        drop(scheduler);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
