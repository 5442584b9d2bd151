//! Node types by name, and patch construction
//!
//! Each registered type pairs its static port table with a factory. Patches
//! are checked against the port tables in full before any node is
//! constructed, so a typo in a connection never opens a device.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use synchroconf::{ConfigError, EngineConfig, NodeConfig, ParamValue, PatchConfig, PortRef};
use thiserror::Error;

use crate::bridge::{BridgeError, CaptureConsumer, PlaybackProducer, Smoother};
use crate::graph::{Graph, GraphError};
use crate::node::BoxedNode;
use crate::nodes::{self, Sensor};
use crate::primitives::{NodePorts, PortKind};
use crate::scheduler::Scheduler;

/// Patch mistakes caught before construction
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("node `{0}` is declared twice")]
    DuplicateNode(String),

    #[error("node `{node}` has unknown type `{type_name}`")]
    UnknownType { node: String, type_name: String },

    #[error("connection refers to undeclared node `{0}`")]
    UnknownNode(String),

    #[error("node `{node}` ({type_id}) has no {direction} port `{port}`")]
    UnknownPort {
        node: String,
        type_id: &'static str,
        direction: &'static str,
        port: String,
    },

    #[error("cannot connect {from} ({output}) to {to} ({input})")]
    KindMismatch {
        from: PortRef,
        to: PortRef,
        output: PortKind,
        input: PortKind,
    },

    #[error("input {0} is connected more than once")]
    InputConnectedTwice(PortRef),

    #[error("always_render names undeclared node `{0}`")]
    UnknownAlwaysRender(String),

    #[error(transparent)]
    Reference(#[from] ConfigError),
}

/// Failure to turn a patch into a running graph
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error("node `{node}`: parameter `{param}` {message}")]
    Param {
        node: String,
        param: String,
        message: String,
    },

    #[error("node `{node}` could not be constructed: {message}")]
    Construct { node: String, message: String },

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Typed access to one node's `[node.params]`
pub struct NodeParams<'a> {
    node: &'a str,
    params: &'a BTreeMap<String, ParamValue>,
}

impl<'a> NodeParams<'a> {
    pub fn new(node: &'a str, params: &'a BTreeMap<String, ParamValue>) -> Self {
        Self { node, params }
    }

    pub fn node(&self) -> &str {
        self.node
    }

    fn invalid(&self, param: &str, message: impl Into<String>) -> BuildError {
        BuildError::Param {
            node: self.node.to_string(),
            param: param.to_string(),
            message: message.into(),
        }
    }

    pub fn number_or(&self, key: &str, default: f64) -> Result<f64, BuildError> {
        match self.params.get(key) {
            None => Ok(default),
            Some(value) => value
                .as_f64()
                .ok_or_else(|| self.invalid(key, "must be a number")),
        }
    }

    pub fn text(&self, key: &str) -> Result<Option<&'a str>, BuildError> {
        match self.params.get(key) {
            None => Ok(None),
            Some(value) => value
                .as_str()
                .map(Some)
                .ok_or_else(|| self.invalid(key, "must be a string")),
        }
    }

    pub fn required_text(&self, key: &str) -> Result<&'a str, BuildError> {
        self.text(key)?
            .ok_or_else(|| self.invalid(key, "is required"))
    }

    /// Integer parameter within `range`
    pub fn integer_in(
        &self,
        key: &str,
        default: i64,
        range: std::ops::RangeInclusive<i64>,
    ) -> Result<i64, BuildError> {
        let value = self.number_or(key, default as f64)?;
        if value.fract() != 0.0 || !range.contains(&(value as i64)) {
            return Err(self.invalid(
                key,
                format!("must be a whole number in {}..={}", range.start(), range.end()),
            ));
        }
        Ok(value as i64)
    }

    pub fn millis_or(&self, key: &str, default: Duration) -> Result<Duration, BuildError> {
        let ms = self.number_or(key, default.as_millis() as f64)?;
        if ms < 0.0 || !ms.is_finite() {
            return Err(self.invalid(key, "must be a non-negative number of milliseconds"));
        }
        Ok(Duration::from_secs_f64(ms / 1000.0))
    }
}

/// Hardware endpoints a host hands to the patch builder by name.
///
/// Device nodes in a patch name the endpoint they want with a `device`
/// parameter; each endpoint can be claimed once. A playback node without a
/// `device` claims `"default"` if the host registered one, and otherwise
/// plays into a clocked null sink.
#[derive(Default)]
pub struct Devices {
    playback: HashMap<String, PlaybackProducer>,
    capture: HashMap<String, CaptureConsumer>,
    sensors: HashMap<String, Box<dyn Sensor>>,
}

impl Devices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_playback(&mut self, name: impl Into<String>, producer: PlaybackProducer) {
        self.playback.insert(name.into(), producer);
    }

    pub fn add_capture(&mut self, name: impl Into<String>, consumer: CaptureConsumer) {
        self.capture.insert(name.into(), consumer);
    }

    pub fn add_sensor(&mut self, name: impl Into<String>, sensor: Box<dyn Sensor>) {
        self.sensors.insert(name.into(), sensor);
    }

    pub fn take_playback(&mut self, name: &str) -> Option<PlaybackProducer> {
        self.playback.remove(name)
    }

    pub fn take_capture(&mut self, name: &str) -> Option<CaptureConsumer> {
        self.capture.remove(name)
    }

    pub fn take_sensor(&mut self, name: &str) -> Option<Box<dyn Sensor>> {
        self.sensors.remove(name)
    }
}

/// What a factory gets besides its params
pub struct BuildContext<'a> {
    pub engine: &'a EngineConfig,
    pub devices: &'a mut Devices,
}

pub type Factory =
    Box<dyn Fn(&NodeParams<'_>, &mut BuildContext<'_>) -> Result<BoxedNode, BuildError> + Send + Sync>;

struct Registration {
    ports: &'static NodePorts,
    factory: Factory,
}

/// Node types known to the patch builder, keyed by `type_id`.
#[derive(Default)]
pub struct NodeRegistry {
    types: BTreeMap<&'static str, Registration>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the reference node library
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        register_builtin(&mut registry);
        registry
    }

    /// Register a type under its port table's `type_id`. A later
    /// registration for the same type replaces the earlier one.
    pub fn register<F>(&mut self, ports: &'static NodePorts, factory: F)
    where
        F: Fn(&NodeParams<'_>, &mut BuildContext<'_>) -> Result<BoxedNode, BuildError>
            + Send
            + Sync
            + 'static,
    {
        self.types.insert(
            ports.type_id,
            Registration {
                ports,
                factory: Box::new(factory),
            },
        );
    }

    pub fn ports(&self, type_name: &str) -> Option<&'static NodePorts> {
        self.types.get(type_name).map(|r| r.ports)
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    pub fn type_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.types.keys().copied()
    }

    /// Every registered port table, for `--describe` style listings
    pub fn describe(&self) -> Vec<&'static NodePorts> {
        self.types.values().map(|r| r.ports).collect()
    }

    pub fn build(
        &self,
        config: &NodeConfig,
        cx: &mut BuildContext<'_>,
    ) -> Result<BoxedNode, BuildError> {
        let registration = self.types.get(config.type_name.as_str()).ok_or_else(|| {
            PatchError::UnknownType {
                node: config.name.clone(),
                type_name: config.type_name.clone(),
            }
        })?;
        let params = NodeParams::new(&config.name, &config.params);
        (registration.factory)(&params, cx)
    }

    /// Check a patch against the registered port tables without building it.
    pub fn validate(&self, patch: &PatchConfig) -> Result<(), PatchError> {
        let mut declared: HashMap<&str, &'static NodePorts> = HashMap::new();
        for node in &patch.nodes {
            let ports = self
                .ports(&node.type_name)
                .ok_or_else(|| PatchError::UnknownType {
                    node: node.name.clone(),
                    type_name: node.type_name.clone(),
                })?;
            if declared.insert(node.name.as_str(), ports).is_some() {
                return Err(PatchError::DuplicateNode(node.name.clone()));
            }
        }

        let lookup = |reference: &PortRef| {
            declared
                .get(reference.node.as_str())
                .copied()
                .ok_or_else(|| PatchError::UnknownNode(reference.node.clone()))
        };

        let mut fed: HashSet<(String, String)> = HashSet::new();
        for connection in &patch.connections {
            let from = PortRef::parse(&connection.from)?;
            let to = PortRef::parse(&connection.to)?;
            let source = lookup(&from)?;
            let dest = lookup(&to)?;

            let output = source
                .output(&from.port)
                .ok_or_else(|| PatchError::UnknownPort {
                    node: from.node.clone(),
                    type_id: source.type_id,
                    direction: "output",
                    port: from.port.clone(),
                })?
                .kind;
            let input = dest
                .input(&to.port)
                .ok_or_else(|| PatchError::UnknownPort {
                    node: to.node.clone(),
                    type_id: dest.type_id,
                    direction: "input",
                    port: to.port.clone(),
                })?
                .kind;

            if output != input {
                return Err(PatchError::KindMismatch {
                    from,
                    to,
                    output,
                    input,
                });
            }
            if !fed.insert((to.node.clone(), to.port.clone())) {
                return Err(PatchError::InputConnectedTwice(to));
            }
        }

        for name in &patch.always_render {
            if !declared.contains_key(name.as_str()) {
                return Err(PatchError::UnknownAlwaysRender(name.clone()));
            }
        }
        Ok(())
    }
}

/// Build a scheduler from a patch with no host devices attached.
pub fn build_patch(
    registry: &NodeRegistry,
    patch: &PatchConfig,
    engine: &EngineConfig,
) -> Result<Scheduler, BuildError> {
    build_patch_with_devices(registry, patch, engine, &mut Devices::new())
}

/// Build a scheduler from a patch.
///
/// The whole patch is validated first. If any later step fails, every node
/// already constructed is torn down before the error is returned. With an
/// empty `always_render`, every node without outputs is a sink and is
/// rendered each tick.
pub fn build_patch_with_devices(
    registry: &NodeRegistry,
    patch: &PatchConfig,
    engine: &EngineConfig,
    devices: &mut Devices,
) -> Result<Scheduler, BuildError> {
    registry.validate(patch)?;

    // Nodes go straight into the scheduler's graph, so a failed build can
    // tear down whatever was constructed.
    let mut scheduler = Scheduler::new(Graph::new(), engine.sample_rate, engine.buffer_size)?;
    let sinks = match assemble(registry, patch, engine, devices, &mut scheduler) {
        Ok(sinks) => sinks,
        Err(e) => {
            tracing::error!("patch build failed: {}", e);
            let report = scheduler.teardown();
            tracing::debug!(nodes = report.nodes, "partial build torn down");
            return Err(e);
        }
    };

    tracing::info!(
        nodes = patch.nodes.len(),
        connections = patch.connections.len(),
        always_render = ?sinks,
        feedback = scheduler.graph().has_feedback(),
        "patch built"
    );
    Ok(scheduler)
}

fn assemble(
    registry: &NodeRegistry,
    patch: &PatchConfig,
    engine: &EngineConfig,
    devices: &mut Devices,
    scheduler: &mut Scheduler,
) -> Result<Vec<String>, BuildError> {
    let mut cx = BuildContext { engine, devices };
    for config in &patch.nodes {
        if scheduler.graph().id_of(&config.name).is_some() {
            return Err(PatchError::DuplicateNode(config.name.clone()).into());
        }
        let node = registry.build(config, &mut cx)?;
        scheduler.graph_mut().add_node(config.name.as_str(), node)?;
    }

    for connection in &patch.connections {
        let from = PortRef::parse(&connection.from).map_err(PatchError::from)?;
        let to = PortRef::parse(&connection.to).map_err(PatchError::from)?;
        scheduler
            .graph_mut()
            .connect_named(&from.node, &from.port, &to.node, &to.port)?;
    }

    let sinks: Vec<String> = if patch.always_render.is_empty() {
        patch
            .nodes
            .iter()
            .filter(|n| registry.ports(&n.type_name).is_some_and(|p| p.outputs.is_empty()))
            .map(|n| n.name.clone())
            .collect()
    } else {
        patch.always_render.clone()
    };
    for name in &sinks {
        let id = scheduler
            .graph()
            .id_of(name)
            .ok_or_else(|| GraphError::NodeNameNotFound(name.clone()))?;
        scheduler.always_render(id)?;
    }
    for id in scheduler.idle_nodes() {
        let name = scheduler.graph().name_of(id).unwrap_or_default();
        tracing::warn!(node = %name, "node is not upstream of any always-render node and will never render");
    }
    Ok(sinks)
}

fn construct(node: &str) -> impl Fn(BridgeError) -> BuildError + '_ {
    move |e| BuildError::Construct {
        node: node.to_string(),
        message: e.to_string(),
    }
}

#[cfg(any(feature = "midi-input", feature = "soundfont"))]
fn construct_node(node: &str) -> impl Fn(crate::node::NodeError) -> BuildError + '_ {
    move |e| BuildError::Construct {
        node: node.to_string(),
        message: e.to_string(),
    }
}

fn frequency(params: &NodeParams<'_>) -> Result<f32, BuildError> {
    Ok(params.number_or("frequency", 440.0)? as f32)
}

fn register_builtin(registry: &mut NodeRegistry) {
    registry.register(&nodes::SILENCE_PORTS, |_, _| Ok(Box::new(nodes::SilenceNode)));
    registry.register(&nodes::CONSTANT_PORTS, |p, _| {
        Ok(Box::new(nodes::ConstantNode::new(p.number_or("value", 0.0)?)))
    });
    registry.register(&nodes::SINE_PORTS, |p, _| {
        Ok(Box::new(nodes::SineNode::new(frequency(p)?)))
    });
    registry.register(&nodes::SQUARE_PORTS, |p, _| {
        Ok(Box::new(nodes::SquareNode::new(frequency(p)?)))
    });
    registry.register(&nodes::SAWTOOTH_PORTS, |p, _| {
        Ok(Box::new(nodes::SawtoothNode::new(frequency(p)?)))
    });
    registry.register(&nodes::BITCRUSH_PORTS, |_, _| Ok(Box::new(nodes::BitcrushNode)));

    registry.register(&nodes::MIDI_HOLD_PORTS, |_, _| {
        Ok(Box::new(nodes::MidiHoldNode))
    });
    registry.register(&nodes::MIDI_TRANSPOSE_PORTS, |_, _| {
        Ok(Box::new(nodes::MidiTransposeNode))
    });
    registry.register(&nodes::MIDI_TRIGGER_PORTS, |_, _| {
        Ok(Box::new(nodes::MidiTriggerNode))
    });
    registry.register(&nodes::MIDI_STRUM_PORTS, |_, _| {
        Ok(Box::new(nodes::MidiStrumNode::default()))
    });
    registry.register(&nodes::MIDI_LOOP_PORTS, |_, _| {
        Ok(Box::new(nodes::MidiLoopNode::default()))
    });
    registry.register(&nodes::MONOPHONIC_RENDER_PORTS, |_, _| {
        Ok(Box::new(nodes::MonophonicRenderNode::default()))
    });

    registry.register(&nodes::CHORD_PORTS, |p, _| {
        let progression = p.required_text("progression")?;
        let octave = p.integer_in("octave", nodes::ChordNode::DEFAULT_OCTAVE as i64, -1..=9)?;
        let velocity = p.integer_in(
            "velocity",
            nodes::ChordNode::DEFAULT_VELOCITY as i64,
            1..=127,
        )?;
        let node = nodes::ChordNode::new(progression, octave as i32, velocity as u8).map_err(
            |e| BuildError::Param {
                node: p.node().to_string(),
                param: "progression".to_string(),
                message: e.to_string(),
            },
        )?;
        Ok(Box::new(node))
    });

    registry.register(&nodes::PLAYBACK_PORTS, |p, cx| {
        let node = match p.text("device")? {
            Some(device) => {
                let producer = cx.devices.take_playback(device).ok_or_else(|| {
                    BuildError::Construct {
                        node: p.node().to_string(),
                        message: format!("no playback device named `{}`", device),
                    }
                })?;
                nodes::PlaybackNode::new(producer, device)
            }
            None => match cx.devices.take_playback("default") {
                Some(producer) => nodes::PlaybackNode::new(producer, "default"),
                None => nodes::PlaybackNode::clocked(
                    cx.engine.buffer_period(),
                    cx.engine.buffer_size,
                    cx.engine.playback_queue_buffers,
                )
                .map_err(construct(p.node()))?,
            },
        };
        Ok(Box::new(
            node.with_teardown_timeout(cx.engine.teardown_timeout()),
        ))
    });

    registry.register(&nodes::RECORDING_PORTS, |p, cx| {
        let device = p.text("device")?.unwrap_or("default");
        let consumer = cx
            .devices
            .take_capture(device)
            .ok_or_else(|| BuildError::Construct {
                node: p.node().to_string(),
                message: format!("no capture device named `{}`", device),
            })?;
        Ok(Box::new(
            nodes::RecordingNode::new(consumer, device).with_timeout(cx.engine.capture_timeout()),
        ))
    });

    registry.register(&nodes::WAV_FILE_PORTS, |p, cx| {
        let path = p.text("path")?.unwrap_or(nodes::WavFileNode::DEFAULT_PATH);
        let path = synchroconf::loader::expand_path(path);
        let node = nodes::WavFileNode::create(&path, cx.engine.sample_rate)
            .map_err(|e| BuildError::Construct {
                node: p.node().to_string(),
                message: format!("{}: {}", path.display(), e),
            })?;
        Ok(Box::new(node))
    });

    registry.register(&nodes::SENSOR_PORTS, |p, cx| {
        let device = p.required_text("device")?;
        let sensor = cx
            .devices
            .take_sensor(device)
            .ok_or_else(|| BuildError::Construct {
                node: p.node().to_string(),
                message: format!("no sensor named `{}`", device),
            })?;
        let interval = p.millis_or("poll_interval_ms", Duration::from_millis(10))?;
        let smoothing = p.millis_or("smoothing_ms", cx.engine.smoothing_time_constant())?;
        let smoother = Smoother::new(smoothing, cx.engine.sample_rate);
        let node = nodes::SensorNode::spawn(p.node(), sensor, interval, smoother)
            .map_err(construct(p.node()))?;
        Ok(Box::new(
            node.with_teardown_timeout(cx.engine.teardown_timeout()),
        ))
    });

    registry.register(&nodes::EVENT_TRIGGER_PORTS, |p, cx| {
        let mut source = nodes::LineEventSource::new(p.required_text("address")?);
        if let Some(line) = p.text("subscribe")? {
            source = source.with_subscribe(line);
        }
        let backoff = p.millis_or("reconnect_backoff_ms", cx.engine.reconnect_backoff())?;
        let node = nodes::EventTriggerNode::spawn(p.node(), source, backoff)
            .map_err(construct(p.node()))?;
        Ok(Box::new(
            node.with_teardown_timeout(cx.engine.teardown_timeout()),
        ))
    });

    #[cfg(feature = "midi-input")]
    registry.register(&nodes::MIDI_INPUT_PORTS, |p, _| {
        let port = p.required_text("port")?;
        let node = nodes::MidiInputNode::open(port).map_err(construct_node(p.node()))?;
        Ok(Box::new(node))
    });

    #[cfg(feature = "soundfont")]
    registry.register(&nodes::SOUNDFONT_PORTS, |p, cx| {
        let path = synchroconf::loader::expand_path(p.required_text("path")?);
        let node = nodes::SoundFontNode::load(&path, cx.engine.sample_rate)
            .map_err(construct_node(p.node()))?;
        Ok(Box::new(node))
    });
}
