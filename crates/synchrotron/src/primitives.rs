//! Core primitives for synchrotron
//!
//! Render context, port descriptors, and the values that flow along edges.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::midi::MidiBuffer;

// =============================================================================
// RENDER CONTEXT
// =============================================================================

/// Snapshot handed to every node for one tick. Never changes mid-tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderContext {
    pub sample_rate: u32,
    pub buffer_size: usize,
    pub tick: u64,
}

impl RenderContext {
    pub fn new(sample_rate: u32, buffer_size: usize) -> Self {
        Self {
            sample_rate,
            buffer_size,
            tick: 0,
        }
    }

    /// Absolute sample index of the first frame in this tick.
    pub fn sample_offset(&self) -> u64 {
        self.tick * self.buffer_size as u64
    }

    pub fn seconds_per_sample(&self) -> f64 {
        1.0 / self.sample_rate as f64
    }
}

// =============================================================================
// PORT TYPES
// =============================================================================

/// Kind of value carried by a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortKind {
    /// Dense `buffer_size` floats per tick
    Stream,
    /// Sparse MIDI events per tick
    Midi,
    /// One control value, changes at most once per tick
    Data,
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortKind::Stream => write!(f, "stream"),
            PortKind::Midi => write!(f, "midi"),
            PortKind::Data => write!(f, "data"),
        }
    }
}

/// Port definition for a node type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortSpec {
    pub name: &'static str,
    pub kind: PortKind,
}

impl PortSpec {
    pub const fn stream(name: &'static str) -> Self {
        Self {
            name,
            kind: PortKind::Stream,
        }
    }

    pub const fn midi(name: &'static str) -> Self {
        Self {
            name,
            kind: PortKind::Midi,
        }
    }

    pub const fn data(name: &'static str) -> Self {
        Self {
            name,
            kind: PortKind::Data,
        }
    }
}

/// Static port table for a node type.
///
/// Declared once per type as a `static` and shared by every instance.
/// Port indices are positions in `inputs` / `outputs`.
#[derive(Debug, Serialize)]
pub struct NodePorts {
    pub type_id: &'static str,
    pub inputs: &'static [PortSpec],
    pub outputs: &'static [PortSpec],
}

impl NodePorts {
    pub fn input_index(&self, name: &str) -> Option<usize> {
        self.inputs.iter().position(|p| p.name == name)
    }

    pub fn output_index(&self, name: &str) -> Option<usize> {
        self.outputs.iter().position(|p| p.name == name)
    }

    pub fn input(&self, name: &str) -> Option<&PortSpec> {
        self.inputs.iter().find(|p| p.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&PortSpec> {
        self.outputs.iter().find(|p| p.name == name)
    }
}

// =============================================================================
// PORT VALUES
// =============================================================================

/// A published stream buffer. Immutable once written.
pub type Stream = Arc<[f32]>;

/// Control-rate value carried on data ports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataValue {
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<DataValue>),
}

impl DataValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DataValue::Number(n) => Some(*n),
            DataValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DataValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DataValue::Bool(b) => Some(*b),
            DataValue::Number(n) => Some(*n != 0.0),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[DataValue]> {
        match self {
            DataValue::List(items) => Some(items),
            _ => None,
        }
    }
}

impl From<f64> for DataValue {
    fn from(v: f64) -> Self {
        DataValue::Number(v)
    }
}

impl From<bool> for DataValue {
    fn from(v: bool) -> Self {
        DataValue::Bool(v)
    }
}

impl From<&str> for DataValue {
    fn from(v: &str) -> Self {
        DataValue::Text(v.to_string())
    }
}

impl From<String> for DataValue {
    fn from(v: String) -> Self {
        DataValue::Text(v)
    }
}

/// Value held by an output port for one tick
#[derive(Debug, Clone)]
pub enum PortValue {
    Stream(Stream),
    Midi(Arc<MidiBuffer>),
    Data(DataValue),
}

impl PortValue {
    pub fn kind(&self) -> PortKind {
        match self {
            PortValue::Stream(_) => PortKind::Stream,
            PortValue::Midi(_) => PortKind::Midi,
            PortValue::Data(_) => PortKind::Data,
        }
    }

    pub fn as_stream(&self) -> Option<&Stream> {
        match self {
            PortValue::Stream(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_midi(&self) -> Option<&Arc<MidiBuffer>> {
        match self {
            PortValue::Midi(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&DataValue> {
        match self {
            PortValue::Data(d) => Some(d),
            _ => None,
        }
    }
}

// =============================================================================
// INTROSPECTION
// =============================================================================

/// Display value in a node's introspection map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExportValue {
    Text(String),
    Number(f64),
    List(Vec<String>),
}

impl From<f64> for ExportValue {
    fn from(v: f64) -> Self {
        ExportValue::Number(v)
    }
}

impl From<&str> for ExportValue {
    fn from(v: &str) -> Self {
        ExportValue::Text(v.to_string())
    }
}

impl From<String> for ExportValue {
    fn from(v: String) -> Self {
        ExportValue::Text(v)
    }
}

impl From<Vec<String>> for ExportValue {
    fn from(v: Vec<String>) -> Self {
        ExportValue::List(v)
    }
}

/// Key → display value map a node fills in after rendering.
///
/// Purely informational; nothing in the engine reads it back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Exports(BTreeMap<String, ExportValue>);

impl Exports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<ExportValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&ExportValue> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ExportValue)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}
