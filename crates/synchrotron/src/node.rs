//! The node contract.

use std::fmt;

use thiserror::Error;

use crate::bridge::BridgeError;
use crate::midi::MidiError;
use crate::primitives::{Exports, NodePorts, PortKind};
use crate::scheduler::{RenderCx, TickError};

/// Broad category of a render failure, reported alongside the node name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Port misuse: unknown name, wrong kind, wrong buffer length, bad MIDI position
    Port,
    /// Invalid parameter or input value
    Configuration,
    /// Hardware or I/O failure
    Device,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Port => write!(f, "port"),
            ErrorKind::Configuration => write!(f, "configuration"),
            ErrorKind::Device => write!(f, "device"),
        }
    }
}

/// Errors a node may return from `render`.
#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error("no {direction} port named `{port}`")]
    UnknownPort {
        direction: &'static str,
        port: String,
    },

    #[error("port `{port}` is {actual}, not {requested}")]
    WrongKind {
        port: String,
        requested: PortKind,
        actual: PortKind,
    },

    #[error("stream written to `{port}` has {got} samples, expected {expected}")]
    BufferLength {
        port: String,
        expected: usize,
        got: usize,
    },

    #[error(transparent)]
    Midi(#[from] MidiError),

    #[error("configuration: {0}")]
    Config(String),

    #[error("device: {0}")]
    Device(String),

    /// A node this one read from failed; carries that node's error unchanged.
    #[error("{0}")]
    Upstream(Box<TickError>),
}

impl RenderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RenderError::UnknownPort { .. }
            | RenderError::WrongKind { .. }
            | RenderError::BufferLength { .. }
            | RenderError::Midi(_) => ErrorKind::Port,
            RenderError::Config(_) => ErrorKind::Configuration,
            RenderError::Device(_) => ErrorKind::Device,
            RenderError::Upstream(inner) => inner.kind(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        RenderError::Config(message.into())
    }

    pub fn device(message: impl Into<String>) -> Self {
        RenderError::Device(message.into())
    }
}

/// Errors a node may return from `teardown`.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("background thread `{name}` did not stop within the teardown deadline")]
    LeakedThread { name: String },

    #[error("background thread `{name}` panicked")]
    ThreadPanicked { name: String },

    #[error("device: {0}")]
    Device(String),
}

impl From<BridgeError> for NodeError {
    fn from(e: BridgeError) -> Self {
        match e {
            BridgeError::JoinTimeout { name, .. } => NodeError::LeakedThread { name },
            BridgeError::WorkerPanicked { name } => NodeError::ThreadPanicked { name },
            BridgeError::Spawn(e) => NodeError::Io(e),
            other => NodeError::Device(other.to_string()),
        }
    }
}

/// A stateful signal-processing unit.
///
/// The scheduler calls `render` at most once per tick, handing it a
/// [`RenderCx`] for reading inputs and publishing outputs. Outputs left
/// unwritten are published as silence (stream), an empty buffer (MIDI), or
/// the previous value (data).
pub trait Node: Send {
    /// Static port table for this node's type.
    fn ports(&self) -> &'static NodePorts;

    fn render(&mut self, cx: &mut RenderCx<'_>) -> Result<(), RenderError>;

    /// Release devices, files, and threads. Called exactly once at shutdown.
    fn teardown(&mut self) -> Result<(), NodeError> {
        Ok(())
    }

    /// Refresh the introspection map. Called after every successful render.
    fn export(&self, _exports: &mut Exports) {}
}

pub type BoxedNode = Box<dyn Node>;
