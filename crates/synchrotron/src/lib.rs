//! Synchrotron: realtime audio/MIDI dataflow engine
//!
//! Nodes with typed ports (audio streams, sparse MIDI buffers, control
//! data) are wired into a graph and rendered one buffer at a time by a
//! pull-based scheduler. Each tick, the always-render set pulls its inputs;
//! every upstream node renders at most once, and feedback edges read the
//! previous tick's value instead of recursing.
//!
//! - [`graph`]: node arena, port-validated edges, snapshots
//! - [`scheduler`]: memoized evaluation and the [`RenderCx`] nodes render through
//! - [`bridge`]: hand-off between the render thread and hardware threads
//! - [`nodes`]: the reference node library
//! - [`registry`]: node types by name and TOML patch construction
//! - [`driver`]: offline or realtime tick loop with an error policy
//! - `pipewire_io` (feature `pipewire`): hardware streams behind the bridge queues

pub mod bridge;
pub mod driver;
pub mod graph;
pub mod midi;
pub mod node;
pub mod nodes;
#[cfg(feature = "pipewire")]
pub mod pipewire_io;
pub mod primitives;
pub mod registry;
pub mod scheduler;

pub use bridge::{
    capture_queue, playback_queue, BridgeError, BridgeStats, BridgeStatsSnapshot,
    CaptureConsumer, CaptureProducer, CaptureWriter, Guarded, PlaybackConsumer, PlaybackProducer,
    PlaybackReader, Smoother, StopSignal, Worker,
};
pub use driver::{Driver, DriverReport, ErrorPolicy, Pacing};
pub use graph::{Edge, Graph, GraphError, GraphSnapshot, NodeSnapshot};
pub use midi::{note_to_frequency, MidiBuffer, MidiError, MidiMessage};
pub use node::{BoxedNode, ErrorKind, Node, NodeError, RenderError};
pub use primitives::*;
pub use registry::{
    build_patch, build_patch_with_devices, BuildContext, BuildError, Devices, NodeParams,
    NodeRegistry, PatchError,
};
pub use scheduler::{RenderCx, Scheduler, TeardownReport, TickError, TickReport};
