//! Reference node library
//!
//! Concrete nodes built only on the public [`Node`](crate::node::Node)
//! contract. Each type declares a static [`NodePorts`](crate::primitives::NodePorts)
//! table that the registry uses to validate patches before construction.

mod effects;
mod events;
mod io;
mod midi;
mod oscillators;
mod sensor;
mod tone;

#[cfg(feature = "midi-input")]
mod midi_input;
#[cfg(feature = "soundfont")]
mod soundfont;

pub use effects::{BitcrushNode, BITCRUSH_PORTS};
pub use events::{
    EventSource, EventTriggerNode, LineEventSource, EVENT_TRIGGER_PORTS,
};
pub use io::{
    PlaybackNode, RecordingNode, WavFileNode, PLAYBACK_PORTS, RECORDING_PORTS, WAV_FILE_PORTS,
};
pub use midi::{
    MidiHoldNode, MidiLoopNode, MidiStrumNode, MidiTransposeNode, MidiTriggerNode,
    MonophonicRenderNode, MIDI_HOLD_PORTS, MIDI_LOOP_PORTS, MIDI_STRUM_PORTS,
    MIDI_TRANSPOSE_PORTS, MIDI_TRIGGER_PORTS, MONOPHONIC_RENDER_PORTS,
};
pub use oscillators::{
    ConstantNode, SawtoothNode, SilenceNode, SineNode, SquareNode, CONSTANT_PORTS,
    SAWTOOTH_PORTS, SILENCE_PORTS, SINE_PORTS, SQUARE_PORTS,
};
pub use sensor::{Sensor, SensorNode, SENSOR_PORTS};
pub use tone::{Chord, ChordError, ChordNode, Quality, CHORD_PORTS};

#[cfg(feature = "midi-input")]
pub use midi_input::{MidiInputNode, MIDI_INPUT_PORTS};
#[cfg(feature = "soundfont")]
pub use soundfont::{SoundFontNode, SOUNDFONT_PORTS};
