//! MIDI processing nodes
//!
//! All of these work per sample position, so timing inside a tick is kept.

use std::collections::{BTreeMap, BTreeSet};

use crate::midi::{note_to_frequency, MidiBuffer, MidiMessage, NOTE_OFF, NOTE_ON};
use crate::node::{Node, RenderError};
use crate::nodes::tone::pitch_class_name;
use crate::primitives::{Exports, NodePorts, PortSpec};
use crate::scheduler::RenderCx;

pub static MIDI_HOLD_PORTS: NodePorts = NodePorts {
    type_id: "midi_hold",
    inputs: &[PortSpec::midi("midi")],
    outputs: &[PortSpec::midi("out")],
};

pub static MIDI_TRANSPOSE_PORTS: NodePorts = NodePorts {
    type_id: "midi_transpose",
    inputs: &[PortSpec::midi("midi"), PortSpec::stream("transposition")],
    outputs: &[PortSpec::midi("out")],
};

pub static MIDI_TRIGGER_PORTS: NodePorts = NodePorts {
    type_id: "midi_trigger",
    inputs: &[PortSpec::midi("midi")],
    outputs: &[PortSpec::stream("trigger")],
};

pub static MIDI_STRUM_PORTS: NodePorts = NodePorts {
    type_id: "midi_strum",
    inputs: &[PortSpec::midi("notes"), PortSpec::stream("strum")],
    outputs: &[PortSpec::midi("out")],
};

pub static MIDI_LOOP_PORTS: NodePorts = NodePorts {
    type_id: "midi_loop",
    inputs: &[
        PortSpec::midi("source"),
        PortSpec::stream("loop"),
        PortSpec::stream("reset"),
    ],
    outputs: &[PortSpec::midi("out")],
};

pub static MONOPHONIC_RENDER_PORTS: NodePorts = NodePorts {
    type_id: "monophonic_render",
    inputs: &[PortSpec::midi("midi")],
    outputs: &[PortSpec::stream("frequency")],
};

/// Drops every note-off so notes sustain until something else stops them.
#[derive(Debug, Default)]
pub struct MidiHoldNode;

impl Node for MidiHoldNode {
    fn ports(&self) -> &'static NodePorts {
        &MIDI_HOLD_PORTS
    }

    fn render(&mut self, cx: &mut RenderCx<'_>) -> Result<(), RenderError> {
        let input = cx.read_midi("midi")?;
        let mut output = MidiBuffer::new(cx.buffer_size());

        for (pos, message) in input.messages() {
            if !message.is_note_off() {
                output.add_message(pos, *message)?;
            }
        }

        cx.write_midi("out", output)
    }
}

/// Shifts note numbers by the rounded `transposition` at each message's position.
#[derive(Debug, Default)]
pub struct MidiTransposeNode;

impl Node for MidiTransposeNode {
    fn ports(&self) -> &'static NodePorts {
        &MIDI_TRANSPOSE_PORTS
    }

    fn render(&mut self, cx: &mut RenderCx<'_>) -> Result<(), RenderError> {
        let input = cx.read_midi("midi")?;
        let transposition = cx.read_stream("transposition")?;
        let mut output = MidiBuffer::new(cx.buffer_size());

        for (pos, message) in input.messages() {
            let shifted = match message.opcode() {
                NOTE_ON | NOTE_OFF => {
                    let note = message.data1() as i32 + transposition[pos].round() as i32;
                    message.with_data1(note.clamp(0, 127) as u8)
                }
                _ => *message,
            };
            output.add_message(pos, shifted)?;
        }

        cx.write_midi("out", output)
    }
}

/// 1.0 at every position holding a note-on, 0.0 elsewhere.
#[derive(Debug, Default)]
pub struct MidiTriggerNode;

impl Node for MidiTriggerNode {
    fn ports(&self) -> &'static NodePorts {
        &MIDI_TRIGGER_PORTS
    }

    fn render(&mut self, cx: &mut RenderCx<'_>) -> Result<(), RenderError> {
        let input = cx.read_midi("midi")?;
        let mut trigger = vec![0.0; cx.buffer_size()];

        for (pos, messages) in input.iter() {
            if messages.iter().any(MidiMessage::is_note_on) {
                trigger[pos] = 1.0;
            }
        }

        cx.write_stream("trigger", trigger)
    }
}

/// Strums across held pitch classes.
///
/// Held pitch classes are expanded to every octave in 0..=127; the `strum`
/// input (clamped to 0..1) picks one of those notes. Crossing into a new
/// note sends note-off for the old one and note-on for the new.
#[derive(Debug, Default)]
pub struct MidiStrumNode {
    held: BTreeSet<u8>,
    current: Option<u8>,
}

impl MidiStrumNode {
    const VELOCITY: u8 = 64;

    fn expanded(&self) -> Vec<u8> {
        let mut notes: Vec<u8> = self
            .held
            .iter()
            .flat_map(|&pc| (0..11u8).map(move |octave| pc + octave * 12))
            .filter(|&note| note <= 127)
            .collect();
        notes.sort_unstable();
        notes
    }
}

impl Node for MidiStrumNode {
    fn ports(&self) -> &'static NodePorts {
        &MIDI_STRUM_PORTS
    }

    fn render(&mut self, cx: &mut RenderCx<'_>) -> Result<(), RenderError> {
        let notes = cx.read_midi("notes")?;
        let strum = cx.read_stream("strum")?;
        let mut output = MidiBuffer::new(cx.buffer_size());

        for (_, message) in notes.messages() {
            let pitch_class = message.data1() % 12;
            if message.is_note_on() {
                self.held.insert(pitch_class);
            } else if message.is_note_off() {
                self.held.remove(&pitch_class);
            }
        }

        if self.held.is_empty() {
            if let Some(note) = self.current.take() {
                output.add_message(0, MidiMessage::note_off(0, note, 0))?;
            }
            return cx.write_midi("out", output);
        }

        let expanded = self.expanded();
        for (pos, &value) in strum.iter().enumerate() {
            let value = value.clamp(0.0, 1.0);
            let segment = ((value * expanded.len() as f32) as usize).min(expanded.len() - 1);
            let target = expanded[segment];

            if self.current != Some(target) {
                if let Some(previous) = self.current {
                    output.add_message(pos, MidiMessage::note_off(0, previous, 0))?;
                }
                output.add_message(pos, MidiMessage::note_on(0, target, Self::VELOCITY))?;
                self.current = Some(target);
            }
        }

        cx.write_midi("out", output)
    }

    fn export(&self, exports: &mut Exports) {
        let held: Vec<String> = self
            .held
            .iter()
            .map(|&pc| pitch_class_name(pc).to_string())
            .collect();
        exports.set("Held", held);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Idle,
    Recording,
    Looping,
}

/// Records and loops incoming MIDI.
///
/// The first rising edge on `loop` starts recording, the second fixes the
/// loop length and starts playback. Later edges restart the loop from its
/// beginning. Incoming MIDI keeps being recorded into the loop while it
/// plays. A rising edge on `reset` clears everything.
#[derive(Debug)]
pub struct MidiLoopNode {
    state: LoopState,
    recorded: BTreeMap<usize, Vec<MidiMessage>>,
    length: usize,
    position: usize,
    last_loop: bool,
    last_reset: bool,
}

impl Default for MidiLoopNode {
    fn default() -> Self {
        Self {
            state: LoopState::Idle,
            recorded: BTreeMap::new(),
            length: 0,
            position: 0,
            last_loop: false,
            last_reset: false,
        }
    }
}

impl MidiLoopNode {
    fn clear(&mut self) {
        self.state = LoopState::Idle;
        self.recorded.clear();
        self.length = 0;
        self.position = 0;
    }

    fn on_loop_pulse(&mut self) {
        match self.state {
            LoopState::Idle => {
                self.state = LoopState::Recording;
                self.position = 0;
                self.recorded.clear();
            }
            LoopState::Recording => {
                self.length = self.position;
                self.position = 0;
                // A zero-length loop cannot play; keep recording.
                if self.length > 0 {
                    self.state = LoopState::Looping;
                }
            }
            LoopState::Looping => self.position = 0,
        }
    }
}

impl Node for MidiLoopNode {
    fn ports(&self) -> &'static NodePorts {
        &MIDI_LOOP_PORTS
    }

    fn render(&mut self, cx: &mut RenderCx<'_>) -> Result<(), RenderError> {
        let source = cx.read_midi("source")?;
        let loop_signal = cx.read_stream("loop")?;
        let reset_signal = cx.read_stream("reset")?;
        let mut output = MidiBuffer::new(cx.buffer_size());

        for i in 0..cx.buffer_size() {
            let reset = reset_signal[i] != 0.0;
            if reset && !self.last_reset {
                self.clear();
            }
            self.last_reset = reset;

            let pulse = loop_signal[i] != 0.0;
            if pulse && !self.last_loop {
                self.on_loop_pulse();
            }
            self.last_loop = pulse;

            if self.state == LoopState::Idle {
                continue;
            }

            let incoming = source.get_messages_at_pos(i);
            if !incoming.is_empty() {
                self.recorded
                    .entry(self.position)
                    .or_default()
                    .extend_from_slice(incoming);
            }

            if self.state == LoopState::Looping {
                if let Some(messages) = self.recorded.get(&self.position) {
                    for message in messages {
                        output.add_message(i, *message)?;
                    }
                }
                self.position = (self.position + 1) % self.length;
            } else {
                self.position += 1;
            }
        }

        cx.write_midi("out", output)
    }

    fn export(&self, exports: &mut Exports) {
        let state = match self.state {
            LoopState::Idle => "idle",
            LoopState::Recording => "recording",
            LoopState::Looping => "looping",
        };
        exports.set("State", state);
        exports.set("Loop Length", self.length as f64);
    }
}

/// Frequency of the most recent held note, 0 when none is held.
#[derive(Debug, Default)]
pub struct MonophonicRenderNode {
    current: Option<u8>,
}

impl Node for MonophonicRenderNode {
    fn ports(&self) -> &'static NodePorts {
        &MONOPHONIC_RENDER_PORTS
    }

    fn render(&mut self, cx: &mut RenderCx<'_>) -> Result<(), RenderError> {
        let input = cx.read_midi("midi")?;
        let mut frequency = vec![0.0; cx.buffer_size()];

        for (i, sample) in frequency.iter_mut().enumerate() {
            for message in input.get_messages_at_pos(i) {
                if message.is_note_on() {
                    self.current = Some(message.data1());
                } else if message.is_note_off() && self.current == Some(message.data1()) {
                    self.current = None;
                }
            }

            if let Some(note) = self.current {
                *sample = note_to_frequency(note as f64) as f32;
            }
        }

        cx.write_stream("frequency", frequency)
    }
}
