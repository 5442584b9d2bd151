//! Raw MIDI messages and the sparse per-tick event buffer.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const NOTE_OFF: u8 = 0x80;
pub const NOTE_ON: u8 = 0x90;
pub const CONTROL_CHANGE: u8 = 0xB0;
pub const PROGRAM_CHANGE: u8 = 0xC0;
pub const PITCH_BEND: u8 = 0xE0;

pub const OPCODE_MASK: u8 = 0xF0;
pub const CHANNEL_MASK: u8 = 0x0F;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MidiError {
    #[error("position {position} outside buffer of {length} samples")]
    PositionOutOfRange { position: usize, length: usize },

    #[error("MIDI message must be 1-3 bytes, got {0}")]
    BadLength(usize),

    #[error("first MIDI byte {0:#04x} is not a status byte")]
    NotStatus(u8),
}

/// One raw MIDI message of 1 to 3 bytes.
///
/// Byte 0 is the status (opcode in the high nibble, channel in the low
/// nibble), bytes 1 and 2 are data bytes where the opcode uses them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MidiMessage {
    bytes: [u8; 3],
    len: u8,
}

impl MidiMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MidiError> {
        if bytes.is_empty() || bytes.len() > 3 {
            return Err(MidiError::BadLength(bytes.len()));
        }
        if bytes[0] & 0x80 == 0 {
            return Err(MidiError::NotStatus(bytes[0]));
        }
        let mut buf = [0u8; 3];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            bytes: buf,
            len: bytes.len() as u8,
        })
    }

    pub fn note_on(channel: u8, note: u8, velocity: u8) -> Self {
        Self {
            bytes: [
                NOTE_ON | (channel & CHANNEL_MASK),
                note & 0x7F,
                velocity & 0x7F,
            ],
            len: 3,
        }
    }

    pub fn note_off(channel: u8, note: u8, velocity: u8) -> Self {
        Self {
            bytes: [
                NOTE_OFF | (channel & CHANNEL_MASK),
                note & 0x7F,
                velocity & 0x7F,
            ],
            len: 3,
        }
    }

    pub fn control_change(channel: u8, controller: u8, value: u8) -> Self {
        Self {
            bytes: [
                CONTROL_CHANGE | (channel & CHANNEL_MASK),
                controller & 0x7F,
                value & 0x7F,
            ],
            len: 3,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn status(&self) -> u8 {
        self.bytes[0]
    }

    pub fn opcode(&self) -> u8 {
        self.bytes[0] & OPCODE_MASK
    }

    pub fn channel(&self) -> u8 {
        self.bytes[0] & CHANNEL_MASK
    }

    /// Note or controller number, 0 if the message has no data bytes.
    pub fn data1(&self) -> u8 {
        if self.len > 1 {
            self.bytes[1]
        } else {
            0
        }
    }

    /// Velocity or value, 0 if the message has fewer than two data bytes.
    pub fn data2(&self) -> u8 {
        if self.len > 2 {
            self.bytes[2]
        } else {
            0
        }
    }

    /// NOTE_ON with non-zero velocity.
    pub fn is_note_on(&self) -> bool {
        self.opcode() == NOTE_ON && self.data2() > 0
    }

    /// NOTE_OFF, or NOTE_ON with velocity 0.
    pub fn is_note_off(&self) -> bool {
        self.opcode() == NOTE_OFF || (self.opcode() == NOTE_ON && self.data2() == 0)
    }

    /// Copy of this message with the note number replaced.
    pub fn with_data1(&self, value: u8) -> Self {
        let mut out = *self;
        if out.len > 1 {
            out.bytes[1] = value & 0x7F;
        }
        out
    }
}

impl fmt::Debug for MidiMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MidiMessage(")?;
        for (i, b) in self.as_bytes().iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02X}", b)?;
        }
        write!(f, ")")
    }
}

/// Sparse map from sample position to the messages at that position.
///
/// Positions run `0..length`. Messages at one position keep insertion
/// order; positions with no messages are absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiBuffer {
    length: usize,
    events: BTreeMap<usize, Vec<MidiMessage>>,
}

impl MidiBuffer {
    pub fn new(length: usize) -> Self {
        Self {
            length,
            events: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.length
    }

    /// True when no position holds a message.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn add_message(&mut self, position: usize, message: MidiMessage) -> Result<(), MidiError> {
        if position >= self.length {
            return Err(MidiError::PositionOutOfRange {
                position,
                length: self.length,
            });
        }
        self.events.entry(position).or_default().push(message);
        Ok(())
    }

    pub fn get_messages_at_pos(&self, position: usize) -> &[MidiMessage] {
        self.events
            .get(&position)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// `(position, messages)` in ascending position order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &[MidiMessage])> {
        self.events.iter().map(|(pos, msgs)| (*pos, msgs.as_slice()))
    }

    /// Every message in position order, flattened.
    pub fn messages(&self) -> impl Iterator<Item = (usize, &MidiMessage)> {
        self.events
            .iter()
            .flat_map(|(pos, msgs)| msgs.iter().map(move |m| (*pos, m)))
    }

    pub fn message_count(&self) -> usize {
        self.events.values().map(Vec::len).sum()
    }

    /// Fold an arbitrary offset into `0..length`.
    pub fn wrap_position(&self, position: i64) -> usize {
        if self.length == 0 {
            return 0;
        }
        position.rem_euclid(self.length as i64) as usize
    }

    /// Pin an arbitrary offset to the nearest valid position.
    pub fn clamp_position(&self, position: i64) -> usize {
        if self.length == 0 {
            return 0;
        }
        position.clamp(0, self.length as i64 - 1) as usize
    }
}

impl<'a> IntoIterator for &'a MidiBuffer {
    type Item = (usize, &'a [MidiMessage]);
    type IntoIter = Box<dyn Iterator<Item = Self::Item> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

/// Frequency in Hz of a MIDI note number, A4 (69) = 440 Hz.
pub fn note_to_frequency(note: f64) -> f64 {
    440.0 * 2f64.powf((note - 69.0) / 12.0)
}
