//! Chord symbols and the chord progression node.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::midi::{MidiBuffer, MidiMessage};
use crate::node::{Node, RenderError};
use crate::primitives::{Exports, NodePorts, PortSpec};
use crate::scheduler::RenderCx;

const PITCH_CLASS_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Sharp spelling of a pitch class (0 = C).
pub fn pitch_class_name(pitch_class: u8) -> &'static str {
    PITCH_CLASS_NAMES[(pitch_class % 12) as usize]
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid chord `{input}`: {reason}")]
pub struct ChordError {
    pub input: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Major,
    Minor,
    Diminished,
    Augmented,
    Sus2,
    Sus4,
    Dominant7,
    Major7,
    Minor7,
}

impl Quality {
    /// Suffix tokens, longest first so `maj7` wins over `m`.
    const TOKENS: &'static [(&'static str, Quality)] = &[
        ("maj7", Quality::Major7),
        ("sus2", Quality::Sus2),
        ("sus4", Quality::Sus4),
        ("dim", Quality::Diminished),
        ("aug", Quality::Augmented),
        ("m7", Quality::Minor7),
        ("7", Quality::Dominant7),
        ("m", Quality::Minor),
    ];

    pub fn intervals(&self) -> &'static [u8] {
        match self {
            Quality::Major => &[0, 4, 7],
            Quality::Minor => &[0, 3, 7],
            Quality::Diminished => &[0, 3, 6],
            Quality::Augmented => &[0, 4, 8],
            Quality::Sus2 => &[0, 2, 7],
            Quality::Sus4 => &[0, 5, 7],
            Quality::Dominant7 => &[0, 4, 7, 10],
            Quality::Major7 => &[0, 4, 7, 11],
            Quality::Minor7 => &[0, 3, 7, 10],
        }
    }

    fn suffix(&self) -> &'static str {
        match self {
            Quality::Major => "",
            other => Self::TOKENS
                .iter()
                .find(|(_, q)| q == other)
                .map(|(token, _)| *token)
                .unwrap_or(""),
        }
    }
}

/// A parsed chord symbol such as `C`, `F#m7`, `Bbmaj7`, `Ddim`, or `Esus4`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chord {
    root: u8,
    root_name: String,
    quality: Quality,
}

impl Chord {
    pub fn root(&self) -> u8 {
        self.root
    }

    pub fn quality(&self) -> Quality {
        self.quality
    }

    /// MIDI notes of the chord with its root in `octave` (C4 = 60).
    /// Notes above 127 are dropped.
    pub fn notes(&self, octave: i32) -> Vec<u8> {
        let base = 12 * (octave + 1) + self.root as i32;
        self.quality
            .intervals()
            .iter()
            .map(|&interval| base + interval as i32)
            .filter(|note| (0..=127).contains(note))
            .map(|note| note as u8)
            .collect()
    }

    /// Parse a whitespace-separated progression.
    pub fn parse_progression(text: &str) -> Result<Vec<Chord>, ChordError> {
        let chords = text
            .split_whitespace()
            .map(str::parse)
            .collect::<Result<Vec<Chord>, _>>()?;
        if chords.is_empty() {
            return Err(ChordError {
                input: text.to_string(),
                reason: "progression is empty".to_string(),
            });
        }
        Ok(chords)
    }
}

impl FromStr for Chord {
    type Err = ChordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let error = |reason: String| ChordError {
            input: s.to_string(),
            reason,
        };

        let mut chars = s.chars();
        let letter = chars
            .next()
            .ok_or_else(|| error("expected one of A, B, C, D, E, F, G".to_string()))?;
        let natural: i32 = match letter {
            'C' => 0,
            'D' => 2,
            'E' => 4,
            'F' => 5,
            'G' => 7,
            'A' => 9,
            'B' => 11,
            other => {
                return Err(error(format!(
                    "expected one of A, B, C, D, E, F, G, got `{}`",
                    other
                )))
            }
        };

        let mut rest = chars.as_str();
        let mut root = natural;
        let mut root_name = letter.to_string();
        if let Some(stripped) = rest.strip_prefix('#') {
            root += 1;
            root_name.push('#');
            rest = stripped;
        } else if let Some(stripped) = rest.strip_prefix('b') {
            root -= 1;
            root_name.push('b');
            rest = stripped;
        }

        let quality = if rest.is_empty() {
            Quality::Major
        } else {
            Quality::TOKENS
                .iter()
                .find(|(token, _)| *token == rest)
                .map(|(_, q)| *q)
                .ok_or_else(|| {
                    error(format!(
                        "unknown quality `{}` after `{}`",
                        rest, root_name
                    ))
                })?
        };

        Ok(Self {
            root: root.rem_euclid(12) as u8,
            root_name,
            quality,
        })
    }
}

impl fmt::Display for Chord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.root_name, self.quality.suffix())
    }
}

pub static CHORD_PORTS: NodePorts = NodePorts {
    type_id: "chord",
    inputs: &[PortSpec::stream("gate"), PortSpec::data("progression")],
    outputs: &[PortSpec::midi("out")],
};

/// Plays a chord progression, one chord per gate.
///
/// A rising edge on `gate` sends note-ons for the current chord; the
/// falling edge sends note-offs and advances to the next chord. A text
/// value on the `progression` input replaces the progression and restarts
/// it.
#[derive(Debug)]
pub struct ChordNode {
    progression: Vec<Chord>,
    source_text: String,
    index: usize,
    octave: i32,
    velocity: u8,
    sounding: Vec<u8>,
    gate_high: bool,
}

impl ChordNode {
    pub const DEFAULT_OCTAVE: i32 = 4;
    pub const DEFAULT_VELOCITY: u8 = 100;

    pub fn new(progression: &str, octave: i32, velocity: u8) -> Result<Self, ChordError> {
        Ok(Self {
            progression: Chord::parse_progression(progression)?,
            source_text: progression.to_string(),
            index: 0,
            octave,
            velocity: velocity.min(127),
            sounding: Vec::new(),
            gate_high: false,
        })
    }

    pub fn current(&self) -> &Chord {
        &self.progression[self.index % self.progression.len()]
    }
}

impl Node for ChordNode {
    fn ports(&self) -> &'static NodePorts {
        &CHORD_PORTS
    }

    fn render(&mut self, cx: &mut RenderCx<'_>) -> Result<(), RenderError> {
        if let Some(text) = cx.read_data("progression")? {
            if let Some(text) = text.as_str() {
                if text != self.source_text {
                    self.progression =
                        Chord::parse_progression(text).map_err(|e| RenderError::config(e.to_string()))?;
                    self.source_text = text.to_string();
                    self.index = 0;
                }
            }
        }

        let gate = cx.read_stream("gate")?;
        let mut output = MidiBuffer::new(cx.buffer_size());

        for (pos, &level) in gate.iter().enumerate() {
            let high = level > 0.0;
            if high && !self.gate_high {
                self.sounding = self.current().notes(self.octave);
                for &note in &self.sounding {
                    output.add_message(pos, MidiMessage::note_on(0, note, self.velocity))?;
                }
            } else if !high && self.gate_high {
                for note in self.sounding.drain(..) {
                    output.add_message(pos, MidiMessage::note_off(0, note, 0))?;
                }
                self.index = (self.index + 1) % self.progression.len();
            }
            self.gate_high = high;
        }

        cx.write_midi("out", output)
    }

    fn export(&self, exports: &mut Exports) {
        exports.set("Chord", self.current().to_string());
        exports.set(
            "Progression",
            self.progression
                .iter()
                .map(Chord::to_string)
                .collect::<Vec<_>>(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::{Feed, Rig};

    #[test]
    fn test_parse_chords() {
        let c: Chord = "C".parse().unwrap();
        assert_eq!(c.root(), 0);
        assert_eq!(c.quality(), Quality::Major);
        assert_eq!(c.notes(4), vec![60, 64, 67]);

        let fsm7: Chord = "F#m7".parse().unwrap();
        assert_eq!(fsm7.root(), 6);
        assert_eq!(fsm7.quality(), Quality::Minor7);
        assert_eq!(fsm7.to_string(), "F#m7");

        let bb: Chord = "Bbmaj7".parse().unwrap();
        assert_eq!(bb.root(), 10);
        assert_eq!(bb.notes(3), vec![58, 62, 65, 69]);

        assert_eq!("Ddim".parse::<Chord>().unwrap().quality(), Quality::Diminished);
        assert_eq!("Esus4".parse::<Chord>().unwrap().notes(4), vec![64, 69, 71]);

        let cb: Chord = "Cb".parse().unwrap();
        assert_eq!(cb.root(), 11);
    }

    #[test]
    fn test_parse_errors() {
        let err = "H".parse::<Chord>().unwrap_err();
        assert!(err.reason.contains("expected one of"));
        assert!("Cmaj9".parse::<Chord>().is_err());
        assert!("".parse::<Chord>().is_err());
        assert!(Chord::parse_progression("   ").is_err());
    }

    #[test]
    fn test_pitch_class_names() {
        assert_eq!(pitch_class_name(0), "C");
        assert_eq!(pitch_class_name(13), "C#");
        assert_eq!(pitch_class_name(11), "B");
    }

    #[test]
    fn test_chord_node_gates_progression() {
        let feed = Feed::new()
            .stream(vec![0.0, 1.0, 1.0, 0.0])
            .stream(vec![1.0, 0.0, 0.0, 0.0]);
        let node = ChordNode::new("C Am", 4, 90).unwrap();
        let mut rig = Rig::new(Box::new(node), feed, &[("stream", "gate")], 48000, 4);

        rig.tick();
        let out = rig.midi("out");
        let ons: Vec<u8> = out.get_messages_at_pos(1).iter().map(|m| m.data1()).collect();
        assert_eq!(ons, vec![60, 64, 67]);
        assert!(out.get_messages_at_pos(1).iter().all(|m| m.is_note_on() && m.data2() == 90));
        assert!(out.get_messages_at_pos(3).iter().all(|m| m.is_note_off()));
        assert_eq!(out.get_messages_at_pos(3).len(), 3);

        rig.tick();
        let out = rig.midi("out");
        let ons: Vec<u8> = out.get_messages_at_pos(0).iter().map(|m| m.data1()).collect();
        assert_eq!(ons, vec![69, 72, 76]);
        assert_eq!(out.get_messages_at_pos(1).len(), 3);
        assert_eq!(
            rig.exports().get("Chord"),
            Some(&crate::primitives::ExportValue::Text("C".into()))
        );
    }

    #[test]
    fn test_chord_node_bad_progression_input() {
        let feed = Feed::new().data("C Xm");
        let node = ChordNode::new("C", 4, 100).unwrap();
        let mut rig = Rig::new(Box::new(node), feed, &[("data", "progression")], 48000, 2);

        let err = rig.try_tick().unwrap_err();
        assert_eq!(err.node, "under_test");
        assert_eq!(err.kind(), crate::node::ErrorKind::Configuration);
    }
}
