//! SoundFont playback via rustysynth

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustysynth::{SoundFont, Synthesizer, SynthesizerSettings};

use crate::midi::{CONTROL_CHANGE, PROGRAM_CHANGE};
use crate::node::{Node, NodeError, RenderError};
use crate::primitives::{Exports, NodePorts, PortSpec};
use crate::scheduler::RenderCx;

pub static SOUNDFONT_PORTS: NodePorts = NodePorts {
    type_id: "soundfont",
    inputs: &[
        PortSpec::midi("midi"),
        PortSpec::data("bank"),
        PortSpec::data("preset"),
    ],
    outputs: &[PortSpec::stream("left"), PortSpec::stream("right")],
};

const BANK_SELECT: i32 = 0;

/// Renders incoming MIDI through a SoundFont synthesizer.
///
/// Rendering is split at every MIDI position so each message takes effect
/// on its exact sample. `bank` and `preset` apply to channel 0.
pub struct SoundFontNode {
    synth: Synthesizer,
    path: PathBuf,
    bank: i32,
    preset: i32,
}

impl SoundFontNode {
    pub fn load(path: impl AsRef<Path>, sample_rate: u32) -> Result<Self, NodeError> {
        let path = path.as_ref().to_path_buf();
        let mut reader = BufReader::new(File::open(&path)?);
        let font = SoundFont::new(&mut reader)
            .map_err(|e| NodeError::Device(format!("{}: {}", path.display(), e)))?;

        let settings = SynthesizerSettings::new(sample_rate as i32);
        let synth = Synthesizer::new(&Arc::new(font), &settings)
            .map_err(|e| NodeError::Device(format!("{}: {}", path.display(), e)))?;

        tracing::info!(path = %path.display(), sample_rate, "SoundFont loaded");
        Ok(Self {
            synth,
            path,
            bank: 0,
            preset: 0,
        })
    }

    fn select(&mut self, bank: i32, preset: i32) {
        if bank != self.bank {
            self.synth
                .process_midi_message(0, CONTROL_CHANGE as i32, BANK_SELECT, bank);
            self.bank = bank;
            // a bank change only takes effect on the next program change
            self.synth
                .process_midi_message(0, PROGRAM_CHANGE as i32, self.preset, 0);
        }
        if preset != self.preset {
            self.synth
                .process_midi_message(0, PROGRAM_CHANGE as i32, preset, 0);
            self.preset = preset;
        }
    }
}

impl Node for SoundFontNode {
    fn ports(&self) -> &'static NodePorts {
        &SOUNDFONT_PORTS
    }

    fn render(&mut self, cx: &mut RenderCx<'_>) -> Result<(), RenderError> {
        let bank = cx.read_number_or("bank", self.bank as f64)?;
        let preset = cx.read_number_or("preset", self.preset as f64)?;
        if !(0.0..=127.0).contains(&bank) || !(0.0..=127.0).contains(&preset) {
            return Err(RenderError::config(format!(
                "bank {} / preset {} outside 0..=127",
                bank, preset
            )));
        }
        self.select(bank as i32, preset as i32);

        let midi = cx.read_midi("midi")?;
        let frames = cx.buffer_size();
        let mut left = vec![0.0f32; frames];
        let mut right = vec![0.0f32; frames];

        let mut cursor = 0;
        for (pos, messages) in midi.iter() {
            if pos > cursor {
                self.synth
                    .render(&mut left[cursor..pos], &mut right[cursor..pos]);
                cursor = pos;
            }
            for message in messages {
                self.synth.process_midi_message(
                    message.channel() as i32,
                    message.opcode() as i32,
                    message.data1() as i32,
                    message.data2() as i32,
                );
            }
        }
        if cursor < frames {
            self.synth
                .render(&mut left[cursor..], &mut right[cursor..]);
        }

        cx.write_stream("left", left)?;
        cx.write_stream("right", right)
    }

    fn teardown(&mut self) -> Result<(), NodeError> {
        self.synth.note_off_all(true);
        Ok(())
    }

    fn export(&self, exports: &mut Exports) {
        exports.set("SoundFont", self.path.display().to_string());
        exports.set("Bank", self.bank as f64);
        exports.set("Preset", self.preset as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_soundfont_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = SoundFontNode::load(dir.path().join("missing.sf2"), 48000);
        assert!(matches!(result, Err(NodeError::Io(_))));
    }

    #[test]
    fn test_garbage_soundfont_is_device_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.sf2");
        std::fs::write(&path, b"definitely not RIFF").unwrap();
        let result = SoundFontNode::load(&path, 48000);
        assert!(matches!(result, Err(NodeError::Device(ref m)) if m.contains("bad.sf2")));
    }
}
