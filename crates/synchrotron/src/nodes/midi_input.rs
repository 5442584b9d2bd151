//! Hardware MIDI input via midir

use crossbeam_channel::Receiver;
use midir::{MidiInput, MidiInputConnection};

use crate::midi::{MidiBuffer, MidiMessage};
use crate::node::{Node, NodeError, RenderError};
use crate::primitives::{Exports, NodePorts, PortSpec};
use crate::scheduler::RenderCx;

pub static MIDI_INPUT_PORTS: NodePorts = NodePorts {
    type_id: "midi_input",
    inputs: &[],
    outputs: &[PortSpec::midi("out")],
};

/// Buffer position for a driver timestamp in microseconds.
///
/// Wall-clock stamps are not aligned to ticks, so they wrap into the
/// current buffer rather than being scheduled exactly.
pub fn timestamp_to_position(timestamp_us: u64, sample_rate: u32, buffer_size: usize) -> usize {
    let sample = (timestamp_us as u128 * sample_rate as u128) / 1_000_000;
    (sample % buffer_size.max(1) as u128) as usize
}

struct Received {
    timestamp_us: u64,
    bytes: Vec<u8>,
}

/// Publishes messages from a hardware MIDI port.
pub struct MidiInputNode {
    connection: Option<MidiInputConnection<()>>,
    port_name: String,
    messages: Receiver<Received>,
    received: u64,
    malformed: u64,
}

impl MidiInputNode {
    /// Open the first input port whose name contains `port_pattern`.
    pub fn open(port_pattern: &str) -> Result<Self, NodeError> {
        let midi_in =
            MidiInput::new("synchrotron-scan").map_err(|e| NodeError::Device(e.to_string()))?;

        let ports = midi_in.ports();
        let port = ports
            .iter()
            .find(|p| {
                midi_in
                    .port_name(p)
                    .map(|n| n.contains(port_pattern))
                    .unwrap_or(false)
            })
            .ok_or_else(|| NodeError::Device(format!("no MIDI input matching `{}`", port_pattern)))?;

        let port_name = midi_in
            .port_name(port)
            .map_err(|e| NodeError::Device(e.to_string()))?;

        let (tx, messages) = crossbeam_channel::unbounded();
        let connection = midi_in
            .connect(
                port,
                "synchrotron-input",
                move |timestamp_us, data, _| {
                    let _ = tx.send(Received {
                        timestamp_us,
                        bytes: data.to_vec(),
                    });
                },
                (),
            )
            .map_err(|e| NodeError::Device(e.to_string()))?;

        tracing::info!(port = %port_name, "MIDI input opened");
        Ok(Self {
            connection: Some(connection),
            port_name,
            messages,
            received: 0,
            malformed: 0,
        })
    }
}

impl Node for MidiInputNode {
    fn ports(&self) -> &'static NodePorts {
        &MIDI_INPUT_PORTS
    }

    fn render(&mut self, cx: &mut RenderCx<'_>) -> Result<(), RenderError> {
        let mut buffer = MidiBuffer::new(cx.buffer_size());

        for msg in self.messages.try_iter() {
            match MidiMessage::from_bytes(&msg.bytes) {
                Ok(message) => {
                    let pos = timestamp_to_position(msg.timestamp_us, cx.sample_rate(), cx.buffer_size());
                    buffer.add_message(pos, message)?;
                    self.received += 1;
                }
                Err(e) => {
                    // sysex and realtime bytes land here
                    self.malformed += 1;
                    tracing::trace!(port = %self.port_name, "skipping MIDI bytes: {}", e);
                }
            }
        }

        cx.write_midi("out", buffer)
    }

    fn teardown(&mut self) -> Result<(), NodeError> {
        if let Some(connection) = self.connection.take() {
            connection.close();
            tracing::info!(port = %self.port_name, "MIDI input closed");
        }
        Ok(())
    }

    fn export(&self, exports: &mut Exports) {
        exports.set("Port", self.port_name.as_str());
        exports.set("Received", self.received as f64);
        exports.set("Skipped", self.malformed as f64);
    }
}
