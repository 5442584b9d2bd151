//! Signal generators
//!
//! Oscillators keep their phase across ticks, so a constant frequency
//! produces one continuous waveform regardless of buffer boundaries.

use std::f64::consts::TAU;

use crate::node::{Node, RenderError};
use crate::primitives::{Exports, NodePorts, PortSpec, Stream};
use crate::scheduler::RenderCx;

pub static SILENCE_PORTS: NodePorts = NodePorts {
    type_id: "silence",
    inputs: &[],
    outputs: &[PortSpec::stream("out")],
};

pub static CONSTANT_PORTS: NodePorts = NodePorts {
    type_id: "constant",
    inputs: &[PortSpec::data("value")],
    outputs: &[PortSpec::stream("out")],
};

pub static SINE_PORTS: NodePorts = NodePorts {
    type_id: "sine",
    inputs: &[PortSpec::stream("frequency")],
    outputs: &[PortSpec::stream("out")],
};

pub static SQUARE_PORTS: NodePorts = NodePorts {
    type_id: "square",
    inputs: &[PortSpec::stream("frequency"), PortSpec::stream("pwm")],
    outputs: &[PortSpec::stream("out")],
};

pub static SAWTOOTH_PORTS: NodePorts = NodePorts {
    type_id: "sawtooth",
    inputs: &[PortSpec::stream("frequency")],
    outputs: &[PortSpec::stream("out")],
};

/// Writes zeros.
#[derive(Debug, Default)]
pub struct SilenceNode;

impl Node for SilenceNode {
    fn ports(&self) -> &'static NodePorts {
        &SILENCE_PORTS
    }

    fn render(&mut self, cx: &mut RenderCx<'_>) -> Result<(), RenderError> {
        cx.write_stream("out", vec![0.0; cx.buffer_size()])
    }
}

/// Holds its `value` data input (or a fixed fallback) as a stream.
#[derive(Debug)]
pub struct ConstantNode {
    fallback: f64,
    current: f64,
}

impl ConstantNode {
    pub fn new(value: f64) -> Self {
        Self {
            fallback: value,
            current: value,
        }
    }
}

impl Node for ConstantNode {
    fn ports(&self) -> &'static NodePorts {
        &CONSTANT_PORTS
    }

    fn render(&mut self, cx: &mut RenderCx<'_>) -> Result<(), RenderError> {
        self.current = cx.read_number_or("value", self.fallback)?;
        cx.write_stream("out", vec![self.current as f32; cx.buffer_size()])
    }

    fn export(&self, exports: &mut Exports) {
        exports.set("Value", self.current);
    }
}

/// Reads `frequency`, falling back to a fixed value when unconnected.
fn frequency(cx: &mut RenderCx<'_>, fallback: f32) -> Result<Stream, RenderError> {
    cx.read_stream_or("frequency", fallback)
}

/// Sine wave, phase in radians.
#[derive(Debug)]
pub struct SineNode {
    frequency: f32,
    phase: f64,
}

impl SineNode {
    pub fn new(frequency: f32) -> Self {
        Self {
            frequency,
            phase: 0.0,
        }
    }
}

impl Node for SineNode {
    fn ports(&self) -> &'static NodePorts {
        &SINE_PORTS
    }

    fn render(&mut self, cx: &mut RenderCx<'_>) -> Result<(), RenderError> {
        let freq = frequency(cx, self.frequency)?;
        let sr = cx.sample_rate() as f64;

        let out: Vec<f32> = freq
            .iter()
            .map(|&f| {
                let sample = self.phase.sin() as f32;
                self.phase = (self.phase + TAU * f as f64 / sr).rem_euclid(TAU);
                sample
            })
            .collect();

        cx.write_stream("out", out)
    }
}

/// Square wave: +1 while phase is above the `pwm` threshold, -1 otherwise.
#[derive(Debug)]
pub struct SquareNode {
    frequency: f32,
    phase: f64,
}

impl SquareNode {
    pub const DEFAULT_PWM: f32 = 0.5;

    pub fn new(frequency: f32) -> Self {
        Self {
            frequency,
            phase: 0.0,
        }
    }
}

impl Node for SquareNode {
    fn ports(&self) -> &'static NodePorts {
        &SQUARE_PORTS
    }

    fn render(&mut self, cx: &mut RenderCx<'_>) -> Result<(), RenderError> {
        let freq = frequency(cx, self.frequency)?;
        let pwm = cx.read_stream_or("pwm", Self::DEFAULT_PWM)?;
        let sr = cx.sample_rate() as f64;

        let out: Vec<f32> = freq
            .iter()
            .zip(pwm.iter())
            .map(|(&f, &threshold)| {
                let sample = if self.phase > threshold as f64 { 1.0 } else { -1.0 };
                self.phase = (self.phase + f as f64 / sr).rem_euclid(1.0);
                sample
            })
            .collect();

        cx.write_stream("out", out)
    }
}

/// Rising ramp from 0 to 1.
#[derive(Debug)]
pub struct SawtoothNode {
    frequency: f32,
    phase: f64,
}

impl SawtoothNode {
    pub fn new(frequency: f32) -> Self {
        Self {
            frequency,
            phase: 0.0,
        }
    }
}

impl Node for SawtoothNode {
    fn ports(&self) -> &'static NodePorts {
        &SAWTOOTH_PORTS
    }

    fn render(&mut self, cx: &mut RenderCx<'_>) -> Result<(), RenderError> {
        let freq = frequency(cx, self.frequency)?;
        let sr = cx.sample_rate() as f64;

        let out: Vec<f32> = freq
            .iter()
            .map(|&f| {
                let sample = self.phase as f32;
                self.phase = (self.phase + f as f64 / sr).rem_euclid(1.0);
                sample
            })
            .collect();

        cx.write_stream("out", out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::{assert_close, Feed, Rig};

    #[test]
    fn test_silence() {
        let mut rig = Rig::new(Box::new(SilenceNode), Feed::new(), &[], 48000, 4);
        rig.tick();
        assert_eq!(rig.stream("out"), vec![0.0; 4]);
        rig.tick();
        assert_eq!(rig.stream("out"), vec![0.0; 4]);
    }

    #[test]
    fn test_sine_quarter_rate() {
        let mut rig = Rig::new(Box::new(SineNode::new(12000.0)), Feed::new(), &[], 48000, 4);
        rig.tick();
        assert_close(&rig.stream("out"), &[0.0, 1.0, 0.0, -1.0], 1e-6);
    }

    #[test]
    fn test_sine_phase_continuity() {
        // 1000 Hz at 48 kHz over three 16-sample ticks must match one 48-sample run.
        let mut split = Rig::new(Box::new(SineNode::new(1000.0)), Feed::new(), &[], 48000, 16);
        let mut joined = Vec::new();
        for _ in 0..3 {
            split.tick();
            joined.extend(split.stream("out"));
        }

        let mut whole = Rig::new(Box::new(SineNode::new(1000.0)), Feed::new(), &[], 48000, 48);
        whole.tick();
        assert_close(&joined, &whole.stream("out"), 1e-5);
    }

    #[test]
    fn test_sine_follows_frequency_input() {
        let feed = Feed::new().stream(vec![12000.0; 4]);
        let mut rig = Rig::new(
            Box::new(SineNode::new(0.0)),
            feed,
            &[("stream", "frequency")],
            48000,
            4,
        );
        rig.tick();
        assert_close(&rig.stream("out"), &[0.0, 1.0, 0.0, -1.0], 1e-6);
    }

    #[test]
    fn test_square_default_pwm() {
        let mut rig = Rig::new(Box::new(SquareNode::new(1.0)), Feed::new(), &[], 4, 4);
        rig.tick();
        // phase 0, 0.25, 0.5, 0.75 against threshold 0.5
        assert_eq!(rig.stream("out"), vec![-1.0, -1.0, -1.0, 1.0]);
    }

    #[test]
    fn test_sawtooth_wraps() {
        let mut rig = Rig::new(Box::new(SawtoothNode::new(1.0)), Feed::new(), &[], 4, 4);
        rig.tick();
        assert_close(&rig.stream("out"), &[0.0, 0.25, 0.5, 0.75], 1e-6);
        rig.tick();
        assert_close(&rig.stream("out"), &[0.0, 0.25, 0.5, 0.75], 1e-6);
    }

    #[test]
    fn test_constant_reads_data_input() {
        let mut rig = Rig::new(Box::new(ConstantNode::new(0.25)), Feed::new(), &[], 48000, 2);
        rig.tick();
        assert_eq!(rig.stream("out"), vec![0.25; 2]);

        let feed = Feed::new().data(0.75);
        let mut rig = Rig::new(
            Box::new(ConstantNode::new(0.25)),
            feed,
            &[("data", "value")],
            48000,
            2,
        );
        rig.tick();
        assert_eq!(rig.stream("out"), vec![0.75; 2]);
        assert_eq!(
            rig.exports().get("Value"),
            Some(&crate::primitives::ExportValue::Number(0.75))
        );
    }
}
