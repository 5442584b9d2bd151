//! Stream effects

use crate::node::{Node, RenderError};
use crate::primitives::{NodePorts, PortSpec};
use crate::scheduler::RenderCx;

pub static BITCRUSH_PORTS: NodePorts = NodePorts {
    type_id: "bitcrush",
    inputs: &[PortSpec::stream("signal"), PortSpec::stream("bit_depth")],
    outputs: &[PortSpec::stream("out")],
};

/// Quantizes `signal` to `2^bit_depth` steps per unit.
#[derive(Debug, Default)]
pub struct BitcrushNode;

impl BitcrushNode {
    pub const DEFAULT_BIT_DEPTH: f32 = 16.0;
}

impl Node for BitcrushNode {
    fn ports(&self) -> &'static NodePorts {
        &BITCRUSH_PORTS
    }

    fn render(&mut self, cx: &mut RenderCx<'_>) -> Result<(), RenderError> {
        let signal = cx.read_stream("signal")?;
        let bit_depth = cx.read_stream_or("bit_depth", Self::DEFAULT_BIT_DEPTH)?;

        let out: Vec<f32> = signal
            .iter()
            .zip(bit_depth.iter())
            .map(|(&x, &bits)| {
                let steps = 2f32.powf(bits);
                (x * steps).round() / steps
            })
            .collect();

        cx.write_stream("out", out)
    }
}
