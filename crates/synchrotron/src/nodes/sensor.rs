//! Background sensor input
//!
//! A worker polls a blocking [`Sensor`] and publishes the newest target
//! through a guarded value. Each render smooths per sample toward the
//! latest target, so a slow device never stalls the render thread. A
//! sensor error stops polling and fails every later render.

use std::time::Duration;

use crate::bridge::{BridgeError, Guarded, Smoother, Worker};
use crate::node::{Node, NodeError, RenderError};
use crate::primitives::{Exports, NodePorts, PortSpec};
use crate::scheduler::RenderCx;

/// A slow, blocking source of scalar readings (camera tracker, serial
/// controller, ...), polled from a background thread.
pub trait Sensor: Send + 'static {
    /// One reading. `Ok(None)` means nothing was detected this time;
    /// `Err` means the device is gone and polling stops.
    fn read(&mut self) -> anyhow::Result<Option<f32>>;
}

impl<F> Sensor for F
where
    F: FnMut() -> anyhow::Result<Option<f32>> + Send + 'static,
{
    fn read(&mut self) -> anyhow::Result<Option<f32>> {
        self()
    }
}

pub static SENSOR_PORTS: NodePorts = NodePorts {
    type_id: "sensor",
    inputs: &[],
    outputs: &[PortSpec::stream("out")],
};

#[derive(Debug, Clone, Default)]
struct Reading {
    target: f32,
    detected: bool,
    fault: Option<String>,
}

/// Streams a background sensor's reading, smoothed per sample.
///
/// Missing readings pull the output toward zero. A device fault fails every
/// later render with a device error.
pub struct SensorNode {
    reading: Guarded<Reading>,
    smoother: Smoother,
    worker: Option<Worker>,
    teardown_timeout: Duration,
}

impl SensorNode {
    pub fn spawn(
        name: &str,
        mut sensor: Box<dyn Sensor>,
        poll_interval: Duration,
        smoother: Smoother,
    ) -> Result<Self, BridgeError> {
        let reading = Guarded::new(Reading::default());
        let shared = reading.clone();
        let worker_name = format!("sensor-{}", name);
        let log_name = name.to_string();

        let worker = Worker::spawn(worker_name, move |stop| loop {
            match sensor.read() {
                Ok(value) => shared.update(|r| {
                    r.target = value.unwrap_or(0.0);
                    r.detected = value.is_some();
                }),
                Err(e) => {
                    tracing::error!(node = %log_name, "sensor failed: {:#}", e);
                    shared.update(|r| {
                        r.target = 0.0;
                        r.detected = false;
                        r.fault = Some(format!("{:#}", e));
                    });
                    return;
                }
            }
            if !stop.sleep(poll_interval) {
                return;
            }
        })?;

        Ok(Self {
            reading,
            smoother,
            worker: Some(worker),
            teardown_timeout: Duration::from_secs(2),
        })
    }

    pub fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout = timeout;
        self
    }
}

impl Node for SensorNode {
    fn ports(&self) -> &'static NodePorts {
        &SENSOR_PORTS
    }

    fn render(&mut self, cx: &mut RenderCx<'_>) -> Result<(), RenderError> {
        let reading = self.reading.get();
        if let Some(fault) = reading.fault {
            return Err(RenderError::device(fault));
        }

        let mut out = vec![0.0; cx.buffer_size()];
        self.smoother.fill(reading.target, &mut out);
        cx.write_stream("out", out)
    }

    fn teardown(&mut self) -> Result<(), NodeError> {
        match self.worker.take() {
            Some(mut worker) => Ok(worker.join_timeout(self.teardown_timeout)?),
            None => Ok(()),
        }
    }

    fn export(&self, exports: &mut Exports) {
        let reading = self.reading.get();
        exports.set("Target", reading.target as f64);
        exports.set("Value", self.smoother.value() as f64);
        exports.set("Detected", if reading.detected { "yes" } else { "no" });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::{Feed, Rig};
    use std::time::Instant;

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met in time");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_sensor_smooths_toward_reading() {
        let node = SensorNode::spawn(
            "hand",
            Box::new(|| -> anyhow::Result<Option<f32>> { Ok(Some(1.0)) }),
            Duration::from_millis(1),
            Smoother::new(Duration::from_millis(1), 1000),
        )
        .unwrap();
        let reading = node.reading.clone();
        wait_for(|| reading.get().detected);

        let mut rig = Rig::new(Box::new(node), Feed::new(), &[], 1000, 4);
        rig.tick();
        let out = rig.stream("out");
        assert!(out.windows(2).all(|w| w[1] > w[0]));
        // one sample of a 1 sample time constant covers 1 - e^-1 of the gap
        assert!((out[0] - (1.0 - (-1.0f32).exp())).abs() < 1e-6);
        assert!(out[3] < 1.0);
        assert!(rig.scheduler.teardown().is_clean());
    }

    #[test]
    fn test_sensor_without_detection_outputs_zero() {
        let node = SensorNode::spawn(
            "hand",
            Box::new(|| -> anyhow::Result<Option<f32>> { Ok(None) }),
            Duration::from_millis(1),
            Smoother::new(Duration::from_millis(10), 1000),
        )
        .unwrap();
        let mut rig = Rig::new(Box::new(node), Feed::new(), &[], 1000, 4);
        rig.tick();
        assert_eq!(rig.stream("out"), vec![0.0; 4]);
    }

    #[test]
    fn test_sensor_fault_is_device_error() {
        let node = SensorNode::spawn(
            "hand",
            Box::new(|| -> anyhow::Result<Option<f32>> { Err(anyhow::anyhow!("camera unplugged")) }),
            Duration::from_millis(1),
            Smoother::new(Duration::from_millis(10), 1000),
        )
        .unwrap();
        let reading = node.reading.clone();
        wait_for(|| reading.get().fault.is_some());

        let mut rig = Rig::new(Box::new(node), Feed::new(), &[], 1000, 4);
        let err = rig.try_tick().unwrap_err();
        assert_eq!(err.kind(), crate::node::ErrorKind::Device);
        assert!(err.to_string().contains("camera unplugged"));
    }

    #[test]
    fn test_stuck_sensor_reports_leaked_thread() {
        let node = SensorNode::spawn(
            "stuck",
            Box::new(|| -> anyhow::Result<Option<f32>> {
                std::thread::sleep(Duration::from_millis(300));
                Ok(None)
            }),
            Duration::from_millis(1),
            Smoother::new(Duration::from_millis(10), 1000),
        )
        .unwrap()
        .with_teardown_timeout(Duration::from_millis(10));

        let mut rig = Rig::new(Box::new(node), Feed::new(), &[], 1000, 4);
        let report = rig.scheduler.teardown();
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(
            report.failures[0].1,
            NodeError::LeakedThread { ref name } if name == "sensor-stuck"
        ));
    }
}
