//! Audio device and file nodes
//!
//! Hardware adapters own the other end of a bridge queue; these nodes only
//! see the render-thread end. The hardware boundary is interleaved stereo
//! f32, exactly `buffer_size` frames per chunk.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bridge::{
    playback_queue, BridgeError, CaptureConsumer, PlaybackProducer, Worker,
};
use crate::node::{Node, NodeError, RenderError};
use crate::primitives::{Exports, NodePorts, PortSpec};
use crate::scheduler::RenderCx;

pub static PLAYBACK_PORTS: NodePorts = NodePorts {
    type_id: "playback",
    inputs: &[PortSpec::stream("left"), PortSpec::stream("right")],
    outputs: &[],
};

pub static RECORDING_PORTS: NodePorts = NodePorts {
    type_id: "recording",
    inputs: &[],
    outputs: &[PortSpec::stream("left"), PortSpec::stream("right")],
};

pub static WAV_FILE_PORTS: NodePorts = NodePorts {
    type_id: "wav_file",
    inputs: &[PortSpec::stream("signal")],
    outputs: &[],
};

// =============================================================================
// PLAYBACK
// =============================================================================

/// Interleaves `left` and `right` into a playback queue.
///
/// A full queue drops the buffer and counts an overrun; the render thread
/// never waits on the device. A device whose end of the queue is gone
/// fails the render.
pub struct PlaybackNode {
    producer: PlaybackProducer,
    device: String,
    clock: Option<Worker>,
    teardown_timeout: Duration,
}

impl PlaybackNode {
    /// Attach to a queue whose consumer a hardware adapter drives.
    pub fn new(producer: PlaybackProducer, device: impl Into<String>) -> Self {
        Self {
            producer,
            device: device.into(),
            clock: None,
            teardown_timeout: Duration::from_secs(2),
        }
    }

    /// Play into a device-less sink that drains one buffer every `period`,
    /// standing in for a hardware callback.
    pub fn clocked(
        period: Duration,
        buffer_size: usize,
        queue_buffers: usize,
    ) -> Result<Self, BridgeError> {
        let (producer, mut consumer) = playback_queue(queue_buffers);
        let frames = buffer_size * 2;

        let clock = Worker::spawn("playback-clock", move |stop| {
            let mut chunk = vec![0.0f32; frames];
            while stop.sleep(period) {
                consumer.fill(&mut chunk);
            }
        })?;

        Ok(Self {
            producer,
            device: "null".to_string(),
            clock: Some(clock),
            teardown_timeout: Duration::from_secs(2),
        })
    }

    pub fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout = timeout;
        self
    }
}

impl Node for PlaybackNode {
    fn ports(&self) -> &'static NodePorts {
        &PLAYBACK_PORTS
    }

    fn render(&mut self, cx: &mut RenderCx<'_>) -> Result<(), RenderError> {
        if self.producer.is_abandoned() {
            return Err(RenderError::device(format!(
                "playback device `{}` stopped",
                self.device
            )));
        }
        let left = cx.read_stream("left")?;
        let right = cx.read_stream("right")?;

        let mut interleaved = Vec::with_capacity(left.len() * 2);
        for (l, r) in left.iter().zip(right.iter()) {
            interleaved.push(*l);
            interleaved.push(*r);
        }

        if let Err(BridgeError::Overrun) = self.producer.push(interleaved) {
            tracing::trace!(node = %cx.node_name(), tick = cx.tick(), "playback overrun");
        }
        Ok(())
    }

    fn teardown(&mut self) -> Result<(), NodeError> {
        match self.clock.take() {
            Some(mut clock) => Ok(clock.join_timeout(self.teardown_timeout)?),
            None => Ok(()),
        }
    }

    fn export(&self, exports: &mut Exports) {
        let stats = self.producer.stats().snapshot();
        exports.set("Device", self.device.as_str());
        exports.set("Queue Free", self.producer.slots() as f64);
        exports.set("Overruns", stats.overruns as f64);
        exports.set("Underruns", stats.underruns as f64);
    }
}

// =============================================================================
// RECORDING
// =============================================================================

/// Splits captured interleaved stereo into `left` and `right`.
///
/// Only the newest captured buffer is used each tick; older ones are
/// dropped. With nothing captured the tick waits for the device, up to
/// the optional timeout.
pub struct RecordingNode {
    consumer: CaptureConsumer,
    device: String,
    timeout: Option<Duration>,
    short_frames: u64,
}

impl RecordingNode {
    pub fn new(consumer: CaptureConsumer, device: impl Into<String>) -> Self {
        Self {
            consumer,
            device: device.into(),
            timeout: None,
            short_frames: 0,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Node for RecordingNode {
    fn ports(&self) -> &'static NodePorts {
        &RECORDING_PORTS
    }

    fn render(&mut self, cx: &mut RenderCx<'_>) -> Result<(), RenderError> {
        let captured = match self.timeout {
            Some(timeout) => self.consumer.latest_timeout(timeout),
            None => self.consumer.latest(),
        }
        .map_err(|e| RenderError::device(format!("{}: {}", self.device, e)))?;

        let frames = cx.buffer_size();
        if captured.len() != frames * 2 {
            self.short_frames += 1;
            tracing::debug!(
                node = %cx.node_name(),
                got = captured.len(),
                expected = frames * 2,
                "capture size mismatch, padding with silence"
            );
        }

        let mut left = vec![0.0; frames];
        let mut right = vec![0.0; frames];
        for (i, frame) in captured.chunks_exact(2).take(frames).enumerate() {
            left[i] = frame[0];
            right[i] = frame[1];
        }

        cx.write_stream("left", left)?;
        cx.write_stream("right", right)
    }

    fn export(&self, exports: &mut Exports) {
        let stats = self.consumer.stats().snapshot();
        exports.set("Device", self.device.as_str());
        exports.set("Dropped", stats.dropped as f64);
        exports.set("Short Frames", self.short_frames as f64);
    }
}

// =============================================================================
// WAV FILE
// =============================================================================

/// Appends `signal` to a mono 32-bit float WAV file.
///
/// The file is finalized in teardown; until then its header is incomplete.
pub struct WavFileNode {
    path: PathBuf,
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    samples_written: u64,
}

impl WavFileNode {
    pub const DEFAULT_PATH: &'static str = "output.wav";

    pub fn create(path: impl AsRef<Path>, sample_rate: u32) -> Result<Self, hound::Error> {
        let path = path.as_ref().to_path_buf();
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let writer = hound::WavWriter::create(&path, spec)?;
        tracing::info!(path = %path.display(), sample_rate, "WAV sink opened");

        Ok(Self {
            path,
            writer: Some(writer),
            samples_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Node for WavFileNode {
    fn ports(&self) -> &'static NodePorts {
        &WAV_FILE_PORTS
    }

    fn render(&mut self, cx: &mut RenderCx<'_>) -> Result<(), RenderError> {
        let signal = cx.read_stream("signal")?;
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| RenderError::device("WAV file already finalized"))?;

        for &sample in signal.iter() {
            writer
                .write_sample(sample)
                .map_err(|e| RenderError::device(format!("{}: {}", self.path.display(), e)))?;
        }
        self.samples_written += signal.len() as u64;
        Ok(())
    }

    fn teardown(&mut self) -> Result<(), NodeError> {
        if let Some(writer) = self.writer.take() {
            writer.finalize()?;
            tracing::info!(
                path = %self.path.display(),
                samples = self.samples_written,
                "WAV sink finalized"
            );
        }
        Ok(())
    }

    fn export(&self, exports: &mut Exports) {
        exports.set("File Path", self.path.display().to_string());
        exports.set("Samples", self.samples_written as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::capture_queue;
    use crate::nodes::testing::{Feed, Rig};

    #[test]
    fn test_playback_interleaves() {
        let (producer, mut consumer) = playback_queue(2);
        let feed = Feed::new()
            .stream(vec![1.0, 2.0, 3.0])
            .stream2(vec![-1.0, -2.0, -3.0]);
        let mut rig = Rig::new(
            Box::new(PlaybackNode::new(producer, "test")),
            feed,
            &[("stream", "left"), ("stream2", "right")],
            48000,
            3,
        );
        rig.tick();

        assert_eq!(
            consumer.pop().unwrap(),
            vec![1.0, -1.0, 2.0, -2.0, 3.0, -3.0]
        );
    }

    #[test]
    fn test_playback_overrun_is_not_fatal() {
        let (producer, _consumer) = playback_queue(1);
        let mut rig = Rig::new(Box::new(PlaybackNode::new(producer, "test")), Feed::new(), &[], 48000, 2);
        rig.tick();
        rig.tick();
        rig.tick();
        assert_eq!(
            rig.exports().get("Overruns"),
            Some(&crate::primitives::ExportValue::Number(2.0))
        );
    }

    #[test]
    fn test_playback_fails_once_device_stops() {
        let (producer, consumer) = playback_queue(4);
        let mut rig = Rig::new(Box::new(PlaybackNode::new(producer, "test")), Feed::new(), &[], 48000, 2);
        rig.tick();
        assert_eq!(
            rig.exports().get("Queue Free"),
            Some(&crate::primitives::ExportValue::Number(3.0))
        );

        drop(consumer);
        let err = rig.try_tick().unwrap_err();
        assert_eq!(err.kind(), crate::node::ErrorKind::Device);
    }

    #[test]
    fn test_clocked_playback_tears_down() {
        let node = PlaybackNode::clocked(Duration::from_micros(1333), 64, 2).unwrap();
        let mut rig = Rig::new(Box::new(node), Feed::new(), &[], 48000, 64);
        rig.tick();
        let report = rig.scheduler.teardown();
        assert!(report.is_clean());
    }

    #[test]
    fn test_recording_uses_newest_capture() {
        let (producer, consumer) = capture_queue();
        producer.push(vec![9.0; 4]).unwrap();
        producer.push(vec![1.0, -1.0, 2.0, -2.0]).unwrap();

        let mut rig = Rig::new(
            Box::new(RecordingNode::new(consumer, "test")),
            Feed::new(),
            &[],
            48000,
            2,
        );
        rig.tick();
        assert_eq!(rig.stream("left"), vec![1.0, 2.0]);
        assert_eq!(rig.stream("right"), vec![-1.0, -2.0]);
        assert_eq!(
            rig.exports().get("Dropped"),
            Some(&crate::primitives::ExportValue::Number(1.0))
        );
    }

    #[test]
    fn test_recording_pads_short_capture() {
        let (producer, consumer) = capture_queue();
        producer.push(vec![0.5, 0.25]).unwrap();

        let mut rig = Rig::new(Box::new(RecordingNode::new(consumer, "test")), Feed::new(), &[], 48000, 3);
        rig.tick();
        assert_eq!(rig.stream("left"), vec![0.5, 0.0, 0.0]);
        assert_eq!(rig.stream("right"), vec![0.25, 0.0, 0.0]);
    }

    #[test]
    fn test_recording_timeout_is_device_error() {
        let (_producer, consumer) = capture_queue();
        let node = RecordingNode::new(consumer, "mic").with_timeout(Some(Duration::from_millis(5)));
        let mut rig = Rig::new(Box::new(node), Feed::new(), &[], 48000, 2);

        let err = rig.try_tick().unwrap_err();
        assert_eq!(err.kind(), crate::node::ErrorKind::Device);
        assert!(err.to_string().contains("mic"));
    }

    #[test]
    fn test_wav_file_written_and_finalized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");

        let feed = Feed::new()
            .stream(vec![0.0, 0.5])
            .stream(vec![-0.5, 1.0]);
        let node = WavFileNode::create(&path, 8000).unwrap();
        let mut rig = Rig::new(Box::new(node), feed, &[("stream", "signal")], 8000, 2);
        rig.tick();
        rig.tick();
        assert!(rig.scheduler.teardown().is_clean());

        let mut reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.spec().sample_rate, 8000);
        let samples: Vec<f32> = reader.samples::<f32>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![0.0, 0.5, -0.5, 1.0]);
    }
}
