//! PipeWire playback and capture streams
//!
//! Each stream runs its own PipeWire main loop on a [`Worker`] thread and
//! talks to the engine only through bridge queues:
//!
//! - playback: the process callback drains a [`PlaybackReader`], so an
//!   empty queue plays silence
//! - capture: the process callback feeds a [`CaptureWriter`], which pushes
//!   one buffer per `buffer_size` frames
//!
//! Both sides are interleaved stereo f32 at the engine sample rate.

use std::time::Duration;

use crossbeam_channel::Sender;
use thiserror::Error;

use crate::bridge::{
    BridgeError, CaptureProducer, CaptureWriter, PlaybackConsumer, PlaybackReader, StopSignal,
    Worker,
};

const CHANNELS: usize = 2;

/// Largest callback we preallocate scratch space for, in frames
const MAX_CALLBACK_FRAMES: usize = 8192;

/// How often the main loop checks for a stop request
const STOP_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum PipeWireError {
    #[error("pipewire: {0}")]
    Init(String),

    #[error("stream `{0}` did not start within {1:?}")]
    StartTimeout(String, Duration),

    #[error(transparent)]
    Worker(#[from] BridgeError),
}

/// Settings for one stream
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Node name shown in the PipeWire graph
    pub name: String,
    /// `target.object` to link to; `None` lets the session manager pick
    pub target: Option<String>,
    pub sample_rate: u32,
    pub buffer_size: usize,
}

impl StreamConfig {
    /// Stream for a patch device name. `"default"` means no fixed target.
    pub fn for_device(name: impl Into<String>, device: &str, sample_rate: u32, buffer_size: usize) -> Self {
        Self {
            name: name.into(),
            target: (device != "default").then(|| device.to_string()),
            sample_rate,
            buffer_size,
        }
    }

    /// `node.latency` hint, `frames/rate`
    pub fn latency(&self) -> String {
        format!("{}/{}", self.buffer_size, self.sample_rate)
    }

    fn chunk(&self) -> usize {
        self.buffer_size * CHANNELS
    }
}

/// A running PipeWire stream. Stops on drop.
pub struct PipeWireStream {
    name: String,
    worker: Worker,
}

impl PipeWireStream {
    /// Open a playback stream that drains `consumer`.
    pub fn playback(
        config: StreamConfig,
        consumer: PlaybackConsumer,
        start_timeout: Duration,
    ) -> Result<Self, PipeWireError> {
        let name = config.name.clone();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let worker = Worker::spawn(format!("pw-out-{}", name), move |stop| {
            if let Err(e) = run_playback(&config, consumer, stop, &ready_tx) {
                tracing::error!(stream = %config.name, "playback stream failed: {}", e);
                let _ = ready_tx.try_send(Err(e.to_string()));
            }
        })?;
        Self::wait_ready(name, worker, ready_rx, start_timeout)
    }

    /// Open a capture stream that feeds `producer`.
    pub fn capture(
        config: StreamConfig,
        producer: CaptureProducer,
        start_timeout: Duration,
    ) -> Result<Self, PipeWireError> {
        let name = config.name.clone();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let worker = Worker::spawn(format!("pw-in-{}", name), move |stop| {
            if let Err(e) = run_capture(&config, producer, stop, &ready_tx) {
                tracing::error!(stream = %config.name, "capture stream failed: {}", e);
                let _ = ready_tx.try_send(Err(e.to_string()));
            }
        })?;
        Self::wait_ready(name, worker, ready_rx, start_timeout)
    }

    fn wait_ready(
        name: String,
        mut worker: Worker,
        ready: crossbeam_channel::Receiver<Result<(), String>>,
        timeout: Duration,
    ) -> Result<Self, PipeWireError> {
        let outcome = match ready.recv_timeout(timeout) {
            Ok(Ok(())) => return Ok(Self { name, worker }),
            Ok(Err(message)) => PipeWireError::Init(message),
            Err(_) => PipeWireError::StartTimeout(name, timeout),
        };
        if let Err(e) = worker.join_timeout(timeout) {
            tracing::warn!("{}", e);
        }
        Err(outcome)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Quit the main loop and wait for the thread.
    pub fn stop(mut self, timeout: Duration) -> Result<(), BridgeError> {
        self.worker.join_timeout(timeout)
    }
}

fn audio_format(sample_rate: u32) -> Result<Vec<u8>, PipeWireError> {
    use pipewire as pw;
    use pw::spa;

    let mut audio_info = spa::param::audio::AudioInfoRaw::new();
    audio_info.set_format(spa::param::audio::AudioFormat::F32LE);
    audio_info.set_rate(sample_rate);
    audio_info.set_channels(CHANNELS as u32);

    let mut position = [0u32; spa::param::audio::MAX_CHANNELS];
    position[0] = pw::spa::sys::SPA_AUDIO_CHANNEL_FL;
    position[1] = pw::spa::sys::SPA_AUDIO_CHANNEL_FR;
    audio_info.set_position(position);

    let values = pw::spa::pod::serialize::PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &pw::spa::pod::Value::Object(pw::spa::pod::Object {
            type_: pw::spa::sys::SPA_TYPE_OBJECT_Format,
            id: pw::spa::sys::SPA_PARAM_EnumFormat,
            properties: audio_info.into(),
        }),
    )
    .map_err(|e| PipeWireError::Init(format!("Failed to serialize format: {}", e)))?
    .0
    .into_inner();
    Ok(values)
}

fn run_playback(
    config: &StreamConfig,
    consumer: PlaybackConsumer,
    stop: StopSignal,
    ready: &Sender<Result<(), String>>,
) -> Result<(), PipeWireError> {
    use pipewire as pw;
    use pw::spa::pod::Pod;
    use pw::{properties::properties, spa};

    pw::init();

    let mainloop = pw::main_loop::MainLoopRc::new(None)
        .map_err(|e| PipeWireError::Init(format!("Failed to create main loop: {}", e)))?;
    let context = pw::context::ContextRc::new(&mainloop, None)
        .map_err(|e| PipeWireError::Init(format!("Failed to create context: {}", e)))?;
    let core = context
        .connect_rc(None)
        .map_err(|e| PipeWireError::Init(format!("Failed to connect to PipeWire: {}", e)))?;

    let latency = config.latency();
    let mut props = properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_ROLE => "Music",
        *pw::keys::MEDIA_CATEGORY => "Playback",
        *pw::keys::AUDIO_CHANNELS => CHANNELS.to_string(),
    };
    props.insert("node.latency", latency.as_str());
    if let Some(target) = &config.target {
        props.insert("target.object", target.as_str());
    }

    let stream = pw::stream::StreamBox::new(&core, &config.name, props)
        .map_err(|e| PipeWireError::Init(format!("Failed to create stream: {}", e)))?;

    let sample_size = std::mem::size_of::<f32>();
    let stride = sample_size * CHANNELS;
    let reader = PlaybackReader::new(consumer, config.chunk());
    let scratch = vec![0.0f32; MAX_CALLBACK_FRAMES * CHANNELS];

    let _listener = stream
        .add_local_listener_with_user_data((reader, scratch))
        .process(move |stream, (reader, scratch)| {
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };
            let requested = buffer.requested() as usize;
            let datas = buffer.datas_mut();
            let Some(data) = datas.first_mut() else {
                return;
            };
            let Some(slice) = data.data() else {
                return;
            };

            let max_frames = (slice.len() / stride).min(MAX_CALLBACK_FRAMES);
            let n_frames = if requested > 0 {
                requested.min(max_frames)
            } else {
                max_frames
            };
            let samples = &mut scratch[..n_frames * CHANNELS];
            reader.read(samples);

            for (i, sample) in samples.iter().enumerate() {
                let start = i * sample_size;
                slice[start..start + sample_size].copy_from_slice(&sample.to_le_bytes());
            }

            let chunk = data.chunk_mut();
            *chunk.offset_mut() = 0;
            *chunk.stride_mut() = stride as i32;
            *chunk.size_mut() = (stride * n_frames) as u32;
        })
        .register()
        .map_err(|e| PipeWireError::Init(format!("Failed to register listener: {}", e)))?;

    let values = audio_format(config.sample_rate)?;
    let mut params = [Pod::from_bytes(&values)
        .ok_or_else(|| PipeWireError::Init("Failed to create Pod from bytes".to_string()))?];

    stream
        .connect(
            spa::utils::Direction::Output,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(|e| PipeWireError::Init(format!("Failed to connect stream: {}", e)))?;

    let mainloop_weak = mainloop.downgrade();
    let timer = mainloop.loop_().add_timer(move |_| {
        if stop.is_stopped() {
            if let Some(ml) = mainloop_weak.upgrade() {
                ml.quit();
            }
        }
    });
    timer
        .update_timer(Some(STOP_POLL), Some(STOP_POLL))
        .into_result()
        .map_err(|e| PipeWireError::Init(format!("Failed to set timer: {}", e)))?;

    tracing::info!(stream = %config.name, target = ?config.target, latency = %latency, "playback stream connected");
    let _ = ready.try_send(Ok(()));
    mainloop.run();
    tracing::debug!(stream = %config.name, "playback main loop exited");
    Ok(())
}

fn run_capture(
    config: &StreamConfig,
    producer: CaptureProducer,
    stop: StopSignal,
    ready: &Sender<Result<(), String>>,
) -> Result<(), PipeWireError> {
    use pipewire as pw;
    use pw::spa::pod::Pod;
    use pw::{properties::properties, spa};

    pw::init();

    let mainloop = pw::main_loop::MainLoopRc::new(None)
        .map_err(|e| PipeWireError::Init(format!("Failed to create main loop: {}", e)))?;
    let context = pw::context::ContextRc::new(&mainloop, None)
        .map_err(|e| PipeWireError::Init(format!("Failed to create context: {}", e)))?;
    let core = context
        .connect_rc(None)
        .map_err(|e| PipeWireError::Init(format!("Failed to connect to PipeWire: {}", e)))?;

    let latency = config.latency();
    let mut props = properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_ROLE => "Production",
        *pw::keys::MEDIA_CATEGORY => "Capture",
        *pw::keys::AUDIO_CHANNELS => CHANNELS.to_string(),
    };
    props.insert("node.latency", latency.as_str());
    if let Some(target) = &config.target {
        props.insert("target.object", target.as_str());
    }

    let stream = pw::stream::StreamBox::new(&core, &config.name, props)
        .map_err(|e| PipeWireError::Init(format!("Failed to create stream: {}", e)))?;

    let sample_size = std::mem::size_of::<f32>();
    let stride = sample_size * CHANNELS;
    let writer = CaptureWriter::new(producer, config.chunk());
    let scratch = vec![0.0f32; MAX_CALLBACK_FRAMES * CHANNELS];

    let _listener = stream
        .add_local_listener_with_user_data((writer, scratch))
        .process(move |stream, (writer, scratch)| {
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };
            let datas = buffer.datas_mut();
            let Some(data) = datas.first_mut() else {
                return;
            };
            let size = data.chunk().size() as usize;
            let Some(slice) = data.data() else {
                return;
            };

            let n_frames = (size.min(slice.len()) / stride).min(MAX_CALLBACK_FRAMES);
            if n_frames == 0 {
                return;
            }
            let samples = &mut scratch[..n_frames * CHANNELS];
            for (i, sample) in samples.iter_mut().enumerate() {
                let start = i * sample_size;
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(&slice[start..start + sample_size]);
                *sample = f32::from_le_bytes(bytes);
            }
            // the engine side is gone; the main loop is about to be stopped
            let _ = writer.write(samples);
        })
        .register()
        .map_err(|e| PipeWireError::Init(format!("Failed to register listener: {}", e)))?;

    let values = audio_format(config.sample_rate)?;
    let mut params = [Pod::from_bytes(&values)
        .ok_or_else(|| PipeWireError::Init("Failed to create Pod from bytes".to_string()))?];

    stream
        .connect(
            spa::utils::Direction::Input,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(|e| PipeWireError::Init(format!("Failed to connect stream: {}", e)))?;

    let mainloop_weak = mainloop.downgrade();
    let timer = mainloop.loop_().add_timer(move |_| {
        if stop.is_stopped() {
            if let Some(ml) = mainloop_weak.upgrade() {
                ml.quit();
            }
        }
    });
    timer
        .update_timer(Some(STOP_POLL), Some(STOP_POLL))
        .into_result()
        .map_err(|e| PipeWireError::Init(format!("Failed to set timer: {}", e)))?;

    tracing::info!(stream = %config.name, target = ?config.target, latency = %latency, "capture stream connected");
    let _ = ready.try_send(Ok(()));
    mainloop.run();
    tracing::debug!(stream = %config.name, "capture main loop exited");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_device_has_no_target() {
        let config = StreamConfig::for_device("synchrotron-out", "default", 48000, 256);
        assert_eq!(config.target, None);
        assert_eq!(config.latency(), "256/48000");
        assert_eq!(config.chunk(), 512);

        let config = StreamConfig::for_device("synchrotron-in", "alsa_input.usb", 44100, 64);
        assert_eq!(config.target.as_deref(), Some("alsa_input.usb"));
    }

    #[test]
    fn test_audio_format_serializes() {
        let values = audio_format(48000).unwrap();
        assert!(pipewire::spa::pod::Pod::from_bytes(&values).is_some());
    }
}
