//! Hand-off primitives between the render thread and hardware threads
//!
//! - Playback: lock-free SPSC queue of interleaved buffers. The render side
//!   never blocks; the hardware side substitutes silence on underrun.
//! - Capture: the render side keeps only the newest buffer and blocks when
//!   nothing has arrived yet.
//! - Guarded scalars plus an exponential smoother for background sensors.
//! - Worker threads with a cooperative stop signal and bounded join.
//!
//! Values cross threads by copy; nothing here hands out shared references
//! into another thread's buffers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("other side of the queue is gone")]
    Disconnected,

    #[error("no buffer arrived within {0:?}")]
    Timeout(Duration),

    #[error("playback queue full, buffer dropped")]
    Overrun,

    #[error("worker `{name}` did not stop within {timeout:?}")]
    JoinTimeout { name: String, timeout: Duration },

    #[error("worker `{name}` panicked")]
    WorkerPanicked { name: String },

    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
}

// =============================================================================
// STATS
// =============================================================================

/// Counters shared by both ends of a queue
#[derive(Debug, Default)]
pub struct BridgeStats {
    pub pushed: AtomicU64,
    pub popped: AtomicU64,
    pub underruns: AtomicU64,
    pub overruns: AtomicU64,
    pub dropped: AtomicU64,
}

/// Point-in-time copy of [`BridgeStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStatsSnapshot {
    pub pushed: u64,
    pub popped: u64,
    pub underruns: u64,
    pub overruns: u64,
    pub dropped: u64,
}

impl BridgeStats {
    pub fn snapshot(&self) -> BridgeStatsSnapshot {
        BridgeStatsSnapshot {
            pushed: self.pushed.load(Ordering::Relaxed),
            popped: self.popped.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// =============================================================================
// PLAYBACK
// =============================================================================

/// Create a playback queue holding at most `capacity` buffers.
pub fn playback_queue(capacity: usize) -> (PlaybackProducer, PlaybackConsumer) {
    let (producer, consumer) = rtrb::RingBuffer::new(capacity.max(1));
    let stats = Arc::new(BridgeStats::default());
    (
        PlaybackProducer {
            inner: producer,
            stats: Arc::clone(&stats),
        },
        PlaybackConsumer {
            inner: consumer,
            stats,
        },
    )
}

/// Render-thread end of a playback queue
pub struct PlaybackProducer {
    inner: rtrb::Producer<Vec<f32>>,
    stats: Arc<BridgeStats>,
}

impl PlaybackProducer {
    /// Enqueue one interleaved buffer without blocking.
    ///
    /// A full queue drops the buffer and counts an overrun.
    pub fn push(&mut self, buffer: Vec<f32>) -> Result<(), BridgeError> {
        match self.inner.push(buffer) {
            Ok(()) => {
                BridgeStats::bump(&self.stats.pushed);
                Ok(())
            }
            Err(_) => {
                BridgeStats::bump(&self.stats.overruns);
                Err(BridgeError::Overrun)
            }
        }
    }

    /// Free slots right now
    pub fn slots(&self) -> usize {
        self.inner.slots()
    }

    /// The hardware end was dropped, so nothing will ever drain the queue.
    pub fn is_abandoned(&self) -> bool {
        self.inner.is_abandoned()
    }

    pub fn stats(&self) -> Arc<BridgeStats> {
        Arc::clone(&self.stats)
    }
}

/// Hardware end of a playback queue
pub struct PlaybackConsumer {
    inner: rtrb::Consumer<Vec<f32>>,
    stats: Arc<BridgeStats>,
}

impl PlaybackConsumer {
    pub fn pop(&mut self) -> Option<Vec<f32>> {
        let buffer = self.inner.pop().ok()?;
        BridgeStats::bump(&self.stats.popped);
        Some(buffer)
    }

    /// Fill `out` from the next queued buffer.
    ///
    /// On underrun `out` is zeroed, the underrun counted, and `false`
    /// returned. A short buffer is padded with zeros.
    pub fn fill(&mut self, out: &mut [f32]) -> bool {
        match self.pop() {
            Some(buffer) => {
                let n = buffer.len().min(out.len());
                out[..n].copy_from_slice(&buffer[..n]);
                out[n..].fill(0.0);
                true
            }
            None => {
                BridgeStats::bump(&self.stats.underruns);
                out.fill(0.0);
                false
            }
        }
    }

    pub fn stats(&self) -> Arc<BridgeStats> {
        Arc::clone(&self.stats)
    }
}

/// Serves device callbacks that ask for an arbitrary number of samples
/// from a queue of fixed-size buffers.
///
/// A partly consumed buffer carries over to the next call.
pub struct PlaybackReader {
    consumer: PlaybackConsumer,
    carry: Vec<f32>,
    pos: usize,
}

impl PlaybackReader {
    /// `chunk` is the interleaved length of one queued buffer.
    pub fn new(consumer: PlaybackConsumer, chunk: usize) -> Self {
        let chunk = chunk.max(1);
        Self {
            consumer,
            carry: vec![0.0; chunk],
            pos: chunk,
        }
    }

    /// Fill all of `out`. Returns `false` if any part of it underran.
    pub fn read(&mut self, out: &mut [f32]) -> bool {
        let mut complete = true;
        let mut written = 0;
        while written < out.len() {
            if self.pos == self.carry.len() {
                complete &= self.consumer.fill(&mut self.carry);
                self.pos = 0;
            }
            let n = (self.carry.len() - self.pos).min(out.len() - written);
            out[written..written + n].copy_from_slice(&self.carry[self.pos..self.pos + n]);
            self.pos += n;
            written += n;
        }
        complete
    }

    pub fn stats(&self) -> Arc<BridgeStats> {
        self.consumer.stats()
    }
}

// =============================================================================
// CAPTURE
// =============================================================================

/// Create a capture queue.
pub fn capture_queue() -> (CaptureProducer, CaptureConsumer) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let stats = Arc::new(BridgeStats::default());
    (
        CaptureProducer {
            tx,
            stats: Arc::clone(&stats),
        },
        CaptureConsumer { rx, stats },
    )
}

/// Hardware end of a capture queue
#[derive(Clone)]
pub struct CaptureProducer {
    tx: Sender<Vec<f32>>,
    stats: Arc<BridgeStats>,
}

impl CaptureProducer {
    pub fn push(&self, buffer: Vec<f32>) -> Result<(), BridgeError> {
        self.tx.send(buffer).map_err(|_| BridgeError::Disconnected)?;
        BridgeStats::bump(&self.stats.pushed);
        Ok(())
    }
}

/// Render-thread end of a capture queue
pub struct CaptureConsumer {
    rx: Receiver<Vec<f32>>,
    stats: Arc<BridgeStats>,
}

impl CaptureConsumer {
    /// Newest queued buffer, discarding older ones. Blocks until one
    /// arrives if the queue is empty.
    pub fn latest(&self) -> Result<Vec<f32>, BridgeError> {
        match self.drain() {
            Some(buffer) => Ok(buffer),
            None => {
                let buffer = self.rx.recv().map_err(|_| BridgeError::Disconnected)?;
                BridgeStats::bump(&self.stats.popped);
                Ok(buffer)
            }
        }
    }

    /// Like [`latest`](Self::latest) but gives up after `timeout`.
    pub fn latest_timeout(&self, timeout: Duration) -> Result<Vec<f32>, BridgeError> {
        match self.drain() {
            Some(buffer) => Ok(buffer),
            None => match self.rx.recv_timeout(timeout) {
                Ok(buffer) => {
                    BridgeStats::bump(&self.stats.popped);
                    Ok(buffer)
                }
                Err(RecvTimeoutError::Timeout) => Err(BridgeError::Timeout(timeout)),
                Err(RecvTimeoutError::Disconnected) => Err(BridgeError::Disconnected),
            },
        }
    }

    /// Buffers waiting right now
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    pub fn stats(&self) -> Arc<BridgeStats> {
        Arc::clone(&self.stats)
    }

    fn drain(&self) -> Option<Vec<f32>> {
        let mut newest = None;
        loop {
            match self.rx.try_recv() {
                Ok(buffer) => {
                    if newest.replace(buffer).is_some() {
                        BridgeStats::bump(&self.stats.dropped);
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        if newest.is_some() {
            BridgeStats::bump(&self.stats.popped);
        }
        newest
    }
}

/// Collects device callbacks of any length into fixed-size capture buffers.
pub struct CaptureWriter {
    producer: CaptureProducer,
    chunk: usize,
    pending: Vec<f32>,
}

impl CaptureWriter {
    /// `chunk` is the interleaved length of one pushed buffer.
    pub fn new(producer: CaptureProducer, chunk: usize) -> Self {
        let chunk = chunk.max(1);
        Self {
            producer,
            chunk,
            pending: Vec::with_capacity(chunk),
        }
    }

    /// Append samples, pushing every buffer that fills up.
    pub fn write(&mut self, mut samples: &[f32]) -> Result<(), BridgeError> {
        while !samples.is_empty() {
            let n = (self.chunk - self.pending.len()).min(samples.len());
            self.pending.extend_from_slice(&samples[..n]);
            samples = &samples[n..];
            if self.pending.len() == self.chunk {
                let full = std::mem::replace(&mut self.pending, Vec::with_capacity(self.chunk));
                self.producer.push(full)?;
            }
        }
        Ok(())
    }
}

// =============================================================================
// GUARDED SCALARS
// =============================================================================

/// A value shared between a background thread and the render thread.
///
/// A poisoned lock still yields the last written value; the writer that
/// panicked cannot have left a `Clone` value half-written.
#[derive(Debug, Default)]
pub struct Guarded<T> {
    inner: Arc<Mutex<T>>,
}

impl<T> Clone for Guarded<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> Guarded<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(value)),
        }
    }

    pub fn get(&self) -> T {
        self.lock().clone()
    }

    pub fn set(&self, value: T) {
        *self.lock() = value;
    }

    pub fn update(&self, f: impl FnOnce(&mut T)) {
        f(&mut self.lock());
    }

    fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One-pole exponential smoother.
///
/// Moves `1 - exp(-1 / (tau * sample_rate))` of the remaining distance to
/// the target each sample.
#[derive(Debug, Clone)]
pub struct Smoother {
    value: f32,
    coeff: f32,
}

impl Smoother {
    pub fn new(time_constant: Duration, sample_rate: u32) -> Self {
        let samples = time_constant.as_secs_f64() * sample_rate as f64;
        let coeff = if samples <= 0.0 {
            1.0
        } else {
            1.0 - (-1.0 / samples).exp()
        };
        Self {
            value: 0.0,
            coeff: coeff as f32,
        }
    }

    pub fn with_initial(mut self, value: f32) -> Self {
        self.value = value;
        self
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn coefficient(&self) -> f32 {
        self.coeff
    }

    pub fn next(&mut self, target: f32) -> f32 {
        self.value += self.coeff * (target - self.value);
        self.value
    }

    pub fn fill(&mut self, target: f32, out: &mut [f32]) {
        for sample in out.iter_mut() {
            *sample = self.next(target);
        }
    }
}

// =============================================================================
// WORKERS
// =============================================================================

/// Handed to a worker's body; tells it when to stop.
pub struct StopSignal {
    stopped: Arc<AtomicBool>,
    wake: Receiver<()>,
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Sleep up to `duration`, returning early on stop.
    ///
    /// Returns `true` if the worker should keep running.
    pub fn sleep(&self, duration: Duration) -> bool {
        match self.wake.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => !self.is_stopped(),
            _ => false,
        }
    }
}

/// A named background thread with cooperative shutdown.
pub struct Worker {
    name: String,
    stopped: Arc<AtomicBool>,
    stop_tx: Option<Sender<()>>,
    done_rx: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn<F>(name: impl Into<String>, body: F) -> Result<Self, BridgeError>
    where
        F: FnOnce(StopSignal) + Send + 'static,
    {
        let name = name.into();
        let stopped = Arc::new(AtomicBool::new(false));
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);

        let signal = StopSignal {
            stopped: Arc::clone(&stopped),
            wake: stop_rx,
        };

        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            // Dropped on return or unwind; the join side sees the disconnect.
            let _done = done_tx;
            body(signal);
        })?;

        tracing::debug!(worker = %name, "worker started");
        Ok(Self {
            name,
            stopped,
            stop_tx: Some(stop_tx),
            done_rx,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the worker to stop and wake it if sleeping.
    pub fn stop(&mut self) {
        self.stopped.store(true, Ordering::Release);
        self.stop_tx.take();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map(|h| h.is_finished()).unwrap_or(true)
    }

    /// Stop the worker and wait up to `timeout` for it to exit.
    ///
    /// On timeout the thread is detached and left running.
    pub fn join_timeout(&mut self, timeout: Duration) -> Result<(), BridgeError> {
        self.stop();
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        match self.done_rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(worker = %self.name, ?timeout, "worker did not stop in time, leaking thread");
                Err(BridgeError::JoinTimeout {
                    name: self.name.clone(),
                    timeout,
                })
            }
            _ => match handle.join() {
                Ok(()) => {
                    tracing::debug!(worker = %self.name, "worker stopped");
                    Ok(())
                }
                Err(_) => Err(BridgeError::WorkerPanicked {
                    name: self.name.clone(),
                }),
            },
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_playback_overrun_and_underrun() {
        let (mut tx, mut rx) = playback_queue(2);
        tx.push(vec![1.0, 1.0]).unwrap();
        tx.push(vec![2.0, 2.0]).unwrap();
        assert!(matches!(tx.push(vec![3.0, 3.0]), Err(BridgeError::Overrun)));

        let mut out = [9.0f32; 2];
        assert!(rx.fill(&mut out));
        assert_eq!(out, [1.0, 1.0]);
        assert!(rx.fill(&mut out));
        assert_eq!(out, [2.0, 2.0]);
        assert!(!rx.fill(&mut out));
        assert_eq!(out, [0.0, 0.0]);

        let stats = rx.stats().snapshot();
        assert_eq!(stats.pushed, 2);
        assert_eq!(stats.popped, 2);
        assert_eq!(stats.overruns, 1);
        assert_eq!(stats.underruns, 1);
    }

    #[test]
    fn test_playback_pads_short_buffer() {
        let (mut tx, mut rx) = playback_queue(1);
        tx.push(vec![0.5]).unwrap();
        let mut out = [9.0f32; 3];
        assert!(rx.fill(&mut out));
        assert_eq!(out, [0.5, 0.0, 0.0]);
    }

    #[test]
    fn test_capture_keeps_newest() {
        let (tx, rx) = capture_queue();
        tx.push(vec![1.0]).unwrap();
        tx.push(vec![2.0]).unwrap();
        tx.push(vec![3.0]).unwrap();

        assert_eq!(rx.latest().unwrap(), vec![3.0]);
        assert_eq!(rx.pending(), 0);
        assert_eq!(rx.stats().snapshot().dropped, 2);
    }

    #[test]
    fn test_capture_blocks_until_arrival() {
        let (tx, rx) = capture_queue();
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            tx.push(vec![4.0]).unwrap();
        });

        assert_eq!(rx.latest().unwrap(), vec![4.0]);
        writer.join().unwrap();
    }

    #[test]
    fn test_capture_timeout_and_disconnect() {
        let (tx, rx) = capture_queue();
        assert!(matches!(
            rx.latest_timeout(Duration::from_millis(5)),
            Err(BridgeError::Timeout(_))
        ));
        drop(tx);
        assert!(matches!(rx.latest(), Err(BridgeError::Disconnected)));
    }

    #[test]
    fn test_playback_reader_spans_buffers() {
        let (mut tx, rx) = playback_queue(4);
        tx.push(vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        tx.push(vec![5.0, 6.0, 7.0, 8.0]).unwrap();
        let mut reader = PlaybackReader::new(rx, 4);

        let mut out = [0.0; 3];
        assert!(reader.read(&mut out));
        assert_eq!(out, [1.0, 2.0, 3.0]);
        assert!(reader.read(&mut out));
        assert_eq!(out, [4.0, 5.0, 6.0]);

        // two left, then the queue runs dry
        assert!(!reader.read(&mut out));
        assert_eq!(out, [7.0, 8.0, 0.0]);
        assert_eq!(reader.stats().snapshot().underruns, 1);
    }

    #[test]
    fn test_capture_writer_rechunks() {
        let (tx, rx) = capture_queue();
        let mut writer = CaptureWriter::new(tx, 4);
        writer.write(&[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(rx.pending(), 0);
        writer.write(&[4.0, 5.0, 6.0, 7.0, 8.0, 9.0]).unwrap();
        assert_eq!(rx.pending(), 2);
        assert_eq!(rx.latest().unwrap(), vec![5.0, 6.0, 7.0, 8.0]);

        drop(rx);
        assert!(matches!(
            writer.write(&[0.0; 3]),
            Err(BridgeError::Disconnected)
        ));
    }

    #[test]
    fn test_guarded_survives_poison() {
        let value = Guarded::new(1.0f32);
        let writer = value.clone();
        let _ = thread::spawn(move || {
            writer.update(|v| {
                *v = 2.0;
                panic!("sensor thread died");
            });
        })
        .join();
        assert_eq!(value.get(), 2.0);
        value.set(3.0);
        assert_eq!(value.get(), 3.0);
    }

    #[test]
    fn test_smoother_converges() {
        let mut smoother = Smoother::new(Duration::from_millis(1), 1000);
        // tau of one sample: 1 - e^-1 of the way each step
        let expected = 1.0 - (-1.0f32).exp();
        assert!((smoother.next(1.0) - expected).abs() < 1e-6);

        let mut out = vec![0.0; 50];
        smoother.fill(1.0, &mut out);
        assert!((out[49] - 1.0).abs() < 1e-6);
        assert!(out.windows(2).all(|w| w[1] >= w[0]));
    }

    #[test]
    fn test_smoother_zero_time_constant_jumps() {
        let mut smoother = Smoother::new(Duration::ZERO, 48000).with_initial(0.25);
        assert_eq!(smoother.next(0.75), 0.75);
    }

    #[test]
    fn test_worker_stops_promptly() {
        let mut worker = Worker::spawn("test-worker", |stop| {
            while stop.sleep(Duration::from_secs(10)) {}
        })
        .unwrap();

        let start = Instant::now();
        worker.join_timeout(Duration::from_secs(2)).unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(worker.is_finished());
    }

    #[test]
    fn test_worker_join_timeout_reports_leak() {
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
        let mut worker = Worker::spawn("stuck-worker", move |_stop| {
            let _ = release_rx.recv();
        })
        .unwrap();

        let err = worker.join_timeout(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, BridgeError::JoinTimeout { ref name, .. } if name == "stuck-worker"));
        release_tx.send(()).unwrap();
    }
}
