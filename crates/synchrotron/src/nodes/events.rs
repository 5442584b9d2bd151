//! Network event triggers
//!
//! A background worker holds the connection and forwards each event over a
//! bounded channel. The render thread drains the channel once per tick and
//! emits a single trigger pulse if anything arrived. Events that find the
//! channel full are dropped and counted. Connection failures are retried
//! forever with a fixed backoff and never reach the render thread.

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use crossbeam_channel::{Receiver, TrySendError};

use crate::bridge::{BridgeError, Guarded, Worker};
use crate::node::{Node, NodeError, RenderError};
use crate::primitives::{Exports, NodePorts, PortSpec};
use crate::scheduler::RenderCx;

/// A connection-oriented stream of discrete events.
pub trait EventSource: Send + 'static {
    /// Human-readable endpoint for logs and exports.
    fn endpoint(&self) -> String;

    fn connect(&mut self) -> anyhow::Result<()>;

    /// Wait up to `timeout` for the next event. `Ok(None)` on timeout;
    /// `Err` means the connection is lost and should be re-established.
    fn poll(&mut self, timeout: Duration) -> anyhow::Result<Option<String>>;

    fn disconnect(&mut self) {}
}

/// Newline-delimited events over TCP. Every non-empty line is one event.
pub struct LineEventSource {
    addr: String,
    subscribe: Option<String>,
    reader: Option<BufReader<TcpStream>>,
    partial: String,
}

impl LineEventSource {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            subscribe: None,
            reader: None,
            partial: String::new(),
        }
    }

    /// Line sent to the server right after each connect.
    pub fn with_subscribe(mut self, line: impl Into<String>) -> Self {
        self.subscribe = Some(line.into());
        self
    }
}

impl EventSource for LineEventSource {
    fn endpoint(&self) -> String {
        self.addr.clone()
    }

    fn connect(&mut self) -> anyhow::Result<()> {
        let mut stream = TcpStream::connect(&self.addr)
            .with_context(|| format!("failed to connect to {}", self.addr))?;
        if let Some(line) = &self.subscribe {
            stream
                .write_all(format!("{}\n", line).as_bytes())
                .context("failed to send subscription")?;
        }
        self.partial.clear();
        self.reader = Some(BufReader::new(stream));
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> anyhow::Result<Option<String>> {
        let reader = self.reader.as_mut().context("not connected")?;
        reader.get_ref().set_read_timeout(Some(timeout))?;

        loop {
            match reader.read_line(&mut self.partial) {
                Ok(0) => anyhow::bail!("connection closed by {}", self.addr),
                Ok(_) => {
                    let line = std::mem::take(&mut self.partial);
                    let event = line.trim();
                    if !event.is_empty() {
                        return Ok(Some(event.to_string()));
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(None)
                }
                Err(e) => return Err(e).context("read failed"),
            }
        }
    }

    fn disconnect(&mut self) {
        self.reader = None;
    }
}

pub static EVENT_TRIGGER_PORTS: NodePorts = NodePorts {
    type_id: "event_trigger",
    inputs: &[],
    outputs: &[PortSpec::stream("trigger")],
};

/// How long a worker blocks in `poll` before checking for stop
const POLL_SLICE: Duration = Duration::from_millis(100);

/// Events held between ticks before new ones are dropped
pub const EVENT_QUEUE_CAPACITY: usize = 64;

/// Emits 1.0 at sample 0 of any tick in which events arrived.
pub struct EventTriggerNode {
    events: Receiver<String>,
    dropped: Arc<AtomicU64>,
    connected: Guarded<bool>,
    endpoint: String,
    received: u64,
    last_event: Option<String>,
    worker: Option<Worker>,
    teardown_timeout: Duration,
}

impl EventTriggerNode {
    pub fn spawn<S: EventSource>(
        name: &str,
        source: S,
        backoff: Duration,
    ) -> Result<Self, BridgeError> {
        Self::spawn_with_capacity(name, source, backoff, EVENT_QUEUE_CAPACITY)
    }

    /// Like [`spawn`](Self::spawn) with room for `capacity` pending events.
    pub fn spawn_with_capacity<S: EventSource>(
        name: &str,
        mut source: S,
        backoff: Duration,
        capacity: usize,
    ) -> Result<Self, BridgeError> {
        let (tx, events) = crossbeam_channel::bounded(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let overflow = Arc::clone(&dropped);
        let connected = Guarded::new(false);
        let shared = connected.clone();
        let endpoint = source.endpoint();
        let log_name = name.to_string();

        let worker = Worker::spawn(format!("events-{}", name), move |stop| {
            while !stop.is_stopped() {
                if let Err(e) = source.connect() {
                    tracing::warn!(node = %log_name, "event source unavailable, retrying in {:?}: {:#}", backoff, e);
                    if !stop.sleep(backoff) {
                        break;
                    }
                    continue;
                }

                tracing::info!(node = %log_name, endpoint = %source.endpoint(), "event source connected");
                shared.set(true);

                while !stop.is_stopped() {
                    match source.poll(POLL_SLICE) {
                        Ok(Some(event)) => match tx.try_send(event) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                let total = overflow.fetch_add(1, Ordering::Relaxed) + 1;
                                tracing::debug!(node = %log_name, dropped = total, "event queue full, event dropped");
                            }
                            Err(TrySendError::Disconnected(_)) => {
                                source.disconnect();
                                return;
                            }
                        },
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!(node = %log_name, "event source lost: {:#}", e);
                            break;
                        }
                    }
                }

                shared.set(false);
                source.disconnect();
                if !stop.sleep(backoff) {
                    break;
                }
            }
            source.disconnect();
        })?;

        Ok(Self {
            events,
            dropped,
            connected,
            endpoint,
            received: 0,
            last_event: None,
            worker: Some(worker),
            teardown_timeout: Duration::from_secs(2),
        })
    }

    pub fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout = timeout;
        self
    }
}

impl Node for EventTriggerNode {
    fn ports(&self) -> &'static NodePorts {
        &EVENT_TRIGGER_PORTS
    }

    fn render(&mut self, cx: &mut RenderCx<'_>) -> Result<(), RenderError> {
        let mut out = vec![0.0; cx.buffer_size()];

        let mut arrived = 0u64;
        for event in self.events.try_iter() {
            arrived += 1;
            self.last_event = Some(event);
        }
        if arrived > 0 {
            out[0] = 1.0;
            self.received += arrived;
            tracing::trace!(node = %cx.node_name(), tick = cx.tick(), arrived, "events triggered");
        }

        cx.write_stream("trigger", out)
    }

    fn teardown(&mut self) -> Result<(), NodeError> {
        match self.worker.take() {
            Some(mut worker) => Ok(worker.join_timeout(self.teardown_timeout)?),
            None => Ok(()),
        }
    }

    fn export(&self, exports: &mut Exports) {
        exports.set("Endpoint", self.endpoint.as_str());
        exports.set("Connected", if self.connected.get() { "yes" } else { "no" });
        exports.set("Events", self.received as f64);
        exports.set("Dropped", self.dropped.load(Ordering::Relaxed) as f64);
        if let Some(event) = &self.last_event {
            exports.set("Last Event", event.as_str());
        }
    }
}
