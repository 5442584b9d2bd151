//! Synchrotron runner
//!
//! Loads engine config and a TOML patch, builds the graph, and drives it
//! offline or in real time. Built with the `pipewire` feature, realtime
//! runs open a PipeWire stream for each playback and recording node.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use synchroconf::{EngineConfig, PatchConfig, SynchroConfig};
use synchrotron::{build_patch_with_devices, Devices, Driver, ErrorPolicy, NodeRegistry, Pacing};
use tracing_subscriber::EnvFilter;

/// Render a Synchrotron patch
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Engine config file (replaces ./synchrotron.toml in the search order)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Patch file describing nodes and connections
    #[arg(short, long, required_unless_present = "describe")]
    patch: Option<PathBuf>,

    /// Seconds of audio to render; runs until killed when omitted in realtime mode
    #[arg(short, long)]
    seconds: Option<f64>,

    /// Pace ticks to the buffer period instead of rendering flat out, and
    /// attach hardware devices when built with PipeWire support
    #[arg(long)]
    realtime: bool,

    /// What to do when a tick fails: halt or skip
    #[arg(long, default_value = "halt")]
    on_error: ErrorPolicy,

    /// Print the built-in node types and their ports as JSON, then exit
    #[arg(long)]
    describe: bool,

    /// Print the built graph as JSON before running
    #[arg(long)]
    dump_graph: bool,
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level)
        .with_context(|| format!("Invalid log filter `{}`", level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

/// Hardware streams backing the patch's device nodes
struct HostDevices {
    devices: Devices,
    #[cfg(feature = "pipewire")]
    streams: Vec<synchrotron::pipewire_io::PipeWireStream>,
}

impl HostDevices {
    fn none() -> Self {
        Self {
            devices: Devices::new(),
            #[cfg(feature = "pipewire")]
            streams: Vec::new(),
        }
    }

    /// One stream per distinct device name. A second node naming the same
    /// device fails the build when it finds the device already claimed.
    #[cfg(feature = "pipewire")]
    fn open(patch: &PatchConfig, engine: &EngineConfig) -> Result<Self> {
        use std::collections::HashSet;
        use synchrotron::pipewire_io::{PipeWireStream, StreamConfig};
        use synchrotron::{capture_queue, playback_queue};

        let mut host = Self::none();
        let mut opened = HashSet::new();
        let timeout = engine.teardown_timeout();
        for node in &patch.nodes {
            let kind = node.type_name.as_str();
            if kind != "playback" && kind != "recording" {
                continue;
            }
            let device = node
                .params
                .get("device")
                .and_then(|v| v.as_str())
                .unwrap_or("default");
            if !opened.insert((kind, device)) {
                continue;
            }
            let config = StreamConfig::for_device(
                format!("synchrotron-{}", node.name),
                device,
                engine.sample_rate,
                engine.buffer_size,
            );
            if kind == "playback" {
                let (producer, consumer) = playback_queue(engine.playback_queue_buffers);
                let stream = PipeWireStream::playback(config, consumer, timeout)
                    .with_context(|| format!("Failed to open playback device `{}`", device))?;
                host.streams.push(stream);
                host.devices.add_playback(device, producer);
            } else {
                let (producer, consumer) = capture_queue();
                let stream = PipeWireStream::capture(config, producer, timeout)
                    .with_context(|| format!("Failed to open capture device `{}`", device))?;
                host.streams.push(stream);
                host.devices.add_capture(device, consumer);
            }
        }
        Ok(host)
    }

    #[cfg(not(feature = "pipewire"))]
    fn open(_patch: &PatchConfig, _engine: &EngineConfig) -> Result<Self> {
        tracing::warn!("built without PipeWire support; playback goes to a null sink");
        Ok(Self::none())
    }

    fn close(self, _timeout: Duration) {
        #[cfg(feature = "pipewire")]
        for stream in self.streams {
            let name = stream.name().to_string();
            if let Err(e) = stream.stop(_timeout) {
                tracing::warn!(stream = %name, "{}", e);
            }
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, sources) = SynchroConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;
    init_tracing(&config.telemetry.log_level)?;

    for file in &sources.files {
        tracing::debug!(path = %file.display(), "config file applied");
    }
    for var in &sources.env_overrides {
        tracing::debug!(var = %var, "env override applied");
    }

    let registry = NodeRegistry::with_builtin();
    if cli.describe {
        let json = serde_json::to_string_pretty(&registry.describe())
            .context("Failed to serialize node types")?;
        println!("{}", json);
        return Ok(());
    }

    let patch_path = cli.patch.context("--patch is required")?;
    let patch = PatchConfig::load(&patch_path)
        .with_context(|| format!("Failed to load patch {}", patch_path.display()))?;

    let mut host = if cli.realtime {
        HostDevices::open(&patch, &config.engine)?
    } else {
        HostDevices::none()
    };
    let scheduler = build_patch_with_devices(&registry, &patch, &config.engine, &mut host.devices)
        .with_context(|| format!("Failed to build patch {}", patch_path.display()))?;

    if cli.dump_graph {
        let json = serde_json::to_string_pretty(&scheduler.graph().snapshot())
            .context("Failed to serialize graph")?;
        println!("{}", json);
    }

    let pacing = if cli.realtime {
        Pacing::Realtime
    } else {
        Pacing::Offline
    };
    let driver = Driver::new(scheduler)
        .with_pacing(pacing)
        .with_error_policy(cli.on_error);

    let ticks = match cli.seconds {
        Some(seconds) if seconds.is_finite() && seconds >= 0.0 => {
            Some(driver.ticks_for(Duration::from_secs_f64(seconds)))
        }
        Some(seconds) => anyhow::bail!("--seconds must be a non-negative number, got {}", seconds),
        None if pacing == Pacing::Realtime => None,
        None => anyhow::bail!("Offline rendering needs --seconds"),
    };

    let report = driver.run(ticks);
    host.close(config.engine.teardown_timeout());
    let report = report.into_result()?;
    tracing::info!(
        ticks = report.ticks_rendered,
        failed = report.ticks_failed,
        late = report.late_ticks,
        elapsed = ?report.elapsed,
        "done"
    );
    Ok(())
}
