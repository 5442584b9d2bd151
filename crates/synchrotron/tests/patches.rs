//! Integration tests for TOML patches
//!
//! Builds patches through the node registry and drives them to completion,
//! the same path the `synchrotron` binary takes.

use synchroconf::{EngineConfig, PatchConfig};
use synchrotron::{
    build_patch, build_patch_with_devices, capture_queue, BuildError, Devices, Driver,
    ErrorKind, ErrorPolicy, NodeRegistry, PatchError, Scheduler,
};
use tempfile::TempDir;

fn engine(sample_rate: u32, buffer_size: usize) -> EngineConfig {
    EngineConfig {
        sample_rate,
        buffer_size,
        ..EngineConfig::default()
    }
}

fn build(toml: &str, engine: &EngineConfig) -> Result<Scheduler, BuildError> {
    let patch = PatchConfig::from_toml_str(toml).unwrap();
    build_patch(&NodeRegistry::with_builtin(), &patch, engine)
}

fn stream(scheduler: &Scheduler, name: &str, port: &str) -> Vec<f32> {
    let id = scheduler.graph().id_of(name).unwrap();
    scheduler
        .output(id, port)
        .and_then(|v| v.as_stream())
        .map(|s| s.to_vec())
        .unwrap()
}

#[test]
fn test_sine_through_bitcrush_to_wav() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("crushed.wav");
    let toml = format!(
        r#"
[[node]]
name = "osc"
type = "sine"
params = {{ frequency = 220.0 }}

[[node]]
name = "crush"
type = "bitcrush"

[[node]]
name = "out"
type = "wav_file"
params = {{ path = '{}' }}

[[connection]]
from = "osc.out"
to = "crush.signal"

[[connection]]
from = "crush.out"
to = "out.signal"
"#,
        path.display()
    );

    let scheduler = build(&toml, &engine(8000, 64)).unwrap();
    let driver = Driver::new(scheduler);
    let ticks = driver.ticks_for(std::time::Duration::from_millis(100));
    assert_eq!(ticks, 13);

    let report = driver.run(Some(ticks)).into_result().unwrap();
    assert_eq!(report.ticks_rendered, 13);
    assert!(report.teardown.is_clean());

    let reader = hound::WavReader::open(&path).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.channels, 1);
    assert_eq!(spec.sample_rate, 8000);
    let samples: Vec<f32> = reader.into_samples::<f32>().map(|s| s.unwrap()).collect();
    assert_eq!(samples.len(), 13 * 64);
    assert!(samples.iter().all(|s| (-1.0..=1.0).contains(s)));
    assert!(samples.iter().any(|s| s.abs() > 0.5));
}

#[test]
fn test_chord_gated_by_square_drives_sine() {
    // At 8 Hz a 0.5 Hz square spans two ticks: low for tick 0, high from
    // sample 1 of tick 1.
    let toml = r#"
always_render = ["voice"]

[[node]]
name = "clock"
type = "square"
params = { frequency = 0.5 }

[[node]]
name = "chords"
type = "chord"
params = { progression = "C F" }

[[node]]
name = "mono"
type = "monophonic_render"

[[node]]
name = "voice"
type = "sine"

[[connection]]
from = "clock.out"
to = "chords.gate"

[[connection]]
from = "chords.out"
to = "mono.midi"

[[connection]]
from = "mono.frequency"
to = "voice.frequency"
"#;
    let mut scheduler = build(toml, &engine(8, 8)).unwrap();

    scheduler.render_tick().unwrap();
    assert_eq!(stream(&scheduler, "mono", "frequency"), vec![0.0; 8]);

    scheduler.render_tick().unwrap();
    let first = stream(&scheduler, "mono", "frequency");
    assert_eq!(first[0], 0.0);
    assert!(first[1] > 0.0, "{:?}", first);
    assert!(first[1..].iter().all(|&f| f == first[1]));

    // gate falls at sample 0, releasing the chord
    scheduler.render_tick().unwrap();
    assert_eq!(stream(&scheduler, "mono", "frequency"), vec![0.0; 8]);

    // next rising edge plays the second chord
    scheduler.render_tick().unwrap();
    let second = stream(&scheduler, "mono", "frequency");
    assert!(second[1] > 0.0);
    assert_ne!(second[1], first[1]);
}

#[test]
fn test_recording_reads_host_capture_device() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("left.wav");
    let toml = format!(
        r#"
[[node]]
name = "mic"
type = "recording"
params = {{ device = "interface" }}

[[node]]
name = "tape"
type = "wav_file"
params = {{ path = '{}' }}

[[connection]]
from = "mic.left"
to = "tape.signal"
"#,
        path.display()
    );
    let patch = PatchConfig::from_toml_str(&toml).unwrap();

    let (producer, consumer) = capture_queue();
    let mut devices = Devices::new();
    devices.add_capture("interface", consumer);
    for tick in 0..3 {
        let base = tick as f32;
        producer.push(vec![base, -base, base + 0.5, -base]).unwrap();
    }

    let mut scheduler =
        build_patch_with_devices(&NodeRegistry::with_builtin(), &patch, &engine(48000, 2), &mut devices)
            .unwrap();
    // only the newest capture is used
    scheduler.render_tick().unwrap();
    assert_eq!(stream(&scheduler, "mic", "left"), vec![2.0, 2.5]);
    assert_eq!(stream(&scheduler, "mic", "right"), vec![-2.0, -2.0]);
    assert!(scheduler.teardown().is_clean());
}

#[test]
fn test_missing_capture_device_fails_build() {
    let toml = r#"
[[node]]
name = "mic"
type = "recording"
"#;
    let err = build(toml, &engine(48000, 64)).unwrap_err();
    assert!(matches!(err, BuildError::Construct { ref node, .. } if node == "mic"));
}

#[test]
fn test_kind_mismatch_rejected_before_construction() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("never.wav");
    let toml = format!(
        r#"
[[node]]
name = "tape"
type = "wav_file"
params = {{ path = '{}' }}

[[node]]
name = "osc"
type = "sine"

[[node]]
name = "chords"
type = "chord"
params = {{ progression = "C" }}

[[connection]]
from = "osc.out"
to = "chords.progression"
"#,
        path.display()
    );
    let err = build(&toml, &engine(48000, 64)).unwrap_err();
    assert!(matches!(err, BuildError::Patch(PatchError::KindMismatch { .. })));
    // validation runs first, so the WAV file was never created
    assert!(!path.exists());
}

#[test]
fn test_skip_policy_survives_capture_timeouts() {
    let toml = r#"
always_render = ["crush"]

[[node]]
name = "mic"
type = "recording"
params = { device = "interface" }

[[node]]
name = "crush"
type = "bitcrush"

[[connection]]
from = "mic.left"
to = "crush.signal"
"#;
    let patch = PatchConfig::from_toml_str(toml).unwrap();
    let config = EngineConfig {
        capture_timeout_ms: Some(5),
        ..engine(48000, 2)
    };

    let run = |policy: ErrorPolicy| {
        let (producer, consumer) = capture_queue();
        producer.push(vec![0.1, 0.1, 0.1, 0.1]).unwrap();
        let mut devices = Devices::new();
        devices.add_capture("interface", consumer);
        let scheduler =
            build_patch_with_devices(&NodeRegistry::with_builtin(), &patch, &config, &mut devices)
                .unwrap();
        let report = Driver::new(scheduler).with_error_policy(policy).run(Some(4));
        drop(producer);
        report
    };

    // one buffer queued, so only the first tick has input
    let halted = run(ErrorPolicy::Halt);
    assert_eq!(halted.ticks_rendered, 1);
    assert_eq!(halted.ticks_failed, 1);
    let error = halted.halted.as_ref().unwrap();
    assert_eq!(error.node, "mic");
    assert_eq!(error.kind(), ErrorKind::Device);
    assert!(halted.into_result().is_err());

    let skipped = run(ErrorPolicy::Skip);
    assert_eq!(skipped.ticks_rendered, 1);
    assert_eq!(skipped.ticks_failed, 3);
    assert!(skipped.into_result().is_ok());
}
