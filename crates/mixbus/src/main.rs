//! Mixbus - headless front end for the routing mixer
//!
//! `mixbus devices` lists the usable devices; `mixbus run` selects devices,
//! applies faders, tone gains and routing, then mixes and prints level meters
//! until Enter is pressed (or `--seconds` runs out).
//!
//! Set RUST_LOG=debug for verbose engine output.

mod args;

use std::io::BufRead;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use crossbeam::channel::{self, RecvTimeoutError};

use args::{Cli, Command, RunArgs};
use mixbus_core::audio::{compatible_devices, AudioBackend, AudioDevice, CpalBackend};
use mixbus_core::config::{default_config_path, load_config, read_config, EngineConfig};
use mixbus_core::engine::{Engine, EngineEvent};
use mixbus_core::Direction;

/// Interval between meter lines
const METER_INTERVAL: Duration = Duration::from_millis(500);

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Devices => list_devices(),
        Command::Run(args) => run(args),
    }
}

fn list_devices() -> Result<()> {
    let devices = CpalBackend::new()
        .devices()
        .context("Failed to enumerate audio devices")?;

    for direction in [Direction::Input, Direction::Output] {
        println!("Stereo {} devices:", direction);
        let usable = compatible_devices(&devices, direction);
        if usable.is_empty() {
            println!("  (none)");
        }
        for device in usable {
            println!("  {}", device.display_name());
        }
        println!();
    }
    Ok(())
}

/// Pick the one device whose name contains `pattern`, ignoring case
///
/// An exact (case-insensitive) name match wins over substring matches.
fn match_device<'a>(devices: &'a [AudioDevice], pattern: &str) -> Result<&'a AudioDevice> {
    let needle = pattern.to_lowercase();
    if let Some(exact) = devices.iter().find(|d| d.name.to_lowercase() == needle) {
        return Ok(exact);
    }

    let matches: Vec<&AudioDevice> = devices
        .iter()
        .filter(|d| d.name.to_lowercase().contains(&needle))
        .collect();
    match matches.as_slice() {
        [device] => Ok(*device),
        [] => bail!("No device matches '{}'", pattern),
        several => bail!(
            "'{}' matches several devices: {}",
            pattern,
            several
                .iter()
                .map(|d| d.display_name())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

fn load_engine_config(args: &RunArgs) -> Result<EngineConfig> {
    let config: EngineConfig = match &args.config {
        Some(path) => read_config(path)?,
        None => load_config(&default_config_path()),
    };
    config.validate().context("Invalid engine configuration")?;
    Ok(config)
}

/// Apply every command line setting to a stopped engine
fn configure(engine: &Engine, args: &RunArgs) -> Result<()> {
    for (slot, name) in &args.inputs {
        let device = match_device(engine.input_devices(), name)?;
        engine.select_input_device(*slot, Some(device.id.clone()))?;
    }
    for (slot, name) in &args.outputs {
        let device = match_device(engine.output_devices(), name)?;
        engine.select_output_device(*slot, Some(device.id.clone()))?;
    }
    for &(input, bus) in &args.routes {
        engine.set_routing(input, bus, true)?;
    }
    for &(slot, value) in &args.faders {
        engine.set_fader(slot, value)?;
    }
    for &(slot, gain) in &args.bass {
        engine.set_bass_gain(slot, gain)?;
    }
    for &(slot, gain) in &args.treble {
        engine.set_treble_gain(slot, gain)?;
    }
    for &(slot, gain) in &args.eq {
        engine.set_eq_gain(slot, gain)?;
    }
    Ok(())
}

fn meter_bar(level: f32) -> String {
    const WIDTH: usize = 12;
    let filled = ((level.clamp(0.0, 1.0) * WIDTH as f32).round() as usize).min(WIDTH);
    format!("{}{}", "#".repeat(filled), ".".repeat(WIDTH - filled))
}

fn print_meters(engine: &Engine) -> Result<()> {
    let mut line = String::new();
    for slot in 0..engine.num_inputs() {
        let input = engine.input(slot)?;
        if input.device.is_some() {
            let (left, right) = input.meter;
            line.push_str(&format!("IN{} {} ", slot + 1, meter_bar(left.max(right))));
        }
    }
    for bus in 0..engine.num_outputs() {
        let output = engine.output(bus)?;
        if output.device.is_some() {
            let (left, right) = output.meter;
            line.push_str(&format!("OUT{} {} ", bus + 1, meter_bar(left.max(right))));
        }
    }
    println!("{}", line.trim_end());
    Ok(())
}

fn run(args: RunArgs) -> Result<()> {
    let config = load_engine_config(&args)?;
    let engine = Engine::with_cpal(config)?;
    let events = engine.subscribe();

    configure(&engine, &args)?;
    engine.start().context("Failed to start the mixer")?;
    println!(
        "Mixing with {} streams. {}",
        engine.open_stream_count(),
        match args.seconds {
            Some(s) => format!("Stopping after {} s.", s),
            None => "Press Enter to stop.".to_string(),
        }
    );

    let (quit_tx, quit_rx) = channel::bounded::<()>(1);
    if args.seconds.is_none() {
        thread::Builder::new()
            .name("mixbus-stdin".into())
            .spawn(move || {
                let mut line = String::new();
                let _ = std::io::stdin().lock().read_line(&mut line);
                let _ = quit_tx.send(());
            })
            .context("Failed to spawn stdin reader")?;
    }

    let deadline = args
        .seconds
        .map(|s| Instant::now() + Duration::from_secs_f64(s.max(0.0)));
    loop {
        match quit_rx.recv_timeout(METER_INTERVAL) {
            Ok(()) => break,
            Err(RecvTimeoutError::Timeout) => {}
            // Sender dropped without --seconds means stdin is gone
            Err(RecvTimeoutError::Disconnected) if deadline.is_none() => break,
            Err(RecvTimeoutError::Disconnected) => thread::sleep(METER_INTERVAL),
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }

        for event in events.try_iter() {
            if let EngineEvent::Error { kind, message } = event {
                eprintln!("{}: {}", kind, message);
            }
        }
        print_meters(&engine)?;
    }

    engine.stop();
    log::info!("mixbus stopped");
    Ok(())
}
