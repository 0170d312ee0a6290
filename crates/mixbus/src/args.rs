//! Command line arguments
//!
//! Slot and bus numbers are 1-based on the command line, matching the labels
//! users see ("Input 1", "Output 6"); they are converted to 0-based indices here.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "mixbus", version, about = "Route and mix stereo inputs onto output buses")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List stereo capture and playback devices
    Devices,
    /// Open the selected devices and mix until Enter or --seconds
    Run(RunArgs),
}

#[derive(Debug, clap::Args)]
pub struct RunArgs {
    /// Engine config file (defaults to the user config path)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Capture device for an input slot
    #[arg(long = "input", value_name = "SLOT=NAME", value_parser = parse_device)]
    pub inputs: Vec<(usize, String)>,

    /// Playback device for an output bus
    #[arg(long = "output", value_name = "BUS=NAME", value_parser = parse_device)]
    pub outputs: Vec<(usize, String)>,

    /// Route an input to a bus
    #[arg(long = "route", value_name = "IN:BUS", value_parser = parse_route)]
    pub routes: Vec<(usize, usize)>,

    /// Fader position (0.0 to 1.0)
    #[arg(long = "fader", value_name = "IN=VALUE", value_parser = parse_fader)]
    pub faders: Vec<(usize, f32)>,

    /// Bass gain (-10 to 10)
    #[arg(long = "bass", value_name = "IN=GAIN", value_parser = parse_gain)]
    pub bass: Vec<(usize, i8)>,

    /// Treble gain (-10 to 10)
    #[arg(long = "treble", value_name = "IN=GAIN", value_parser = parse_gain)]
    pub treble: Vec<(usize, i8)>,

    /// Mid-band EQ gain (-10 to 10)
    #[arg(long = "eq", value_name = "IN=GAIN", value_parser = parse_gain)]
    pub eq: Vec<(usize, i8)>,

    /// Stop after this many seconds instead of waiting for Enter
    #[arg(long)]
    pub seconds: Option<f64>,
}

/// 1-based slot number to index
fn parse_slot(s: &str) -> Result<usize, String> {
    match s.trim().parse::<usize>() {
        Ok(n) if n >= 1 => Ok(n - 1),
        _ => Err(format!("'{}' is not a slot number (1, 2, ...)", s)),
    }
}

fn split_once<'a>(s: &'a str, sep: char, form: &str) -> Result<(&'a str, &'a str), String> {
    s.split_once(sep)
        .ok_or_else(|| format!("expected {}, got '{}'", form, s))
}

fn parse_device(s: &str) -> Result<(usize, String), String> {
    let (slot, name) = split_once(s, '=', "SLOT=NAME")?;
    let name = name.trim();
    if name.is_empty() {
        return Err("device name is empty".into());
    }
    Ok((parse_slot(slot)?, name.to_string()))
}

fn parse_route(s: &str) -> Result<(usize, usize), String> {
    let (input, bus) = split_once(s, ':', "IN:BUS")?;
    Ok((parse_slot(input)?, parse_slot(bus)?))
}

fn parse_fader(s: &str) -> Result<(usize, f32), String> {
    let (slot, value) = split_once(s, '=', "IN=VALUE")?;
    let value: f32 = value
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is not a number", value))?;
    Ok((parse_slot(slot)?, value))
}

fn parse_gain(s: &str) -> Result<(usize, i8), String> {
    let (slot, gain) = split_once(s, '=', "IN=GAIN")?;
    let gain: i8 = gain
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is not a whole number", gain))?;
    Ok((parse_slot(slot)?, gain))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_are_one_based() {
        assert_eq!(parse_device("1=USB Audio").unwrap(), (0, "USB Audio".to_string()));
        assert_eq!(parse_route("2:6").unwrap(), (1, 5));
        assert!(parse_route("0:1").is_err());
        assert!(parse_device("x=USB").is_err());
    }

    #[test]
    fn test_values() {
        assert_eq!(parse_fader("3=0.7").unwrap(), (2, 0.7));
        assert_eq!(parse_gain("1=-10").unwrap(), (0, -10));
        assert!(parse_gain("1=2.5").is_err());
        assert!(parse_fader("1").is_err());
        assert!(parse_device("1=").is_err());
    }

    #[test]
    fn test_run_command_line() {
        let cli = Cli::try_parse_from([
            "mixbus", "run", "--input", "1=Scarlett", "--output", "2=HDMI", "--route", "1:2",
            "--fader", "1=0.8", "--bass", "1=4", "--seconds", "5",
        ])
        .unwrap();
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.inputs, vec![(0, "Scarlett".to_string())]);
                assert_eq!(args.outputs, vec![(1, "HDMI".to_string())]);
                assert_eq!(args.routes, vec![(0, 1)]);
                assert_eq!(args.bass, vec![(0, 4)]);
                assert_eq!(args.seconds, Some(5.0));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
