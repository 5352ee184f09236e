use crate::domain::error::ZoneError;
use crate::domain::models::{Color, Mode};
use crate::domain::zones::ZoneRegistry;
use crate::infrastructure::bluetooth::protocol::Command;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "ble-led-panel")]
#[command(about = "Control panel for a BLE multi-zone LED fixture", version)]
pub struct Cli {
    /// Log filter, overrides settings and RUST_LOG (e.g. "debug")
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Settings file to use instead of the per-user one
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PowerState {
    On,
    Off,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// List nearby BLE devices
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "5")]
        seconds: u64,
    },
    /// Connect to a device by name or address and remember it
    Pair {
        /// Substring of the device name or address
        pattern: String,
        #[arg(short, long, default_value = "5")]
        seconds: u64,
    },
    /// Show the zone layout
    Zones,
    /// Set every zone to one color
    Color { color: Color },
    /// Set one zone's color
    ZoneColor { zone: u32, color: Color },
    /// Set color, brightness and mode on a set of zones
    Mask {
        /// Zone ids, comma separated
        #[arg(long, value_delimiter = ',', required_unless_present = "all")]
        zones: Vec<u32>,
        /// Target every zone
        #[arg(long, conflicts_with = "zones")]
        all: bool,
        color: Color,
        #[arg(short, long, default_value = "255")]
        brightness: i32,
        #[arg(short, long, default_value = Mode::SIMPLE)]
        mode: String,
    },
    /// Switch the animation mode (SIMPLE, EYES, RANDOM, ...)
    Mode { name: String },
    /// Turn the fixture on or off
    Power {
        #[arg(value_enum)]
        state: PowerState,
    },
    /// Start the breathing effect
    Breath,
    /// Read and print the device configuration
    Config,
    /// Stay connected and print events, reconnecting automatically
    Watch,
}

impl Commands {
    /// The wire command a one-shot invocation sends, if any
    pub fn device_command(&self, zones: &ZoneRegistry) -> Result<Option<Command>, ZoneError> {
        let command = match self {
            Commands::Color { color } => Command::SetGlobalColor(*color),
            Commands::ZoneColor { zone, color } => {
                zones.zone_by_id(*zone)?;
                Command::SetZoneColor {
                    zone: *zone,
                    color: *color,
                }
            }
            Commands::Mask {
                zones: ids,
                all,
                color,
                brightness,
                mode,
            } => Command::SetMaskedState {
                mask: if *all {
                    zones.all_zones_mask()
                } else {
                    zones.mask_from_ids(ids)?
                },
                color: *color,
                brightness: *brightness,
                mode: Mode::from(mode.as_str()),
            },
            Commands::Mode { name } => Command::SetMode(Mode::from(name.as_str())),
            Commands::Power {
                state: PowerState::On,
            } => Command::PowerOn,
            Commands::Power {
                state: PowerState::Off,
            } => Command::PowerOff,
            Commands::Breath => Command::Breath,
            Commands::Scan { .. }
            | Commands::Pair { .. }
            | Commands::Zones
            | Commands::Config
            | Commands::Watch => return Ok(None),
        };
        Ok(Some(command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("ble-led-panel").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_mask_from_zone_list() {
        let zones = ZoneRegistry::default();
        let cli = parse(&["mask", "--zones", "0,3,8", "#00ff00", "-b", "40"]);
        assert_eq!(
            cli.command.device_command(&zones).unwrap(),
            Some(Command::SetMaskedState {
                mask: 0b1_0000_1001,
                color: Color::new(0, 0xff, 0),
                brightness: 40,
                mode: Mode::simple(),
            })
        );
    }

    #[test]
    fn test_mask_all_zones() {
        let zones = ZoneRegistry::default();
        let cli = parse(&["mask", "--all", "ffffff", "--mode", "EYES"]);
        match cli.command.device_command(&zones).unwrap() {
            Some(Command::SetMaskedState { mask, mode, brightness, .. }) => {
                assert_eq!(mask, 511);
                assert_eq!(mode, Mode::named("EYES"));
                assert_eq!(brightness, 255);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_zone_rejected() {
        let zones = ZoneRegistry::default();
        let cli = parse(&["zone-color", "12", "ff0000"]);
        assert_eq!(cli.command.device_command(&zones), Err(ZoneError::NotFound(12)));
    }

    #[test]
    fn test_bad_color_is_a_usage_error() {
        assert!(Cli::try_parse_from(["ble-led-panel", "color", "red"]).is_err());
        assert!(Cli::try_parse_from(["ble-led-panel", "mask", "ff0000"]).is_err());
    }

    #[test]
    fn test_local_commands_send_nothing() {
        let zones = ZoneRegistry::default();
        let local: [&[&str]; 4] = [&["zones"], &["config"], &["scan", "-s", "2"], &["pair", "fixture"]];
        for args in local {
            assert_eq!(parse(args).command.device_command(&zones), Ok(None));
        }
        assert_eq!(
            parse(&["power", "off"]).command.device_command(&zones),
            Ok(Some(Command::PowerOff))
        );
    }
}
