//! LED Fixture Control Protocol
//!
//! Commands are UTF-8 text written to the control characteristic, fields separated
//! by `:` with no trailing delimiter and no escaping. The device answers
//! `GET_CONFIG` with a JSON document delivered as a notification.

use crate::domain::error::{DecodeError, EncodingError};
use crate::domain::models::{Brightness, Color, Configuration, Mode, ZoneState};
use crate::domain::zones::{ZoneMask, ZoneRegistry};
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

/// Control service UUID
pub const SERVICE_UUID: &str = "4fafc201-1fb5-459e-8fcc-c5c9c331914b";

/// Control characteristic UUID - write commands, notify configuration
pub const CONTROL_CHAR_UUID: &str = "beb5483e-36e1-4688-b7f5-ea07361b26a8";

pub const FIELD_DELIMITER: char = ':';

/// Newest configuration schema this client understands
pub const SUPPORTED_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `COLOR:rrggbb`
    SetGlobalColor(Color),
    /// `SCOLOR:<zone>:rrggbb`
    SetZoneColor { zone: u32, color: Color },
    /// `MASK:<mask>:rrggbb:<brightness>:<mode>`
    SetMaskedState {
        mask: ZoneMask,
        color: Color,
        brightness: i32,
        mode: Mode,
    },
    /// `MODE:<mode>`
    SetMode(Mode),
    /// `GET_CONFIG`
    RequestConfig,
    /// `ON`
    PowerOn,
    /// `OFF`
    PowerOff,
    /// `BREATH`
    Breath,
}

/// Target a continuous control writes to; pending commands with the same key
/// supersede each other in the command queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoalesceKey {
    GlobalColor,
    ZoneColor(u32),
    Masked(ZoneMask),
    ConfigRequest,
}

impl Command {
    /// Render the wire text, validating every field against `zones`
    pub fn encode(&self, zones: &ZoneRegistry) -> Result<String, EncodingError> {
        let text = match self {
            Self::SetGlobalColor(color) => format!("COLOR:{}", color.to_hex()),
            Self::SetZoneColor { zone, color } => {
                if !zones.contains(*zone) {
                    return Err(EncodingError::ZoneOutOfRange {
                        zone: *zone,
                        count: zones.zone_count(),
                    });
                }
                format!("SCOLOR:{}:{}", zone, color.to_hex())
            }
            Self::SetMaskedState {
                mask,
                color,
                brightness,
                mode,
            } => {
                let width = zones.mask_width();
                if *mask > zones.mask_field_max() {
                    return Err(EncodingError::MaskFieldOverflow { mask: *mask, width });
                }
                if !zones.is_valid_mask(*mask) {
                    return Err(EncodingError::MaskOutOfRange {
                        mask: *mask,
                        all: zones.all_zones_mask(),
                    });
                }
                let brightness = Brightness::try_from(*brightness)?;
                format!(
                    "MASK:{:0width$}:{}:{}:{}",
                    mask,
                    color.to_hex(),
                    brightness,
                    mode_field(mode)?,
                    width = width
                )
            }
            Self::SetMode(mode) => format!("MODE:{}", mode_field(mode)?),
            Self::RequestConfig => "GET_CONFIG".to_string(),
            Self::PowerOn => "ON".to_string(),
            Self::PowerOff => "OFF".to_string(),
            Self::Breath => "BREATH".to_string(),
        };
        Ok(text)
    }

    pub fn coalesce_key(&self) -> Option<CoalesceKey> {
        match self {
            Self::SetGlobalColor(_) => Some(CoalesceKey::GlobalColor),
            Self::SetZoneColor { zone, .. } => Some(CoalesceKey::ZoneColor(*zone)),
            Self::SetMaskedState { mask, .. } => Some(CoalesceKey::Masked(*mask)),
            Self::RequestConfig => Some(CoalesceKey::ConfigRequest),
            Self::SetMode(_) | Self::PowerOn | Self::PowerOff | Self::Breath => None,
        }
    }
}

fn mode_field(mode: &Mode) -> Result<String, EncodingError> {
    let name = mode.to_string();
    if name.is_empty() {
        return Err(EncodingError::EmptyMode);
    }
    if name.contains(FIELD_DELIMITER) {
        return Err(EncodingError::Delimiter(name));
    }
    Ok(name)
}

/// Parse a UUID string
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid, uuid::Error> {
    Uuid::parse_str(uuid_str)
}

// Device-side schema. Field names follow the firmware, not the client model.

#[derive(Debug, Deserialize)]
struct RawConfiguration {
    #[serde(default)]
    version: Option<u32>,
    #[serde(default)]
    mode: Option<RawGlobalMode>,
    #[serde(default)]
    strips: Vec<RawStrip>,
}

/// Older firmware reports the mode as a list
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawGlobalMode {
    Name(String),
    Names(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct RawStrip {
    color: String,
    #[serde(default)]
    mode: Option<RawZoneMode>,
    #[serde(default)]
    brightness: Option<serde_json::Number>,
}

/// Any JSON number, saturated to `i64` so clamping can happen afterwards
fn saturating_i64(number: &serde_json::Number) -> i64 {
    if let Some(value) = number.as_i64() {
        value
    } else if number.as_u64().is_some() {
        i64::MAX
    } else {
        number.as_f64().map_or(0, |value| value as i64)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawZoneMode {
    Index(u32),
    Name(String),
}

impl From<RawZoneMode> for Mode {
    fn from(raw: RawZoneMode) -> Self {
        match raw {
            RawZoneMode::Index(index) => Mode::Index(index),
            RawZoneMode::Name(name) => Mode::Named(name),
        }
    }
}

/// Decode a configuration notification.
///
/// Produces a complete [`Configuration`] or an error, never a partial result.
pub fn decode_configuration(bytes: &[u8]) -> Result<Configuration, DecodeError> {
    let payload = trim_payload(bytes);

    let value: serde_json::Value =
        serde_json::from_slice(payload).map_err(|e| DecodeError::Json(e.to_string()))?;
    if !value.is_object() {
        return Err(DecodeError::NotAnObject);
    }
    let raw: RawConfiguration =
        serde_json::from_value(value).map_err(|e| DecodeError::Json(e.to_string()))?;

    if let Some(version) = raw.version {
        if version > SUPPORTED_SCHEMA_VERSION {
            warn!(
                "Configuration schema v{} is newer than supported v{}, decoding best-effort",
                version, SUPPORTED_SCHEMA_VERSION
            );
        }
    }

    let mode = match raw.mode {
        Some(RawGlobalMode::Name(name)) => Mode::Named(name),
        Some(RawGlobalMode::Names(names)) => names
            .into_iter()
            .next()
            .map(Mode::Named)
            .ok_or(DecodeError::MissingField("mode"))?,
        None => return Err(DecodeError::MissingField("mode")),
    };

    let zones = raw
        .strips
        .into_iter()
        .enumerate()
        .map(|(index, strip)| {
            let color = Color::from_hex(&strip.color).map_err(|_| DecodeError::InvalidColor {
                index,
                value: strip.color.clone(),
            })?;
            let reported = strip.brightness.as_ref().map_or(0, saturating_i64);
            let brightness = Brightness::clamped(reported);
            if i64::from(brightness.value()) != reported {
                debug!("Strip {} brightness {} clamped", index, reported);
            }
            Ok(ZoneState {
                color,
                brightness,
                mode: strip.mode.map(Mode::from).unwrap_or_else(|| mode.clone()),
            })
        })
        .collect::<Result<Vec<_>, DecodeError>>()?;

    Ok(Configuration {
        mode,
        zones,
        schema_version: raw.version,
    })
}

/// Firmware may pad the notification with NULs
fn trim_payload(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|b| *b != 0 && !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    &bytes[..end]
}

/// Notifications with no payload acknowledge fire-and-forget commands
pub fn is_empty_notification(bytes: &[u8]) -> bool {
    trim_payload(bytes).is_empty()
}
