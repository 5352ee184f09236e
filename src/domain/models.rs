use crate::domain::error::{ColorParseError, ControlError, EncodingError};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// 24-bit RGB color; the 6-hex-digit form is the wire encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const BLACK: Color = Color::new(0, 0, 0);
    pub const WHITE: Color = Color::new(255, 255, 255);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Build from wide channel values, clamping each to `0..=255`
    pub fn from_channels(r: i32, g: i32, b: i32) -> Self {
        let clamp = |v: i32| v.clamp(0, 255) as u8;
        Self::new(clamp(r), clamp(g), clamp(b))
    }

    /// Lower 24 bits as `0xRRGGBB`
    pub fn from_rgb24(value: u32) -> Self {
        Self::new((value >> 16) as u8, (value >> 8) as u8, value as u8)
    }

    pub fn to_rgb24(self) -> u32 {
        (u32::from(self.r) << 16) | (u32::from(self.g) << 8) | u32::from(self.b)
    }

    /// Strict wire form: exactly 6 hex digits, either case, no `#`
    pub fn from_hex(hex: &str) -> Result<Self, ColorParseError> {
        if hex.len() != 6 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ColorParseError(hex.to_string()));
        }
        u32::from_str_radix(hex, 16)
            .map(Self::from_rgb24)
            .map_err(|_| ColorParseError(hex.to_string()))
    }

    /// Lowercase `rrggbb`
    pub fn to_hex(self) -> String {
        format!("{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Accepts the picker form `#rrggbb` as well as the wire form
impl FromStr for Color {
    type Err = ColorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s.trim().trim_start_matches('#'))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Brightness(u8);

impl Brightness {
    pub const MAX: Brightness = Brightness(255);

    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    pub fn clamped(value: i64) -> Self {
        Self(value.clamp(0, 255) as u8)
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<i32> for Brightness {
    type Error = EncodingError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        u8::try_from(value)
            .map(Self)
            .map_err(|_| EncodingError::BrightnessOutOfRange(value))
    }
}

impl fmt::Display for Brightness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Effect mode.
///
/// The device owns the set of modes, so unknown names are carried as-is. Zones may
/// report their mode as an index instead of a name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Mode {
    Named(String),
    Index(u32),
}

impl Mode {
    pub const SIMPLE: &'static str = "SIMPLE";
    pub const EYES: &'static str = "EYES";
    pub const RANDOM: &'static str = "RANDOM";

    /// Modes this client ships buttons for
    pub const KNOWN: &'static [&'static str] = &[Self::SIMPLE, Self::EYES, Self::RANDOM];

    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    pub fn simple() -> Self {
        Self::named(Self::SIMPLE)
    }

    pub fn is_known(&self) -> bool {
        match self {
            Self::Named(name) => Self::KNOWN.contains(&name.as_str()),
            Self::Index(_) => false,
        }
    }
}

impl Default for Mode {
    fn default() -> Self {
        Self::simple()
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => f.write_str(name),
            Self::Index(index) => write!(f, "{index}"),
        }
    }
}

impl From<&str> for Mode {
    fn from(name: &str) -> Self {
        Self::named(name)
    }
}

/// Last known rendering state of one zone
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ZoneState {
    pub color: Color,
    pub brightness: Brightness,
    pub mode: Mode,
}

/// Device-reported state: global mode plus one entry per zone, indexed by zone id
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Configuration {
    pub mode: Mode,
    pub zones: Vec<ZoneState>,
    pub schema_version: Option<u32>,
}

/// Platform identity of a BLE peripheral
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub id: DeviceId,
    pub name: Option<String>,
}

impl DeviceHandle {
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: DeviceId::new(id),
            name,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }
}

/// How a device came to be tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOrigin {
    /// Previously authorized; watched and reconnected automatically
    Authorized,
    /// Chosen through the device picker; needs re-selection after a drop
    Selected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Scanning,
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone)]
pub enum AppEvent {
    StateChanged { device: DeviceId, state: LinkState },
    Configuration(Arc<Configuration>),
    Error(ControlError),
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
