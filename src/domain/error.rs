//! Error taxonomy
//!
//! Every error here is `Clone` so it can travel to observers inside
//! [`AppEvent::Error`](crate::domain::models::AppEvent).

use crate::domain::models::DeviceId;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ZoneError {
    #[error("zone {0} not found")]
    NotFound(u32),

    #[error("invalid zone id {0}")]
    InvalidZone(u32),

    #[error("zone ids must be contiguous from 0, found {id}")]
    NonContiguous { id: u32 },

    #[error("{count} zones do not fit the mask field (max {max})")]
    TooManyZones { count: usize, max: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid color {0:?}: expected 6 hex digits")]
pub struct ColorParseError(pub String);

/// Caller supplied a value the wire format cannot carry
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("brightness {0} out of range 0..=255")]
    BrightnessOutOfRange(i32),

    #[error("zone {zone} out of range (fixture has {count} zones)")]
    ZoneOutOfRange { zone: u32, count: usize },

    #[error("mask {mask} does not fit a {width}-digit field")]
    MaskFieldOverflow { mask: u32, width: usize },

    #[error("mask {mask:#b} selects zones outside {all:#b}")]
    MaskOutOfRange { mask: u32, all: u32 },

    #[error("mode name is empty")]
    EmptyMode,

    #[error("field {0:?} contains the ':' delimiter")]
    Delimiter(String),
}

/// Malformed configuration payload
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed configuration JSON: {0}")]
    Json(String),

    #[error("configuration is not a JSON object")]
    NotAnObject,

    #[error("configuration is missing `{0}`")]
    MissingField(&'static str),

    #[error("strip {index} has invalid color {value:?}")]
    InvalidColor { index: usize, value: String },
}

/// GATT connect sequence step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStage {
    OpenSession,
    ResolveService,
    ResolveCharacteristic,
}

impl fmt::Display for ConnectStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            Self::OpenSession => "opening GATT session",
            Self::ResolveService => "resolving control service",
            Self::ResolveCharacteristic => "resolving control characteristic",
        };
        f.write_str(stage)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectCause {
    Timeout,
    Failed(String),
}

impl fmt::Display for ConnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("timed out"),
            Self::Failed(reason) => f.write_str(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("connect to {device} failed while {stage}: {cause}")]
pub struct ConnectError {
    pub device: DeviceId,
    pub stage: ConnectStage,
    pub cause: ConnectCause,
}

impl ConnectError {
    pub fn is_timeout(&self) -> bool {
        self.cause == ConnectCause::Timeout
    }
}

/// Characteristic write failed; the command was dropped
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("write of {command:?} failed: {cause}")]
pub struct WriteError {
    pub command: String,
    pub cause: String,
}

/// Enqueueing a command through a sink failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error("no active connection")]
    NotConnected,

    #[error("command queue full ({depth} pending)")]
    QueueFull { depth: usize },

    #[error("notification subscription failed: {0}")]
    Subscribe(String),
}

/// Failures reported to observers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("device discovery failed: {0}")]
    Discovery(String),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Write(#[from] WriteError),
}
