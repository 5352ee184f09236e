//! Bluetooth Module
//!
//! Provides BLE communication with the LED fixture.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   ConnectionManager                      │
//! │  (Main coordinator - public API for the application)     │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!     ┌─────────────┬───┴─────────┬──────────────┐
//!     │             │             │              │
//!     ▼             ▼             ▼              ▼
//! ┌─────────┐ ┌────────────┐ ┌───────────┐ ┌────────────┐
//! │ Scanner │ │ Connection │ │  Command  │ │   Config   │
//! │         │ │            │ │   Queue   │ │    Sync    │
//! │ - adv.  │ │ - GATT     │ │ - FIFO    │ │ - notify   │
//! │  watch  │ │ - timeout  │ │ - coalesce│ │ - cache    │
//! └─────────┘ └────────────┘ └─────┬─────┘ └─────┬──────┘
//!                                  ▼             ▼
//!                          ┌─────────────────────────┐
//!                          │        Protocol         │
//!                          │  (text commands, JSON)  │
//!                          └─────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Wire commands, UUIDs and configuration decoding
//! - [`transport`] - Traits the core uses to reach the BLE stack
//! - [`btleplug_adapter`] - btleplug implementation of [`transport`]
//! - [`scanner`] - Advertisement watches
//! - [`connection`] - GATT session and characteristic resolution
//! - [`command_queue`] - Serialized, coalescing writes
//! - [`config_sync`] - Device configuration cache
//! - [`service`] - Main service coordinator

pub mod btleplug_adapter;
pub mod command_queue;
pub mod config_sync;
pub mod connection;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main service for convenience
pub use service::ConnectionManager;
