//! Control core for a BLE-attached multi-zone LED fixture.

pub mod domain;
pub mod infrastructure;
pub mod presentation;
