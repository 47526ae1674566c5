//! Secure DFU client for Nordic nRF51/nRF52 devices over Bluetooth Low Energy.
//!
//! The [`ble`] module defines the transport façade (and a btleplug-backed
//! implementation); the [`dfu`] module implements the Nordic Secure DFU
//! protocol on top of it: firmware archive reading, buttonless bootloader
//! transitions, and the object transfer state machine.

pub mod ble;
pub mod dfu;
