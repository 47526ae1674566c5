//! BLE transport façade.
//!
//! Provides a trait-based abstraction over a BLE central (client,
//! peripheral, characteristic), enabling both real hardware and mock
//! testing. The [`btleplug`] submodule implements it over the btleplug
//! crate.

pub mod btleplug;

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Base UUID used to expand 16-bit and 32-bit Bluetooth SIG short forms.
const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

/// Errors raised by the BLE transport layer.
#[derive(Debug, Error)]
pub enum BleError {
    /// No Bluetooth adapter is present on this host.
    #[error("no Bluetooth adapter available")]
    NoAdapter,

    /// The backing runtime could not be started.
    #[error("BLE runtime error: {0}")]
    Runtime(String),

    /// No matching device was found within the connection timeout.
    #[error("connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Connecting or service discovery failed.
    #[error("failed to connect: {0}")]
    Connect(String),

    /// Disconnecting failed (the link may already be gone).
    #[error("failed to disconnect: {0}")]
    Disconnect(String),

    /// Scanning failed to start or aborted.
    #[error("scan failed: {0}")]
    Scan(String),

    /// A characteristic write was rejected or the link dropped mid-write.
    #[error("characteristic write failed: {0}")]
    Write(String),

    /// Subscribing to or unsubscribing from value changes failed.
    #[error("subscription failed: {0}")]
    Subscribe(String),

    /// The peripheral disconnected while an operation was outstanding.
    #[error("peripheral link lost")]
    LinkLost,
}

/// How a characteristic write is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Acknowledged write.
    WithResponse,
    /// Fire-and-forget write.
    NoResponse,
}

/// How the server pushes value changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    /// Server-pushed, unacknowledged.
    Notification,
    /// Server-pushed, acknowledged.
    Indication,
}

/// Callback invoked with the raw value of a notification or indication.
pub type NotificationHandler = Box<dyn FnMut(&[u8]) + Send + 'static>;

/// A device seen while scanning.
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub address: String,
    pub name: String,
    /// Advertised service UUIDs, in full 128-bit string form.
    pub services: Vec<String>,
}

/// A BLE central capable of scanning and connecting.
pub trait Client {
    /// Connect to the device with the given address.
    fn connect_address(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<Box<dyn Peripheral>, BleError>;

    /// Connect to the first device advertising the given local name
    /// (compared case-insensitively).
    fn connect_name(&self, name: &str, timeout: Duration)
        -> Result<Box<dyn Peripheral>, BleError>;

    /// Scan for `duration`, invoking `handler` for each advertisement.
    /// Running out the scan duration is a normal completion, not an error.
    fn scan(
        &self,
        duration: Duration,
        handler: &mut dyn FnMut(Advertisement),
    ) -> Result<(), BleError>;
}

/// A connected peripheral with discovered services.
pub trait Peripheral {
    fn address(&self) -> String;

    fn disconnect(&self) -> Result<(), BleError>;

    fn find_service(&self, uuid: &str) -> Option<Box<dyn Service>>;

    fn find_characteristic(&self, uuid: &str) -> Option<Box<dyn Characteristic>>;
}

/// A GATT service on a connected peripheral.
pub trait Service {
    fn uuid(&self) -> String;

    fn find_characteristic(&self, uuid: &str) -> Option<Box<dyn Characteristic>>;
}

/// A GATT characteristic on a connected peripheral.
pub trait Characteristic {
    fn uuid(&self) -> String;

    fn write(&self, data: &[u8], kind: WriteKind) -> Result<(), BleError>;

    fn subscribe(&self, kind: SubscriptionKind, handler: NotificationHandler)
        -> Result<(), BleError>;

    fn unsubscribe(&self, kind: SubscriptionKind) -> Result<(), BleError>;
}

/// Parse a UUID leniently: short 16-bit ("fe59") and 32-bit forms are
/// expanded with the Bluetooth base UUID, anything else is parsed as a
/// full 128-bit UUID. Returns `None` for unparseable input.
pub fn parse_uuid(input: &str) -> Option<Uuid> {
    let trimmed = input.trim();
    match trimmed.len() {
        4 | 8 => u32::from_str_radix(trimmed, 16)
            .ok()
            .map(|short| Uuid::from_u128(BLUETOOTH_BASE_UUID | (u128::from(short) << 96))),
        _ => Uuid::parse_str(trimmed).ok(),
    }
}
