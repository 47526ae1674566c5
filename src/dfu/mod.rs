//! Nordic Secure DFU over BLE.
//!
//! Implements the client side of the Secure DFU protocol for nRF51/nRF52
//! devices:
//!
//! 1. **Archive reading** - extract the init packet (`.dat`) and the
//!    firmware image (`.bin`) from the ZIP package
//! 2. **Mode detection** - decide whether the device is running its
//!    bootloader or an application with a buttonless DFU service
//! 3. **Buttonless transition** - reboot an application into the
//!    bootloader, changing the advertising name first for unbonded
//!    devices, then reconnect
//! 4. **Object transfer** - stream each payload as DFU objects through
//!    the control point / packet characteristic pair, verifying a CRC-32
//!    per object and resuming past payloads the device already holds
//!
//! # Example
//!
//! ```ignore
//! use nrf_dfu::ble::btleplug::BtleplugClient;
//! use nrf_dfu::dfu::{DeviceId, SecureDfu};
//!
//! let client = BtleplugClient::new()?;
//! let mut dfu = SecureDfu::new(
//!     Box::new(client),
//!     DeviceId::Name("MyDevice".into()),
//!     std::time::Duration::from_secs(30),
//! );
//! dfu.update("firmware.zip", |current, total| {
//!     println!("{current}/{total} bytes");
//! })?;
//! ```

mod archive;
mod config;
mod error;
mod packet;
mod protocol;
mod response;

pub use archive::FirmwareArchive;
pub use config::{ObjectType, ResultCode, DFU_SERVICE_UUID};
pub use error::{DfuError, DfuResult, ProtocolViolation};
pub use protocol::{DeviceId, DfuMode, SecureDfu};
pub use response::{ResponseSlot, SlotError, SlotProducer};
