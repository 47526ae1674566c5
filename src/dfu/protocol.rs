//! Secure DFU protocol engine.
//!
//! Orchestrates the complete update:
//! 1. Connect and detect which DFU personality the device presents
//! 2. If an application is running, reboot it into the bootloader via the
//!    Buttonless service (with the advertising-name dance for unbonded
//!    devices), then reconnect
//! 3. Stream the init packet and the firmware image as DFU objects with
//!    per-object CRC verification and resume-on-match

use std::path::Path;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::archive::FirmwareArchive;
use super::config::{
    ObjectType, OpCode, ADV_NAME_PREFIX, ADV_NAME_SUFFIX_LEN, BOOT_SETTLE_DELAY,
    DFU_BUTTONLESS_BONDED_UUID, DFU_BUTTONLESS_UNBONDED_UUID, DFU_CONTROL_POINT_UUID,
    DFU_PACKET_UUID, DFU_SERVICE_UUID, FRAGMENT_DELAY, FRAGMENT_SIZE, RECONNECT_ATTEMPTS,
    RECONNECT_DELAY,
};
use super::error::{DfuError, DfuResult, ProtocolViolation};
use super::packet::{self, ChecksumResponse, SelectResponse};
use super::response::{ResponseSlot, SlotError};
use crate::ble::{
    BleError, Characteristic, Client, Peripheral, SubscriptionKind, WriteKind,
};

/// How the target device is identified when connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceId {
    /// Platform address of the device.
    Address(String),
    /// Advertised local name, matched case-insensitively.
    Name(String),
}

/// Which DFU personality a connected device presents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuMode {
    /// The bootloader is running: control and packet characteristics are
    /// both present.
    BootloaderActive,
    /// An application with the unbonded buttonless service is running;
    /// entering the bootloader requires an advertising-name change.
    ButtonlessUnbonded,
    /// An application with the bonded buttonless service is running.
    ButtonlessBonded,
}

/// A live connection with the DFU capability handles resolved for the
/// mode the device is in. The peripheral is released on drop.
struct Session {
    peripheral: Box<dyn Peripheral>,
    control: Option<Box<dyn Characteristic>>,
    packet: Option<Box<dyn Characteristic>>,
    buttonless: Option<Box<dyn Characteristic>>,
    mode: DfuMode,
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(err) = self.peripheral.disconnect() {
            log::debug!("disconnect: {}", err);
        }
    }
}

/// Byte progress accounting for one update run.
struct ProgressTracker<'a> {
    current: u64,
    total: u64,
    callback: &'a mut dyn FnMut(u64, u64),
}

impl ProgressTracker<'_> {
    fn advance(&mut self, bytes: u64) {
        self.current += bytes;
        (self.callback)(self.current, self.total);
    }
}

/// Secure DFU client for a single target device.
pub struct SecureDfu {
    client: Box<dyn Client>,
    target: DeviceId,
    timeout: Duration,
}

impl SecureDfu {
    pub fn new(client: Box<dyn Client>, target: DeviceId, timeout: Duration) -> Self {
        Self {
            client,
            target,
            timeout,
        }
    }

    /// Update the device with the given firmware archive.
    ///
    /// `progress` is invoked with `(current_bytes, total_bytes)` after
    /// every packet fragment written.
    pub fn update<P, F>(&mut self, archive_path: P, mut progress: F) -> DfuResult<()>
    where
        P: AsRef<Path>,
        F: FnMut(u64, u64),
    {
        let archive = FirmwareArchive::open(archive_path)?;
        let total = archive.total_size();

        let mut session = self.connect_session()?;
        if session.mode != DfuMode::BootloaderActive {
            log::info!("DFU characteristics not found; rebooting device into bootloader");
            self.transition_to_bootloader(&session)?;
            session = self.reconnect_bootloader()?;
        }

        let control = session
            .control
            .as_deref()
            .ok_or(DfuError::NoDfuCharacteristics)?;

        let slot = ResponseSlot::new();
        let producer = slot.producer();
        control.subscribe(
            SubscriptionKind::Notification,
            Box::new(move |frame| producer.deposit(frame)),
        )?;

        let mut tracker = ProgressTracker {
            current: 0,
            total,
            callback: &mut progress,
        };
        let result = self.run_transfers(&session, &slot, &archive, &mut tracker);

        if let Err(err) = control.unsubscribe(SubscriptionKind::Notification) {
            log::debug!("unsubscribe control: {}", err);
        }
        result
    }

    /// Reboot the device into its bootloader without performing an
    /// update. A no-op when the bootloader is already active.
    pub fn enter_bootloader(&mut self) -> DfuResult<()> {
        let session = self.connect_session()?;
        if session.mode == DfuMode::BootloaderActive {
            log::info!("bootloader already active");
            return Ok(());
        }

        log::info!("switching device to DFU mode");
        self.transition_to_bootloader(&session)?;

        // Let the device tear the link down before we disconnect our end.
        thread::sleep(BOOT_SETTLE_DELAY);
        Ok(())
    }

    // ========================================================================
    // Connection and mode detection
    // ========================================================================

    fn connect_session(&self) -> DfuResult<Session> {
        let peripheral = match &self.target {
            DeviceId::Address(address) => {
                log::info!("connecting to '{}'", address);
                self.client.connect_address(address, self.timeout)?
            }
            DeviceId::Name(name) => {
                log::info!("connecting to '{}'", name);
                self.client.connect_name(name, self.timeout)?
            }
        };

        match Self::resolve_mode(peripheral.as_ref()) {
            Ok((control, packet, buttonless, mode)) => Ok(Session {
                peripheral,
                control,
                packet,
                buttonless,
                mode,
            }),
            Err(err) => {
                if let Err(disconnect_err) = peripheral.disconnect() {
                    log::debug!("disconnect after failed setup: {}", disconnect_err);
                }
                Err(err)
            }
        }
    }

    /// Inspect the DFU service and decide which personality the device
    /// presents: bootloader pair first, then bonded buttonless, then
    /// unbonded buttonless.
    #[allow(clippy::type_complexity)]
    fn resolve_mode(
        peripheral: &dyn Peripheral,
    ) -> DfuResult<(
        Option<Box<dyn Characteristic>>,
        Option<Box<dyn Characteristic>>,
        Option<Box<dyn Characteristic>>,
        DfuMode,
    )> {
        let service = peripheral
            .find_service(DFU_SERVICE_UUID)
            .ok_or(DfuError::NoDfuCharacteristics)?;

        let control = service.find_characteristic(DFU_CONTROL_POINT_UUID);
        let packet = service.find_characteristic(DFU_PACKET_UUID);
        if control.is_some() && packet.is_some() {
            return Ok((control, packet, None, DfuMode::BootloaderActive));
        }

        if let Some(buttonless) = service.find_characteristic(DFU_BUTTONLESS_BONDED_UUID) {
            log::info!("using bonded buttonless bootloader");
            return Ok((None, None, Some(buttonless), DfuMode::ButtonlessBonded));
        }
        if let Some(buttonless) = service.find_characteristic(DFU_BUTTONLESS_UNBONDED_UUID) {
            log::info!("using unbonded buttonless bootloader");
            return Ok((None, None, Some(buttonless), DfuMode::ButtonlessUnbonded));
        }

        Err(DfuError::NoDfuCharacteristics)
    }

    // ========================================================================
    // Buttonless transition
    // ========================================================================

    /// Drive the buttonless service to reboot the application into its
    /// bootloader. Subscriptions are released only if the device is not
    /// known to have rebooted; once it has, the link is going away anyway.
    fn transition_to_bootloader(&mut self, session: &Session) -> DfuResult<()> {
        let buttonless = session
            .buttonless
            .as_deref()
            .ok_or(DfuError::NoDfuCharacteristics)?;

        let slot = ResponseSlot::new();

        // Subscribe in both modes; firmware revisions differ in which one
        // they deliver the response on.
        let producer = slot.producer();
        buttonless.subscribe(
            SubscriptionKind::Indication,
            Box::new(move |frame| producer.deposit(frame)),
        )?;
        let producer = slot.producer();
        if let Err(err) = buttonless.subscribe(
            SubscriptionKind::Notification,
            Box::new(move |frame| producer.deposit(frame)),
        ) {
            if let Err(unsub_err) = buttonless.unsubscribe(SubscriptionKind::Indication) {
                log::debug!("unsubscribe buttonless: {}", unsub_err);
            }
            return Err(err.into());
        }

        let mut rebooted = false;
        let result = self.run_transition(buttonless, &slot, session.mode, &mut rebooted);

        if !rebooted {
            if let Err(err) = buttonless.unsubscribe(SubscriptionKind::Indication) {
                log::debug!("unsubscribe buttonless: {}", err);
            }
            if let Err(err) = buttonless.unsubscribe(SubscriptionKind::Notification) {
                log::debug!("unsubscribe buttonless: {}", err);
            }
        }
        result
    }

    fn run_transition(
        &mut self,
        buttonless: &dyn Characteristic,
        slot: &ResponseSlot,
        mode: DfuMode,
        rebooted: &mut bool,
    ) -> DfuResult<()> {
        if mode == DfuMode::ButtonlessUnbonded {
            let name = generate_device_name();
            log::info!("changing bootloader advertising name to '{}'", name);
            self.send_buttonless(buttonless, slot, &packet::set_adv_name_request(&name))?;
            // The bootloader will advertise under the new name; the old
            // address is no longer a valid way to reach it.
            self.target = DeviceId::Name(name);
        }

        // The device may drop the link before acknowledging this request;
        // the reconnect loop decides whether the reboot actually happened.
        match self.send_buttonless(buttonless, slot, &packet::enter_bootloader_request()) {
            Ok(()) => {}
            Err(err) => {
                log::warn!(
                    "enter-bootloader request not acknowledged ({}); assuming reboot",
                    err
                );
            }
        }
        *rebooted = true;
        Ok(())
    }

    fn send_buttonless(
        &self,
        buttonless: &dyn Characteristic,
        slot: &ResponseSlot,
        request: &[u8],
    ) -> DfuResult<()> {
        buttonless.write(request, WriteKind::WithResponse)?;
        let frame = slot.take().map_err(|err| match err {
            SlotError::LinkLost => DfuError::Ble(BleError::LinkLost),
            SlotError::Overrun => {
                DfuError::ButtonlessProtocol(ProtocolViolation::UnexpectedFrame)
            }
        })?;
        packet::parse_buttonless_response(&frame, request[0])
    }

    /// Reconnect after a reboot transition. Success requires the
    /// bootloader personality; anything else counts as a failed attempt.
    fn reconnect_bootloader(&mut self) -> DfuResult<Session> {
        log::info!("reconnecting to peripheral");
        for attempt in 1..=RECONNECT_ATTEMPTS {
            match self.connect_session() {
                Ok(session) if session.mode == DfuMode::BootloaderActive => {
                    log::info!("connected to {}", session.peripheral.address());
                    return Ok(session);
                }
                Ok(_) => {
                    log::debug!("attempt {}: bootloader not active yet", attempt);
                }
                Err(err) => {
                    log::debug!("attempt {}: {}", attempt, err);
                }
            }
            if attempt < RECONNECT_ATTEMPTS {
                thread::sleep(RECONNECT_DELAY);
            }
        }
        Err(DfuError::ReconnectFailed {
            attempts: RECONNECT_ATTEMPTS,
        })
    }

    // ========================================================================
    // Object transfer
    // ========================================================================

    fn run_transfers(
        &self,
        session: &Session,
        slot: &ResponseSlot,
        archive: &FirmwareArchive,
        progress: &mut ProgressTracker<'_>,
    ) -> DfuResult<()> {
        log::info!(
            "transferring init packet ({} bytes)",
            archive.init_data().len()
        );
        self.transfer(session, slot, ObjectType::Command, archive.init_data(), progress)?;

        log::info!(
            "transferring firmware image ({} bytes)",
            archive.firmware_data().len()
        );
        self.transfer(session, slot, ObjectType::Data, archive.firmware_data(), progress)?;
        Ok(())
    }

    /// Stream one payload as a sequence of DFU objects: SELECT, then per
    /// chunk CREATE, packet fragments, CRC check, EXECUTE.
    fn transfer(
        &self,
        session: &Session,
        slot: &ResponseSlot,
        object_type: ObjectType,
        data: &[u8],
        progress: &mut ProgressTracker<'_>,
    ) -> DfuResult<()> {
        let control = session
            .control
            .as_deref()
            .ok_or(DfuError::NoDfuCharacteristics)?;
        let packet_char = session
            .packet
            .as_deref()
            .ok_or(DfuError::NoDfuCharacteristics)?;

        let size = data.len();
        let full_crc = crc32fast::hash(data);

        let select = self.select_object(control, slot, object_type)?;
        if select.offset as usize == size && select.crc == full_crc {
            log::info!("{} already on device; skipping", object_type.describe());
            return Ok(());
        }

        let max_chunk = select.max_size as usize;
        if max_chunk == 0 {
            return Err(DfuError::ControlProtocol(ProtocolViolation::ZeroMaxSize));
        }

        let mut start = 0usize;
        while start < size {
            let end = usize::min(start + max_chunk, size);
            self.create_object(control, slot, object_type, (end - start) as u32)?;
            self.stream_chunk(packet_char, &data[start..end], progress)?;
            self.verify_crc(control, slot, data, end)?;
            self.execute_object(control, slot)?;
            start = end;
        }
        Ok(())
    }

    /// Write one chunk to the packet characteristic in 20-byte
    /// fragments.
    fn stream_chunk(
        &self,
        packet_char: &dyn Characteristic,
        chunk: &[u8],
        progress: &mut ProgressTracker<'_>,
    ) -> DfuResult<()> {
        for fragment in chunk.chunks(FRAGMENT_SIZE) {
            packet_char.write(fragment, WriteKind::NoResponse)?;
            progress.advance(fragment.len() as u64);
            // Give the host stack time to drain the unacknowledged write
            // queue; on macOS fragments are dropped without this.
            thread::sleep(FRAGMENT_DELAY);
        }
        Ok(())
    }

    fn select_object(
        &self,
        control: &dyn Characteristic,
        slot: &ResponseSlot,
        object_type: ObjectType,
    ) -> DfuResult<SelectResponse> {
        let body = self.send_control(
            control,
            slot,
            OpCode::ObjectSelect,
            &packet::select_request(object_type),
        )?;
        SelectResponse::parse(&body)
    }

    fn create_object(
        &self,
        control: &dyn Characteristic,
        slot: &ResponseSlot,
        object_type: ObjectType,
        length: u32,
    ) -> DfuResult<()> {
        self.send_control(
            control,
            slot,
            OpCode::ObjectCreate,
            &packet::create_request(object_type, length),
        )?;
        Ok(())
    }

    /// Ask the device for its running checksum and compare it against the
    /// local CRC over the payload prefix up to `end`.
    fn verify_crc(
        &self,
        control: &dyn Characteristic,
        slot: &ResponseSlot,
        data: &[u8],
        end: usize,
    ) -> DfuResult<()> {
        let body = self.send_control(control, slot, OpCode::CrcGet, &packet::crc_request())?;
        let reply = ChecksumResponse::parse(&body)?;

        if reply.offset as usize != end {
            return Err(DfuError::SizeMismatch {
                expected: end as u64,
                actual: u64::from(reply.offset),
            });
        }
        let expected = crc32fast::hash(&data[..end]);
        if reply.crc != expected {
            return Err(DfuError::CrcMismatch {
                expected,
                actual: reply.crc,
            });
        }
        Ok(())
    }

    fn execute_object(&self, control: &dyn Characteristic, slot: &ResponseSlot) -> DfuResult<()> {
        self.send_control(control, slot, OpCode::ObjectExecute, &packet::execute_request())?;
        Ok(())
    }

    /// Configure how often the device acknowledges packet writes with a
    /// receipt notification. Zero disables them. The transfer loop polls
    /// with CRC_GET instead of consuming receipts.
    #[allow(dead_code)]
    fn set_receipt_notification(
        &self,
        session: &Session,
        slot: &ResponseSlot,
        count: u16,
    ) -> DfuResult<()> {
        let control = session
            .control
            .as_deref()
            .ok_or(DfuError::NoDfuCharacteristics)?;
        self.send_control(
            control,
            slot,
            OpCode::ReceiptNotifSet,
            &packet::receipt_notif_request(count),
        )?;
        Ok(())
    }

    /// Issue one control request and consume exactly one response. At
    /// most one request may be outstanding at a time.
    fn send_control(
        &self,
        control: &dyn Characteristic,
        slot: &ResponseSlot,
        opcode: OpCode,
        request: &[u8],
    ) -> DfuResult<Vec<u8>> {
        control.write(request, WriteKind::WithResponse)?;
        let frame = slot.take().map_err(|err| match err {
            SlotError::LinkLost => DfuError::Ble(BleError::LinkLost),
            SlotError::Overrun => DfuError::ControlProtocol(ProtocolViolation::UnexpectedFrame),
        })?;
        packet::parse_control_response(&frame, opcode)
    }
}

/// Generate the advertising name an unbonded bootloader will reboot
/// under: "Dfu" followed by ten random lowercase letters, seeded from
/// the current wall-clock time.
fn generate_device_name() -> String {
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let mut rng = StdRng::seed_from_u64(seed);
    let suffix: String = (0..ADV_NAME_SUFFIX_LEN)
        .map(|_| char::from(b'a' + rng.gen_range(0u8..26)))
        .collect();
    format!("{}{}", ADV_NAME_PREFIX, suffix)
}

// ============================================================================
// Tests
// ============================================================================
