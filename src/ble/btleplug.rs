//! btleplug-backed implementation of the BLE façade.
//!
//! The client owns a tokio runtime so the rest of the crate can stay
//! synchronous; every btleplug call is bridged with `block_on`. Incoming
//! notifications are forwarded to per-characteristic handlers by a
//! dispatch task that runs for the lifetime of the connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use btleplug::api::{
    Central, CentralEvent, Manager as _, Peripheral as _, PeripheralProperties, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral};
use futures::stream::StreamExt;
use tokio::runtime::Runtime;
use uuid::Uuid;

use super::{
    parse_uuid, Advertisement, BleError, Characteristic, Client, NotificationHandler, Peripheral,
    Service, SubscriptionKind, WriteKind,
};

/// Handlers registered per characteristic UUID.
type HandlerMap = HashMap<Uuid, Vec<(SubscriptionKind, NotificationHandler)>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn connect_err(err: btleplug::Error) -> BleError {
    BleError::Connect(err.to_string())
}

fn scan_err(err: btleplug::Error) -> BleError {
    BleError::Scan(err.to_string())
}

/// BLE client backed by the first available btleplug adapter.
pub struct BtleplugClient {
    runtime: Arc<Runtime>,
    adapter: Adapter,
}

impl BtleplugClient {
    pub fn new() -> Result<Self, BleError> {
        let runtime = Arc::new(
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|e| BleError::Runtime(e.to_string()))?,
        );
        let adapter = runtime.block_on(async {
            let manager = Manager::new()
                .await
                .map_err(|e| BleError::Runtime(e.to_string()))?;
            let adapters = manager
                .adapters()
                .await
                .map_err(|e| BleError::Runtime(e.to_string()))?;
            adapters.into_iter().next().ok_or(BleError::NoAdapter)
        })?;
        Ok(Self { runtime, adapter })
    }

    /// Scan until an advertisement satisfies `matcher`, then connect and
    /// discover services. The whole search is bounded by `timeout`.
    fn connect_matching<M>(
        &self,
        timeout: Duration,
        matcher: M,
    ) -> Result<Box<dyn Peripheral>, BleError>
    where
        M: Fn(&PeripheralProperties) -> bool,
    {
        let search = async {
            let mut events = self.adapter.events().await.map_err(connect_err)?;
            self.adapter
                .start_scan(ScanFilter::default())
                .await
                .map_err(connect_err)?;
            loop {
                let event = match events.next().await {
                    Some(event) => event,
                    None => return Err(BleError::Connect("adapter event stream closed".into())),
                };
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                let peripheral = match self.adapter.peripheral(&id).await {
                    Ok(peripheral) => peripheral,
                    Err(_) => continue,
                };
                if let Ok(Some(properties)) = peripheral.properties().await {
                    if matcher(&properties) {
                        return Ok(peripheral);
                    }
                }
            }
        };

        let found = self
            .runtime
            .block_on(tokio::time::timeout(timeout, search));
        self.runtime.block_on(self.adapter.stop_scan()).ok();
        let found = found.map_err(|_| BleError::ConnectTimeout(timeout))??;

        self.runtime
            .block_on(async {
                found.connect().await?;
                found.discover_services().await
            })
            .map_err(connect_err)?;

        BtleplugPeripheral::wrap(self.runtime.clone(), found)
    }
}

impl Client for BtleplugClient {
    fn connect_address(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<Box<dyn Peripheral>, BleError> {
        self.connect_matching(timeout, |properties| {
            properties.address.to_string().eq_ignore_ascii_case(address)
        })
    }

    fn connect_name(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Box<dyn Peripheral>, BleError> {
        self.connect_matching(timeout, |properties| {
            properties
                .local_name
                .as_deref()
                .map_or(false, |local| local.eq_ignore_ascii_case(name))
        })
    }

    fn scan(
        &self,
        duration: Duration,
        handler: &mut dyn FnMut(Advertisement),
    ) -> Result<(), BleError> {
        let scan = async {
            let mut events = self.adapter.events().await.map_err(scan_err)?;
            self.adapter
                .start_scan(ScanFilter::default())
                .await
                .map_err(scan_err)?;
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                let peripheral = match self.adapter.peripheral(&id).await {
                    Ok(peripheral) => peripheral,
                    Err(_) => continue,
                };
                let properties = match peripheral.properties().await {
                    Ok(Some(properties)) => properties,
                    _ => continue,
                };
                handler(Advertisement {
                    address: properties.address.to_string(),
                    name: properties.local_name.unwrap_or_default(),
                    services: properties.services.iter().map(Uuid::to_string).collect(),
                });
            }
            Ok(())
        };

        // Running out the scan window is a normal completion.
        let result = match self.runtime.block_on(tokio::time::timeout(duration, scan)) {
            Err(_elapsed) => Ok(()),
            Ok(inner) => inner,
        };
        self.runtime.block_on(self.adapter.stop_scan()).ok();
        result
    }
}

/// Connection state shared by the peripheral handle and everything
/// derived from it (services, characteristics, the dispatch task).
struct SharedPeripheral {
    runtime: Arc<Runtime>,
    peripheral: PlatformPeripheral,
    address: String,
    handlers: Arc<Mutex<HandlerMap>>,
}

struct BtleplugPeripheral {
    shared: Arc<SharedPeripheral>,
}

impl BtleplugPeripheral {
    fn wrap(
        runtime: Arc<Runtime>,
        peripheral: PlatformPeripheral,
    ) -> Result<Box<dyn Peripheral>, BleError> {
        let address = peripheral.address().to_string();
        let handlers: Arc<Mutex<HandlerMap>> = Arc::new(Mutex::new(HashMap::new()));

        let stream = runtime
            .block_on(peripheral.notifications())
            .map_err(|e| BleError::Subscribe(e.to_string()))?;
        let dispatch_handlers = handlers.clone();
        runtime.spawn(async move {
            let mut stream = stream;
            while let Some(notification) = stream.next().await {
                let mut map = lock(&dispatch_handlers);
                if let Some(registered) = map.get_mut(&notification.uuid) {
                    // A value change is a single delivery even when both
                    // subscription kinds are registered for the
                    // characteristic; btleplug does not report which mode
                    // the server used.
                    if let Some((_, handler)) = registered.first_mut() {
                        handler(&notification.value);
                    }
                }
            }
            // The stream ends when the link goes down. Dropping the
            // handlers unblocks anyone still waiting on them.
            lock(&dispatch_handlers).clear();
        });

        Ok(Box::new(Self {
            shared: Arc::new(SharedPeripheral {
                runtime,
                peripheral,
                address,
                handlers,
            }),
        }))
    }
}

impl Peripheral for BtleplugPeripheral {
    fn address(&self) -> String {
        self.shared.address.clone()
    }

    fn disconnect(&self) -> Result<(), BleError> {
        self.shared
            .runtime
            .block_on(self.shared.peripheral.disconnect())
            .map_err(|e| BleError::Disconnect(e.to_string()))
    }

    fn find_service(&self, uuid: &str) -> Option<Box<dyn Service>> {
        let target = parse_uuid(uuid)?;
        self.shared
            .peripheral
            .services()
            .into_iter()
            .find(|service| service.uuid == target)
            .map(|service| {
                Box::new(BtleplugService {
                    shared: self.shared.clone(),
                    service,
                }) as Box<dyn Service>
            })
    }

    fn find_characteristic(&self, uuid: &str) -> Option<Box<dyn Characteristic>> {
        let target = parse_uuid(uuid)?;
        self.shared
            .peripheral
            .characteristics()
            .into_iter()
            .find(|characteristic| characteristic.uuid == target)
            .map(|characteristic| {
                Box::new(BtleplugCharacteristic {
                    shared: self.shared.clone(),
                    characteristic,
                }) as Box<dyn Characteristic>
            })
    }
}

struct BtleplugService {
    shared: Arc<SharedPeripheral>,
    service: btleplug::api::Service,
}

impl Service for BtleplugService {
    fn uuid(&self) -> String {
        self.service.uuid.to_string()
    }

    fn find_characteristic(&self, uuid: &str) -> Option<Box<dyn Characteristic>> {
        let target = parse_uuid(uuid)?;
        self.service
            .characteristics
            .iter()
            .find(|characteristic| characteristic.uuid == target)
            .cloned()
            .map(|characteristic| {
                Box::new(BtleplugCharacteristic {
                    shared: self.shared.clone(),
                    characteristic,
                }) as Box<dyn Characteristic>
            })
    }
}

struct BtleplugCharacteristic {
    shared: Arc<SharedPeripheral>,
    characteristic: btleplug::api::Characteristic,
}

impl Characteristic for BtleplugCharacteristic {
    fn uuid(&self) -> String {
        self.characteristic.uuid.to_string()
    }

    fn write(&self, data: &[u8], kind: WriteKind) -> Result<(), BleError> {
        let write_type = match kind {
            WriteKind::WithResponse => WriteType::WithResponse,
            WriteKind::NoResponse => WriteType::WithoutResponse,
        };
        self.shared
            .runtime
            .block_on(
                self.shared
                    .peripheral
                    .write(&self.characteristic, data, write_type),
            )
            .map_err(|e| BleError::Write(e.to_string()))
    }

    fn subscribe(
        &self,
        kind: SubscriptionKind,
        handler: NotificationHandler,
    ) -> Result<(), BleError> {
        let uuid = self.characteristic.uuid;
        // Both subscription kinds share one CCCD subscription; btleplug
        // drives the descriptor from the characteristic's properties.
        let needs_subscribe = lock(&self.shared.handlers)
            .get(&uuid)
            .map_or(true, Vec::is_empty);
        if needs_subscribe {
            self.shared
                .runtime
                .block_on(self.shared.peripheral.subscribe(&self.characteristic))
                .map_err(|e| BleError::Subscribe(e.to_string()))?;
        }
        lock(&self.shared.handlers)
            .entry(uuid)
            .or_default()
            .push((kind, handler));
        Ok(())
    }

    fn unsubscribe(&self, kind: SubscriptionKind) -> Result<(), BleError> {
        let uuid = self.characteristic.uuid;
        let now_empty = {
            let mut map = lock(&self.shared.handlers);
            match map.get_mut(&uuid) {
                Some(registered) => {
                    registered.retain(|(registered_kind, _)| *registered_kind != kind);
                    let empty = registered.is_empty();
                    if empty {
                        map.remove(&uuid);
                    }
                    empty
                }
                None => return Ok(()),
            }
        };
        if now_empty {
            self.shared
                .runtime
                .block_on(self.shared.peripheral.unsubscribe(&self.characteristic))
                .map_err(|e| BleError::Subscribe(e.to_string()))?;
        }
        Ok(())
    }
}
