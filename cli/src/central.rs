// Central backend over btleplug
//
// Bridges btleplug's async adapter API onto the callback-style platform
// traits. Every operation runs on a spawned task, so callbacks never fire
// before the triggering call has returned.

use anyhow::{Context, Result};
use blelink_core::central::connection::{GattClientCallback, GattConnector, GattLink};
use blelink_core::central::scan::{ScanCallback, ScanFailureReason, Scanner};
use blelink_core::peripheral::advertise::Advertiser;
use blelink_core::peripheral::server::GattServerPlatform;
use blelink_core::{
    Capabilities, Characteristic, GattStatus, LinkState, PlatformError, RadioPlatform, RadioState,
    Service,
};
use btleplug::api::{
    BDAddr, CentralEvent as AdapterEvent, CharPropFlags, Central as _, Manager as _,
    Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Status reported for links the host stack could not establish.
const GATT_ERROR: i32 = 133;

/// Open the first adapter, or the one whose description starts with `name`.
pub async fn open_adapter(name: Option<&str>) -> Result<Adapter> {
    let manager = Manager::new()
        .await
        .context("Failed to reach the Bluetooth stack")?;
    let adapters = manager
        .adapters()
        .await
        .context("Failed to list Bluetooth adapters")?;

    for adapter in adapters {
        let info = adapter.adapter_info().await.unwrap_or_default();
        match name {
            Some(wanted) if !info.starts_with(wanted) => continue,
            _ => {
                info!("Using Bluetooth adapter: {}", info);
                return Ok(adapter);
            }
        }
    }
    anyhow::bail!("No Bluetooth adapter found")
}

/// Central-only radio. Powered state is not observable through btleplug, so
/// the radio reports `On` and operations surface failures instead.
pub struct BtleplugRadio {
    scanner: Arc<BtleplugScanner>,
    connector: Arc<BtleplugConnector>,
}

impl BtleplugRadio {
    /// Must be called from within a tokio runtime.
    pub fn new(adapter: Adapter) -> Result<Self> {
        let runtime = Handle::try_current().context("btleplug backend needs a tokio runtime")?;
        Ok(Self {
            scanner: Arc::new(BtleplugScanner {
                adapter: adapter.clone(),
                runtime: runtime.clone(),
                active: Mutex::new(None),
            }),
            connector: Arc::new(BtleplugConnector { adapter, runtime }),
        })
    }
}

impl RadioPlatform for BtleplugRadio {
    fn is_low_energy_supported(&self) -> bool {
        true
    }

    fn state(&self) -> RadioState {
        RadioState::On
    }

    fn scanner(&self) -> Option<Arc<dyn Scanner>> {
        Some(self.scanner.clone())
    }

    fn gatt_connector(&self) -> Option<Arc<dyn GattConnector>> {
        Some(self.connector.clone())
    }

    fn advertiser(&self) -> Option<Arc<dyn Advertiser>> {
        None
    }

    fn gatt_server(&self) -> Option<Arc<dyn GattServerPlatform>> {
        None
    }
}

/// Address string for a peripheral. Some hosts (macOS) hide the hardware
/// address, in which case the platform identifier is used.
fn address_of(peripheral: &Peripheral, reported: BDAddr) -> String {
    if reported == BDAddr::default() {
        format!("{:?}", peripheral.id())
    } else {
        reported.to_string()
    }
}

async fn find_peripheral(adapter: &Adapter, address: &str) -> Option<Peripheral> {
    let peripherals = adapter.peripherals().await.ok()?;
    peripherals
        .into_iter()
        .find(|p| address_of(p, p.address()).eq_ignore_ascii_case(address))
}

// ============================================================================
// SCANNER
// ============================================================================

/// Last signal strength seen per address. Updates that carry no RSSI reuse
/// the previous reading.
#[derive(Debug, Default)]
struct SignalCache {
    last: HashMap<String, i16>,
}

impl SignalCache {
    fn resolve(&mut self, address: &str, reported: Option<i16>) -> Option<i16> {
        match reported {
            Some(rssi) => {
                self.last.insert(address.to_string(), rssi);
                Some(rssi)
            }
            None => self.last.get(address).copied(),
        }
    }
}

struct ActiveScan {
    task: JoinHandle<()>,
    callback: Arc<dyn ScanCallback>,
}

pub struct BtleplugScanner {
    adapter: Adapter,
    runtime: Handle,
    active: Mutex<Option<ActiveScan>>,
}

impl Scanner for BtleplugScanner {
    fn start_scan(&self, callback: Arc<dyn ScanCallback>) -> Result<(), PlatformError> {
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|scan| !scan.task.is_finished()) {
            return Err(PlatformError::Refused("scan already running".to_string()));
        }

        let adapter = self.adapter.clone();
        let cb = callback.clone();
        let task = self.runtime.spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    warn!("Adapter event stream unavailable: {}", e);
                    cb.on_scan_failed(ScanFailureReason::ApplicationRegistrationFailed);
                    return;
                }
            };
            if let Err(e) = adapter.start_scan(ScanFilter::default()).await {
                warn!("Scan start rejected: {}", e);
                cb.on_scan_failed(ScanFailureReason::InternalError);
                return;
            }

            let mut signals = SignalCache::default();
            while let Some(event) = events.next().await {
                let id = match event {
                    AdapterEvent::DeviceDiscovered(id) | AdapterEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let Ok(Some(props)) = peripheral.properties().await else {
                    continue;
                };
                let address = address_of(&peripheral, props.address);
                let Some(rssi) = signals.resolve(&address, props.rssi) else {
                    debug!("No signal reading for {} yet", address);
                    continue;
                };
                cb.on_device_found(&address, props.local_name.as_deref(), rssi);
            }
            debug!("Adapter event stream ended");
        });

        *active = Some(ActiveScan { task, callback });
        Ok(())
    }

    fn stop_scan(&self) -> Result<(), PlatformError> {
        let Some(scan) = self.active.lock().take() else {
            return Err(PlatformError::Refused("no scan running".to_string()));
        };
        scan.task.abort();

        let adapter = self.adapter.clone();
        self.runtime.spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                warn!("Scan stop rejected by host stack: {}", e);
            }
            scan.callback.on_scan_complete();
        });
        Ok(())
    }
}

// ============================================================================
// GATT CLIENT
// ============================================================================

pub struct BtleplugConnector {
    adapter: Adapter,
    runtime: Handle,
}

struct LinkShared {
    peripheral: Mutex<Option<Peripheral>>,
    callback: Arc<dyn GattClientCallback>,
}

struct BtleplugLink {
    runtime: Handle,
    shared: Arc<LinkShared>,
    watcher: JoinHandle<()>,
}

impl GattConnector for BtleplugConnector {
    fn connect(
        &self,
        address: &str,
        callback: Arc<dyn GattClientCallback>,
    ) -> Result<Box<dyn GattLink>, PlatformError> {
        let shared = Arc::new(LinkShared {
            peripheral: Mutex::new(None),
            callback,
        });

        let adapter = self.adapter.clone();
        let address = address.to_string();
        let link = shared.clone();
        let watcher = self.runtime.spawn(async move {
            let Some(peripheral) = find_peripheral(&adapter, &address).await else {
                warn!("{} is not known to the host stack, scan first", address);
                link.callback
                    .on_connection_state_change(GattStatus::Failure(GATT_ERROR), LinkState::Disconnected);
                return;
            };
            let mut events = adapter.events().await.ok();
            if let Err(e) = peripheral.connect().await {
                warn!("Connect to {} failed: {}", address, e);
                link.callback
                    .on_connection_state_change(GattStatus::Failure(GATT_ERROR), LinkState::Disconnected);
                return;
            }

            let id = peripheral.id();
            *link.peripheral.lock() = Some(peripheral);
            link.callback
                .on_connection_state_change(GattStatus::Success, LinkState::Connected);

            // Report link loss the host stack notices on its own.
            let Some(events) = events.as_mut() else {
                return;
            };
            while let Some(event) = events.next().await {
                if matches!(event, AdapterEvent::DeviceDisconnected(ref gone) if *gone == id) {
                    link.callback
                        .on_connection_state_change(GattStatus::Success, LinkState::Disconnected);
                    return;
                }
            }
        });

        Ok(Box::new(BtleplugLink {
            runtime: self.runtime.clone(),
            shared,
            watcher,
        }))
    }
}

fn capabilities(flags: CharPropFlags) -> Capabilities {
    let mut capabilities = Capabilities::empty();
    if flags.contains(CharPropFlags::READ) {
        capabilities = capabilities | Capabilities::READABLE;
    }
    if flags.intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE) {
        capabilities = capabilities | Capabilities::WRITABLE;
    }
    if flags.intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE) {
        capabilities = capabilities | Capabilities::NOTIFIABLE;
    }
    capabilities
}

fn services_of(peripheral: &Peripheral) -> Vec<Service> {
    peripheral
        .services()
        .into_iter()
        .map(|remote| {
            let service = if remote.primary {
                Service::primary(remote.uuid)
            } else {
                Service::secondary(remote.uuid)
            };
            remote
                .characteristics
                .iter()
                .fold(service, |service, c| {
                    service.with_characteristic(Characteristic::new(c.uuid, capabilities(c.properties)))
                })
        })
        .collect()
}

impl GattLink for BtleplugLink {
    fn discover_services(&self) -> Result<(), PlatformError> {
        let peripheral = self
            .shared
            .peripheral
            .lock()
            .clone()
            .ok_or_else(|| PlatformError::Refused("link not established".to_string()))?;
        let callback = self.shared.callback.clone();
        self.runtime.spawn(async move {
            match peripheral.discover_services().await {
                Ok(()) => callback.on_services_discovered(GattStatus::Success, services_of(&peripheral)),
                Err(e) => {
                    warn!("Service discovery failed: {}", e);
                    callback.on_services_discovered(GattStatus::Failure(GATT_ERROR), Vec::new());
                }
            }
        });
        Ok(())
    }

    fn disconnect(&self) -> Result<(), PlatformError> {
        let peripheral = self
            .shared
            .peripheral
            .lock()
            .clone()
            .ok_or_else(|| PlatformError::Refused("link not established".to_string()))?;
        let callback = self.shared.callback.clone();
        self.runtime.spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                warn!("Disconnect request failed: {}", e);
            }
            callback.on_connection_state_change(GattStatus::Success, LinkState::Disconnected);
        });
        Ok(())
    }

    fn close(&self) {
        self.watcher.abort();
        if let Some(peripheral) = self.shared.peripheral.lock().take() {
            debug!("Link to {} released", peripheral.address());
        }
    }
}
