// Peripheral backend over BlueZ (bluer)
//
// Advertising, the GATT application and adapter power all live in bluetoothd;
// this module maps them onto the callback-style platform traits.

use anyhow::{Context, Result};
use async_trait::async_trait;
use blelink_core::central::connection::GattConnector;
use blelink_core::central::scan::Scanner;
use blelink_core::peripheral::advertise::{
    AdvertiseCallback, AdvertiseFailureReason, AdvertiseMode, AdvertisementPayload, Advertiser,
};
use blelink_core::peripheral::server::{GattServerCallback, GattServerPlatform};
use blelink_core::radio::RadioStateObserver;
use blelink_core::{
    BatterySource, Capabilities, GattStatus, LinkState, PlatformError, RadioPlatform, RadioState,
    SharedAttributeTable,
};
use bluer::adv::{Advertisement, AdvertisementHandle, Type as AdvertisementType};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicRead, CharacteristicReadRequest, ReqError, Service,
};
use bluer::{Adapter, AdapterEvent, AdapterProperty};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How often connected centrals are polled from bluetoothd.
const CONNECTION_POLL: Duration = Duration::from_secs(1);

/// Open the named adapter (or the default one) and make sure it is powered.
pub async fn open_adapter(name: Option<&str>) -> Result<Adapter> {
    let session = bluer::Session::new()
        .await
        .context("Failed to connect to bluetoothd")?;
    let adapter = match name {
        Some(name) => session.adapter(name)?,
        None => session.default_adapter().await?,
    };
    info!("Using Bluetooth adapter: {}", adapter.name());

    if !adapter.is_powered().await? {
        info!("Powering on Bluetooth adapter...");
        adapter.set_powered(true).await?;
    }
    Ok(adapter)
}

/// Peripheral-only radio backed by a BlueZ adapter.
pub struct BluerRadio {
    powered: Arc<AtomicBool>,
    watchers: Arc<Mutex<Vec<Weak<dyn RadioStateObserver>>>>,
    advertiser: Arc<BluerAdvertiser>,
    server: Arc<BluerGattServer>,
    power_task: JoinHandle<()>,
}

impl BluerRadio {
    /// Must be called from within a tokio runtime.
    pub async fn new(adapter: Adapter) -> Result<Self> {
        let runtime = Handle::try_current().context("bluer backend needs a tokio runtime")?;
        let powered = Arc::new(AtomicBool::new(adapter.is_powered().await?));
        let watchers: Arc<Mutex<Vec<Weak<dyn RadioStateObserver>>>> =
            Arc::new(Mutex::new(Vec::new()));

        let events = adapter
            .events()
            .await
            .context("Failed to watch adapter properties")?;
        let power_task = runtime.spawn(watch_power(events, powered.clone(), watchers.clone()));

        Ok(Self {
            powered,
            watchers,
            advertiser: Arc::new(BluerAdvertiser {
                adapter: adapter.clone(),
                runtime: runtime.clone(),
                handle: Arc::new(Mutex::new(None)),
            }),
            server: Arc::new(BluerGattServer {
                adapter,
                runtime,
                application: Arc::new(Mutex::new(None)),
                monitor: Mutex::new(None),
            }),
            power_task,
        })
    }
}

impl Drop for BluerRadio {
    fn drop(&mut self) {
        self.power_task.abort();
    }
}

async fn watch_power(
    events: impl futures::Stream<Item = AdapterEvent>,
    powered: Arc<AtomicBool>,
    watchers: Arc<Mutex<Vec<Weak<dyn RadioStateObserver>>>>,
) {
    futures::pin_mut!(events);
    while let Some(event) = events.next().await {
        let AdapterEvent::PropertyChanged(AdapterProperty::Powered(on)) = event else {
            continue;
        };
        if powered.swap(on, Ordering::SeqCst) == on {
            continue;
        }
        info!("Adapter powered {}", if on { "on" } else { "off" });

        let steps = if on {
            [RadioState::TurningOn, RadioState::On]
        } else {
            [RadioState::TurningOff, RadioState::Off]
        };
        let observers: Vec<_> = watchers.lock().iter().filter_map(Weak::upgrade).collect();
        for state in steps {
            for observer in &observers {
                observer.on_radio_state_changed(state);
            }
        }
    }
}

impl RadioPlatform for BluerRadio {
    fn is_low_energy_supported(&self) -> bool {
        true
    }

    fn state(&self) -> RadioState {
        if self.powered.load(Ordering::SeqCst) {
            RadioState::On
        } else {
            RadioState::Off
        }
    }

    fn scanner(&self) -> Option<Arc<dyn Scanner>> {
        None
    }

    fn gatt_connector(&self) -> Option<Arc<dyn GattConnector>> {
        None
    }

    fn advertiser(&self) -> Option<Arc<dyn Advertiser>> {
        self.state().is_on().then(|| self.advertiser.clone() as Arc<dyn Advertiser>)
    }

    fn gatt_server(&self) -> Option<Arc<dyn GattServerPlatform>> {
        self.state().is_on().then(|| self.server.clone() as Arc<dyn GattServerPlatform>)
    }

    fn watch_state(&self, observer: Weak<dyn RadioStateObserver>) {
        self.watchers.lock().push(observer);
    }
}

// ============================================================================
// ADVERTISING
// ============================================================================

pub struct BluerAdvertiser {
    adapter: Adapter,
    runtime: Handle,
    handle: Arc<Mutex<Option<AdvertisementHandle>>>,
}

fn advertising_interval(mode: AdvertiseMode) -> Duration {
    match mode {
        AdvertiseMode::LowLatency => Duration::from_millis(100),
        AdvertiseMode::Balanced => Duration::from_millis(250),
        AdvertiseMode::LowPower => Duration::from_millis(1000),
    }
}

fn advertisement_for(payload: &AdvertisementPayload) -> Advertisement {
    let interval = advertising_interval(payload.mode);
    Advertisement {
        advertisement_type: if payload.connectable {
            AdvertisementType::Peripheral
        } else {
            AdvertisementType::Broadcast
        },
        service_uuids: payload.service_uuids.iter().copied().collect::<BTreeSet<Uuid>>(),
        local_name: Some(payload.local_name.clone()),
        discoverable: Some(true),
        tx_power: Some(payload.tx_power.dbm()),
        min_interval: Some(interval),
        max_interval: Some(interval),
        ..Default::default()
    }
}

impl Advertiser for BluerAdvertiser {
    fn set_device_name(&self, name: &str) -> Result<(), PlatformError> {
        let adapter = self.adapter.clone();
        let name = name.to_string();
        self.runtime.spawn(async move {
            if let Err(e) = adapter.set_alias(name.clone()).await {
                warn!("Failed to set adapter alias to '{}': {}", name, e);
            }
        });
        Ok(())
    }

    fn start_advertising(
        &self,
        payload: &AdvertisementPayload,
        callback: Arc<dyn AdvertiseCallback>,
    ) -> Result<(), PlatformError> {
        if self.handle.lock().is_some() {
            return Err(PlatformError::Refused("advertisement already registered".to_string()));
        }

        let adapter = self.adapter.clone();
        let advertisement = advertisement_for(payload);
        let slot = self.handle.clone();
        self.runtime.spawn(async move {
            match adapter.advertise(advertisement).await {
                Ok(handle) => {
                    *slot.lock() = Some(handle);
                    callback.on_start_success();
                }
                Err(e) => {
                    warn!("bluetoothd rejected the advertisement: {}", e);
                    callback.on_start_failure(AdvertiseFailureReason::InternalError);
                }
            }
        });
        Ok(())
    }

    fn stop_advertising(&self) -> Result<(), PlatformError> {
        if self.handle.lock().take().is_none() {
            debug!("No advertisement registered");
        }
        Ok(())
    }
}

// ============================================================================
// GATT SERVER
// ============================================================================

pub struct BluerGattServer {
    adapter: Adapter,
    runtime: Handle,
    application: Arc<Mutex<Option<ApplicationHandle>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

fn read_value(
    table: &SharedAttributeTable,
    service: Uuid,
    characteristic: Uuid,
) -> Result<Vec<u8>, ReqError> {
    table
        .read()
        .read(&service, &characteristic)
        .map_err(|_| ReqError::NotSupported)
}

fn local_characteristic(
    table: &SharedAttributeTable,
    service: Uuid,
    uuid: Uuid,
    capabilities: Capabilities,
) -> Characteristic {
    let read = capabilities.contains(Capabilities::READABLE).then(|| {
        let table = table.clone();
        CharacteristicRead {
            read: true,
            fun: Box::new(move |_req: CharacteristicReadRequest| {
                let value = read_value(&table, service, uuid);
                Box::pin(async move { value })
            }),
            ..Default::default()
        }
    });

    let notify = capabilities.contains(Capabilities::NOTIFIABLE).then(|| {
        let table = table.clone();
        CharacteristicNotify {
            notify: true,
            method: CharacteristicNotifyMethod::Fun(Box::new(move |mut notifier| {
                let value = read_value(&table, service, uuid);
                Box::pin(async move {
                    if let Ok(value) = value {
                        if let Err(e) = notifier.notify(value).await {
                            debug!("Notification for {} not delivered: {}", uuid, e);
                        }
                    }
                })
            })),
            ..Default::default()
        }
    });

    Characteristic {
        uuid,
        read,
        notify,
        ..Default::default()
    }
}

fn application_for(table: &SharedAttributeTable) -> Application {
    let services = table
        .read()
        .services()
        .iter()
        .map(|service| Service {
            uuid: service.uuid,
            primary: service.kind == blelink_core::ServiceKind::Primary,
            characteristics: service
                .characteristics
                .iter()
                .map(|c| local_characteristic(table, service.uuid, c.uuid, c.capabilities))
                .collect(),
            ..Default::default()
        })
        .collect();
    Application {
        services,
        ..Default::default()
    }
}

/// Poll bluetoothd for connected devices and report changes.
/// Tracks which connected devices are Centrals of this server. Links that
/// already existed when the server came up (headsets, keyboards) are never
/// reported and are forgotten once they drop.
#[derive(Debug, Default)]
struct CentralTracker {
    known: BTreeSet<String>,
    preexisting: BTreeSet<String>,
}

impl CentralTracker {
    fn seeded(already_connected: BTreeSet<String>) -> Self {
        Self {
            known: BTreeSet::new(),
            preexisting: already_connected,
        }
    }

    /// Apply a fresh poll, returning `(departed, arrived)`.
    fn update(&mut self, connected: &BTreeSet<String>) -> (Vec<String>, Vec<String>) {
        self.preexisting.retain(|address| connected.contains(address));
        let current: BTreeSet<String> = connected.difference(&self.preexisting).cloned().collect();

        let departed = self.known.difference(&current).cloned().collect();
        let arrived = current.difference(&self.known).cloned().collect();
        self.known = current;
        (departed, arrived)
    }
}

async fn connected_devices(adapter: &Adapter) -> Option<BTreeSet<String>> {
    let addresses = match adapter.device_addresses().await {
        Ok(addresses) => addresses,
        Err(e) => {
            debug!("Failed to query device addresses: {}", e);
            return None;
        }
    };
    let mut connected = BTreeSet::new();
    for address in addresses {
        let Ok(device) = adapter.device(address) else {
            continue;
        };
        if device.is_connected().await.unwrap_or(false) {
            connected.insert(address.to_string());
        }
    }
    Some(connected)
}

async fn monitor_centrals(adapter: Adapter, callback: Arc<dyn GattServerCallback>) {
    let baseline = connected_devices(&adapter).await.unwrap_or_default();
    if !baseline.is_empty() {
        debug!("Ignoring {} devices connected before the server started", baseline.len());
    }
    let mut tracker = CentralTracker::seeded(baseline);

    loop {
        tokio::time::sleep(CONNECTION_POLL).await;
        let Some(connected) = connected_devices(&adapter).await else {
            continue;
        };

        let (departed, arrived) = tracker.update(&connected);
        for gone in departed {
            callback.on_connection_state_change(&gone, GattStatus::Success, LinkState::Disconnected);
        }
        for central in arrived {
            callback.on_connection_state_change(&central, GattStatus::Success, LinkState::Connected);
        }
    }
}

impl GattServerPlatform for BluerGattServer {
    fn register(
        &self,
        table: SharedAttributeTable,
        callback: Arc<dyn GattServerCallback>,
    ) -> Result<(), PlatformError> {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            return Err(PlatformError::Refused("GATT application already registered".to_string()));
        }

        let adapter = self.adapter.clone();
        let slot = self.application.clone();
        let application = application_for(&table);
        self.runtime.spawn(async move {
            match adapter.serve_gatt_application(application).await {
                Ok(handle) => {
                    info!("GATT application registered");
                    *slot.lock() = Some(handle);
                }
                Err(e) => warn!("bluetoothd rejected the GATT application: {}", e),
            }
        });

        *monitor = Some(
            self.runtime
                .spawn(monitor_centrals(self.adapter.clone(), callback)),
        );
        Ok(())
    }

    fn unregister(&self) {
        if let Some(task) = self.monitor.lock().take() {
            task.abort();
        }
        self.application.lock().take();
    }
}

// ============================================================================
// BATTERY
// ============================================================================

const POWER_SUPPLY_ROOT: &str = "/sys/class/power_supply";

/// Battery percentage read from the kernel power-supply class.
pub struct SysfsBattery {
    capacity: PathBuf,
}

impl SysfsBattery {
    /// First power supply of type `Battery`, if the host has one.
    pub fn detect() -> Option<Self> {
        Self::detect_in(Path::new(POWER_SUPPLY_ROOT))
    }

    fn detect_in(root: &Path) -> Option<Self> {
        let mut supplies: Vec<PathBuf> = std::fs::read_dir(root)
            .ok()?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect();
        supplies.sort();
        supplies.into_iter().find_map(|supply| {
            let kind = std::fs::read_to_string(supply.join("type")).ok()?;
            (kind.trim() == "Battery").then(|| Self {
                capacity: supply.join("capacity"),
            })
        })
    }
}

#[async_trait]
impl BatterySource for SysfsBattery {
    async fn battery_level(&self) -> Result<u8, PlatformError> {
        let raw = tokio::fs::read_to_string(&self.capacity)
            .await
            .map_err(|e| PlatformError::Unavailable(e.to_string()))?;
        raw.trim()
            .parse::<u8>()
            .map_err(|e| PlatformError::Backend(format!("capacity '{}': {}", raw.trim(), e)))
    }
}
