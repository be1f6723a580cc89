//! Simulated radios sharing an in-process "air".
//!
//! [`SimulatedRadio`] implements every platform trait. Outcomes are delivered
//! on spawned tokio tasks, so a callback never runs before the call that
//! triggered it has returned. Static [`Beacon`]s stand in for peripherals that
//! only advertise and answer discovery; a second `SimulatedRadio` running the
//! peripheral role can be connected to like any other device.
//!
//! Must be used from within a tokio runtime.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::central::connection::{GattClientCallback, GattConnector, GattLink};
use crate::central::scan::{ScanCallback, ScanFailureReason, Scanner};
use crate::error::PlatformError;
use crate::peripheral::advertise::{
    AdvertiseCallback, AdvertiseFailureReason, AdvertisementPayload, Advertiser,
};
use crate::peripheral::server::{GattServerCallback, GattServerPlatform};
use crate::peripheral::table::SharedAttributeTable;
use crate::profile::Service;
use crate::radio::{GattStatus, LinkState, RadioPlatform, RadioState, RadioStateObserver};

/// Status reported when the remote device cannot be reached.
pub const GATT_ERROR: i32 = 133;
/// Status reported when discovery runs against a device that went away.
pub const GATT_DISCOVERY_FAILED: i32 = 129;

// ============================================================================
// AIR
// ============================================================================

/// A peripheral that advertises and serves a fixed service tree.
#[derive(Debug, Clone)]
pub struct Beacon {
    pub address: String,
    pub name: Option<String>,
    pub rssi: i16,
    pub connectable: bool,
    pub services: Vec<Service>,
}

impl Beacon {
    pub fn new(address: &str, name: Option<&str>, rssi: i16) -> Self {
        Self {
            address: address.to_string(),
            name: name.map(str::to_string),
            rssi,
            connectable: true,
            services: Vec::new(),
        }
    }

    pub fn with_service(mut self, service: Service) -> Self {
        self.services.push(service);
        self
    }

    pub fn non_connectable(mut self) -> Self {
        self.connectable = false;
        self
    }
}

#[derive(Debug, Clone)]
struct Sighting {
    address: String,
    name: Option<String>,
    rssi: i16,
}

enum Target {
    Beacon(Beacon),
    Radio(Arc<RadioCore>),
}

#[derive(Default)]
struct AirInner {
    beacons: Mutex<Vec<Beacon>>,
    radios: Mutex<Vec<Weak<RadioCore>>>,
}

impl AirInner {
    fn radios(&self) -> Vec<Arc<RadioCore>> {
        let mut radios = self.radios.lock();
        radios.retain(|r| r.strong_count() > 0);
        radios.iter().filter_map(Weak::upgrade).collect()
    }

    /// Everything a scanner at `observer` can currently hear.
    fn sightings(&self, observer: &str) -> Vec<Sighting> {
        let mut sightings: Vec<Sighting> = self
            .beacons
            .lock()
            .iter()
            .map(|b| Sighting {
                address: b.address.clone(),
                name: b.name.clone(),
                rssi: b.rssi,
            })
            .collect();
        sightings.extend(
            self.radios()
                .into_iter()
                .filter(|r| r.address != observer)
                .filter_map(|r| r.sighting()),
        );
        sightings
    }

    /// Deliver a new sighting to every radio currently scanning.
    fn announce(&self, sighting: &Sighting) {
        for radio in self.radios() {
            if radio.address == sighting.address {
                continue;
            }
            if let Some(callback) = radio.scan.lock().clone() {
                let sighting = sighting.clone();
                tokio::spawn(async move {
                    callback.on_device_found(&sighting.address, sighting.name.as_deref(), sighting.rssi);
                });
            }
        }
    }

    fn find(&self, address: &str) -> Option<Target> {
        if let Some(beacon) = self.beacons.lock().iter().find(|b| b.address == address) {
            return Some(Target::Beacon(beacon.clone()));
        }
        self.radios()
            .into_iter()
            .find(|r| r.address == address)
            .map(Target::Radio)
    }
}

/// Shared medium connecting simulated radios and beacons.
#[derive(Clone, Default)]
pub struct SimulatedAir {
    inner: Arc<AirInner>,
}

impl SimulatedAir {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a beacon in range. Radios already scanning hear it at once.
    pub fn add_beacon(&self, beacon: Beacon) {
        let sighting = Sighting {
            address: beacon.address.clone(),
            name: beacon.name.clone(),
            rssi: beacon.rssi,
        };
        self.inner.beacons.lock().push(beacon);
        self.inner.announce(&sighting);
    }

    pub fn remove_beacon(&self, address: &str) {
        self.inner.beacons.lock().retain(|b| b.address != address);
    }

    /// Add a radio at `address`, powered on.
    pub fn radio(&self, address: &str, rssi: i16) -> SimulatedRadio {
        let core = Arc::new(RadioCore {
            address: address.to_string(),
            rssi,
            air: self.inner.clone(),
            state: Mutex::new(RadioState::On),
            watchers: Mutex::new(Vec::new()),
            scan: Mutex::new(None),
            scan_failure: Mutex::new(None),
            alias: Mutex::new(String::new()),
            advertisement: Mutex::new(None),
            advertise_failure: Mutex::new(None),
            server: Mutex::new(None),
        });
        self.inner.radios.lock().push(Arc::downgrade(&core));
        SimulatedRadio { core }
    }
}

// ============================================================================
// RADIO
// ============================================================================

struct RadioCore {
    address: String,
    rssi: i16,
    air: Arc<AirInner>,
    state: Mutex<RadioState>,
    watchers: Mutex<Vec<Weak<dyn RadioStateObserver>>>,
    scan: Mutex<Option<Arc<dyn ScanCallback>>>,
    scan_failure: Mutex<Option<ScanFailureReason>>,
    alias: Mutex<String>,
    advertisement: Mutex<Option<AdvertisementPayload>>,
    advertise_failure: Mutex<Option<AdvertiseFailureReason>>,
    server: Mutex<Option<(SharedAttributeTable, Arc<dyn GattServerCallback>)>>,
}

impl RadioCore {
    fn sighting(&self) -> Option<Sighting> {
        let advertisement = self.advertisement.lock();
        let payload = advertisement.as_ref()?;
        Some(Sighting {
            address: self.address.clone(),
            name: Some(payload.local_name.clone()).filter(|n| !n.is_empty()),
            rssi: self.rssi,
        })
    }

    fn is_connectable(&self) -> bool {
        self.advertisement
            .lock()
            .as_ref()
            .is_some_and(|p| p.connectable)
    }

    fn notify_server(&self, central: &str, state: LinkState) {
        let callback = self.server.lock().as_ref().map(|(_, cb)| cb.clone());
        if let Some(callback) = callback {
            callback.on_connection_state_change(central, GattStatus::Success, state);
        }
    }

    fn served_services(&self) -> Option<Vec<Service>> {
        let server = self.server.lock();
        let (table, _) = server.as_ref()?;
        let services = table.read().services().to_vec();
        Some(services)
    }

    fn set_state(&self, state: RadioState) {
        *self.state.lock() = state;
        let watchers: Vec<_> = self
            .watchers
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for watcher in watchers {
            watcher.on_radio_state_changed(state);
        }
    }
}

/// A simulated platform radio.
#[derive(Clone)]
pub struct SimulatedRadio {
    core: Arc<RadioCore>,
}

impl SimulatedRadio {
    pub fn address(&self) -> &str {
        &self.core.address
    }

    /// Power the radio down or up, walking through the transitional states.
    pub fn set_powered(&self, on: bool) {
        if on {
            info!("[sim {}] radio on", self.core.address);
            self.core.set_state(RadioState::TurningOn);
            self.core.set_state(RadioState::On);
        } else {
            info!("[sim {}] radio off", self.core.address);
            self.core.scan.lock().take();
            self.core.advertisement.lock().take();
            self.core.set_state(RadioState::TurningOff);
            self.core.set_state(RadioState::Off);
        }
    }

    /// Make the next scan start fail with `reason`.
    pub fn fail_next_scan(&self, reason: ScanFailureReason) {
        *self.core.scan_failure.lock() = Some(reason);
    }

    /// Make the next advertise start fail with `reason`.
    pub fn fail_next_advertise(&self, reason: AdvertiseFailureReason) {
        *self.core.advertise_failure.lock() = Some(reason);
    }

    pub fn is_advertising(&self) -> bool {
        self.core.advertisement.lock().is_some()
    }

    pub fn is_scanning(&self) -> bool {
        self.core.scan.lock().is_some()
    }

    /// Name last applied through [`Advertiser::set_device_name`].
    pub fn alias(&self) -> String {
        self.core.alias.lock().clone()
    }

    fn when_on<T>(&self, role: T) -> Option<T> {
        self.core.state.lock().is_on().then_some(role)
    }
}

impl RadioPlatform for SimulatedRadio {
    fn is_low_energy_supported(&self) -> bool {
        true
    }

    fn state(&self) -> RadioState {
        *self.core.state.lock()
    }

    fn scanner(&self) -> Option<Arc<dyn Scanner>> {
        self.when_on(self.core.clone() as Arc<dyn Scanner>)
    }

    fn gatt_connector(&self) -> Option<Arc<dyn GattConnector>> {
        self.when_on(self.core.clone() as Arc<dyn GattConnector>)
    }

    fn advertiser(&self) -> Option<Arc<dyn Advertiser>> {
        self.when_on(self.core.clone() as Arc<dyn Advertiser>)
    }

    fn gatt_server(&self) -> Option<Arc<dyn GattServerPlatform>> {
        self.when_on(self.core.clone() as Arc<dyn GattServerPlatform>)
    }

    fn watch_state(&self, observer: Weak<dyn RadioStateObserver>) {
        self.core.watchers.lock().push(observer);
    }
}

// ============================================================================
// ROLES
// ============================================================================

impl Scanner for RadioCore {
    fn start_scan(&self, callback: Arc<dyn ScanCallback>) -> Result<(), PlatformError> {
        if let Some(reason) = self.scan_failure.lock().take() {
            tokio::spawn(async move { callback.on_scan_failed(reason) });
            return Ok(());
        }

        let mut scan = self.scan.lock();
        if scan.is_some() {
            tokio::spawn(async move { callback.on_scan_failed(ScanFailureReason::AlreadyStarted) });
            return Ok(());
        }
        *scan = Some(callback.clone());
        drop(scan);

        let sightings = self.air.sightings(&self.address);
        debug!("[sim {}] scan started, {} in range", self.address, sightings.len());
        tokio::spawn(async move {
            for s in sightings {
                callback.on_device_found(&s.address, s.name.as_deref(), s.rssi);
            }
        });
        Ok(())
    }

    fn stop_scan(&self) -> Result<(), PlatformError> {
        let Some(callback) = self.scan.lock().take() else {
            return Err(PlatformError::Refused("no scan running".to_string()));
        };
        tokio::spawn(async move { callback.on_scan_complete() });
        Ok(())
    }
}

struct SimLink {
    local: String,
    remote: String,
    air: Arc<AirInner>,
    callback: Arc<dyn GattClientCallback>,
}

impl GattConnector for RadioCore {
    fn connect(
        &self,
        address: &str,
        callback: Arc<dyn GattClientCallback>,
    ) -> Result<Box<dyn GattLink>, PlatformError> {
        let target = self.air.find(address);
        let local = self.address.clone();
        let notify = callback.clone();
        tokio::spawn(async move {
            match target {
                Some(Target::Beacon(beacon)) if beacon.connectable => {
                    notify.on_connection_state_change(GattStatus::Success, LinkState::Connected);
                }
                Some(Target::Radio(radio)) if radio.is_connectable() => {
                    radio.notify_server(&local, LinkState::Connected);
                    notify.on_connection_state_change(GattStatus::Success, LinkState::Connected);
                }
                _ => notify.on_connection_state_change(
                    GattStatus::Failure(GATT_ERROR),
                    LinkState::Disconnected,
                ),
            }
        });

        Ok(Box::new(SimLink {
            local: self.address.clone(),
            remote: address.to_string(),
            air: self.air.clone(),
            callback,
        }))
    }
}

impl GattLink for SimLink {
    fn discover_services(&self) -> Result<(), PlatformError> {
        let services = match self.air.find(&self.remote) {
            Some(Target::Beacon(beacon)) => Some(beacon.services),
            Some(Target::Radio(radio)) => radio.served_services(),
            None => None,
        };
        let callback = self.callback.clone();
        tokio::spawn(async move {
            match services {
                Some(services) => callback.on_services_discovered(GattStatus::Success, services),
                None => callback.on_services_discovered(
                    GattStatus::Failure(GATT_DISCOVERY_FAILED),
                    Vec::new(),
                ),
            }
        });
        Ok(())
    }

    fn disconnect(&self) -> Result<(), PlatformError> {
        let target = self.air.find(&self.remote);
        let local = self.local.clone();
        let callback = self.callback.clone();
        tokio::spawn(async move {
            if let Some(Target::Radio(radio)) = target {
                radio.notify_server(&local, LinkState::Disconnected);
            }
            callback.on_connection_state_change(GattStatus::Success, LinkState::Disconnected);
        });
        Ok(())
    }

    fn close(&self) {
        debug!("[sim {}] link to {} closed", self.local, self.remote);
    }
}

impl Advertiser for RadioCore {
    fn set_device_name(&self, name: &str) -> Result<(), PlatformError> {
        *self.alias.lock() = name.to_string();
        Ok(())
    }

    fn start_advertising(
        &self,
        payload: &AdvertisementPayload,
        callback: Arc<dyn AdvertiseCallback>,
    ) -> Result<(), PlatformError> {
        if let Some(reason) = self.advertise_failure.lock().take() {
            tokio::spawn(async move { callback.on_start_failure(reason) });
            return Ok(());
        }

        {
            let mut advertisement = self.advertisement.lock();
            if advertisement.is_some() {
                tokio::spawn(async move {
                    callback.on_start_failure(AdvertiseFailureReason::AlreadyStarted)
                });
                return Ok(());
            }
            *advertisement = Some(payload.clone());
        }

        debug!("[sim {}] advertising '{}'", self.address, payload.local_name);
        if let Some(sighting) = self.sighting() {
            self.air.announce(&sighting);
        }
        tokio::spawn(async move { callback.on_start_success() });
        Ok(())
    }

    fn stop_advertising(&self) -> Result<(), PlatformError> {
        self.advertisement.lock().take();
        Ok(())
    }
}

impl GattServerPlatform for RadioCore {
    fn register(
        &self,
        table: SharedAttributeTable,
        callback: Arc<dyn GattServerCallback>,
    ) -> Result<(), PlatformError> {
        let mut server = self.server.lock();
        if server.is_some() {
            return Err(PlatformError::Refused("GATT server already registered".to_string()));
        }
        *server = Some((table, callback));
        Ok(())
    }

    fn unregister(&self) {
        self.server.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{Capabilities, Characteristic, BATTERY_LEVEL_CHARACTERISTIC, BATTERY_SERVICE};
    use tokio::sync::mpsc;

    struct ChannelScan(mpsc::UnboundedSender<String>);

    impl ScanCallback for ChannelScan {
        fn on_device_found(&self, address: &str, _name: Option<&str>, _rssi: i16) {
            let _ = self.0.send(format!("found {}", address));
        }

        fn on_scan_failed(&self, reason: ScanFailureReason) {
            let _ = self.0.send(format!("failed {:?}", reason));
        }

        fn on_scan_complete(&self) {
            let _ = self.0.send("complete".to_string());
        }
    }

    #[tokio::test]
    async fn test_scan_reports_beacons_and_late_arrivals() {
        let air = SimulatedAir::new();
        air.add_beacon(Beacon::new("A", Some("Lamp"), -40));
        let radio = air.radio("C0", -50);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let scanner = radio.scanner().expect("powered");
        scanner.start_scan(Arc::new(ChannelScan(tx))).expect("start");
        assert_eq!(rx.recv().await.as_deref(), Some("found A"));

        air.add_beacon(Beacon::new("B", Some("Fan"), -60));
        assert_eq!(rx.recv().await.as_deref(), Some("found B"));

        scanner.stop_scan().expect("stop");
        assert_eq!(rx.recv().await.as_deref(), Some("complete"));
        assert!(!radio.is_scanning());
    }

    #[tokio::test]
    async fn test_injected_scan_failure() {
        let air = SimulatedAir::new();
        let radio = air.radio("C0", -50);
        radio.fail_next_scan(ScanFailureReason::FeatureUnsupported);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let scanner = radio.scanner().expect("powered");
        scanner.start_scan(Arc::new(ChannelScan(tx))).expect("start");
        assert_eq!(rx.recv().await.as_deref(), Some("failed FeatureUnsupported"));
    }

    #[test]
    fn test_powered_off_radio_offers_no_roles() {
        let air = SimulatedAir::new();
        let radio = air.radio("C0", -50);
        radio.set_powered(false);

        assert_eq!(radio.state(), RadioState::Off);
        assert!(radio.scanner().is_none());
        assert!(radio.advertiser().is_none());
        assert!(radio.gatt_connector().is_none());
        assert!(radio.gatt_server().is_none());
    }

    struct ChannelLink(mpsc::UnboundedSender<(GattStatus, Option<LinkState>, usize)>);

    impl GattClientCallback for ChannelLink {
        fn on_connection_state_change(&self, status: GattStatus, state: LinkState) {
            let _ = self.0.send((status, Some(state), 0));
        }

        fn on_services_discovered(&self, status: GattStatus, services: Vec<Service>) {
            let _ = self.0.send((status, None, services.len()));
        }
    }

    #[tokio::test]
    async fn test_connect_to_unknown_address_fails() {
        let air = SimulatedAir::new();
        let radio = air.radio("C0", -50);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let connector = radio.gatt_connector().expect("powered");
        let _link = connector
            .connect("ZZ", Arc::new(ChannelLink(tx)))
            .expect("request accepted");
        assert_eq!(
            rx.recv().await,
            Some((
                GattStatus::Failure(GATT_ERROR),
                Some(LinkState::Disconnected),
                0
            ))
        );
    }

    #[tokio::test]
    async fn test_beacon_link_discovers_services() {
        let air = SimulatedAir::new();
        air.add_beacon(Beacon::new("AA:BB", Some("Meter"), -40).with_service(
            Service::primary(BATTERY_SERVICE).with_characteristic(Characteristic::new(
                BATTERY_LEVEL_CHARACTERISTIC,
                Capabilities::READABLE,
            )),
        ));
        let radio = air.radio("C0", -50);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let link = radio
            .gatt_connector()
            .expect("powered")
            .connect("AA:BB", Arc::new(ChannelLink(tx)))
            .expect("request accepted");
        assert_eq!(
            rx.recv().await,
            Some((GattStatus::Success, Some(LinkState::Connected), 0))
        );

        link.discover_services().expect("discover");
        assert_eq!(rx.recv().await, Some((GattStatus::Success, None, 1)));

        link.disconnect().expect("disconnect");
        assert_eq!(
            rx.recv().await,
            Some((GattStatus::Success, Some(LinkState::Disconnected), 0))
        );
    }

    struct ChannelAdvertise(mpsc::UnboundedSender<Option<AdvertiseFailureReason>>);

    impl AdvertiseCallback for ChannelAdvertise {
        fn on_start_success(&self) {
            let _ = self.0.send(None);
        }

        fn on_start_failure(&self, reason: AdvertiseFailureReason) {
            let _ = self.0.send(Some(reason));
        }
    }

    #[tokio::test]
    async fn test_second_advertisement_is_rejected() {
        let air = SimulatedAir::new();
        let radio = air.radio("P0", -45);
        let advertiser = radio.advertiser().expect("powered");
        let payload = AdvertisementPayload::from_config(&Default::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let callback: Arc<dyn AdvertiseCallback> = Arc::new(ChannelAdvertise(tx));

        advertiser.set_device_name("Sensor").expect("alias");
        advertiser.start_advertising(&payload, callback.clone()).expect("start");
        assert_eq!(rx.recv().await, Some(None));
        assert!(radio.is_advertising());
        assert_eq!(radio.alias(), "Sensor");

        advertiser.start_advertising(&payload, callback).expect("start");
        assert_eq!(
            rx.recv().await,
            Some(Some(AdvertiseFailureReason::AlreadyStarted))
        );
    }

    struct Quiet;

    impl GattServerCallback for Quiet {
        fn on_connection_state_change(&self, _: &str, _: GattStatus, _: LinkState) {}
    }

    #[test]
    fn test_server_registers_once() {
        let air = SimulatedAir::new();
        let radio = air.radio("P0", -45);
        let server = radio.gatt_server().expect("powered");
        let table = SharedAttributeTable::default();
        let callback: Arc<dyn GattServerCallback> = Arc::new(Quiet);
        server.register(table.clone(), callback.clone()).expect("first");
        assert!(server.register(table, callback).is_err());
        server.unregister();
    }
}
